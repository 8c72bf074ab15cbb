//! Persistent byte cache for embedding vectors.
//!
//! Entries are addressed by [`CacheKey`], grouped per model namespace on
//! disk, and expired explicitly by last access time.

mod expiry;
mod key;
mod store;

pub use expiry::{ExpiryReport, expire_dir, touch_accessed};
pub use key::{CacheKey, namespace_for};
pub use store::{ByteStore, LocalFileStore, StoreOptions, StoreStats};

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised by cache maintenance and writes.
///
/// Reads never surface corruption through this type; a bad entry is a miss.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error(
        "Cache I/O failed at '{path}': {source}\nSuggestion: Check disk space and permissions for the cache directory"
    )]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl CacheError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}
