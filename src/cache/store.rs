//! File-backed byte store with optional LZ4 compression.
//!
//! # Layout
//!
//! One file per entry, named by its hex [`CacheKey`], directly under the
//! store root. Writes go through a temporary file in the same directory and
//! are renamed into place, so readers never observe partial entries.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::debug;

use crate::cache::{CacheError, CacheKey, ExpiryReport, expire_dir, touch_accessed};

/// Persistent key to bytes mapping.
///
/// Implementations must be safe to share between worker threads. A
/// corrupted or unreadable entry is reported as a miss, never as an error.
pub trait ByteStore: Send + Sync {
    fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, CacheError>;

    fn put(&self, key: &CacheKey, value: &[u8]) -> Result<(), CacheError>;

    fn keys(&self) -> Result<Vec<CacheKey>, CacheError>;

    /// Removes an entry, returning whether it existed.
    fn delete(&self, key: &CacheKey) -> Result<bool, CacheError>;

    /// Batched lookup preserving input order.
    fn mget(&self, keys: &[CacheKey]) -> Result<Vec<Option<Vec<u8>>>, CacheError> {
        keys.iter().map(|key| self.get(key)).collect()
    }
}

/// Behaviour switches for [`LocalFileStore`].
#[derive(Debug, Clone, Copy)]
pub struct StoreOptions {
    /// Compress entries with LZ4 (size-prepended frame)
    pub compress: bool,
    /// Refresh the access time on every successful read
    pub update_atime: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            compress: true,
            update_atime: true,
        }
    }
}

/// Aggregate size information about a store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub entries: usize,
    pub bytes: u64,
}

/// [`ByteStore`] keeping one file per key under a root directory.
#[derive(Debug, Clone)]
pub struct LocalFileStore {
    root: PathBuf,
    options: StoreOptions,
}

impl LocalFileStore {
    /// Opens (and creates if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>, options: StoreOptions) -> Result<Self, CacheError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| CacheError::io(&root, e))?;
        Ok(Self { root, options })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.as_str())
    }

    /// Deletes entries not read within `threshold_days`.
    pub fn expire(&self, threshold_days: u64) -> Result<ExpiryReport, CacheError> {
        expire_dir(&self.root, threshold_days)
    }

    /// Counts entries and their on-disk size.
    pub fn stats(&self) -> Result<StoreStats, CacheError> {
        let mut stats = StoreStats::default();
        for key in self.keys()? {
            if let Ok(metadata) = fs::metadata(self.entry_path(&key)) {
                stats.entries += 1;
                stats.bytes += metadata.len();
            }
        }
        Ok(stats)
    }

    fn decode(&self, key: &CacheKey, raw: Vec<u8>) -> Option<Vec<u8>> {
        if !self.options.compress {
            return Some(raw);
        }
        match lz4_flex::decompress_size_prepended(&raw) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                debug!(target: "ragshard::cache", "Corrupted cache entry {key}: {e}");
                None
            }
        }
    }
}

impl ByteStore for LocalFileStore {
    fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, CacheError> {
        let path = self.entry_path(key);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                debug!(target: "ragshard::cache", "Unreadable cache entry {key}: {e}");
                return Ok(None);
            }
        };

        let Some(bytes) = self.decode(key, raw) else {
            return Ok(None);
        };

        if self.options.update_atime {
            if let Err(e) = touch_accessed(&path) {
                debug!(target: "ragshard::cache", "Failed to refresh access time of {key}: {e}");
            }
        }
        Ok(Some(bytes))
    }

    fn put(&self, key: &CacheKey, value: &[u8]) -> Result<(), CacheError> {
        let payload = if self.options.compress {
            lz4_flex::compress_prepend_size(value)
        } else {
            value.to_vec()
        };

        let mut tmp = NamedTempFile::new_in(&self.root).map_err(|e| CacheError::io(&self.root, e))?;
        tmp.write_all(&payload)
            .map_err(|e| CacheError::io(tmp.path(), e))?;
        let path = self.entry_path(key);
        tmp.persist(&path)
            .map_err(|e| CacheError::io(&path, e.error))?;
        Ok(())
    }

    fn keys(&self) -> Result<Vec<CacheKey>, CacheError> {
        let entries = fs::read_dir(&self.root).map_err(|e| CacheError::io(&self.root, e))?;
        let mut keys: Vec<CacheKey> = entries
            .flatten()
            .filter_map(|entry| CacheKey::from_hex(&entry.file_name().to_string_lossy()))
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn delete(&self, key: &CacheKey) -> Result<bool, CacheError> {
        let path = self.entry_path(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(CacheError::io(&path, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn key(text: &str) -> CacheKey {
        CacheKey::compute("test-model", false, text, None)
    }

    #[test]
    fn test_put_get_compressed() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalFileStore::open(temp_dir.path(), StoreOptions::default()).unwrap();
        let value = vec![7u8; 4096];

        store.put(&key("a"), &value).unwrap();

        assert_eq!(store.get(&key("a")).unwrap(), Some(value));
        assert_eq!(store.get(&key("missing")).unwrap(), None);

        // Highly repetitive payload must shrink on disk
        let on_disk = fs::metadata(temp_dir.path().join(key("a").as_str())).unwrap();
        assert!(on_disk.len() < 4096);
    }

    #[test]
    fn test_uncompressed_store() {
        let temp_dir = TempDir::new().unwrap();
        let options = StoreOptions {
            compress: false,
            update_atime: false,
        };
        let store = LocalFileStore::open(temp_dir.path(), options).unwrap();

        store.put(&key("plain"), b"raw bytes").unwrap();

        let on_disk = fs::read(temp_dir.path().join(key("plain").as_str())).unwrap();
        assert_eq!(on_disk, b"raw bytes");
        assert_eq!(store.get(&key("plain")).unwrap().unwrap(), b"raw bytes");
    }

    #[test]
    fn test_corrupted_entry_is_a_miss() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalFileStore::open(temp_dir.path(), StoreOptions::default()).unwrap();
        fs::write(temp_dir.path().join(key("bad").as_str()), b"\x0a\x00\x00\x00\xff").unwrap();

        assert_eq!(store.get(&key("bad")).unwrap(), None);
    }

    #[test]
    fn test_keys_and_delete() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalFileStore::open(temp_dir.path(), StoreOptions::default()).unwrap();
        store.put(&key("one"), b"1").unwrap();
        store.put(&key("two"), b"2").unwrap();
        fs::write(temp_dir.path().join("README"), b"not a key").unwrap();

        let keys = store.keys().unwrap();
        assert_eq!(keys.len(), 2);
        assert!(keys.contains(&key("one")));

        assert!(store.delete(&key("one")).unwrap());
        assert!(!store.delete(&key("one")).unwrap());
        assert_eq!(store.keys().unwrap(), vec![key("two")]);
    }

    #[test]
    fn test_mget_preserves_order() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalFileStore::open(temp_dir.path(), StoreOptions::default()).unwrap();
        store.put(&key("x"), b"x").unwrap();
        store.put(&key("z"), b"z").unwrap();

        let values = store.mget(&[key("z"), key("y"), key("x")]).unwrap();
        assert_eq!(values, vec![Some(b"z".to_vec()), None, Some(b"x".to_vec())]);
    }

    #[test]
    fn test_stats_and_expire() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalFileStore::open(temp_dir.path(), StoreOptions::default()).unwrap();
        store.put(&key("one"), b"1").unwrap();
        store.put(&key("two"), b"2").unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.entries, 2);
        assert!(stats.bytes > 0);

        // Zero-day threshold expires everything
        let report = store.expire(0).unwrap();
        assert_eq!(report.removed, 2);
        assert!(store.keys().unwrap().is_empty());
    }
}
