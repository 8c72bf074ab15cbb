//! Content-addressed keys for the embedding byte cache.

use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;

/// Length of a hex-encoded SHA-256 digest.
const KEY_HEX_LEN: usize = 64;

/// Number of hex characters of the model file digest kept in a namespace.
const MODEL_DIGEST_PREFIX: usize = 15;

/// Deterministic digest of everything that influences an embedding.
///
/// Two requests map to the same key only if model, instruction mode, text
/// and requested dimension are all identical.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Computes the key for one embedding request.
    pub fn compute(model: &str, instruct: bool, text: &str, dimensions: Option<usize>) -> Self {
        let mut hasher = Sha256::new();
        let dims = dimensions.map(|d| d.to_string()).unwrap_or_default();
        let flag: &[u8] = if instruct { b"1" } else { b"0" };

        // Length prefixes keep field boundaries unambiguous
        for field in [model.as_bytes(), flag, text.as_bytes(), dims.as_bytes()] {
            hasher.update((field.len() as u64).to_le_bytes());
            hasher.update(field);
        }

        Self(format!("{:x}", hasher.finalize()))
    }

    /// Parses a key from a cache file name.
    ///
    /// Returns `None` for anything that is not a lowercase hex SHA-256.
    pub fn from_hex(value: &str) -> Option<Self> {
        let valid = value.len() == KEY_HEX_LEN
            && value
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        valid.then(|| Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derives the on-disk namespace for a model.
///
/// Slashes become underscores. When the model string names a local file,
/// the namespace is bound to the file content so a replaced model never
/// reuses stale vectors. Private runs live in their own `private_` space.
pub fn namespace_for(model: &str, instruct: bool, private: bool) -> String {
    let mut namespace = model.replace('/', "_");

    let path = Path::new(model);
    if path.is_file() {
        if let Ok(bytes) = std::fs::read(path) {
            let mut hasher = Sha256::new();
            hasher.update(&bytes);
            hasher.update(if instruct { "True" } else { "False" });
            let digest = format!("{:x}", hasher.finalize());
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| namespace.clone());
            namespace = format!("{name}_{}", &digest[..MODEL_DIGEST_PREFIX]);
        }
    }

    if private {
        namespace = format!("private_{namespace}");
    }
    namespace
}
