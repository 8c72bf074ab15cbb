//! Core document types shared by the cache, index and bucketing layers.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Metadata key carrying the stable content digest of a document.
pub const CONTENT_HASH_KEY: &str = "content_hash";

/// Identifier of a document inside an index docstore.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A unit of text with free-form metadata.
///
/// Content is never modified by the embedding subsystem; metadata may be
/// replaced when a cached shard is reloaded for a fresh copy of the document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub page_content: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Document {
    pub fn new(page_content: impl Into<String>) -> Self {
        Self {
            page_content: page_content.into(),
            metadata: BTreeMap::new(),
        }
    }

    /// Builder-style metadata insertion.
    pub fn with_metadata(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Returns the `content_hash` metadata entry when it is a string.
    pub fn content_hash(&self) -> Option<&str> {
        self.metadata.get(CONTENT_HASH_KEY).and_then(|v| v.as_str())
    }

    /// Fills in `content_hash` from the page content if it is missing.
    pub fn ensure_content_hash(&mut self) -> &str {
        if self.content_hash().is_none() {
            let hash = content_hash(&self.page_content);
            self.metadata
                .insert(CONTENT_HASH_KEY.to_string(), serde_json::Value::String(hash));
        }
        self.content_hash().unwrap_or_default()
    }
}

/// SHA-256 hex digest of a text, the canonical content hash.
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Current UTC timestamp in seconds since UNIX_EPOCH
pub fn get_utc_timestamp() -> u64 {
    Utc::now().timestamp() as u64
}
