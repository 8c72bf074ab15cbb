//! On-disk shard format.
//!
//! A shard is a directory holding two files:
//! - `vectors.vec`: 16-byte header (magic `RSHD`, version, dimension,
//!   vector count) followed by contiguous little-endian f32 rows
//! - `docstore.json`: ids in vector order, the documents and index settings
//!
//! Both files are written through temporary files and renamed into place.
//! Vectors are read back through a memory map.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use memmap2::MmapOptions;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::index::{IndexError, IndexShard, RelevanceScore};
use crate::types::{Document, DocumentId, get_utc_timestamp};
use crate::vector::VectorDimension;

/// Current storage format version.
const STORAGE_VERSION: u32 = 1;

/// Size of the vector file header in bytes.
const HEADER_SIZE: usize = 16;

/// Magic bytes to identify shard vector files.
const MAGIC_BYTES: &[u8; 4] = b"RSHD";

const BYTES_PER_F32: usize = 4;

pub const VECTORS_FILE: &str = "vectors.vec";
pub const DOCSTORE_FILE: &str = "docstore.json";

/// Directory of the single-document shard for `content_hash`.
pub fn shard_path(shard_dir: &Path, content_hash: &str) -> PathBuf {
    shard_dir.join(format!("{content_hash}.shard"))
}

/// Persisted docstore and index settings.
#[derive(Debug, Serialize, Deserialize)]
struct DocstoreFile {
    version: u32,
    dimension: usize,
    relevance: RelevanceScore,
    normalize: bool,
    index_to_docstore_id: Vec<DocumentId>,
    // BTreeMap keeps the JSON stable across saves
    documents: BTreeMap<DocumentId, Document>,
    created_at: u64,
    updated_at: u64,
}

impl IndexShard {
    /// Writes the shard as a directory at `path`.
    pub fn save(&self, path: &Path) -> Result<(), IndexError> {
        fs::create_dir_all(path).map_err(|e| IndexError::io(path, e))?;

        let mut payload = Vec::with_capacity(HEADER_SIZE + self.raw_vectors().len() * BYTES_PER_F32);
        payload.extend_from_slice(MAGIC_BYTES);
        payload.extend_from_slice(&STORAGE_VERSION.to_le_bytes());
        payload.extend_from_slice(&(self.dimension().get() as u32).to_le_bytes());
        payload.extend_from_slice(&(self.len() as u32).to_le_bytes());
        for value in self.raw_vectors() {
            payload.extend_from_slice(&value.to_le_bytes());
        }
        write_atomic(path, VECTORS_FILE, &payload)?;

        let created_at = read_docstore(path)
            .map(|existing| existing.created_at)
            .unwrap_or_else(|_| get_utc_timestamp());
        let docstore = DocstoreFile {
            version: STORAGE_VERSION,
            dimension: self.dimension().get(),
            relevance: self.relevance(),
            normalize: self.normalizes(),
            index_to_docstore_id: self.ids().to_vec(),
            documents: self
                .documents()
                .map(|(id, doc)| (id.clone(), doc.clone()))
                .collect(),
            created_at,
            updated_at: get_utc_timestamp(),
        };
        let json = serde_json::to_vec_pretty(&docstore).map_err(|e| IndexError::InvalidFormat {
            path: path.join(DOCSTORE_FILE),
            reason: format!("Failed to serialize docstore: {e}"),
        })?;
        write_atomic(path, DOCSTORE_FILE, &json)
    }

    /// Reads a shard directory written by [`IndexShard::save`].
    pub fn load(path: &Path) -> Result<Self, IndexError> {
        let docstore = read_docstore(path)?;
        if docstore.version > STORAGE_VERSION {
            return Err(IndexError::VersionMismatch {
                expected: STORAGE_VERSION,
                actual: docstore.version,
            });
        }

        let vectors_path = path.join(VECTORS_FILE);
        let file = File::open(&vectors_path).map_err(|e| IndexError::io(&vectors_path, e))?;
        // The file is only read, and shards are never rewritten in place
        let mmap = unsafe { MmapOptions::new().map(&file) }
            .map_err(|e| IndexError::io(&vectors_path, e))?;

        let (version, dimension, count) = read_header(&mmap, &vectors_path)?;
        if version != STORAGE_VERSION {
            return Err(IndexError::VersionMismatch {
                expected: STORAGE_VERSION,
                actual: version,
            });
        }
        if dimension.get() != docstore.dimension || count != docstore.index_to_docstore_id.len() {
            return Err(IndexError::InvalidFormat {
                path: path.to_path_buf(),
                reason: format!(
                    "vector file holds {count}x{dimension}, docstore expects {}x{}",
                    docstore.index_to_docstore_id.len(),
                    docstore.dimension
                ),
            });
        }

        let expected_len = HEADER_SIZE + count * dimension.get() * BYTES_PER_F32;
        if mmap.len() != expected_len {
            return Err(IndexError::InvalidFormat {
                path: vectors_path,
                reason: format!("expected {expected_len} bytes, found {}", mmap.len()),
            });
        }

        let vectors: Vec<f32> = mmap[HEADER_SIZE..]
            .chunks_exact(BYTES_PER_F32)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        let documents: HashMap<DocumentId, Document> = docstore.documents.into_iter().collect();

        IndexShard::from_parts(
            dimension,
            vectors,
            docstore.index_to_docstore_id,
            documents,
            docstore.relevance,
            docstore.normalize,
        )
    }
}

fn write_atomic(dir: &Path, name: &str, bytes: &[u8]) -> Result<(), IndexError> {
    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| IndexError::io(dir, e))?;
    tmp.write_all(bytes)
        .map_err(|e| IndexError::io(tmp.path(), e))?;
    let target = dir.join(name);
    tmp.persist(&target)
        .map_err(|e| IndexError::io(&target, e.error))?;
    Ok(())
}

fn read_docstore(path: &Path) -> Result<DocstoreFile, IndexError> {
    let docstore_path = path.join(DOCSTORE_FILE);
    let json = fs::read(&docstore_path).map_err(|e| IndexError::io(&docstore_path, e))?;
    serde_json::from_slice(&json).map_err(|e| IndexError::InvalidFormat {
        path: docstore_path,
        reason: format!("Failed to parse docstore: {e}"),
    })
}

fn read_header(bytes: &[u8], path: &Path) -> Result<(u32, VectorDimension, usize), IndexError> {
    let invalid = |reason: &str| IndexError::InvalidFormat {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };
    if bytes.len() < HEADER_SIZE {
        return Err(invalid("File too small to contain header"));
    }
    if &bytes[0..4] != MAGIC_BYTES {
        return Err(invalid("Invalid magic bytes"));
    }

    let word = |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
    let version = word(4);
    let dimension = VectorDimension::new(word(8) as usize)?;
    let count = word(12) as usize;
    Ok((version, dimension, count))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> IndexShard {
        IndexShard::from_embeddings(
            VectorDimension::new(3).unwrap(),
            vec![
                (
                    DocumentId::from("h1"),
                    Document::new("first").with_metadata("content_hash", "h1"),
                    vec![1.0, 2.0, 2.0],
                ),
                (
                    DocumentId::from("h2"),
                    Document::new("second").with_metadata("content_hash", "h2"),
                    vec![0.0, 0.0, 5.0],
                ),
            ],
            RelevanceScore::Quadratic,
            true,
        )
        .unwrap()
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = shard_path(temp_dir.path(), "merged");
        let shard = sample();

        shard.save(&path).unwrap();
        assert!(path.join(VECTORS_FILE).exists());
        assert!(path.join(DOCSTORE_FILE).exists());

        let loaded = IndexShard::load(&path).unwrap();
        assert_eq!(loaded.ids(), shard.ids());
        assert_eq!(loaded.dimension(), shard.dimension());
        assert_eq!(loaded.relevance(), RelevanceScore::Quadratic);
        assert_eq!(loaded.vector(1), shard.vector(1));
        assert_eq!(
            loaded.document(&DocumentId::from("h1")).unwrap().page_content,
            "first"
        );
    }

    #[test]
    fn test_truncated_vectors_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("bad.shard");
        sample().save(&path).unwrap();

        let vectors = fs::read(path.join(VECTORS_FILE)).unwrap();
        fs::write(path.join(VECTORS_FILE), &vectors[..vectors.len() - 4]).unwrap();

        assert!(matches!(
            IndexShard::load(&path),
            Err(IndexError::InvalidFormat { .. })
        ));
    }

    #[test]
    fn test_bad_magic_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("bad.shard");
        sample().save(&path).unwrap();

        let mut vectors = fs::read(path.join(VECTORS_FILE)).unwrap();
        vectors[0..4].copy_from_slice(b"CVEC");
        fs::write(path.join(VECTORS_FILE), vectors).unwrap();

        let err = IndexShard::load(&path).unwrap_err();
        assert!(err.to_string().contains("magic"));
    }

    #[test]
    fn test_missing_directory() {
        let temp_dir = TempDir::new().unwrap();
        assert!(matches!(
            IndexShard::load(&temp_dir.path().join("absent.shard")),
            Err(IndexError::Io { .. })
        ));
    }

    #[test]
    fn test_resave_keeps_created_at() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("s.shard");
        sample().save(&path).unwrap();
        let first = read_docstore(&path).unwrap();

        sample().save(&path).unwrap();
        let second = read_docstore(&path).unwrap();

        assert_eq!(first.created_at, second.created_at);
        assert!(second.updated_at >= first.updated_at);
    }
}
