//! Last-access based expiry for cache directories.
//!
//! Entries are either plain files (embedding cache) or directories
//! (persisted shards). A directory counts as accessed when the directory
//! itself or any file inside it was accessed.

use std::fs::{self, File, FileTimes, Metadata};
use std::io;
use std::path::Path;
use std::time::{Duration, SystemTime};

use tracing::{debug, info};
use walkdir::WalkDir;

use crate::cache::CacheError;

const SECONDS_PER_DAY: u64 = 24 * 3600;

/// Outcome of one expiry pass over a directory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExpiryReport {
    /// Entries looked at
    pub scanned: usize,
    /// Entries deleted
    pub removed: usize,
    /// Bytes freed by the deleted entries
    pub bytes_reclaimed: u64,
}

impl ExpiryReport {
    /// Adds another report into this one.
    pub fn absorb(&mut self, other: ExpiryReport) {
        self.scanned += other.scanned;
        self.removed += other.removed;
        self.bytes_reclaimed += other.bytes_reclaimed;
    }

    /// Human readable one-liner.
    pub fn display(&self) -> String {
        format!(
            "removed {}/{} ({:.3} MiB)",
            self.removed,
            self.scanned,
            self.bytes_reclaimed as f64 / 1024.0 / 1024.0
        )
    }
}

/// Deletes every entry of `dir` not accessed within `threshold_days`.
///
/// A missing directory yields an empty report.
pub fn expire_dir(dir: &Path, threshold_days: u64) -> Result<ExpiryReport, CacheError> {
    let mut report = ExpiryReport::default();
    if !dir.exists() {
        return Ok(report);
    }

    let threshold = Duration::from_secs(threshold_days.saturating_mul(SECONDS_PER_DAY));
    let now = SystemTime::now();
    let entries = fs::read_dir(dir).map_err(|e| CacheError::io(dir, e))?;

    for entry in entries {
        let entry = entry.map_err(|e| CacheError::io(dir, e))?;
        let path = entry.path();
        // DirEntry metadata does not follow symlinks and does not touch atime
        let metadata = match entry.metadata() {
            Ok(m) => m,
            Err(e) => {
                debug!(target: "ragshard::cache", "Skipping {}: {e}", path.display());
                continue;
            }
        };
        report.scanned += 1;

        let accessed = last_access(&path, &metadata);
        let idle = now.duration_since(accessed).unwrap_or(Duration::ZERO);
        if idle < threshold {
            continue;
        }

        let size = entry_size(&path, &metadata);
        let removed = if metadata.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        match removed {
            Ok(()) => {
                report.removed += 1;
                report.bytes_reclaimed += size;
            }
            Err(e) => debug!(target: "ragshard::cache", "Failed to expire {}: {e}", path.display()),
        }
    }

    info!(
        target: "ragshard::cache",
        "Expired entries in {}: {}",
        dir.display(),
        report.display()
    );
    Ok(report)
}

/// Marks a file or directory as accessed now, leaving mtime untouched.
pub fn touch_accessed(path: &Path) -> io::Result<()> {
    let file = File::open(path)?;
    file.set_times(FileTimes::new().set_accessed(SystemTime::now()))
}

fn last_access(path: &Path, metadata: &Metadata) -> SystemTime {
    let own = metadata.accessed().unwrap_or(SystemTime::UNIX_EPOCH);
    if !metadata.is_dir() {
        return own;
    }

    WalkDir::new(path)
        .min_depth(1)
        .into_iter()
        .filter_map(Result::ok)
        .filter_map(|entry| entry.metadata().ok())
        .filter_map(|m| m.accessed().ok())
        .fold(own, |latest, t| latest.max(t))
}

fn entry_size(path: &Path, metadata: &Metadata) -> u64 {
    if !metadata.is_dir() {
        return metadata.len();
    }

    WalkDir::new(path)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|m| m.len())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn age(path: &Path, days: u64) {
        let past = SystemTime::now() - Duration::from_secs(days * SECONDS_PER_DAY);
        File::open(path)
            .unwrap()
            .set_times(FileTimes::new().set_accessed(past))
            .unwrap();
    }

    #[test]
    fn test_expire_removes_only_stale_files() {
        let temp_dir = TempDir::new().unwrap();
        let stale = temp_dir.path().join("stale");
        let fresh = temp_dir.path().join("fresh");
        fs::write(&stale, vec![0u8; 2048]).unwrap();
        fs::write(&fresh, vec![0u8; 16]).unwrap();
        age(&stale, 10);

        let report = expire_dir(temp_dir.path(), 5).unwrap();

        assert_eq!(report.scanned, 2);
        assert_eq!(report.removed, 1);
        assert_eq!(report.bytes_reclaimed, 2048);
        assert!(!stale.exists());
        assert!(fresh.exists());
    }

    #[test]
    fn test_expire_directory_entries() {
        let temp_dir = TempDir::new().unwrap();
        let shard = temp_dir.path().join("abc.shard");
        fs::create_dir(&shard).unwrap();
        fs::write(shard.join("vectors.vec"), vec![1u8; 100]).unwrap();
        fs::write(shard.join("docstore.json"), b"{}").unwrap();
        age(&shard.join("vectors.vec"), 30);
        age(&shard.join("docstore.json"), 30);
        age(&shard, 30);

        let report = expire_dir(temp_dir.path(), 7).unwrap();

        assert_eq!(report.removed, 1);
        assert_eq!(report.bytes_reclaimed, 102);
        assert!(!shard.exists());
    }

    #[test]
    fn test_recent_child_keeps_directory() {
        let temp_dir = TempDir::new().unwrap();
        let shard = temp_dir.path().join("abc.shard");
        fs::create_dir(&shard).unwrap();
        fs::write(shard.join("vectors.vec"), b"v").unwrap();
        age(&shard, 30);
        touch_accessed(&shard.join("vectors.vec")).unwrap();

        let report = expire_dir(temp_dir.path(), 7).unwrap();

        assert_eq!(report.removed, 0);
        assert!(shard.exists());
    }

    #[test]
    fn test_nested_directory_size_and_access() {
        let temp_dir = TempDir::new().unwrap();
        let shard = temp_dir.path().join("abc.shard");
        let nested = shard.join("parts").join("deep");
        fs::create_dir_all(&nested).unwrap();
        fs::write(shard.join("docstore.json"), vec![2u8; 10]).unwrap();
        fs::write(nested.join("vectors.vec"), vec![1u8; 40]).unwrap();
        age(&shard, 30);
        age(&shard.join("docstore.json"), 30);
        age(&shard.join("parts"), 30);
        age(&nested, 30);
        age(&nested.join("vectors.vec"), 30);

        let report = expire_dir(temp_dir.path(), 7).unwrap();
        assert_eq!(report.removed, 1);
        assert_eq!(report.bytes_reclaimed, 50);
    }

    #[test]
    fn test_recent_nested_file_keeps_directory() {
        let temp_dir = TempDir::new().unwrap();
        let shard = temp_dir.path().join("abc.shard");
        let nested = shard.join("parts");
        fs::create_dir_all(&nested).unwrap();
        fs::write(nested.join("vectors.vec"), b"v").unwrap();
        age(&shard, 30);
        age(&nested, 30);
        touch_accessed(&nested.join("vectors.vec")).unwrap();

        let report = expire_dir(temp_dir.path(), 7).unwrap();
        assert_eq!(report.removed, 0);
        assert!(shard.exists());
    }

    #[test]
    fn test_missing_directory_is_empty_report() {
        let temp_dir = TempDir::new().unwrap();
        let report = expire_dir(&temp_dir.path().join("nope"), 1).unwrap();
        assert_eq!(report, ExpiryReport::default());
    }

    #[test]
    fn test_report_display() {
        let report = ExpiryReport {
            scanned: 4,
            removed: 1,
            bytes_reclaimed: 1024 * 1024,
        };
        assert_eq!(report.display(), "removed 1/4 (1.000 MiB)");
    }
}
