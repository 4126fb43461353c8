//! Disk-resident cache tier.
//!
//! Content-addressed storage under one directory per cache instance: each
//! entry is a single file named by the hex SHA-256 of its logical key, so
//! arbitrary keys never produce invalid or overlong paths. A file's
//! modification time doubles as the LRU clock, refreshed on read. All
//! operations serialize behind one coarse lock per instance; entries are
//! whole-file writes, so correctness wins over throughput.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::warn;

use super::CacheEntry;
use crate::error::Result;

struct Counters {
    size: u64,
    count: usize,
    scanned: bool,
}

/// Capacity-enforced on-disk store of serialized cache entries.
pub struct DiskCache {
    root: PathBuf,
    capacity: u64,
    counters: Mutex<Counters>,
}

impl DiskCache {
    /// `directory` is created on first use. `capacity` bounds total stored
    /// bytes; `u64::MAX` effectively disables enforcement.
    pub fn new(directory: PathBuf, capacity: u64) -> Self {
        Self {
            root: directory,
            capacity,
            counters: Mutex::new(Counters {
                size: 0,
                count: 0,
                scanned: false,
            }),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.root
    }

    /// Total stored bytes, per the running counters.
    pub async fn size(&self) -> u64 {
        let mut counters = self.counters.lock().await;
        self.ensure_scanned(&mut counters).await;
        counters.size
    }

    pub async fn count(&self) -> usize {
        let mut counters = self.counters.lock().await;
        self.ensure_scanned(&mut counters).await;
        counters.count
    }

    /// Persist an entry, then enforce the byte capacity.
    pub async fn set(&self, entry: &CacheEntry) -> Result<()> {
        let mut counters = self.counters.lock().await;
        self.ensure_scanned(&mut counters).await;

        let path = self.path_for(&entry.key);
        let encoded = super::encode_entry(entry)?;
        let old_size = file_size(&path).await;

        tokio::fs::create_dir_all(&self.root).await?;
        tokio::fs::write(&path, &encoded).await?;

        if let Some(old) = old_size {
            counters.size = counters.size.saturating_sub(old);
        } else {
            counters.count += 1;
        }
        counters.size += encoded.len() as u64;

        self.enforce_capacity(&mut counters).await;
        Ok(())
    }

    /// Load an entry if present, refreshing its access time. Unreadable or
    /// corrupt files are treated as absent and removed.
    pub async fn get(&self, key: &str) -> Option<CacheEntry> {
        let mut counters = self.counters.lock().await;
        self.ensure_scanned(&mut counters).await;

        let path = self.path_for(key);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(_) => return None,
        };
        match super::decode_entry(&raw) {
            Ok(entry) => {
                touch(&path);
                Some(entry)
            }
            Err(error) => {
                warn!(key, %error, "discarding unreadable disk cache entry");
                self.delete_file(&path, &mut counters).await;
                None
            }
        }
    }

    pub async fn remove(&self, key: &str) {
        let mut counters = self.counters.lock().await;
        self.ensure_scanned(&mut counters).await;
        let path = self.path_for(key);
        self.delete_file(&path, &mut counters).await;
    }

    /// Delete every entry.
    pub async fn reset(&self) {
        let mut counters = self.counters.lock().await;
        self.ensure_scanned(&mut counters).await;
        match tokio::fs::read_dir(&self.root).await {
            Ok(mut dir) => {
                while let Ok(Some(file)) = dir.next_entry().await {
                    self.delete_file(&file.path(), &mut counters).await;
                }
            }
            Err(error) => warn!(%error, "error resetting disk cache"),
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        self.root.join(hex::encode(digest))
    }

    async fn delete_file(&self, path: &Path, counters: &mut Counters) {
        let Some(size) = file_size(path).await else {
            return;
        };
        match tokio::fs::remove_file(path).await {
            Ok(()) => {
                counters.size = counters.size.saturating_sub(size);
                counters.count = counters.count.saturating_sub(1);
            }
            Err(error) => warn!(path = %path.display(), %error, "error removing cache file"),
        }
    }

    /// Delete oldest-modified entries until total size fits the capacity.
    /// A full directory rescan per pass: simple and robust, and rare enough
    /// not to matter at the sizes disk caches run at.
    async fn enforce_capacity(&self, counters: &mut Counters) {
        if counters.size <= self.capacity {
            return;
        }
        let mut entries = match self.list_entries().await {
            Ok(entries) => entries,
            Err(error) => {
                warn!(%error, "error listing disk cache for capacity enforcement");
                return;
            }
        };
        entries.sort_by_key(|(_, _, modified)| *modified);
        for (path, _, _) in entries {
            if counters.size <= self.capacity {
                break;
            }
            self.delete_file(&path, counters).await;
        }
    }

    async fn list_entries(&self) -> Result<Vec<(PathBuf, u64, SystemTime)>> {
        let mut collected = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.root).await?;
        while let Some(file) = dir.next_entry().await? {
            let metadata = match file.metadata().await {
                Ok(metadata) => metadata,
                Err(_) => continue,
            };
            if !metadata.is_file() {
                continue;
            }
            let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            collected.push((file.path(), metadata.len(), modified));
        }
        Ok(collected)
    }

    /// Size and count are rebuilt by one directory scan on first use; the
    /// directory listing is the only on-disk metadata.
    async fn ensure_scanned(&self, counters: &mut Counters) {
        if counters.scanned {
            return;
        }
        counters.scanned = true;
        if let Err(error) = tokio::fs::create_dir_all(&self.root).await {
            warn!(%error, "error creating disk cache directory");
            return;
        }
        match self.list_entries().await {
            Ok(entries) => {
                counters.count = entries.len();
                counters.size = entries.iter().map(|(_, size, _)| size).sum();
            }
            Err(error) => warn!(%error, "error scanning disk cache directory"),
        }
        self.enforce_capacity(counters).await;
    }
}

async fn file_size(path: &Path) -> Option<u64> {
    tokio::fs::metadata(path).await.ok().map(|m| m.len())
}

/// Refresh the modification time, which is this cache's LRU clock.
fn touch(path: &Path) {
    let result = std::fs::File::options()
        .write(true)
        .open(path)
        .and_then(|file| file.set_modified(SystemTime::now()));
    if let Err(error) = result {
        warn!(path = %path.display(), %error, "error updating cache access time");
    }
}
