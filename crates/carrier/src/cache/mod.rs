//! Two-tier response cache.
//!
//! Completed transfers can be cached under a key derived from the request URL
//! or supplied explicitly. Lookups hit the in-memory tier first and fall back
//! to disk, promoting disk hits back into memory. The disk tier survives
//! process restarts; the memory tier is purely a hot layer over it.

mod disk;
mod memory;

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::warn;

pub use disk::DiskCache;
pub use memory::MemoryCache;

use crate::error::{Error, Result};
use crate::response::ResponseHeader;

/// How a transfer interacts with the response cache.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum CachePolicy {
    /// Bypass the cache entirely.
    #[default]
    NoCache,
    /// Cache under a key derived from the request URL.
    ByUrl,
    /// Cache under an explicit key, decoupled from the URL.
    Key(String),
}

impl CachePolicy {
    /// The storage key this policy yields for `url`, if caching at all.
    pub fn key_for(&self, url: &str) -> Option<String> {
        match self {
            Self::NoCache => None,
            Self::ByUrl => Some(url.to_string()),
            Self::Key(key) => Some(key.clone()),
        }
    }
}

/// A cached response: the header and the complete body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub header: ResponseHeader,
    pub body: Bytes,
}

/// Configuration for a [`ResponseCache`].
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Directory name component for the disk tier.
    pub name: String,
    /// Parent directory for the disk tier. Defaults to the system temp dir.
    pub dir: PathBuf,
    /// Memory tier entry-count limit, `0` for unbounded.
    pub memory_count_limit: usize,
    /// Memory tier total-body-bytes limit, `0` for unbounded.
    pub memory_cost_limit: usize,
    /// Disk tier capacity in bytes.
    pub disk_capacity: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            name: "carrier-cache".to_string(),
            dir: std::env::temp_dir(),
            memory_count_limit: 0,
            memory_cost_limit: 512 * 1024 * 1024,
            disk_capacity: 1024 * 1024 * 1024,
        }
    }
}

/// The memory tier backed by the disk tier, behind one facade.
pub struct ResponseCache {
    memory: MemoryCache,
    disk: Arc<DiskCache>,
}

impl ResponseCache {
    pub fn new(config: CacheConfig) -> Self {
        let directory = config.dir.join(&config.name);
        Self {
            memory: MemoryCache::new(config.memory_count_limit, config.memory_cost_limit),
            disk: Arc::new(DiskCache::new(directory, config.disk_capacity)),
        }
    }

    /// Look `key` up, memory first. A disk hit is promoted into memory so
    /// repeat lookups skip deserialization.
    pub async fn get(&self, key: &str) -> Option<CacheEntry> {
        if let Some(entry) = self.memory.get(key) {
            return Some(entry);
        }
        let entry = self.disk.get(key).await?;
        self.memory.put(entry.clone());
        Some(entry)
    }

    /// Store an entry in both tiers. Disk failures are logged, not
    /// propagated; a cache write must never fail the transfer it trails.
    pub async fn put(&self, entry: CacheEntry) {
        if let Err(error) = self.disk.set(&entry).await {
            warn!(key = entry.key, %error, "error writing disk cache entry");
        }
        self.memory.put(entry);
    }

    pub async fn remove(&self, key: &str) {
        self.memory.remove(key);
        self.disk.remove(key).await;
    }

    /// Drop every entry in both tiers.
    pub async fn reset(&self) {
        self.memory.clear();
        self.disk.reset().await;
    }

    pub fn disk(&self) -> &Arc<DiskCache> {
        &self.disk
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

#[derive(Serialize, Deserialize)]
struct EntryHeader {
    key: String,
    header: ResponseHeader,
}

const LENGTH_PREFIX: usize = 8;

/// On-disk entry layout: a little-endian `u64` header length, the JSON
/// header, then the raw body bytes.
fn encode_entry(entry: &CacheEntry) -> Result<Vec<u8>> {
    let header = serde_json::to_vec(&EntryHeader {
        key: entry.key.clone(),
        header: entry.header.clone(),
    })
    .map_err(Error::other)?;

    let mut encoded = Vec::with_capacity(LENGTH_PREFIX + header.len() + entry.body.len());
    encoded.extend_from_slice(&(header.len() as u64).to_le_bytes());
    encoded.extend_from_slice(&header);
    encoded.extend_from_slice(&entry.body);
    Ok(encoded)
}

fn decode_entry(raw: &[u8]) -> Result<CacheEntry> {
    let prefix: [u8; LENGTH_PREFIX] = raw
        .get(..LENGTH_PREFIX)
        .and_then(|slice| slice.try_into().ok())
        .ok_or_else(|| Error::unspecified("cache entry shorter than its length prefix"))?;
    let header_len = u64::from_le_bytes(prefix) as usize;

    let header_end = LENGTH_PREFIX
        .checked_add(header_len)
        .filter(|end| *end <= raw.len())
        .ok_or_else(|| Error::unspecified("cache entry header length out of bounds"))?;

    let header: EntryHeader =
        serde_json::from_slice(&raw[LENGTH_PREFIX..header_end]).map_err(Error::other)?;

    Ok(CacheEntry {
        key: header.key,
        header: header.header,
        body: Bytes::copy_from_slice(&raw[header_end..]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_encoding_round_trips() {
        let entry = CacheEntry {
            key: "https://example.com/data".to_string(),
            header: ResponseHeader::synthesized(200, Some("https://example.com/data".into())),
            body: Bytes::from_static(b"payload bytes"),
        };

        let encoded = encode_entry(&entry).unwrap();
        let decoded = decode_entry(&encoded).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn truncated_entries_are_rejected() {
        let entry = CacheEntry {
            key: "k".to_string(),
            header: ResponseHeader::synthesized(200, None),
            body: Bytes::from_static(b"body"),
        };
        let encoded = encode_entry(&entry).unwrap();

        assert!(decode_entry(&encoded[..4]).is_err());
        assert!(decode_entry(&encoded[..LENGTH_PREFIX + 2]).is_err());
    }

    #[test]
    fn policy_keys() {
        assert_eq!(CachePolicy::NoCache.key_for("https://a"), None);
        assert_eq!(
            CachePolicy::ByUrl.key_for("https://a"),
            Some("https://a".to_string()),
        );
        assert_eq!(
            CachePolicy::Key("custom".into()).key_for("https://a"),
            Some("custom".to_string()),
        );
    }
}
