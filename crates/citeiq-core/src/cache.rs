//! Two-tier cache for raw provider responses.
//!
//! **L1** – [`DashMap`] in-memory map (lock-free concurrent reads).
//! **L2** – Optional directory on disk, one `<sha256 hex>.json` file per key
//! (persists across process restarts).
//!
//! On [`get`](ResponseCache::get): check L1 first; on miss, fall through to L2
//! and promote the entry back into L1 on hit. On
//! [`insert`](ResponseCache::insert): write-through to both tiers. L2 writes
//! go to a temporary file in the cache directory which is then renamed over
//! the final name, so readers never observe a partial entry and take no lock.
//!
//! Keys are a pure function of (provider, canonical query). Only successful
//! responses are stored, entries never expire, and I/O failures degrade to a
//! cache miss with a warning.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::CoreError;
use crate::provider::Provider;

/// Deterministic cache key: hex SHA-256 of `provider \n query`.
pub fn cache_key(provider: Provider, query: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(provider.name().as_bytes());
    hasher.update(b"\n");
    hasher.update(query.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// A cached provider response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub provider: Provider,
    pub query: String,
    /// Unix seconds at which the response was stored.
    pub stored_at: u64,
    pub payload: Vec<u8>,
}

/// On-disk envelope. The payload is base64 so arbitrary bytes survive JSON.
#[derive(Serialize, Deserialize)]
struct StoredEntry {
    provider: Provider,
    query: String,
    stored_at: u64,
    payload: String,
}

impl StoredEntry {
    fn from_entry(entry: &CacheEntry) -> Self {
        Self {
            provider: entry.provider,
            query: entry.query.clone(),
            stored_at: entry.stored_at,
            payload: BASE64.encode(&entry.payload),
        }
    }

    fn into_entry(self) -> Option<CacheEntry> {
        let payload = BASE64.decode(self.payload.as_bytes()).ok()?;
        Some(CacheEntry {
            provider: self.provider,
            query: self.query,
            stored_at: self.stored_at,
            payload,
        })
    }
}

fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Thread-safe two-tier cache for provider responses.
pub struct ResponseCache {
    entries: DashMap<String, CacheEntry>,
    dir: Option<PathBuf>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl std::fmt::Debug for ResponseCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseCache")
            .field("dir", &self.dir)
            .field("l1_entries", &self.entries.len())
            .field("hits", &self.hits())
            .field("misses", &self.misses())
            .finish()
    }
}

impl ResponseCache {
    /// Create an in-memory-only cache (no disk persistence).
    pub fn in_memory() -> Self {
        Self {
            entries: DashMap::new(),
            dir: None,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Open a persistent cache rooted at `dir`, creating it if needed.
    ///
    /// A path that exists but is not a directory, or cannot be created, is a
    /// configuration error.
    pub fn open(dir: &Path) -> Result<Self, CoreError> {
        if dir.exists() && !dir.is_dir() {
            return Err(CoreError::InvalidPath {
                path: dir.to_path_buf(),
                reason: "cache path exists and is not a directory".into(),
            });
        }
        std::fs::create_dir_all(dir).map_err(|e| CoreError::InvalidPath {
            path: dir.to_path_buf(),
            reason: format!("cannot create cache directory: {e}"),
        })?;
        tracing::info!(path = %dir.display(), "opened response cache");
        Ok(Self {
            dir: Some(dir.to_path_buf()),
            ..Self::in_memory()
        })
    }

    pub fn has_persistence(&self) -> bool {
        self.dir.is_some()
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    fn entry_path(&self, key: &str) -> Option<PathBuf> {
        self.dir.as_ref().map(|d| d.join(format!("{key}.json")))
    }

    /// Look up a cached response.
    pub fn get(&self, provider: Provider, query: &str) -> Option<CacheEntry> {
        let key = cache_key(provider, query);

        if let Some(entry) = self.entries.get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Some(entry.clone());
        }

        let found = self
            .read_disk(&key)
            .filter(|e| e.provider == provider && e.query == query);
        match found {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                self.entries.insert(key, entry.clone());
                Some(entry)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    fn read_disk(&self, key: &str) -> Option<CacheEntry> {
        let path = self.entry_path(key)?;
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "cache read failed");
                return None;
            }
        };
        match serde_json::from_slice::<StoredEntry>(&bytes) {
            Ok(stored) => stored.into_entry(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "corrupt cache entry ignored");
                None
            }
        }
    }

    /// Store a successful response. Disk failures are logged and swallowed.
    pub fn insert(&self, provider: Provider, query: &str, payload: Vec<u8>) {
        let key = cache_key(provider, query);
        let entry = CacheEntry {
            provider,
            query: query.to_string(),
            stored_at: now_epoch(),
            payload,
        };
        if let Err(e) = self.write_disk(&key, &entry) {
            tracing::warn!(provider = %provider, error = %e, "cache write failed");
        }
        self.entries.insert(key, entry);
    }

    fn write_disk(&self, key: &str, entry: &CacheEntry) -> std::io::Result<()> {
        let (Some(dir), Some(path)) = (self.dir.as_ref(), self.entry_path(key)) else {
            return Ok(());
        };
        let body = serde_json::to_vec(&StoredEntry::from_entry(entry))?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&body)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| e.error)?;
        Ok(())
    }

    /// Drop the in-memory tier; the disk tier is untouched.
    pub fn clear_memory(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}
