//! Content-addressed response cache.
//!
//! A [`Fingerprint`] is the SHA-256 of the fully rendered request payload
//! (system instructions + user content). The same payload always maps to the
//! same entry, so entries can be reused across runs and across concurrent
//! workers without coordination.
//!
//! Stores:
//! - [`FsCache`]: one JSON file per fingerprint (default)
//! - [`SqlCache`]: embedded libSQL table
//! - [`MemoryCache`]: process-local map for tests and dry runs
//!
//! Entries are written once and never expire on their own; `purge` is the
//! only way to drop them.

mod fs;
mod memory;
mod migrations;
mod sql;

use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use docenrich_shared::{AppConfig, CacheBackend, CacheEntry, DocEnrichError, Result};

pub use fs::FsCache;
pub use memory::MemoryCache;
pub use sql::SqlCache;

/// Separator between payload parts so `("ab", "c")` and `("a", "bc")` differ.
const PART_SEPARATOR: u8 = 0x1f;

// ---------------------------------------------------------------------------
// Fingerprint
// ---------------------------------------------------------------------------

/// Hex-encoded SHA-256 of a rendered request payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint a payload made of ordered parts.
    pub fn of(parts: &[&str]) -> Self {
        let mut hasher = Sha256::new();
        for (i, part) in parts.iter().enumerate() {
            if i > 0 {
                hasher.update([PART_SEPARATOR]);
            }
            hasher.update(part.as_bytes());
        }
        Self(format!("{:x}", hasher.finalize()))
    }

    /// Parse a stored fingerprint, rejecting anything that is not 64 hex chars.
    pub fn from_hex(hex: &str) -> Result<Self> {
        if hex.len() == 64 && hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            Ok(Self(hex.to_ascii_lowercase()))
        } else {
            Err(DocEnrichError::validation(format!("not a fingerprint: {hex}")))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// FingerprintCache
// ---------------------------------------------------------------------------

/// Narrow get/put interface over a content-addressed store.
///
/// `get` is a local lookup and a miss is `Ok(None)`. `put` returns only once
/// the entry is durable. Concurrent puts to distinct keys must not interfere;
/// concurrent puts to the same key carry identical content and the last one wins.
#[async_trait]
pub trait FingerprintCache: Send + Sync {
    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>>;

    async fn put(&self, fingerprint: &Fingerprint, entry: &CacheEntry) -> Result<()>;
}

/// Open the store selected by the `[cache]` section.
pub async fn open_cache(config: &AppConfig) -> Result<Arc<dyn FingerprintCache>> {
    let cache: Arc<dyn FingerprintCache> = match config.cache.backend {
        CacheBackend::Fs => Arc::new(FsCache::open(&config.cache.dir)?),
        CacheBackend::Libsql => {
            Arc::new(SqlCache::open(std::path::Path::new(&config.cache.db_path)).await?)
        }
        CacheBackend::Memory => Arc::new(MemoryCache::new()),
    };
    tracing::debug!(backend = ?config.cache.backend, "opened fingerprint cache");
    Ok(cache)
}
