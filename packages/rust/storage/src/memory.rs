//! In-memory [`FingerprintCache`].

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use docenrich_shared::{CacheEntry, Result};

use crate::{Fingerprint, FingerprintCache};

/// Process-local cache. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<Fingerprint, CacheEntry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl FingerprintCache for MemoryCache {
    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>> {
        Ok(self.entries.read().await.get(fingerprint).cloned())
    }

    async fn put(&self, fingerprint: &Fingerprint, entry: &CacheEntry) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(fingerprint.clone(), entry.clone());
        Ok(())
    }
}
