//! One-file-per-fingerprint cache directory.
//!
//! Layout: `<dir>/<fingerprint>.json` holding `{prompt, response, timestamp, model}`.
//! Writes go to a uniquely named temp file in the same directory, are synced,
//! then renamed over the target, so readers never observe a partial entry.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

use docenrich_shared::{CacheEntry, DocEnrichError, Result};

use crate::{Fingerprint, FingerprintCache};

/// Filesystem-backed [`FingerprintCache`].
#[derive(Debug, Clone)]
pub struct FsCache {
    dir: PathBuf,
}

impl FsCache {
    /// Use `dir` as the cache directory, creating it if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .map_err(|e| DocEnrichError::CacheIo(format!("{}: {e}", dir.display())))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.dir.join(format!("{fingerprint}.json"))
    }

    /// Number of stored entries.
    pub fn len(&self) -> Result<usize> {
        Ok(self.entry_files()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Delete every stored entry. Returns how many were removed.
    pub fn purge(&self) -> Result<usize> {
        let files = self.entry_files()?;
        for path in &files {
            std::fs::remove_file(path)
                .map_err(|e| DocEnrichError::CacheIo(format!("{}: {e}", path.display())))?;
        }
        tracing::info!(dir = %self.dir.display(), removed = files.len(), "purged cache");
        Ok(files.len())
    }

    fn entry_files(&self) -> Result<Vec<PathBuf>> {
        let read_dir = std::fs::read_dir(&self.dir)
            .map_err(|e| DocEnrichError::CacheIo(format!("{}: {e}", self.dir.display())))?;
        let mut files = Vec::new();
        for item in read_dir {
            let path = item
                .map_err(|e| DocEnrichError::CacheIo(e.to_string()))?
                .path();
            let is_entry = path.extension().is_some_and(|ext| ext == "json")
                && path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .is_some_and(|s| Fingerprint::from_hex(s).is_ok());
            if is_entry {
                files.push(path);
            }
        }
        Ok(files)
    }
}

#[async_trait]
impl FingerprintCache for FsCache {
    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>> {
        let path = self.entry_path(fingerprint);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(DocEnrichError::CacheIo(format!("{}: {e}", path.display())));
            }
        };

        let entry = serde_json::from_slice(&bytes).map_err(|e| {
            DocEnrichError::CacheIo(format!("corrupt entry {}: {e}", path.display()))
        })?;
        debug!(%fingerprint, "cache hit");
        Ok(Some(entry))
    }

    async fn put(&self, fingerprint: &Fingerprint, entry: &CacheEntry) -> Result<()> {
        let target = self.entry_path(fingerprint);
        let temp = self
            .dir
            .join(format!(".{fingerprint}.{}.tmp", Uuid::now_v7()));

        let body = serde_json::to_vec_pretty(entry)
            .map_err(|e| DocEnrichError::CacheIo(format!("serialize entry: {e}")))?;

        if let Err(e) = write_synced(&temp, &body).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(DocEnrichError::CacheIo(format!("{}: {e}", temp.display())));
        }

        if let Err(e) = tokio::fs::rename(&temp, &target).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(DocEnrichError::CacheIo(format!("{}: {e}", target.display())));
        }

        debug!(%fingerprint, bytes = body.len(), "cached response");
        Ok(())
    }
}

async fn write_synced(path: &Path, body: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(body).await?;
    file.sync_all().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::Arc;

    fn temp_cache() -> FsCache {
        let dir = std::env::temp_dir().join(format!("docenrich-fs-cache-{}", Uuid::now_v7()));
        FsCache::open(dir).expect("open cache dir")
    }

    fn entry(response: &str) -> CacheEntry {
        CacheEntry {
            prompt: "system\n\nuser".into(),
            response: response.into(),
            timestamp: Utc::now(),
            model: "gpt-4o-mini".into(),
        }
    }

    #[tokio::test]
    async fn miss_then_hit() {
        let cache = temp_cache();
        let fp = Fingerprint::of(&["system", "user"]);

        assert!(cache.get(&fp).await.expect("get miss").is_none());

        cache.put(&fp, &entry(r#"{"ok":true}"#)).await.expect("put");
        let hit = cache.get(&fp).await.expect("get hit").expect("entry");
        assert_eq!(hit.response, r#"{"ok":true}"#);
        assert_eq!(hit.model, "gpt-4o-mini");

        let on_disk = cache.dir().join(format!("{fp}.json"));
        let raw = std::fs::read_to_string(on_disk).expect("entry file");
        assert!(raw.contains("\"prompt\""));
        assert!(raw.contains("\"timestamp\""));

        let _ = std::fs::remove_dir_all(cache.dir());
    }

    #[tokio::test]
    async fn no_temp_files_left_behind() {
        let cache = temp_cache();
        for i in 0..5 {
            let fp = Fingerprint::of(&["s", &i.to_string()]);
            cache.put(&fp, &entry("r")).await.unwrap();
        }
        let leftovers = std::fs::read_dir(cache.dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
        assert_eq!(cache.len().unwrap(), 5);

        let _ = std::fs::remove_dir_all(cache.dir());
    }

    #[tokio::test]
    async fn concurrent_puts_same_and_distinct_keys() {
        let cache = Arc::new(temp_cache());
        let shared = Fingerprint::of(&["same", "payload"]);

        let mut handles = Vec::new();
        for i in 0..16 {
            let cache = cache.clone();
            let shared = shared.clone();
            handles.push(tokio::spawn(async move {
                cache.put(&shared, &entry("identical")).await.unwrap();
                let own = Fingerprint::of(&["distinct", &i.to_string()]);
                cache.put(&own, &entry(&format!("r{i}"))).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(cache.get(&shared).await.unwrap().unwrap().response, "identical");
        for i in 0..16 {
            let own = Fingerprint::of(&["distinct", &i.to_string()]);
            assert_eq!(cache.get(&own).await.unwrap().unwrap().response, format!("r{i}"));
        }
        assert_eq!(cache.len().unwrap(), 17);

        let _ = std::fs::remove_dir_all(cache.dir());
    }

    #[tokio::test]
    async fn corrupt_entry_is_cache_io_error() {
        let cache = temp_cache();
        let fp = Fingerprint::of(&["broken"]);
        std::fs::write(cache.dir().join(format!("{fp}.json")), "{not json").unwrap();

        let err = cache.get(&fp).await.unwrap_err();
        assert_eq!(err.class(), "cache_io");

        let _ = std::fs::remove_dir_all(cache.dir());
    }

    #[tokio::test]
    async fn purge_removes_entries_only() {
        let cache = temp_cache();
        cache.put(&Fingerprint::of(&["a"]), &entry("a")).await.unwrap();
        cache.put(&Fingerprint::of(&["b"]), &entry("b")).await.unwrap();
        std::fs::write(cache.dir().join("README"), "keep me").unwrap();

        assert_eq!(cache.purge().unwrap(), 2);
        assert!(cache.is_empty().unwrap());
        assert!(cache.dir().join("README").exists());

        let _ = std::fs::remove_dir_all(cache.dir());
    }
}
