//! libSQL-backed [`FingerprintCache`].
//!
//! All entries live in a single `fingerprint_cache` table keyed by
//! fingerprint. Writes are upserts so a repeated put of the same key simply
//! replaces the row.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database, params};
use tokio::sync::Mutex;

use docenrich_shared::{CacheEntry, DocEnrichError, Result};

use crate::{Fingerprint, FingerprintCache, migrations};

/// Embedded database cache.
pub struct SqlCache {
    #[allow(dead_code)]
    db: Database,
    conn: Mutex<Connection>,
}

fn db_err(e: impl std::fmt::Display) -> DocEnrichError {
    DocEnrichError::CacheIo(e.to_string())
}

impl SqlCache {
    /// Open or create a cache database at `path`.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| DocEnrichError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;
        Self::from_database(db).await
    }

    /// Open a throwaway in-memory database.
    pub async fn open_in_memory() -> Result<Self> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(db_err)?;
        Self::from_database(db).await
    }

    async fn from_database(db: Database) -> Result<Self> {
        let conn = db.connect().map_err(db_err)?;
        let cache = Self {
            db,
            conn: Mutex::new(conn),
        };
        cache.run_migrations().await?;
        Ok(cache)
    }

    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;
        let conn = self.conn.lock().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying cache migration"
                );
                conn.execute_batch(migration.sql).await.map_err(|e| {
                    DocEnrichError::CacheIo(format!(
                        "migration v{} failed: {e}",
                        migration.version
                    ))
                })?;
            }
        }
        Ok(())
    }

    /// Current schema version, or 0 before the first migration.
    pub async fn get_schema_version(&self) -> u32 {
        let conn = self.conn.lock().await;
        let result = conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => match rows.next().await {
                Ok(Some(row)) => row.get::<u32>(0).unwrap_or(0),
                _ => 0,
            },
            Err(_) => 0,
        }
    }

    /// Number of stored entries.
    pub async fn len(&self) -> Result<u64> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query("SELECT COUNT(*) FROM fingerprint_cache", params![])
            .await
            .map_err(db_err)?;
        match rows.next().await.map_err(db_err)? {
            Some(row) => row.get::<i64>(0).map(|n| n as u64).map_err(db_err),
            None => Ok(0),
        }
    }

    /// Delete every stored entry. Returns how many were removed.
    pub async fn purge(&self) -> Result<u64> {
        let conn = self.conn.lock().await;
        let removed = conn
            .execute("DELETE FROM fingerprint_cache", params![])
            .await
            .map_err(db_err)?;
        tracing::info!(removed, "purged cache table");
        Ok(removed)
    }
}

#[async_trait]
impl FingerprintCache for SqlCache {
    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT prompt, response, model, created_at FROM fingerprint_cache WHERE fingerprint = ?1",
                params![fingerprint.as_str()],
            )
            .await
            .map_err(db_err)?;

        let Some(row) = rows.next().await.map_err(db_err)? else {
            return Ok(None);
        };

        let created_at: String = row.get(3).map_err(db_err)?;
        let timestamp = DateTime::parse_from_rfc3339(&created_at)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| DocEnrichError::CacheIo(format!("bad timestamp for {fingerprint}: {e}")))?;

        Ok(Some(CacheEntry {
            prompt: row.get(0).map_err(db_err)?,
            response: row.get(1).map_err(db_err)?,
            model: row.get(2).map_err(db_err)?,
            timestamp,
        }))
    }

    async fn put(&self, fingerprint: &Fingerprint, entry: &CacheEntry) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO fingerprint_cache (fingerprint, prompt, response, model, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(fingerprint) DO UPDATE SET
                prompt = excluded.prompt,
                response = excluded.response,
                model = excluded.model,
                created_at = excluded.created_at",
            params![
                fingerprint.as_str(),
                entry.prompt.as_str(),
                entry.response.as_str(),
                entry.model.as_str(),
                entry.timestamp.to_rfc3339()
            ],
        )
        .await
        .map_err(db_err)?;
        Ok(())
    }
}
