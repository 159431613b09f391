//! Content-addressed result cache.
//!
//! Keyed by the SHA-256 of the raw uploaded bytes, so identical inputs map
//! to identical keys and a repeat upload short-circuits the whole pipeline.
//! Entries are written only after every stage succeeds (no partial
//! caching). Expiry is lazy: an expired row is deleted on lookup; the
//! `purge_expired` sweep exists for space reclamation only.

use anyhow::Result;
use chrono::Utc;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;

use docgraph_core::models::PipelineResult;

/// SHA-256 content hash of raw document bytes, hex-encoded.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

pub struct ResultCache {
    pool: SqlitePool,
}

impl ResultCache {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Look up a cached result. Expired entries are logically absent and
    /// lazily deleted.
    pub async fn lookup(&self, hash: &str) -> Result<Option<PipelineResult>> {
        let row: Option<(String, i64)> = sqlx::query_as(
            "SELECT result_json, expires_at FROM cache_entries WHERE content_hash = ?",
        )
        .bind(hash)
        .fetch_optional(&self.pool)
        .await?;

        let Some((json, expires_at)) = row else {
            return Ok(None);
        };

        if expires_at <= Utc::now().timestamp() {
            sqlx::query("DELETE FROM cache_entries WHERE content_hash = ?")
                .bind(hash)
                .execute(&self.pool)
                .await?;
            return Ok(None);
        }

        match serde_json::from_str(&json) {
            Ok(result) => Ok(Some(result)),
            Err(e) => {
                // A corrupt entry behaves like a miss; drop it.
                tracing::warn!(hash, error = %e, "dropping undecodable cache entry");
                sqlx::query("DELETE FROM cache_entries WHERE content_hash = ?")
                    .bind(hash)
                    .execute(&self.pool)
                    .await?;
                Ok(None)
            }
        }
    }

    /// Store a full pipeline result. Last write wins.
    pub async fn store(&self, hash: &str, result: &PipelineResult, ttl_days: i64) -> Result<()> {
        let now = Utc::now().timestamp();
        let json = serde_json::to_string(result)?;
        sqlx::query(
            r#"
            INSERT INTO cache_entries (content_hash, result_json, created_at, expires_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(content_hash) DO UPDATE SET
                result_json = excluded.result_json,
                created_at = excluded.created_at,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(hash)
        .bind(json)
        .bind(now)
        .bind(now + ttl_days * 24 * 60 * 60)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Delete all expired entries; returns the number removed.
    pub async fn purge_expired(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM cache_entries WHERE expires_at <= ?")
            .bind(Utc::now().timestamp())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
