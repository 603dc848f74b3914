// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL durable tier (SQLite or MySQL through the sqlx `Any` driver).
//!
//! One row per object:
//! ```sql
//! CREATE TABLE resource_blobs (
//!   path VARCHAR(768) PRIMARY KEY,  -- {bucket}/{group}/{path}, binary collation
//!   content_type TEXT,
//!   content_encoding TEXT,          -- "gzip" or NULL
//!   metadata TEXT,                  -- user metadata as a JSON object
//!   body LONGBLOB NOT NULL,
//!   content_length BIGINT NOT NULL, -- stored (encoded) length
//!   last_modified BIGINT NOT NULL   -- epoch millis
//! )
//! ```
//!
//! Prefix listings are range scans over the primary key, so paths compare
//! byte-wise: `path >= 'b/files/' AND path < 'b/files0'`.
//!
//! ## sqlx Any Driver Quirks
//!
//! MySQL TEXT columns come back as BLOB through `Any`, so text columns are
//! read as `String` first and as UTF-8 bytes second.

use std::collections::BTreeMap;
use std::sync::Once;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};

use super::traits::{Blob, BlobMetadata, BlobPage, BlobWrite, DurableTier, PageBuilder, StorageError};
use crate::resilience::retry::{retry, RetryConfig};
use crate::resource::now_millis;

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

/// Rows fetched per round trip while building a listing page.
const SCAN_CHUNK: usize = 256;

const META_COLUMNS: &str = "path, content_type, content_encoding, metadata, content_length, last_modified";

pub struct SqlDurableTier {
    pool: AnyPool,
    is_sqlite: bool,
}

impl SqlDurableTier {
    /// Connect with startup-mode retry (fails fast if config is wrong) and create the table.
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        install_drivers();

        let is_sqlite = connection_string.starts_with("sqlite:");

        let pool = retry("sql_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(20)
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(300))
                .connect(connection_string)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .await?;

        let store = Self { pool, is_sqlite };

        if is_sqlite {
            store.enable_wal_mode().await?;
        }

        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> AnyPool {
        self.pool.clone()
    }

    /// WAL lets listings read while the sync worker writes.
    async fn enable_wal_mode(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to enable WAL mode: {}", e)))?;

        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to set synchronous mode: {}", e)))?;

        Ok(())
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        let sql = if self.is_sqlite {
            r#"
            CREATE TABLE IF NOT EXISTS resource_blobs (
                path TEXT PRIMARY KEY,
                content_type TEXT,
                content_encoding TEXT,
                metadata TEXT,
                body BLOB NOT NULL,
                content_length INTEGER NOT NULL,
                last_modified INTEGER NOT NULL
            )
            "#
        } else {
            // 768 utf8mb4 chars is the InnoDB key limit; binary collation keeps byte order
            r#"
            CREATE TABLE IF NOT EXISTS resource_blobs (
                path VARCHAR(768) CHARACTER SET utf8mb4 COLLATE utf8mb4_bin PRIMARY KEY,
                content_type VARCHAR(255),
                content_encoding VARCHAR(32),
                metadata TEXT,
                body LONGBLOB NOT NULL,
                content_length BIGINT NOT NULL,
                last_modified BIGINT NOT NULL
            )
            "#
        };

        retry("sql_init_schema", &RetryConfig::startup(), || async {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .await?;

        Ok(())
    }

    fn upsert_sql(&self) -> &'static str {
        if self.is_sqlite {
            "INSERT INTO resource_blobs (path, content_type, content_encoding, metadata, body, content_length, last_modified)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(path) DO UPDATE SET
                content_type = excluded.content_type,
                content_encoding = excluded.content_encoding,
                metadata = excluded.metadata,
                body = excluded.body,
                content_length = excluded.content_length,
                last_modified = excluded.last_modified"
        } else {
            "INSERT INTO resource_blobs (path, content_type, content_encoding, metadata, body, content_length, last_modified)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON DUPLICATE KEY UPDATE
                content_type = VALUES(content_type),
                content_encoding = VALUES(content_encoding),
                metadata = VALUES(metadata),
                body = VALUES(body),
                content_length = VALUES(content_length),
                last_modified = VALUES(last_modified)"
        }
    }

    async fn upsert(&self, path: &str, meta: &BlobMetadata, body: &[u8]) -> Result<(), StorageError> {
        let metadata_json = serde_json::to_string(&meta.user_metadata)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let sql = self.upsert_sql();

        retry("sql_store", &RetryConfig::query(), || async {
            sqlx::query(sql)
                .bind(path)
                .bind(&meta.content_type)
                .bind(&meta.content_encoding)
                .bind(&metadata_json)
                .bind(body)
                .bind(body.len() as i64)
                .bind(meta.last_modified.unwrap_or_else(now_millis))
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            Ok(())
        })
        .await
    }

    /// Fetch up to `limit` metadata rows in `[lower, upper)`, or `(lower, upper)` when not inclusive.
    async fn scan(
        &self,
        lower: &str,
        inclusive: bool,
        upper: Option<&str>,
        limit: usize,
    ) -> Result<Vec<BlobMetadata>, StorageError> {
        let op = if inclusive { ">=" } else { ">" };
        let sql = match upper {
            Some(_) => format!(
                "SELECT {} FROM resource_blobs WHERE path {} ? AND path < ? ORDER BY path LIMIT ?",
                META_COLUMNS, op
            ),
            None => format!("SELECT {} FROM resource_blobs WHERE path {} ? ORDER BY path LIMIT ?", META_COLUMNS, op),
        };

        let rows = retry("sql_list", &RetryConfig::query(), || async {
            let mut query = sqlx::query(&sql).bind(lower);
            if let Some(upper) = upper {
                query = query.bind(upper);
            }
            query
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(format!("Failed to scan by prefix: {}", e)))
        })
        .await?;

        rows.iter().map(row_metadata).collect()
    }
}

/// Read a text column as String (SQLite) or UTF-8 bytes (MySQL through `Any`).
fn text_column(row: &AnyRow, column: &str) -> Option<String> {
    row.try_get::<String, _>(column).ok().or_else(|| {
        row.try_get::<Vec<u8>, _>(column)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
    })
}

fn row_metadata(row: &AnyRow) -> Result<BlobMetadata, StorageError> {
    let path = text_column(row, "path").ok_or_else(|| StorageError::Backend("row without path".to_string()))?;
    let user_metadata = match text_column(row, "metadata") {
        Some(json) if !json.is_empty() => serde_json::from_str::<BTreeMap<String, String>>(&json)
            .map_err(|e| StorageError::Corruption { key: path.clone(), reason: e.to_string() })?,
        _ => BTreeMap::new(),
    };
    let content_length: i64 = row.try_get("content_length").unwrap_or(0);
    let last_modified: Option<i64> = row.try_get("last_modified").ok();

    Ok(BlobMetadata {
        content_type: text_column(row, "content_type"),
        content_encoding: text_column(row, "content_encoding"),
        content_length: content_length.max(0) as u64,
        user_metadata,
        last_modified,
        path,
    })
}

/// Smallest string greater than every string starting with `prefix`.
///
/// `None` for the root prefix, which is unbounded.
fn prefix_upper_bound(prefix: &str) -> Option<String> {
    let mut chars: Vec<char> = prefix.chars().collect();
    while let Some(last) = chars.pop() {
        if let Some(next) = char::from_u32(last as u32 + 1) {
            chars.push(next);
            return Some(chars.into_iter().collect());
        }
    }
    None
}

#[async_trait]
impl DurableTier for SqlDurableTier {
    async fn load(&self, path: &str) -> Result<Option<Blob>, StorageError> {
        let sql = format!("SELECT {}, body FROM resource_blobs WHERE path = ?", META_COLUMNS);

        let row = retry("sql_load", &RetryConfig::query(), || async {
            sqlx::query(&sql)
                .bind(path)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .await?;

        match row {
            Some(row) => {
                let meta = row_metadata(&row)?;
                let body: Vec<u8> = row
                    .try_get("body")
                    .map_err(|e| StorageError::Backend(e.to_string()))?;
                Ok(Some(Blob { meta, body }))
            }
            None => Ok(None),
        }
    }

    async fn store(&self, path: &str, write: BlobWrite) -> Result<(), StorageError> {
        let meta = BlobMetadata {
            path: path.to_string(),
            content_type: Some(write.content_type),
            content_encoding: write.content_encoding,
            content_length: write.body.len() as u64,
            user_metadata: write.user_metadata,
            last_modified: Some(now_millis()),
        };
        self.upsert(path, &meta, &write.body).await
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        retry("sql_delete", &RetryConfig::query(), || async {
            sqlx::query("DELETE FROM resource_blobs WHERE path = ?")
                .bind(path)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn copy(&self, from: &str, to: &str) -> Result<(), StorageError> {
        let blob = self
            .load(from)
            .await?
            .ok_or_else(|| StorageError::NotFound(from.to_string()))?;
        let meta = BlobMetadata { path: to.to_string(), last_modified: Some(now_millis()), ..blob.meta };
        self.upsert(to, &meta, &blob.body).await
    }

    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        retry("sql_exists", &RetryConfig::query(), || async {
            let result = sqlx::query("SELECT 1 FROM resource_blobs WHERE path = ? LIMIT 1")
                .bind(path)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            Ok(result.is_some())
        })
        .await
    }

    async fn meta(&self, path: &str) -> Result<Option<BlobMetadata>, StorageError> {
        let sql = format!("SELECT {} FROM resource_blobs WHERE path = ?", META_COLUMNS);

        let row = retry("sql_meta", &RetryConfig::query(), || async {
            sqlx::query(&sql)
                .bind(path)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .await?;

        row.as_ref().map(row_metadata).transpose()
    }

    async fn list(
        &self,
        prefix: &str,
        token: Option<&str>,
        limit: usize,
        recursive: bool,
    ) -> Result<BlobPage, StorageError> {
        let upper = prefix_upper_bound(prefix);
        let mut page = PageBuilder::new(prefix, token, limit, recursive);

        // A folder token skips its whole subtree
        let mut lower = match token {
            Some(t) if t > prefix && t.ends_with('/') && !recursive => prefix_upper_bound(t).unwrap_or_default(),
            Some(t) if t > prefix => t.to_string(),
            _ => prefix.to_string(),
        };
        let mut inclusive = true;

        loop {
            let rows = self.scan(&lower, inclusive, upper.as_deref(), SCAN_CHUNK).await?;
            let fetched = rows.len();
            let Some(last) = rows.last().map(|m| m.path.clone()) else {
                break;
            };

            let mut full = false;
            for meta in rows {
                if !page.push(meta) {
                    full = true;
                    break;
                }
            }
            if full || fetched < SCAN_CHUNK {
                break;
            }
            lower = last;
            inclusive = false;
        }

        Ok(page.finish())
    }
}
