//! SQLite key-value store
//!
//! Durable backend for [`KvStore`]. Several processes may share one file;
//! the conditional put relies on SQLite's primary-key conflict handling.

use std::path::Path;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{Pool, Sqlite, SqlitePool};

use super::kv::{KvEntry, KvKey, KvStore};
use crate::error::AppError;

/// Key-value store persisted in a single `kv` table
pub struct SqliteKvStore {
    pool: Pool<Sqlite>,
}

fn encode_key(key: &KvKey) -> String {
    key.segments()
        .iter()
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn decode_key(raw: &str) -> Result<KvKey, AppError> {
    let segments = raw
        .split('/')
        .map(|segment| {
            urlencoding::decode(segment)
                .map(|decoded| decoded.into_owned())
                .map_err(|e| AppError::Persistence(format!("Corrupt key {:?}: {}", raw, e)))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(KvKey::new(segments))
}

impl SqliteKvStore {
    /// Open (or create) the database file and run migrations.
    pub async fn connect(path: &Path) -> Result<Self, AppError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| AppError::Database(sqlx::Error::Io(e)))?;
            }
        }

        let connection_string = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePool::connect(&connection_string).await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| {
                tracing::error!("Migration failed: {}", e);
                AppError::Persistence(format!("Migration failed: {}", e))
            })?;

        tracing::info!(path = %path.display(), "SQLite key-value store ready");
        Ok(Self { pool })
    }
}

#[async_trait]
impl KvStore for SqliteKvStore {
    async fn get(&self, key: &KvKey) -> Result<Option<Value>, AppError> {
        let raw = sqlx::query_scalar::<_, String>("SELECT value FROM kv WHERE key = ?")
            .bind(encode_key(key))
            .fetch_optional(&self.pool)
            .await?;

        raw.map(|text| serde_json::from_str(&text).map_err(AppError::from))
            .transpose()
    }

    async fn set(&self, key: &KvKey, value: Value) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO kv (key, value) VALUES (?, ?) ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(encode_key(key))
        .bind(value.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn set_if_absent(&self, key: &KvKey, value: Value) -> Result<bool, AppError> {
        let result =
            sqlx::query("INSERT INTO kv (key, value) VALUES (?, ?) ON CONFLICT(key) DO NOTHING")
                .bind(encode_key(key))
                .bind(value.to_string())
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn delete(&self, key: &KvKey) -> Result<(), AppError> {
        sqlx::query("DELETE FROM kv WHERE key = ?")
            .bind(encode_key(key))
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn list(&self, prefix: &KvKey) -> Result<Vec<KvEntry>, AppError> {
        let exact = encode_key(prefix);
        let rows = if prefix.segments().is_empty() {
            sqlx::query_as::<_, (String, String)>("SELECT key, value FROM kv ORDER BY key")
                .fetch_all(&self.pool)
                .await?
        } else {
            let nested = format!("{}/", exact);
            sqlx::query_as::<_, (String, String)>(
                "SELECT key, value FROM kv WHERE key = ? OR substr(key, 1, length(?)) = ? ORDER BY key",
            )
            .bind(&exact)
            .bind(&nested)
            .bind(&nested)
            .fetch_all(&self.pool)
            .await?
        };

        rows.into_iter()
            .map(|(key, value)| -> Result<KvEntry, AppError> {
                Ok(KvEntry {
                    key: decode_key(&key)?,
                    value: serde_json::from_str(&value)?,
                })
            })
            .collect()
    }
}
