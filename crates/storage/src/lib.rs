use std::{fs, path::Path, str::FromStr};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{de::DeserializeOwned, Serialize};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};

/// The client's durable local state: a key → JSON-document table. Every write
/// replaces the whole document for its key, keeping the stored blob identical
/// to the in-memory view it was serialized from.
#[derive(Clone)]
pub struct LocalStore {
    pool: Pool<Sqlite>,
}

impl LocalStore {
    pub async fn open(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect_options)
            .await?;
        let store = Self { pool };
        store.ensure_documents_table().await?;
        Ok(store)
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    async fn ensure_documents_table(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                key        TEXT PRIMARY KEY,
                body       TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure documents table exists")?;
        Ok(())
    }

    pub async fn get_document(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT body FROM documents WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("failed to read document '{key}'"))?;
        Ok(row.map(|row| row.get::<String, _>(0)))
    }

    pub async fn put_document(&self, key: &str, body: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO documents (key, body, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET body=excluded.body, updated_at=excluded.updated_at",
        )
        .bind(key)
        .bind(body)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to write document '{key}'"))?;
        Ok(())
    }

    pub async fn delete_document(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM documents WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to delete document '{key}'"))?;
        Ok(())
    }

    pub async fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let Some(body) = self.get_document(key).await? else {
            return Ok(None);
        };
        let value = serde_json::from_str(&body)
            .with_context(|| format!("document '{key}' holds malformed JSON"))?;
        Ok(Some(value))
    }

    pub async fn store<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let body = serde_json::to_string(value)
            .with_context(|| format!("failed to serialize document '{key}'"))?;
        self.put_document(key, &body).await
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return Ok(());
    }
    let file = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();
    match Path::new(file).parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            fs::create_dir_all(parent).with_context(|| {
                format!(
                    "failed to create parent directory '{}' for '{database_url}'",
                    parent.display()
                )
            })
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
