use anyhow::{Context, Result};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use uuid::Uuid;

const PREF_LEARNING_LANGUAGE: &str = "learning_language";
const PREF_DEVICE_ID: &str = "device_id";
const PREF_ACCESS_TOKEN: &str = "auth.access_token";
const PREF_REFRESH_TOKEN: &str = "auth.refresh_token";

/// Device-local key-value preference store. Everything the client persists
/// between launches lives here; all learning content and progress is
/// server-owned and only cached in memory.
#[derive(Clone)]
pub struct Preferences {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredTokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

impl Preferences {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // A single connection keeps `sqlite::memory:` databases coherent (one
        // in-memory database per connection) and is plenty for preferences.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect_options)
            .await?;
        let prefs = Self { pool };
        prefs.ensure_preferences_table().await?;
        Ok(prefs)
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    async fn ensure_preferences_table(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS preferences (
                key        TEXT PRIMARY KEY,
                value      TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure preferences table exists")?;
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM preferences WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>(0)))
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO preferences (key, value, updated_at) VALUES (?, ?, CURRENT_TIMESTAMP)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM preferences WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn learning_language(&self) -> Result<Option<String>> {
        self.get(PREF_LEARNING_LANGUAGE).await
    }

    pub async fn set_learning_language(&self, code: &str) -> Result<()> {
        self.set(PREF_LEARNING_LANGUAGE, code).await
    }

    /// Stable per-install identifier, minted on first access.
    pub async fn device_id(&self) -> Result<String> {
        if let Some(existing) = self.get(PREF_DEVICE_ID).await? {
            return Ok(existing);
        }
        let minted = Uuid::new_v4().to_string();
        self.set(PREF_DEVICE_ID, &minted).await?;
        Ok(minted)
    }

    pub async fn stored_tokens(&self) -> Result<Option<StoredTokenPair>> {
        let access = self.get(PREF_ACCESS_TOKEN).await?;
        let refresh = self.get(PREF_REFRESH_TOKEN).await?;
        Ok(match (access, refresh) {
            (Some(access_token), Some(refresh_token)) => Some(StoredTokenPair {
                access_token,
                refresh_token,
            }),
            _ => None,
        })
    }

    pub async fn save_tokens(&self, access_token: &str, refresh_token: &str) -> Result<()> {
        self.set(PREF_ACCESS_TOKEN, access_token).await?;
        self.set(PREF_REFRESH_TOKEN, refresh_token).await?;
        Ok(())
    }

    pub async fn clear_tokens(&self) -> Result<()> {
        self.delete(PREF_ACCESS_TOKEN).await?;
        self.delete(PREF_REFRESH_TOKEN).await?;
        Ok(())
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
