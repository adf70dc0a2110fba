use std::{fs, path::Path, str::FromStr};

use anyhow::{Context, Result};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};

/// Fixed names under which the credentials are persisted. The names are part
/// of the on-disk contract and must not change between releases.
pub const ACCESS_TOKEN_KEY: &str = "token";
pub const REFRESH_TOKEN_KEY: &str = "refreshToken";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCredentials {
    pub access: String,
    pub refresh: String,
}

/// Durable client-side state. Holds the access/refresh credential pair across
/// restarts; everything else the client shows is re-fetched from the backend.
#[derive(Clone)]
pub struct ClientStore {
    pool: Pool<Sqlite>,
}

impl ClientStore {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // A single connection keeps `sqlite::memory:` databases coherent:
        // every pooled connection would otherwise get its own empty store.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect_options)
            .await?;

        let store = Self { pool };
        store.ensure_credentials_table().await?;
        Ok(store)
    }

    pub async fn in_memory() -> Result<Self> {
        Self::new("sqlite::memory:").await
    }

    async fn ensure_credentials_table(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS credentials (
                name  TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure credentials table exists")?;
        Ok(())
    }

    pub async fn store_credentials(&self, access: &str, refresh: &str) -> Result<()> {
        self.put(ACCESS_TOKEN_KEY, access).await?;
        self.put(REFRESH_TOKEN_KEY, refresh).await?;
        Ok(())
    }

    pub async fn load_credentials(&self) -> Result<Option<StoredCredentials>> {
        let access = self.get(ACCESS_TOKEN_KEY).await?;
        let refresh = self.get(REFRESH_TOKEN_KEY).await?;
        Ok(match (access, refresh) {
            (Some(access), Some(refresh)) => Some(StoredCredentials { access, refresh }),
            _ => None,
        })
    }

    pub async fn clear_credentials(&self) -> Result<()> {
        self.delete(ACCESS_TOKEN_KEY).await?;
        self.delete(REFRESH_TOKEN_KEY).await?;
        Ok(())
    }

    async fn put(&self, name: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO credentials (name, value) VALUES (?1, ?2)
            ON CONFLICT(name) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(name)
        .bind(value)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to store credential '{name}'"))?;
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM credentials WHERE name = ?1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("failed to load credential '{name}'"))?;
        Ok(row.map(|row| row.get::<String, _>(0)))
    }

    async fn delete(&self, name: &str) -> Result<()> {
        sqlx::query("DELETE FROM credentials WHERE name = ?1")
            .bind(name)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to clear credential '{name}'"))?;
        Ok(())
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return Ok(());
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();
    if path.is_empty() {
        return Ok(());
    }

    let Some(parent) = Path::new(path).parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn credentials_round_trip() {
        let store = ClientStore::in_memory().await.expect("store");

        assert_eq!(store.load_credentials().await.expect("load"), None);

        store
            .store_credentials("access-1", "refresh-1")
            .await
            .expect("store pair");
        assert_eq!(
            store.load_credentials().await.expect("load"),
            Some(StoredCredentials {
                access: "access-1".to_string(),
                refresh: "refresh-1".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn storing_again_overwrites_previous_pair() {
        let store = ClientStore::in_memory().await.expect("store");
        store
            .store_credentials("access-1", "refresh-1")
            .await
            .expect("first pair");
        store
            .store_credentials("access-2", "refresh-2")
            .await
            .expect("second pair");

        let loaded = store.load_credentials().await.expect("load").expect("pair");
        assert_eq!(loaded.access, "access-2");
        assert_eq!(loaded.refresh, "refresh-2");
    }

    #[tokio::test]
    async fn clearing_removes_both_keys() {
        let store = ClientStore::in_memory().await.expect("store");
        store
            .store_credentials("access-1", "refresh-1")
            .await
            .expect("pair");
        store.clear_credentials().await.expect("clear");
        assert_eq!(store.load_credentials().await.expect("load"), None);
    }
}
