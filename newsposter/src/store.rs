use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::{debug, info};

/// Persistent dedup state: processed message fingerprints, images already used
/// as covers, and hashes of downloaded cover files.
///
/// Every write is an `INSERT OR IGNORE` against a unique key, so recording the
/// same thing twice is a no-op and overlapping runs cannot corrupt the tables.
#[derive(Debug, Clone)]
pub struct ContentStore {
    pool: SqlitePool,
}

impl ContentStore {
    /// Open (or create) the store at `path` and make sure the schema exists.
    pub async fn open(path: &str) -> Result<Self> {
        let pool = common::init_db_pool(path).await?;
        Self::from_pool(pool).await
    }

    /// Private in-memory store, used by tests and dry runs.
    pub async fn in_memory() -> Result<Self> {
        let pool = common::init_memory_pool().await?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS processed (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                message_hash TEXT NOT NULL UNIQUE,
                seen_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create processed table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS used_images (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                provider TEXT NOT NULL,
                image_id TEXT NOT NULL,
                image_url TEXT,
                query TEXT,
                used_at TEXT,
                UNIQUE(provider, image_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create used_images table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS saved_files (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                filename TEXT NOT NULL UNIQUE,
                file_hash TEXT NOT NULL,
                created_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create saved_files table")?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_saved_files_hash ON saved_files (file_hash)")
            .execute(&self.pool)
            .await
            .context("failed to create saved_files index")?;

        Ok(())
    }

    pub async fn has_message(&self, message_hash: &str) -> Result<bool> {
        let found = sqlx::query_scalar::<_, i64>("SELECT 1 FROM processed WHERE message_hash = ? LIMIT 1")
            .bind(message_hash)
            .fetch_optional(&self.pool)
            .await
            .context("failed to look up message hash")?;
        Ok(found.is_some())
    }

    pub async fn record_message(&self, message_hash: &str) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO processed (message_hash, seen_at) VALUES (?, ?)")
            .bind(message_hash)
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .context("failed to record message hash")?;
        Ok(())
    }

    pub async fn is_image_used(&self, provider: &str, image_id: &str) -> Result<bool> {
        let found = sqlx::query_scalar::<_, i64>(
            "SELECT 1 FROM used_images WHERE provider = ? AND image_id = ? LIMIT 1",
        )
        .bind(provider)
        .bind(image_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to look up used image")?;
        Ok(found.is_some())
    }

    pub async fn record_image_used(
        &self,
        provider: &str,
        image_id: &str,
        image_url: &str,
        query: &str,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO used_images (provider, image_id, image_url, query, used_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(provider)
        .bind(image_id)
        .bind(image_url)
        .bind(query)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("failed to record used image")?;

        if result.rows_affected() == 0 {
            debug!(provider, image_id, "image already recorded as used");
        }
        Ok(())
    }

    pub async fn has_file_hash(&self, file_hash: &str) -> Result<bool> {
        let found = sqlx::query_scalar::<_, i64>("SELECT 1 FROM saved_files WHERE file_hash = ? LIMIT 1")
            .bind(file_hash)
            .fetch_optional(&self.pool)
            .await
            .context("failed to look up file hash")?;
        Ok(found.is_some())
    }

    pub async fn record_file(&self, filename: &str, file_hash: &str) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO saved_files (filename, file_hash, created_at) VALUES (?, ?, ?)")
            .bind(filename)
            .bind(file_hash)
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .context("failed to record saved file")?;
        Ok(())
    }

    /// Delete rows recorded before `cutoff` from all three tables.
    /// Returns the total number of rows removed.
    pub async fn prune(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut removed = 0;
        for (table, column) in [
            ("processed", "seen_at"),
            ("used_images", "used_at"),
            ("saved_files", "created_at"),
        ] {
            let sql = format!("DELETE FROM {} WHERE {} < ?", table, column);
            let result = sqlx::query(&sql)
                .bind(cutoff)
                .execute(&self.pool)
                .await
                .with_context(|| format!("failed to prune {}", table))?;
            removed += result.rows_affected();
        }
        if removed > 0 {
            info!(removed, %cutoff, "pruned content store");
        }
        Ok(removed)
    }
}
