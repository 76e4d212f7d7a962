use std::str::FromStr;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use crate::cache::{resolve_rank_range, CacheStore};
use crate::error::Result;

/// SQLite-backed store: `kv` for records, `zset` for sorted indexes.
pub struct SqliteCacheStore {
    pool: SqlitePool,
}

impl SqliteCacheStore {
    /// Open (creating if needed) the database file and apply migrations.
    pub async fn connect(db_path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{db_path}"))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        Self::from_pool(pool).await
    }

    /// Private in-memory database. A single connection keeps every query on
    /// the same database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl CacheStore for SqliteCacheStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let row = sqlx::query("SELECT value FROM kv WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(r) => Ok(Some(r.try_get::<Vec<u8>, _>("value")?)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO kv (key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        let mut removed = 0usize;
        for key in keys {
            let kv = sqlx::query("DELETE FROM kv WHERE key = ?")
                .bind(key)
                .execute(&mut *tx)
                .await?;
            removed += kv.rows_affected() as usize;

            let zset = sqlx::query("DELETE FROM zset WHERE name = ?")
                .bind(key)
                .execute(&mut *tx)
                .await?;
            if zset.rows_affected() > 0 {
                removed += 1;
            }
        }
        tx.commit().await?;
        Ok(removed)
    }

    async fn scan_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT key FROM kv WHERE substr(key, 1, ?) = ? ORDER BY key")
            .bind(prefix.chars().count() as i64)
            .bind(prefix)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|r| r.try_get::<String, _>("key").map_err(Into::into))
            .collect()
    }

    async fn zset_add(&self, index: &str, score: f64, member: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO zset (name, member, score) VALUES (?, ?, ?)
            ON CONFLICT(name, member) DO UPDATE SET score = excluded.score
            "#,
        )
        .bind(index)
        .bind(member)
        .bind(score)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn zset_reverse_range(&self, index: &str, start: isize, end: isize) -> Result<Vec<String>> {
        // Non-negative ranks map straight onto LIMIT/OFFSET.
        if start >= 0 && end >= 0 {
            if start > end {
                return Ok(Vec::new());
            }
            let rows = sqlx::query(
                "SELECT member FROM zset WHERE name = ? ORDER BY score DESC, member DESC LIMIT ? OFFSET ?",
            )
            .bind(index)
            .bind((end - start).saturating_add(1) as i64)
            .bind(start as i64)
            .fetch_all(&self.pool)
            .await?;
            return rows
                .iter()
                .map(|r| r.try_get::<String, _>("member").map_err(Into::into))
                .collect();
        }

        let rows = sqlx::query(
            "SELECT member FROM zset WHERE name = ? ORDER BY score DESC, member DESC",
        )
        .bind(index)
        .fetch_all(&self.pool)
        .await?;

        let Some((from, to)) = resolve_rank_range(rows.len(), start, end) else {
            return Ok(Vec::new());
        };
        rows[from..=to]
            .iter()
            .map(|r| r.try_get::<String, _>("member").map_err(Into::into))
            .collect()
    }
}
