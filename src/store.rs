//! Persistent sample store.
//!
//! Schema depth is intentionally minimal: one `samples` table and a
//! `schema_meta` table recording the applied version, migrated with a small
//! ordered list of SQL statements rather than a general migration
//! framework. The relational schema itself is not the part of this system
//! under test here; what matters is that the supervisor and the ancillary
//! flush path have a real, working place to write to.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

/// One collected measurement.
#[derive(Debug, Clone)]
pub struct Sample {
    pub collected_at: DateTime<Utc>,
    pub reachable: bool,
    pub downstream_power_snr: Vec<(f64, f64)>,
    pub upstream_power: Vec<f64>,
}

impl Sample {
    #[cfg(test)]
    pub fn test_sample(seed: i64) -> Self {
        Self {
            collected_at: DateTime::from_timestamp(seed, 0).unwrap(),
            reachable: true,
            downstream_power_snr: vec![],
            upstream_power: vec![],
        }
    }
}

#[async_trait::async_trait]
pub trait Store: Send + Sync {
    async fn record_sample(&self, sample: &Sample) -> anyhow::Result<()>;
    async fn schema_version(&self) -> anyhow::Result<u32>;
}

const MIGRATIONS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS schema_meta (version INTEGER NOT NULL)",
    "CREATE TABLE IF NOT EXISTS samples (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        collected_at TEXT NOT NULL,
        reachable INTEGER NOT NULL,
        downstream_json TEXT NOT NULL,
        upstream_json TEXT NOT NULL
    )",
];

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(path: &std::path::Path) -> anyhow::Result<Self> {
        let url = format!("sqlite://{}?mode=rwc", path.display());
        let pool = SqlitePool::connect(&url).await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        for stmt in MIGRATIONS {
            sqlx::query(stmt).execute(&mut *tx).await?;
        }
        let version: Option<(i64,)> = sqlx::query_as("SELECT version FROM schema_meta LIMIT 1")
            .fetch_optional(&mut *tx)
            .await?;
        if version.is_none() {
            sqlx::query("INSERT INTO schema_meta (version) VALUES (?)")
                .bind(MIGRATIONS.len() as i64)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl Store for SqliteStore {
    async fn record_sample(&self, sample: &Sample) -> anyhow::Result<()> {
        let downstream_json = serde_json::to_string(&sample.downstream_power_snr)?;
        let upstream_json = serde_json::to_string(&sample.upstream_power)?;
        sqlx::query(
            "INSERT INTO samples (collected_at, reachable, downstream_json, upstream_json)
             VALUES (?, ?, ?, ?)",
        )
        .bind(sample.collected_at.to_rfc3339())
        .bind(sample.reachable)
        .bind(downstream_json)
        .bind(upstream_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn schema_version(&self) -> anyhow::Result<u32> {
        let row: (i64,) = sqlx::query_as("SELECT version FROM schema_meta LIMIT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0 as u32)
    }
}
