//! Append-only log of issued watermarks
//!
//! One record per successful embedding. Lookups answer the forensic
//! questions: who received this id, what did a viewer receive, and who
//! received copies of an item.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};

use super::payload::WatermarkId;
use crate::core::error::LedgerError;
use crate::core::types::{AttachmentId, ItemId, ViewerId};

pub type LedgerResult<T> = std::result::Result<T, LedgerError>;

/// One issued watermark
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatermarkRecord {
    pub watermark_id: WatermarkId,
    pub viewer_id: ViewerId,
    pub item_id: ItemId,
    pub source_attachment: AttachmentId,
    pub created_at: DateTime<Utc>,
    pub source_ip: Option<String>,
}

#[async_trait]
pub trait WatermarkLedger: Send + Sync {
    async fn append(&self, record: WatermarkRecord) -> LedgerResult<()>;

    async fn find(&self, id: &WatermarkId) -> LedgerResult<Option<WatermarkRecord>>;

    /// Newest first
    async fn for_viewer(&self, viewer: ViewerId, limit: usize) -> LedgerResult<Vec<WatermarkRecord>>;

    /// Newest first
    async fn for_item(&self, item: ItemId, limit: usize) -> LedgerResult<Vec<WatermarkRecord>>;

    /// Drop records created before `cutoff`, returning how many were removed
    async fn prune_before(&self, cutoff: DateTime<Utc>) -> LedgerResult<u64>;
}

/// Ledger held in process memory
#[derive(Default)]
pub struct MemoryLedger {
    records: RwLock<Vec<WatermarkRecord>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    fn newest_matching<F>(&self, limit: usize, matches: F) -> Vec<WatermarkRecord>
    where
        F: Fn(&WatermarkRecord) -> bool,
    {
        let records = self.records.read();
        let mut found: Vec<_> = records.iter().filter(|r| matches(r)).cloned().collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        found.truncate(limit);
        found
    }
}

#[async_trait]
impl WatermarkLedger for MemoryLedger {
    async fn append(&self, record: WatermarkRecord) -> LedgerResult<()> {
        self.records.write().push(record);
        Ok(())
    }

    async fn find(&self, id: &WatermarkId) -> LedgerResult<Option<WatermarkRecord>> {
        Ok(self.records.read().iter().find(|r| &r.watermark_id == id).cloned())
    }

    async fn for_viewer(&self, viewer: ViewerId, limit: usize) -> LedgerResult<Vec<WatermarkRecord>> {
        Ok(self.newest_matching(limit, |r| r.viewer_id == viewer))
    }

    async fn for_item(&self, item: ItemId, limit: usize) -> LedgerResult<Vec<WatermarkRecord>> {
        Ok(self.newest_matching(limit, |r| r.item_id == item))
    }

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> LedgerResult<u64> {
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|r| r.created_at >= cutoff);
        Ok((before - records.len()) as u64)
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS watermark_records (
    watermark_id TEXT PRIMARY KEY NOT NULL,
    viewer_id INTEGER NOT NULL,
    item_id INTEGER NOT NULL,
    source_attachment INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    source_ip TEXT
);
CREATE INDEX IF NOT EXISTS idx_watermark_records_viewer ON watermark_records(viewer_id, created_at);
CREATE INDEX IF NOT EXISTS idx_watermark_records_item ON watermark_records(item_id, created_at);
"#;

/// Ledger persisted in SQLite
#[derive(Clone)]
pub struct SqliteLedger {
    pool: SqlitePool,
}

impl SqliteLedger {
    /// Open (creating if needed) the ledger database at `path`
    pub async fn open(path: PathBuf) -> LedgerResult<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| LedgerError::Database(sqlx::Error::Io(e)))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(if cfg!(feature = "wal") {
                SqliteJournalMode::Wal
            } else {
                SqliteJournalMode::Delete
            })
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        Self::with_pool(pool).await
    }

    pub async fn with_pool(pool: SqlitePool) -> LedgerResult<Self> {
        for statement in SCHEMA.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query(statement).execute(&pool).await?;
        }
        tracing::info!("Watermark ledger ready");
        Ok(Self { pool })
    }

    fn decode(row: &SqliteRow) -> LedgerResult<WatermarkRecord> {
        let raw_id: String = row.try_get("watermark_id")?;
        let watermark_id = WatermarkId::from_hex(&raw_id).ok_or_else(|| LedgerError::CorruptRecord {
            reason: format!("bad watermark id '{}'", raw_id),
        })?;

        Ok(WatermarkRecord {
            watermark_id,
            viewer_id: ViewerId(row.try_get::<i64, _>("viewer_id")? as u64),
            item_id: ItemId(row.try_get::<i64, _>("item_id")? as u64),
            source_attachment: AttachmentId(row.try_get::<i64, _>("source_attachment")? as u64),
            created_at: row.try_get("created_at")?,
            source_ip: row.try_get("source_ip")?,
        })
    }

    async fn select(&self, column: &str, key: u64, limit: usize) -> LedgerResult<Vec<WatermarkRecord>> {
        let sql = format!(
            "SELECT * FROM watermark_records WHERE {} = ? ORDER BY created_at DESC LIMIT ?",
            column
        );
        let rows = sqlx::query(&sql)
            .bind(key as i64)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::decode).collect()
    }
}

#[async_trait]
impl WatermarkLedger for SqliteLedger {
    async fn append(&self, record: WatermarkRecord) -> LedgerResult<()> {
        sqlx::query(
            "INSERT INTO watermark_records \
             (watermark_id, viewer_id, item_id, source_attachment, created_at, source_ip) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(record.watermark_id.to_hex())
        .bind(record.viewer_id.0 as i64)
        .bind(record.item_id.0 as i64)
        .bind(record.source_attachment.0 as i64)
        .bind(record.created_at)
        .bind(record.source_ip)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find(&self, id: &WatermarkId) -> LedgerResult<Option<WatermarkRecord>> {
        let row = sqlx::query("SELECT * FROM watermark_records WHERE watermark_id = ?")
            .bind(id.to_hex())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::decode).transpose()
    }

    async fn for_viewer(&self, viewer: ViewerId, limit: usize) -> LedgerResult<Vec<WatermarkRecord>> {
        self.select("viewer_id", viewer.0, limit).await
    }

    async fn for_item(&self, item: ItemId, limit: usize) -> LedgerResult<Vec<WatermarkRecord>> {
        self.select("item_id", item.0, limit).await
    }

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> LedgerResult<u64> {
        let result = sqlx::query("DELETE FROM watermark_records WHERE created_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
