// src/report_log.rs
//! Append-only record of report attempts, read by the scheduler for interval
//! gating and by operators for display.
use std::collections::BTreeSet;
use std::str::FromStr;

use alloy::primitives::B256;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tokio::sync::Mutex;

use crate::types::{AggregatedValue, AggregationMethod, AttemptStatus, NewAttempt, ReportAttempt};

#[derive(thiserror::Error, Debug)]
pub enum LogError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("no attempt with id {0}")]
    UnknownAttempt(u64),
    #[error("attempt {id} already has hash {existing}, refusing {new}")]
    HashConflict { id: u64, existing: B256, new: B256 },
    #[error("hash {hash} already belongs to attempt {owner}")]
    DuplicateHash { hash: B256, owner: u64 },
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Terminal (or intermediate) result for an existing attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptUpdate {
    pub status: AttemptStatus,
    /// Hashes broadcast for the same nonce other than the first accepted one.
    pub replaced_hashes: Vec<B256>,
    pub error: Option<String>,
}

impl AttemptUpdate {
    pub fn failed(error: impl Into<String>) -> Self {
        Self { status: AttemptStatus::Failed, replaced_hashes: Vec::new(), error: Some(error.into()) }
    }
}

#[async_trait]
pub trait ReportLog: Send + Sync {
    async fn append(&self, attempt: NewAttempt) -> Result<ReportAttempt, LogError>;

    /// Record the first accepted hash. Assigning a different hash later, or a
    /// hash another attempt already holds, is an error.
    async fn assign_hash(&self, id: u64, hash: B256, nonce: u64) -> Result<(), LogError>;

    async fn update(&self, id: u64, update: AttemptUpdate) -> Result<(), LogError>;

    /// Time of the most recent attempt that counts as a report.
    async fn last_success(&self, query_id: B256) -> Result<Option<DateTime<Utc>>, LogError>;

    /// Oldest first; all queries when `query_id` is `None`.
    async fn attempts(&self, query_id: Option<B256>) -> Result<Vec<ReportAttempt>, LogError>;
}

#[derive(Default)]
pub struct MemoryReportLog {
    rows: Mutex<Vec<ReportAttempt>>,
}

impl MemoryReportLog {
    pub fn new() -> Self { Self::default() }
}

#[async_trait]
impl ReportLog for MemoryReportLog {
    async fn append(&self, a: NewAttempt) -> Result<ReportAttempt, LogError> {
        let mut rows = self.rows.lock().await;
        let attempt = ReportAttempt {
            id: rows.len() as u64 + 1,
            query_id: a.query_id,
            query_name: a.query_name,
            value: a.value,
            submitted_at: a.submitted_at,
            tx_hash: None,
            nonce: None,
            replaced_hashes: Vec::new(),
            status: a.status,
            error: None,
        };
        rows.push(attempt.clone());
        Ok(attempt)
    }

    async fn assign_hash(&self, id: u64, hash: B256, nonce: u64) -> Result<(), LogError> {
        let mut rows = self.rows.lock().await;
        if let Some(owner) = rows.iter().find(|r| r.id != id && r.tx_hash == Some(hash)) {
            return Err(LogError::DuplicateHash { hash, owner: owner.id });
        }
        let row = rows.iter_mut().find(|r| r.id == id).ok_or(LogError::UnknownAttempt(id))?;
        match row.tx_hash {
            Some(existing) if existing != hash => return Err(LogError::HashConflict { id, existing, new: hash }),
            _ => {}
        }
        row.tx_hash = Some(hash);
        row.nonce = Some(nonce);
        row.status = AttemptStatus::Submitted;
        Ok(())
    }

    async fn update(&self, id: u64, update: AttemptUpdate) -> Result<(), LogError> {
        let mut rows = self.rows.lock().await;
        let row = rows.iter_mut().find(|r| r.id == id).ok_or(LogError::UnknownAttempt(id))?;
        row.status = update.status;
        row.replaced_hashes = update.replaced_hashes;
        row.error = update.error;
        Ok(())
    }

    async fn last_success(&self, query_id: B256) -> Result<Option<DateTime<Utc>>, LogError> {
        let rows = self.rows.lock().await;
        Ok(rows
            .iter()
            .rev()
            .find(|r| r.query_id == query_id && r.status.is_success())
            .map(|r| r.submitted_at))
    }

    async fn attempts(&self, query_id: Option<B256>) -> Result<Vec<ReportAttempt>, LogError> {
        let rows = self.rows.lock().await;
        Ok(rows.iter().filter(|r| query_id.map_or(true, |q| r.query_id == q)).cloned().collect())
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS report_attempts (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    query_id        TEXT    NOT NULL,
    query_name      TEXT    NOT NULL,
    value           REAL    NOT NULL,
    method          TEXT    NOT NULL,
    sources         TEXT    NOT NULL,
    spread          REAL    NOT NULL,
    computed_at     TEXT    NOT NULL,
    submitted_at    TEXT    NOT NULL,
    tx_hash         TEXT,
    nonce           INTEGER,
    replaced_hashes TEXT    NOT NULL DEFAULT '[]',
    status          TEXT    NOT NULL,
    error           TEXT
);
CREATE INDEX IF NOT EXISTS report_attempts_query ON report_attempts (query_id, id);
CREATE UNIQUE INDEX IF NOT EXISTS report_attempts_hash ON report_attempts (tx_hash);
"#;

fn corrupt(what: &str, e: impl std::fmt::Display) -> LogError {
    LogError::Corrupt(format!("{what}: {e}"))
}

fn parse_hash(s: &str) -> Result<B256, LogError> {
    B256::from_str(s).map_err(|e| corrupt("hash", e))
}

fn hex(h: &B256) -> String { alloy::primitives::hex::encode_prefixed(h) }

const COLUMNS: &str = "id, query_id, query_name, value, method, sources, spread, computed_at, \
                       submitted_at, tx_hash, nonce, replaced_hashes, status, error";

pub struct SqliteReportLog {
    pool: SqlitePool,
}

impl SqliteReportLog {
    /// Open (creating if needed) the database at `url`, e.g. `sqlite://reports.db?mode=rwc`.
    pub async fn connect(url: &str) -> Result<Self, LogError> {
        let pool = SqlitePoolOptions::new().max_connections(1).connect(url).await?;
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    fn decode(row: &SqliteRow) -> Result<ReportAttempt, LogError> {
        let method: String = row.try_get("method")?;
        let method: AggregationMethod = serde_json::from_str(&method).map_err(|e| corrupt("method", e))?;
        let sources: String = row.try_get("sources")?;
        let sources: BTreeSet<String> = serde_json::from_str(&sources).map_err(|e| corrupt("sources", e))?;
        let replaced: String = row.try_get("replaced_hashes")?;
        let replaced: Vec<String> = serde_json::from_str(&replaced).map_err(|e| corrupt("replaced_hashes", e))?;
        let status: String = row.try_get("status")?;
        let tx_hash: Option<String> = row.try_get("tx_hash")?;
        let nonce: Option<i64> = row.try_get("nonce")?;
        let id: i64 = row.try_get("id")?;
        let query_id: String = row.try_get("query_id")?;

        Ok(ReportAttempt {
            id: id as u64,
            query_id: parse_hash(&query_id)?,
            query_name: row.try_get("query_name")?,
            value: AggregatedValue {
                value: row.try_get("value")?,
                method,
                contributing_source_ids: sources,
                computed_at: row.try_get("computed_at")?,
                spread: row.try_get("spread")?,
            },
            submitted_at: row.try_get("submitted_at")?,
            tx_hash: tx_hash.as_deref().map(parse_hash).transpose()?,
            nonce: nonce.map(|n| n as u64),
            replaced_hashes: replaced.iter().map(|h| parse_hash(h)).collect::<Result<_, _>>()?,
            status: AttemptStatus::from_str(&status).map_err(|e| corrupt("status", e))?,
            error: row.try_get("error")?,
        })
    }

    async fn fetch(&self, id: u64) -> Result<ReportAttempt, LogError> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM report_attempts WHERE id = ?"))
            .bind(id as i64)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(LogError::UnknownAttempt(id))?;
        Self::decode(&row)
    }
}

#[async_trait]
impl ReportLog for SqliteReportLog {
    async fn append(&self, a: NewAttempt) -> Result<ReportAttempt, LogError> {
        let method = serde_json::to_string(&a.value.method).map_err(|e| LogError::Corrupt(e.to_string()))?;
        let sources =
            serde_json::to_string(&a.value.contributing_source_ids).map_err(|e| LogError::Corrupt(e.to_string()))?;
        let id: i64 = sqlx::query(
            r#"
            INSERT INTO report_attempts
                (query_id, query_name, value, method, sources, spread, computed_at, submitted_at, status)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(hex(&a.query_id))
        .bind(&a.query_name)
        .bind(a.value.value)
        .bind(method)
        .bind(sources)
        .bind(a.value.spread)
        .bind(a.value.computed_at)
        .bind(a.submitted_at)
        .bind(a.status.as_str())
        .fetch_one(&self.pool)
        .await?
        .try_get("id")?;
        self.fetch(id as u64).await
    }

    async fn assign_hash(&self, id: u64, hash: B256, nonce: u64) -> Result<(), LogError> {
        let current = self.fetch(id).await?;
        if let Some(existing) = current.tx_hash.filter(|h| *h != hash) {
            return Err(LogError::HashConflict { id, existing, new: hash });
        }
        let owner = sqlx::query("SELECT id FROM report_attempts WHERE tx_hash = ? AND id != ? LIMIT 1")
            .bind(hex(&hash))
            .bind(id as i64)
            .fetch_optional(&self.pool)
            .await?;
        if let Some(owner) = owner {
            let owner: i64 = owner.try_get("id")?;
            return Err(LogError::DuplicateHash { hash, owner: owner as u64 });
        }
        sqlx::query("UPDATE report_attempts SET tx_hash = ?, nonce = ?, status = ? WHERE id = ?")
            .bind(hex(&hash))
            .bind(nonce as i64)
            .bind(AttemptStatus::Submitted.as_str())
            .bind(id as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update(&self, id: u64, update: AttemptUpdate) -> Result<(), LogError> {
        let replaced: Vec<String> = update.replaced_hashes.iter().map(hex).collect();
        let replaced = serde_json::to_string(&replaced).map_err(|e| LogError::Corrupt(e.to_string()))?;
        let done = sqlx::query("UPDATE report_attempts SET status = ?, replaced_hashes = ?, error = ? WHERE id = ?")
            .bind(update.status.as_str())
            .bind(replaced)
            .bind(update.error)
            .bind(id as i64)
            .execute(&self.pool)
            .await?;
        if done.rows_affected() == 0 {
            return Err(LogError::UnknownAttempt(id));
        }
        Ok(())
    }

    async fn last_success(&self, query_id: B256) -> Result<Option<DateTime<Utc>>, LogError> {
        let row = sqlx::query(
            "SELECT submitted_at FROM report_attempts \
             WHERE query_id = ? AND status IN ('confirmed', 'dry_run') ORDER BY id DESC LIMIT 1",
        )
        .bind(hex(&query_id))
        .fetch_optional(&self.pool)
        .await?;
        Ok(match row {
            Some(row) => Some(row.try_get("submitted_at")?),
            None => None,
        })
    }

    async fn attempts(&self, query_id: Option<B256>) -> Result<Vec<ReportAttempt>, LogError> {
        let rows = match query_id {
            Some(q) => {
                sqlx::query(&format!("SELECT {COLUMNS} FROM report_attempts WHERE query_id = ? ORDER BY id"))
                    .bind(hex(&q))
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query(&format!("SELECT {COLUMNS} FROM report_attempts ORDER BY id"))
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(Self::decode).collect()
    }
}
