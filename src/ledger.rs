use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;

use crate::telegram::Update;

/// key: update-ledger -> append-only audit row per inbound bot event
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerEntry {
    pub update_id: i64,
    pub kind: String,
    pub chat_id: Option<i64>,
    pub sender_id: Option<i64>,
    pub text: Option<String>,
    pub command: Option<String>,
    pub callback_data: Option<String>,
    pub raw_payload: Value,
    pub received_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn from_update(update: &Update, received_at: DateTime<Utc>) -> Self {
        Self {
            update_id: update.update_id,
            kind: update.kind().to_string(),
            chat_id: update.chat_id(),
            sender_id: update.sender_id(),
            text: update.text().map(str::to_string),
            command: update.command(),
            callback_data: update.callback_data().map(str::to_string),
            raw_payload: update.raw.clone(),
            received_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Recorded,
    /// A row with this `update_id` already exists; nothing was written.
    Duplicate,
}

#[async_trait]
pub trait UpdateLedger: Send + Sync {
    async fn record(&self, entry: &LedgerEntry) -> Result<RecordOutcome, sqlx::Error>;

    /// `max(update_id) + 1`, or `None` for an empty ledger.
    async fn resume_cursor(&self) -> Result<Option<i64>, sqlx::Error>;
}

#[derive(Clone)]
pub struct PgUpdateLedger {
    pool: PgPool,
}

impl PgUpdateLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UpdateLedger for PgUpdateLedger {
    async fn record(&self, entry: &LedgerEntry) -> Result<RecordOutcome, sqlx::Error> {
        let inserted: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO bot_update_ledger (
                update_id,
                kind,
                chat_id,
                sender_id,
                text,
                command,
                callback_data,
                raw_payload,
                received_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (update_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(entry.update_id)
        .bind(&entry.kind)
        .bind(entry.chat_id)
        .bind(entry.sender_id)
        .bind(&entry.text)
        .bind(&entry.command)
        .bind(&entry.callback_data)
        .bind(&entry.raw_payload)
        .bind(entry.received_at)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match inserted {
            Some(_) => RecordOutcome::Recorded,
            None => RecordOutcome::Duplicate,
        })
    }

    async fn resume_cursor(&self) -> Result<Option<i64>, sqlx::Error> {
        let latest: Option<i64> = sqlx::query_scalar("SELECT MAX(update_id) FROM bot_update_ledger")
            .fetch_one(&self.pool)
            .await?;
        Ok(latest.map(|update_id| update_id + 1))
    }
}
