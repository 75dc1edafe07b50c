//! PostgreSQL-backed mutation log store.

use crate::mutation::store::check_successors;
use crate::mutation::{LogError, LogResult, LogStore, MutationRecord};
use async_trait::async_trait;
use sqlx::{PgPool, Row};

/// Stores each record as JSONB keyed by its sequence number
#[derive(Clone)]
pub struct PgLogStore {
    pool: PgPool,
}

impl PgLogStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the log table if it does not exist
    pub async fn ensure_schema(&self) -> LogResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS mutation_log (
                seq BIGINT PRIMARY KEY,
                match_id TEXT NOT NULL,
                cause TEXT NOT NULL,
                recorded_at TIMESTAMPTZ NOT NULL,
                record JSONB NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS mutation_log_match_id ON mutation_log (match_id)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn to_db_seq(seq: u64) -> LogResult<i64> {
    i64::try_from(seq).map_err(|_| LogError::Storage(format!("sequence {seq} out of range")))
}

#[async_trait]
impl LogStore for PgLogStore {
    async fn load_from(&self, after: u64) -> LogResult<Vec<MutationRecord>> {
        let rows = sqlx::query("SELECT record FROM mutation_log WHERE seq > $1 ORDER BY seq")
            .bind(to_db_seq(after)?)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|r| {
                let value: serde_json::Value = r.get("record");
                Ok(serde_json::from_value(value)?)
            })
            .collect()
    }

    async fn append_batch(&self, records: &[MutationRecord]) -> LogResult<()> {
        let mut tx = self.pool.begin().await?;

        let head: Option<i64> = sqlx::query_scalar("SELECT MAX(seq) FROM mutation_log")
            .fetch_one(&mut *tx)
            .await?;
        check_successors(head.unwrap_or(0) as u64, records)?;

        for record in records {
            sqlx::query(
                "INSERT INTO mutation_log (seq, match_id, cause, recorded_at, record)
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(to_db_seq(record.seq)?)
            .bind(record.match_id.to_string())
            .bind(record.cause.to_string())
            .bind(record.timestamp)
            .bind(serde_json::to_value(record)?)
            .execute(&mut *tx)
            .await?;
        }

        // Dropping the transaction on an early return rolls it back
        tx.commit().await?;
        Ok(())
    }
}
