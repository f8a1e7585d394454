//! InteractionLog: append-only record of agent-to-agent and agent-to-task
//! events.
//!
//! Records are never mutated; the only deletion is the retention sweep.
//! Appends need no read-modify-write, so concurrent writers are trivially
//! safe.

use crate::error::{EngineError, Result};
use crate::types::{InteractionOutcome, InteractionRecord};

use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;

#[derive(sqlx::FromRow)]
struct InteractionRow {
    id: String,
    source_agent: String,
    target_agent: Option<String>,
    interaction_type: String,
    payload: String,
    outcome: String,
    created_at: DateTime<Utc>,
}

impl InteractionRow {
    fn into_record(self) -> InteractionRecord {
        InteractionRecord {
            id: self.id,
            source_agent: self.source_agent,
            target_agent: self.target_agent,
            interaction_type: self.interaction_type,
            payload: serde_json::from_str(&self.payload)
                .unwrap_or_else(|_| serde_json::Value::Object(Default::default())),
            outcome: InteractionOutcome::from_str_lossy(&self.outcome),
            created_at: self.created_at,
        }
    }
}

const INTERACTION_COLUMNS: &str =
    "id, source_agent, target_agent, interaction_type, payload, outcome, created_at";

/// Append-only interaction log.
#[derive(Clone)]
pub struct InteractionLog {
    pool: SqlitePool,
}

impl InteractionLog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append one interaction. The payload must be a JSON object; it is
    /// validated here, at ingestion, not at consumption.
    ///
    /// Well-known payload keys (schema v1): `entry_id` — the knowledge entry
    /// this interaction applied, read by the recommendation engine;
    /// `task_id` — correlates interactions with feedback.
    pub async fn record(
        &self,
        source_agent: &str,
        target_agent: Option<&str>,
        interaction_type: &str,
        payload: serde_json::Value,
        outcome: InteractionOutcome,
    ) -> Result<InteractionRecord> {
        if source_agent.trim().is_empty() {
            return Err(EngineError::validation("source agent must not be empty"));
        }
        if interaction_type.trim().is_empty() {
            return Err(EngineError::validation(
                "interaction type must not be empty",
            ));
        }
        if !payload.is_object() {
            return Err(EngineError::validation("payload must be a JSON object"));
        }

        let record = InteractionRecord {
            id: uuid::Uuid::new_v4().to_string(),
            source_agent: source_agent.to_owned(),
            target_agent: target_agent.map(str::to_owned),
            interaction_type: interaction_type.to_owned(),
            payload,
            outcome,
            created_at: Utc::now(),
        };

        sqlx::query(
            "INSERT INTO interactions \
             (id, source_agent, target_agent, interaction_type, payload, outcome, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.id)
        .bind(&record.source_agent)
        .bind(&record.target_agent)
        .bind(&record.interaction_type)
        .bind(record.payload.to_string())
        .bind(record.outcome.as_str())
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;

        Ok(record)
    }

    /// All interactions inside a window, oldest first (deterministic input
    /// for pattern detection).
    pub async fn in_window(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<InteractionRecord>> {
        let rows: Vec<InteractionRow> = sqlx::query_as(&format!(
            "SELECT {INTERACTION_COLUMNS} FROM interactions \
             WHERE created_at >= ? AND created_at < ? \
             ORDER BY created_at ASC, id ASC",
        ))
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(InteractionRow::into_record).collect())
    }

    /// Interactions recorded after a cursor, oldest first. Drives the
    /// incremental profile ingestion sweep.
    pub async fn since(
        &self,
        cursor: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<InteractionRecord>> {
        let rows: Vec<InteractionRow> = sqlx::query_as(&format!(
            "SELECT {INTERACTION_COLUMNS} FROM interactions \
             WHERE created_at > ? \
             ORDER BY created_at ASC, id ASC LIMIT ?",
        ))
        .bind(cursor)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(InteractionRow::into_record).collect())
    }

    /// Most recent interactions involving an agent (as source or target).
    pub async fn recent_for_agent(
        &self,
        agent_id: &str,
        limit: i64,
    ) -> Result<Vec<InteractionRecord>> {
        let rows: Vec<InteractionRow> = sqlx::query_as(&format!(
            "SELECT {INTERACTION_COLUMNS} FROM interactions \
             WHERE source_agent = ? OR target_agent = ? \
             ORDER BY created_at DESC, id ASC LIMIT ?",
        ))
        .bind(agent_id)
        .bind(agent_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(InteractionRow::into_record).collect())
    }

    /// Successful interactions between a pair of agents inside a window, in
    /// either direction. Tempers collaborator recommendations.
    pub async fn successes_between(
        &self,
        agent_a: &str,
        agent_b: &str,
        start: DateTime<Utc>,
    ) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM interactions \
             WHERE outcome = 'success' AND created_at >= ? \
               AND ((source_agent = ? AND target_agent = ?) \
                 OR (source_agent = ? AND target_agent = ?))",
        )
        .bind(start)
        .bind(agent_a)
        .bind(agent_b)
        .bind(agent_b)
        .bind(agent_a)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    /// Retention sweep: drop records older than the given number of days.
    /// Returns the number of removed rows.
    pub async fn sweep(&self, retention_days: i64) -> Result<u64> {
        let cutoff = Utc::now() - Duration::days(retention_days);
        let result = sqlx::query("DELETE FROM interactions WHERE created_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Total number of retained interactions.
    pub async fn count(&self) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM interactions")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }
}

impl std::fmt::Debug for InteractionLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InteractionLog").finish_non_exhaustive()
    }
}
