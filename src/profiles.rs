//! ProfileStore: per-agent learning profiles and explicit feedback.
//!
//! Profiles are created lazily on first sight of an agent and updated
//! incrementally, one interaction or feedback at a time. The skill vector is
//! an EMA toward each observed outcome, so the hot path never recomputes a
//! profile from the full interaction history. Concurrent updaters race
//! through the same CAS-on-version loop the knowledge store uses.

use crate::config::SharedConfig;
use crate::error::{EngineError, Result};
use crate::types::{
    AgentLearningProfile, Feedback, InteractionOutcome, InteractionRecord, KnowledgeCategory,
};

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use std::collections::HashMap;

/// Skill key carrying the EMA of normalized feedback ratings.
pub(crate) const FEEDBACK_SKILL: &str = "feedback";

#[derive(sqlx::FromRow)]
struct ProfileRow {
    agent_id: String,
    skill_vector: String,
    interactions_observed: i64,
    successes: i64,
    failures: i64,
    last_active_at: DateTime<Utc>,
    version: i64,
    created_at: DateTime<Utc>,
}

impl ProfileRow {
    fn into_profile(self) -> AgentLearningProfile {
        AgentLearningProfile {
            agent_id: self.agent_id,
            skill_vector: serde_json::from_str(&self.skill_vector).unwrap_or_default(),
            interactions_observed: self.interactions_observed,
            successes: self.successes,
            failures: self.failures,
            last_active_at: self.last_active_at,
            version: self.version,
            created_at: self.created_at,
        }
    }
}

const PROFILE_COLUMNS: &str = "agent_id, skill_vector, interactions_observed, successes, \
     failures, last_active_at, version, created_at";

/// Lazily created, incrementally updated agent profiles plus the feedback
/// ledger.
#[derive(Clone)]
pub struct ProfileStore {
    pool: SqlitePool,
    config: SharedConfig,
}

impl ProfileStore {
    pub fn new(pool: SqlitePool, config: SharedConfig) -> Self {
        Self { pool, config }
    }

    /// Fetch a profile, or `None` when the agent has never been observed.
    pub async fn get(&self, agent_id: &str) -> Result<Option<AgentLearningProfile>> {
        let row: Option<ProfileRow> = sqlx::query_as(&format!(
            "SELECT {PROFILE_COLUMNS} FROM agent_profiles WHERE agent_id = ?",
        ))
        .bind(agent_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(ProfileRow::into_profile))
    }

    /// Fetch a profile, creating an empty one on first sight.
    pub async fn ensure(&self, agent_id: &str) -> Result<AgentLearningProfile> {
        if agent_id.trim().is_empty() {
            return Err(EngineError::validation("agent id must not be empty"));
        }
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO agent_profiles \
             (agent_id, skill_vector, interactions_observed, successes, failures, \
              last_active_at, version, created_at) \
             VALUES (?, '{}', 0, 0, 0, ?, 0, ?) \
             ON CONFLICT(agent_id) DO NOTHING",
        )
        .bind(agent_id)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get(agent_id)
            .await?
            .ok_or_else(|| EngineError::not_found("profile", agent_id))
    }

    /// All known profiles, ordered by agent id.
    pub async fn all(&self) -> Result<Vec<AgentLearningProfile>> {
        let rows: Vec<ProfileRow> = sqlx::query_as(&format!(
            "SELECT {PROFILE_COLUMNS} FROM agent_profiles ORDER BY agent_id ASC",
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ProfileRow::into_profile).collect())
    }

    /// Number of known agents.
    pub async fn count(&self) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM agent_profiles")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    /// Fold one interaction into the source agent's profile.
    ///
    /// The interaction type becomes a skill key; if the interaction touched a
    /// knowledge entry, the caller resolves its category and passes it as a
    /// second skill key. Each observed skill moves by EMA toward the outcome
    /// (success 1.0, failure 0.0, neutral 0.5).
    pub async fn apply_interaction(
        &self,
        record: &InteractionRecord,
        category_hint: Option<KnowledgeCategory>,
    ) -> Result<AgentLearningProfile> {
        let observed = match record.outcome {
            InteractionOutcome::Success => 1.0,
            InteractionOutcome::Failure => 0.0,
            InteractionOutcome::Neutral => 0.5,
        };
        let mut skill_keys = vec![record.interaction_type.clone()];
        if let Some(category) = category_hint {
            skill_keys.push(category.as_str().to_owned());
        }

        self.modify(&record.source_agent, |profile| {
            let alpha = self.config.load().skill_ema_alpha;
            for key in &skill_keys {
                ema_step(&mut profile.skill_vector, key, observed, alpha);
            }
            profile.interactions_observed += 1;
            match record.outcome {
                InteractionOutcome::Success => profile.successes += 1,
                InteractionOutcome::Failure => profile.failures += 1,
                InteractionOutcome::Neutral => {}
            }
            if record.created_at > profile.last_active_at {
                profile.last_active_at = record.created_at;
            }
        })
        .await
    }

    /// Record explicit feedback. The rating bound is validated before any
    /// write; accepted feedback also nudges the agent's feedback skill.
    pub async fn submit_feedback(
        &self,
        agent_id: &str,
        task_id: &str,
        rating: i64,
        details: &str,
    ) -> Result<Feedback> {
        if !(1..=5).contains(&rating) {
            return Err(EngineError::validation("rating must be within 1..=5"));
        }
        if agent_id.trim().is_empty() {
            return Err(EngineError::validation("agent id must not be empty"));
        }
        if task_id.trim().is_empty() {
            return Err(EngineError::validation("task id must not be empty"));
        }

        let feedback = Feedback {
            id: uuid::Uuid::new_v4().to_string(),
            agent_id: agent_id.to_owned(),
            task_id: task_id.to_owned(),
            rating,
            details: details.trim().to_owned(),
            created_at: Utc::now(),
        };

        sqlx::query(
            "INSERT INTO feedback (id, agent_id, task_id, rating, details, created_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&feedback.id)
        .bind(&feedback.agent_id)
        .bind(&feedback.task_id)
        .bind(feedback.rating)
        .bind(&feedback.details)
        .bind(feedback.created_at)
        .execute(&self.pool)
        .await?;

        let observed = feedback.normalized_rating();
        self.modify(agent_id, |profile| {
            let alpha = self.config.load().skill_ema_alpha;
            ema_step(&mut profile.skill_vector, FEEDBACK_SKILL, observed, alpha);
        })
        .await?;

        Ok(feedback)
    }

    /// Feedback submitted after `since`, newest first.
    pub async fn feedback_since(&self, since: DateTime<Utc>) -> Result<Vec<Feedback>> {
        let rows: Vec<(String, String, String, i64, String, DateTime<Utc>)> = sqlx::query_as(
            "SELECT id, agent_id, task_id, rating, details, created_at FROM feedback \
             WHERE created_at >= ? ORDER BY created_at DESC, id ASC",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(
                |(id, agent_id, task_id, rating, details, created_at)| Feedback {
                    id,
                    agent_id,
                    task_id,
                    rating,
                    details,
                    created_at,
                },
            )
            .collect())
    }

    /// Read-modify-write under optimistic concurrency. The closure is
    /// re-applied on a fresh read each attempt.
    async fn modify<F>(&self, agent_id: &str, apply: F) -> Result<AgentLearningProfile>
    where
        F: Fn(&mut AgentLearningProfile),
    {
        let retries = self.config.load().update_retry_limit;
        for _ in 0..=retries {
            let current = self.ensure(agent_id).await?;
            let mut next = current.clone();
            apply(&mut next);
            next.version = current.version + 1;

            let updated = sqlx::query(
                "UPDATE agent_profiles \
                 SET skill_vector = ?, interactions_observed = ?, successes = ?, \
                     failures = ?, last_active_at = ?, version = version + 1 \
                 WHERE agent_id = ? AND version = ?",
            )
            .bind(serde_json::to_string(&next.skill_vector).unwrap_or_else(|_| "{}".into()))
            .bind(next.interactions_observed)
            .bind(next.successes)
            .bind(next.failures)
            .bind(next.last_active_at)
            .bind(agent_id)
            .bind(current.version)
            .execute(&self.pool)
            .await?;

            if updated.rows_affected() == 1 {
                return Ok(next);
            }
            tracing::debug!(agent_id, "profile update lost the version race, retrying");
        }

        Err(EngineError::conflict("profile", agent_id))
    }
}

impl std::fmt::Debug for ProfileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProfileStore").finish_non_exhaustive()
    }
}

fn ema_step(skills: &mut HashMap<String, f64>, key: &str, observed: f64, alpha: f64) {
    let current = skills.get(key).copied().unwrap_or(observed);
    let next = (1.0 - alpha) * current + alpha * observed;
    skills.insert(key.to_owned(), next.clamp(0.0, 1.0));
}
