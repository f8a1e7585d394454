//! KnowledgeFlowManager: subscription-based routing of published knowledge.
//!
//! Subscriptions are standing interests (categories and/or tags) with a
//! per-agent cap; registering past the cap evicts the oldest. Publishing
//! fans out one persisted delivery per matching active subscription, then
//! hands each delivery to a semaphore-bounded worker so one slow subscriber
//! never blocks the rest. Every sink call carries a timeout; failures retry
//! with doubling backoff up to the attempt budget, then dead-letter with a
//! warning. Delivery rows are never dropped, so nothing fails silently.
//!
//! Publishing itself never returns an error because a delivery failed; the
//! delivery ledger is the source of truth for what went out.

pub mod delivery;

use crate::config::SharedConfig;
use crate::error::{EngineError, Result};
use crate::store::{KnowledgeStore, ScoredEntry};
use crate::types::{
    normalize_tags, Delivery, DeliveryState, KnowledgeCategory, KnowledgeEntry, Subscription,
};

use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;
use tokio::sync::Semaphore;

use std::sync::Arc;

pub use delivery::{DeliverySink, NullSink};

/// How urgently a knowledge request needs an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Normal,
    High,
}

/// Result of a knowledge request.
#[derive(Debug)]
pub enum RequestOutcome {
    /// The store already held matching entries.
    Found(Vec<ScoredEntry>),
    /// Nothing matched; a one-shot subscription now waits for it.
    Waiting(Subscription),
    /// Nothing matched and the request was not urgent enough to wait.
    NothingFound,
}

/// Counters over the subscription and delivery tables.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct FlowMetrics {
    pub active_subscriptions: i64,
    pub pending: i64,
    pub retrying: i64,
    pub delivered: i64,
    pub dead_lettered: i64,
}

#[derive(sqlx::FromRow)]
struct SubscriptionRow {
    id: String,
    agent_id: String,
    categories: String,
    tags: String,
    active: bool,
    one_shot: bool,
    query: Option<String>,
    expires_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl SubscriptionRow {
    fn into_subscription(self) -> Subscription {
        Subscription {
            id: self.id,
            agent_id: self.agent_id,
            categories: serde_json::from_str(&self.categories).unwrap_or_default(),
            tags: serde_json::from_str(&self.tags).unwrap_or_default(),
            active: self.active,
            one_shot: self.one_shot,
            query: self.query,
            expires_at: self.expires_at,
            created_at: self.created_at,
        }
    }
}

const SUBSCRIPTION_COLUMNS: &str =
    "id, agent_id, categories, tags, active, one_shot, query, expires_at, created_at";

#[derive(sqlx::FromRow)]
struct DeliveryRow {
    id: String,
    subscription_id: String,
    agent_id: String,
    entry_id: String,
    state: String,
    attempts: i64,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl DeliveryRow {
    fn into_delivery(self) -> Delivery {
        Delivery {
            id: self.id,
            subscription_id: self.subscription_id,
            agent_id: self.agent_id,
            entry_id: self.entry_id,
            state: DeliveryState::from_str_lossy(&self.state),
            attempts: self.attempts,
            last_error: self.last_error,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

const DELIVERY_COLUMNS: &str =
    "id, subscription_id, agent_id, entry_id, state, attempts, last_error, created_at, updated_at";

/// Subscription registry plus the outbound delivery pipeline.
#[derive(Clone)]
pub struct KnowledgeFlowManager {
    pool: SqlitePool,
    store: KnowledgeStore,
    sink: Arc<dyn DeliverySink>,
    /// Bounds concurrent outbound deliveries.
    workers: Arc<Semaphore>,
    config: SharedConfig,
}

impl KnowledgeFlowManager {
    pub fn new(
        pool: SqlitePool,
        store: KnowledgeStore,
        sink: Arc<dyn DeliverySink>,
        config: SharedConfig,
    ) -> Self {
        let workers = Arc::new(Semaphore::new(config.load().delivery_workers));
        Self {
            pool,
            store,
            sink,
            workers,
            config,
        }
    }

    // --- subscriptions ---

    /// Register a standing interest. At least one category or tag is
    /// required. When the agent is already at the subscription cap, the
    /// oldest active subscription is deactivated to make room.
    pub async fn subscribe(
        &self,
        agent_id: &str,
        categories: &[KnowledgeCategory],
        tags: &[String],
    ) -> Result<Subscription> {
        if agent_id.trim().is_empty() {
            return Err(EngineError::validation("agent id must not be empty"));
        }
        let tags = normalize_tags(tags);
        if categories.is_empty() && tags.is_empty() {
            return Err(EngineError::validation(
                "subscription needs at least one category or tag",
            ));
        }

        self.evict_past_cap(agent_id).await?;

        let subscription = Subscription {
            id: uuid::Uuid::new_v4().to_string(),
            agent_id: agent_id.to_owned(),
            categories: categories.to_vec(),
            tags,
            active: true,
            one_shot: false,
            query: None,
            expires_at: None,
            created_at: Utc::now(),
        };
        self.insert_subscription(&subscription).await?;
        Ok(subscription)
    }

    /// Deactivate a subscription. Surfaces `NotFound` when the id does not
    /// name an active subscription.
    pub async fn unsubscribe(&self, subscription_id: &str) -> Result<()> {
        let result = sqlx::query("UPDATE subscriptions SET active = 0 WHERE id = ? AND active = 1")
            .bind(subscription_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::not_found("subscription", subscription_id));
        }
        Ok(())
    }

    /// Active subscriptions for one agent, oldest first.
    pub async fn subscriptions_for(&self, agent_id: &str) -> Result<Vec<Subscription>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions \
             WHERE agent_id = ? AND active = 1 ORDER BY created_at ASC, id ASC",
        ))
        .bind(agent_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(SubscriptionRow::into_subscription)
            .collect())
    }

    async fn evict_past_cap(&self, agent_id: &str) -> Result<()> {
        let cap = self.config.load().subscription_cap;
        let active = self.subscriptions_for(agent_id).await?;
        if (active.len() as i64) < cap {
            return Ok(());
        }
        // Oldest first; evict enough to admit the newcomer.
        let excess = active.len() as i64 - cap + 1;
        for subscription in active.iter().take(excess as usize) {
            sqlx::query("UPDATE subscriptions SET active = 0 WHERE id = ?")
                .bind(&subscription.id)
                .execute(&self.pool)
                .await?;
            tracing::debug!(
                agent_id,
                subscription_id = %subscription.id,
                "evicted oldest subscription past the cap"
            );
        }
        Ok(())
    }

    async fn insert_subscription(&self, subscription: &Subscription) -> Result<()> {
        sqlx::query(
            "INSERT INTO subscriptions \
             (id, agent_id, categories, tags, active, one_shot, query, expires_at, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&subscription.id)
        .bind(&subscription.agent_id)
        .bind(serde_json::to_string(&subscription.categories).unwrap_or_else(|_| "[]".into()))
        .bind(serde_json::to_string(&subscription.tags).unwrap_or_else(|_| "[]".into()))
        .bind(subscription.active)
        .bind(subscription.one_shot)
        .bind(&subscription.query)
        .bind(subscription.expires_at)
        .bind(subscription.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn all_active_subscriptions(&self) -> Result<Vec<Subscription>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions \
             WHERE active = 1 ORDER BY created_at ASC, id ASC",
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(SubscriptionRow::into_subscription)
            .collect())
    }

    // --- publish ---

    /// Fan newly written entries out to matching subscribers.
    ///
    /// Creates exactly one delivery per (entry, matching active subscription)
    /// and hands them to the worker pool. With `targets`, only subscriptions
    /// owned by those agents are considered. Returns the number of deliveries
    /// enqueued; delivery failures surface in the ledger, never here.
    pub async fn publish(&self, entry_ids: &[String], targets: Option<&[String]>) -> Result<usize> {
        let now = Utc::now();
        let subscriptions = self.all_active_subscriptions().await?;
        let mut enqueued = 0;

        for entry_id in entry_ids {
            let Some(entry) = self.store.peek(entry_id).await? else {
                tracing::warn!(entry_id, "skipping publish of unknown entry");
                continue;
            };

            for subscription in &subscriptions {
                if subscription.agent_id == entry.source_agent {
                    continue; // authors do not receive their own entries
                }
                if let Some(targets) = targets {
                    if !targets.contains(&subscription.agent_id) {
                        continue;
                    }
                }
                if subscription.expired(now) {
                    continue;
                }
                if !subscription.matches(entry.category, &entry.tags) {
                    continue;
                }

                let delivery = self.enqueue(subscription, &entry).await?;
                enqueued += 1;
                if subscription.one_shot {
                    // Satisfied: the one-shot retires after its first match.
                    sqlx::query("UPDATE subscriptions SET active = 0 WHERE id = ?")
                        .bind(&subscription.id)
                        .execute(&self.pool)
                        .await?;
                }
                self.spawn_delivery(delivery, entry.clone());
            }
        }

        Ok(enqueued)
    }

    async fn enqueue(
        &self,
        subscription: &Subscription,
        entry: &KnowledgeEntry,
    ) -> Result<Delivery> {
        let now = Utc::now();
        let delivery = Delivery {
            id: uuid::Uuid::new_v4().to_string(),
            subscription_id: subscription.id.clone(),
            agent_id: subscription.agent_id.clone(),
            entry_id: entry.id.clone(),
            state: DeliveryState::Pending,
            attempts: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        sqlx::query(
            "INSERT INTO deliveries \
             (id, subscription_id, agent_id, entry_id, state, attempts, created_at, updated_at) \
             VALUES (?, ?, ?, ?, 'pending', 0, ?, ?)",
        )
        .bind(&delivery.id)
        .bind(&delivery.subscription_id)
        .bind(&delivery.agent_id)
        .bind(&delivery.entry_id)
        .bind(delivery.created_at)
        .bind(delivery.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(delivery)
    }

    fn spawn_delivery(&self, delivery: Delivery, entry: KnowledgeEntry) {
        let manager = self.clone();
        tokio::spawn(async move {
            let Ok(_permit) = manager.workers.clone().acquire_owned().await else {
                return; // semaphore closed: shutting down
            };
            if let Err(error) = manager.run_delivery(delivery, entry).await {
                tracing::warn!(%error, "delivery bookkeeping failed");
            }
        });
    }

    /// Drive one delivery to a terminal state.
    async fn run_delivery(&self, mut delivery: Delivery, entry: KnowledgeEntry) -> Result<()> {
        let config = self.config.load();
        let timeout = std::time::Duration::from_millis(config.delivery_timeout_ms);
        let max_attempts = config.max_delivery_attempts as i64;
        let mut backoff = std::time::Duration::from_millis(config.delivery_backoff_ms);

        loop {
            delivery.attempts += 1;
            let attempt = tokio::time::timeout(
                timeout,
                self.sink.deliver_entry(&delivery.agent_id, &entry),
            )
            .await;

            let failure = match attempt {
                Ok(Ok(())) => None,
                Ok(Err(error)) => Some(error.to_string()),
                Err(_) => Some(format!(
                    "delivery timed out after {}ms",
                    config.delivery_timeout_ms
                )),
            };

            match failure {
                None => {
                    self.mark(&delivery.id, DeliveryState::Delivered, delivery.attempts, None)
                        .await?;
                    return Ok(());
                }
                Some(error) if delivery.attempts >= max_attempts => {
                    tracing::warn!(
                        delivery_id = %delivery.id,
                        agent_id = %delivery.agent_id,
                        entry_id = %delivery.entry_id,
                        attempts = delivery.attempts,
                        %error,
                        "delivery dead-lettered"
                    );
                    self.mark(
                        &delivery.id,
                        DeliveryState::DeadLettered,
                        delivery.attempts,
                        Some(&error),
                    )
                    .await?;
                    return Ok(());
                }
                Some(error) => {
                    self.mark(
                        &delivery.id,
                        DeliveryState::Retrying,
                        delivery.attempts,
                        Some(&error),
                    )
                    .await?;
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
            }
        }
    }

    async fn mark(
        &self,
        delivery_id: &str,
        state: DeliveryState,
        attempts: i64,
        last_error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE deliveries SET state = ?, attempts = ?, last_error = ?, updated_at = ? \
             WHERE id = ?",
        )
        .bind(state.as_str())
        .bind(attempts)
        .bind(last_error)
        .bind(Utc::now())
        .bind(delivery_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // --- requests ---

    /// Ask for knowledge now. Search answers synchronously when it can; an
    /// urgent request that finds nothing leaves behind a one-shot expiring
    /// subscription keyed on the query's tokens.
    pub async fn request_knowledge(
        &self,
        agent_id: &str,
        query: &str,
        urgency: Urgency,
    ) -> Result<RequestOutcome> {
        if query.trim().is_empty() {
            return Err(EngineError::validation("query must not be empty"));
        }
        let hits = self.store.search(query, None, &[], 10).await?;
        if !hits.is_empty() {
            return Ok(RequestOutcome::Found(hits));
        }
        if urgency != Urgency::High {
            return Ok(RequestOutcome::NothingFound);
        }

        let config = self.config.load();
        let mut tokens: Vec<String> = crate::text::tokenize(query).into_iter().collect();
        tokens.sort();
        self.evict_past_cap(agent_id).await?;
        let subscription = Subscription {
            id: uuid::Uuid::new_v4().to_string(),
            agent_id: agent_id.to_owned(),
            categories: Vec::new(),
            tags: tokens,
            active: true,
            one_shot: true,
            query: Some(query.to_owned()),
            expires_at: Some(Utc::now() + Duration::seconds(config.request_ttl_secs)),
            created_at: Utc::now(),
        };
        self.insert_subscription(&subscription).await?;
        tracing::debug!(agent_id, query, subscription_id = %subscription.id,
            "urgent request parked as a one-shot subscription");
        Ok(RequestOutcome::Waiting(subscription))
    }

    /// Deactivate expired one-shot subscriptions and notify their owners.
    /// Returns the number expired. Run by the periodic ingestion sweep.
    pub async fn expire_one_shots(&self) -> Result<u64> {
        let now = Utc::now();
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions \
             WHERE active = 1 AND one_shot = 1 AND expires_at IS NOT NULL AND expires_at <= ?",
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        let mut expired = 0;
        for row in rows {
            let subscription = row.into_subscription();
            sqlx::query("UPDATE subscriptions SET active = 0 WHERE id = ?")
                .bind(&subscription.id)
                .execute(&self.pool)
                .await?;
            expired += 1;

            let query = subscription.query.clone().unwrap_or_default();
            if let Err(error) = self
                .sink
                .notify_request_expired(&subscription.agent_id, &query)
                .await
            {
                tracing::warn!(%error, agent_id = %subscription.agent_id,
                    "failed to notify agent of expired request");
            }
        }
        Ok(expired)
    }

    // --- observability ---

    /// Ledger counters for the analytics surface.
    pub async fn metrics(&self) -> Result<FlowMetrics> {
        let (active_subscriptions,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM subscriptions WHERE active = 1")
                .fetch_one(&self.pool)
                .await?;

        let mut metrics = FlowMetrics {
            active_subscriptions,
            ..FlowMetrics::default()
        };
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM deliveries GROUP BY state")
                .fetch_all(&self.pool)
                .await?;
        for (state, count) in rows {
            match DeliveryState::from_str_lossy(&state) {
                DeliveryState::Pending => metrics.pending = count,
                DeliveryState::Retrying => metrics.retrying = count,
                DeliveryState::Delivered => metrics.delivered = count,
                DeliveryState::DeadLettered => metrics.dead_lettered = count,
            }
        }
        Ok(metrics)
    }

    /// Dead-lettered deliveries, newest first, for inspection.
    pub async fn dead_letters(&self, limit: i64) -> Result<Vec<Delivery>> {
        let rows: Vec<DeliveryRow> = sqlx::query_as(&format!(
            "SELECT {DELIVERY_COLUMNS} FROM deliveries \
             WHERE state = 'dead_lettered' ORDER BY updated_at DESC, id ASC LIMIT ?",
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(DeliveryRow::into_delivery).collect())
    }
}

impl std::fmt::Debug for KnowledgeFlowManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KnowledgeFlowManager").finish_non_exhaustive()
    }
}
