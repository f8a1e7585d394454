//! KnowledgeStore: durable keyed storage of knowledge entries with search.
//!
//! Wraps a dedicated SQLite pool for `knowledge.db`. The embedded schema also
//! carries the tables owned by the other subsystems (interactions, patterns,
//! insights, profiles, flow) so a single `connect` call prepares the whole
//! engine database.
//!
//! Reads never write: confidence decay is computed at read time from
//! `updated_at`, and usage counts accumulate in an in-memory batch that is
//! flushed periodically with additive SQL, keeping the read path free of
//! read-modify-write contention. Deletes are soft; tombstoned entries are
//! physically purged after a retention window so the graph and pattern
//! subsystems can observe the removal.

use crate::config::SharedConfig;
use crate::error::{EngineError, Result};
use crate::text;
use crate::types::{normalize_tags, EntryPatch, KnowledgeCategory, KnowledgeEntry};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

/// Connect to (or create) the engine database at the given path.
///
/// Runs embedded migrations, enables WAL mode, and configures a small pool.
pub async fn connect(path: &Path) -> Result<SqlitePool> {
    let url = format!("sqlite:{}?mode=rwc", path.display());
    let options = SqliteConnectOptions::from_str(&url)
        .map_err(|error| EngineError::validation(format!("invalid db path: {error}")))?
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .busy_timeout(std::time::Duration::from_secs(5))
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await?;

    run_migrations(&pool).await?;

    Ok(pool)
}

/// Run the embedded schema. Raw SQL rather than sqlx::migrate! because the
/// engine database is self-contained and every statement is `IF NOT EXISTS`.
async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::raw_sql(SCHEMA_V1).execute(pool).await?;
    sqlx::raw_sql(SCHEMA_V2).execute(pool).await?;
    sqlx::raw_sql(SCHEMA_V3).execute(pool).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Usage counter batch
// ---------------------------------------------------------------------------

/// Pending usage-count increments, accumulated off the read path.
#[derive(Default)]
pub(crate) struct UsageCounter {
    pending: Mutex<HashMap<String, i64>>,
}

impl UsageCounter {
    fn bump(&self, entry_id: &str) -> usize {
        let mut pending = self.pending.lock();
        *pending.entry(entry_id.to_owned()).or_insert(0) += 1;
        pending.len()
    }

    fn drain(&self) -> HashMap<String, i64> {
        std::mem::take(&mut *self.pending.lock())
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

#[derive(sqlx::FromRow)]
struct EntryRow {
    id: String,
    content: String,
    category: String,
    tags: String,
    source_agent: String,
    confidence: f64,
    usage_count: i64,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    tombstoned_at: Option<DateTime<Utc>>,
}

impl EntryRow {
    fn into_entry(self) -> KnowledgeEntry {
        KnowledgeEntry {
            id: self.id,
            content: self.content,
            category: KnowledgeCategory::from_str_lossy(&self.category),
            tags: serde_json::from_str(&self.tags).unwrap_or_default(),
            source_agent: self.source_agent,
            confidence: self.confidence,
            usage_count: self.usage_count,
            version: self.version,
            created_at: self.created_at,
            updated_at: self.updated_at,
            tombstoned_at: self.tombstoned_at,
        }
    }
}

const ENTRY_COLUMNS: &str = "id, content, category, tags, source_agent, confidence, \
     usage_count, version, created_at, updated_at, tombstoned_at";

/// A search hit with its relevance score.
#[derive(Debug, Clone)]
pub struct ScoredEntry {
    pub entry: KnowledgeEntry,
    pub score: f64,
}

/// Per-category aggregate used by the analytics surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CategoryStatistics {
    pub category: KnowledgeCategory,
    pub entry_count: i64,
    pub total_usage: i64,
    pub average_confidence: f64,
}

// ---------------------------------------------------------------------------
// KnowledgeStore
// ---------------------------------------------------------------------------

/// Keyed storage of knowledge entries with ranked search.
#[derive(Clone)]
pub struct KnowledgeStore {
    pool: SqlitePool,
    usage: Arc<UsageCounter>,
    config: SharedConfig,
}

impl KnowledgeStore {
    pub fn new(pool: SqlitePool, config: SharedConfig) -> Self {
        Self {
            pool,
            usage: Arc::new(UsageCounter::default()),
            config,
        }
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create a new entry. Tags are normalized; content, source agent, and
    /// confidence bounds are validated before the write.
    pub async fn put(
        &self,
        content: &str,
        category: KnowledgeCategory,
        tags: &[String],
        source_agent: &str,
        confidence: f64,
    ) -> Result<KnowledgeEntry> {
        let content = content.trim();
        if content.is_empty() {
            return Err(EngineError::validation("entry content must not be empty"));
        }
        if source_agent.trim().is_empty() {
            return Err(EngineError::validation("source agent must not be empty"));
        }
        if !(0.0..=1.0).contains(&confidence) {
            return Err(EngineError::validation("confidence must be within 0..=1"));
        }

        let now = Utc::now();
        let entry = KnowledgeEntry {
            id: uuid::Uuid::new_v4().to_string(),
            content: content.to_owned(),
            category,
            tags: normalize_tags(tags),
            source_agent: source_agent.to_owned(),
            confidence,
            usage_count: 0,
            version: 0,
            created_at: now,
            updated_at: now,
            tombstoned_at: None,
        };

        sqlx::query(
            "INSERT INTO knowledge_entries \
             (id, content, category, tags, source_agent, confidence, usage_count, version, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, 0, 0, ?, ?)",
        )
        .bind(&entry.id)
        .bind(&entry.content)
        .bind(entry.category.as_str())
        .bind(serde_json::to_string(&entry.tags).unwrap_or_else(|_| "[]".into()))
        .bind(&entry.source_agent)
        .bind(entry.confidence)
        .bind(entry.created_at)
        .bind(entry.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(entry)
    }

    /// Fetch a live entry by id, recording a usage hit. Returns `None` for
    /// missing or tombstoned entries.
    pub async fn get(&self, id: &str) -> Result<Option<KnowledgeEntry>> {
        let entry = self.peek(id).await?;
        if entry.is_some() {
            self.record_usage(id);
        }
        Ok(entry)
    }

    /// Fetch without the usage side effect (internal consumers).
    pub(crate) async fn peek(&self, id: &str) -> Result<Option<KnowledgeEntry>> {
        let row: Option<EntryRow> = sqlx::query_as(&format!(
            "SELECT {ENTRY_COLUMNS} FROM knowledge_entries \
             WHERE id = ? AND tombstoned_at IS NULL",
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(EntryRow::into_entry))
    }

    /// Fetch several live entries by id. Missing ids are skipped.
    pub async fn get_many(&self, ids: &[String]) -> Result<Vec<KnowledgeEntry>> {
        let mut entries = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(entry) = self.peek(id).await? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    /// Apply a patch under optimistic concurrency. The patch is re-applied on
    /// top of a fresh read each attempt, so a losing writer retries its delta
    /// rather than overwriting a concurrent change.
    pub async fn update(&self, id: &str, patch: &EntryPatch) -> Result<KnowledgeEntry> {
        if patch.is_empty() {
            return Err(EngineError::validation("empty patch"));
        }
        if let Some(confidence) = patch.confidence {
            if !(0.0..=1.0).contains(&confidence) {
                return Err(EngineError::validation("confidence must be within 0..=1"));
            }
        }
        if let Some(content) = &patch.content {
            if content.trim().is_empty() {
                return Err(EngineError::validation("entry content must not be empty"));
            }
        }

        let retries = self.config.load().update_retry_limit;
        for _ in 0..=retries {
            let Some(current) = self.peek(id).await? else {
                return Err(EngineError::not_found("entry", id));
            };

            let mut next = current.clone();
            if let Some(content) = &patch.content {
                next.content = content.trim().to_owned();
            }
            if let Some(category) = patch.category {
                next.category = category;
            }
            if let Some(tags) = &patch.tags {
                next.tags = normalize_tags(tags);
            }
            if let Some(confidence) = patch.confidence {
                next.confidence = confidence;
            }
            next.updated_at = Utc::now();
            next.version = current.version + 1;

            let updated = sqlx::query(
                "UPDATE knowledge_entries \
                 SET content = ?, category = ?, tags = ?, confidence = ?, \
                     version = version + 1, updated_at = ? \
                 WHERE id = ? AND version = ? AND tombstoned_at IS NULL",
            )
            .bind(&next.content)
            .bind(next.category.as_str())
            .bind(serde_json::to_string(&next.tags).unwrap_or_else(|_| "[]".into()))
            .bind(next.confidence)
            .bind(next.updated_at)
            .bind(id)
            .bind(current.version)
            .execute(&self.pool)
            .await?;

            if updated.rows_affected() == 1 {
                return Ok(next);
            }
            tracing::debug!(entry_id = id, "update lost the version race, retrying");
        }

        Err(EngineError::conflict("entry", id))
    }

    /// Soft-delete: tombstone the entry for the retention window.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE knowledge_entries SET tombstoned_at = ? \
             WHERE id = ? AND tombstoned_at IS NULL",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::not_found("entry", id));
        }
        Ok(())
    }

    /// Physically remove entries tombstoned longer than the retention window.
    /// Returns the purged ids so the graph can garbage-collect edges.
    pub async fn purge_tombstoned(&self) -> Result<Vec<String>> {
        let cutoff = Utc::now() - Duration::days(self.config.load().tombstone_retention_days);
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT id FROM knowledge_entries \
             WHERE tombstoned_at IS NOT NULL AND tombstoned_at <= ?",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        let ids: Vec<String> = rows.into_iter().map(|(id,)| id).collect();
        for id in &ids {
            sqlx::query("DELETE FROM knowledge_entries WHERE id = ?")
                .bind(id)
                .execute(&self.pool)
                .await?;
        }
        Ok(ids)
    }

    /// Ranked search over live entries.
    ///
    /// Category and tags are exact filters; the relevance score is a weighted
    /// sum of lexical overlap between the query and the entry's content/tags,
    /// recency, and log-scaled usage count. Ties break by most recent
    /// `updated_at`, then id. Hits record usage through the batched counter.
    pub async fn search(
        &self,
        query: &str,
        category: Option<KnowledgeCategory>,
        tags: &[String],
        limit: usize,
    ) -> Result<Vec<ScoredEntry>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let config = self.config.load();
        let scan_limit = config.search_scan_limit;

        let rows: Vec<EntryRow> = match category {
            Some(category) => {
                sqlx::query_as(&format!(
                    "SELECT {ENTRY_COLUMNS} FROM knowledge_entries \
                     WHERE tombstoned_at IS NULL AND category = ? \
                     ORDER BY updated_at DESC LIMIT ?",
                ))
                .bind(category.as_str())
                .bind(scan_limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(&format!(
                    "SELECT {ENTRY_COLUMNS} FROM knowledge_entries \
                     WHERE tombstoned_at IS NULL \
                     ORDER BY updated_at DESC LIMIT ?",
                ))
                .bind(scan_limit)
                .fetch_all(&self.pool)
                .await?
            }
        };

        let wanted_tags = normalize_tags(tags);
        let query_tokens = text::tokenize(query);
        let now = Utc::now();

        let mut hits: Vec<ScoredEntry> = rows
            .into_iter()
            .map(EntryRow::into_entry)
            .filter(|entry| {
                wanted_tags
                    .iter()
                    .all(|wanted| entry.tags.contains(wanted))
            })
            .filter_map(|entry| {
                let mut haystack = text::tokenize(&entry.content);
                for tag in &entry.tags {
                    haystack.extend(text::tokenize(tag));
                }
                haystack.extend(text::tokenize(entry.category.as_str()));

                let lexical = text::jaccard(&query_tokens, &haystack);
                if !query_tokens.is_empty() && lexical == 0.0 {
                    return None;
                }

                let age_days =
                    (now - entry.updated_at).num_seconds().max(0) as f64 / 86_400.0;
                let recency = 1.0 / (1.0 + age_days);
                let usage = (1.0 + entry.usage_count as f64).ln();

                let score = 3.0 * lexical + recency + 0.5 * usage;
                Some(ScoredEntry { entry, score })
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.entry.updated_at.cmp(&a.entry.updated_at))
                .then_with(|| a.entry.id.cmp(&b.entry.id))
        });
        hits.truncate(limit);

        for hit in &hits {
            self.record_usage(&hit.entry.id);
        }

        Ok(hits)
    }

    /// Live entries created inside a window, oldest first. Input to the
    /// knowledge-source pattern detection.
    pub async fn created_in_window(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<KnowledgeEntry>> {
        let rows: Vec<EntryRow> = sqlx::query_as(&format!(
            "SELECT {ENTRY_COLUMNS} FROM knowledge_entries \
             WHERE tombstoned_at IS NULL AND created_at >= ? AND created_at < ? \
             ORDER BY created_at ASC, id ASC",
        ))
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(EntryRow::into_entry).collect())
    }

    /// Most recently updated live entries in a category.
    pub async fn by_category(
        &self,
        category: KnowledgeCategory,
        limit: i64,
    ) -> Result<Vec<KnowledgeEntry>> {
        let rows: Vec<EntryRow> = sqlx::query_as(&format!(
            "SELECT {ENTRY_COLUMNS} FROM knowledge_entries \
             WHERE tombstoned_at IS NULL AND category = ? \
             ORDER BY updated_at DESC, id ASC LIMIT ?",
        ))
        .bind(category.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(EntryRow::into_entry).collect())
    }

    /// Recent live entries sharing at least one of the given tags, excluding
    /// `exclude_id`. Used to strengthen shared-tag edges at write time.
    pub(crate) async fn sharing_tags(
        &self,
        tags: &[String],
        exclude_id: &str,
        limit: usize,
    ) -> Result<Vec<KnowledgeEntry>> {
        if tags.is_empty() {
            return Ok(Vec::new());
        }
        // Tag sets are small JSON arrays; scan recent rows and filter here.
        let rows: Vec<EntryRow> = sqlx::query_as(&format!(
            "SELECT {ENTRY_COLUMNS} FROM knowledge_entries \
             WHERE tombstoned_at IS NULL AND id != ? \
             ORDER BY updated_at DESC LIMIT 200",
        ))
        .bind(exclude_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(EntryRow::into_entry)
            .filter(|entry| entry.tags.iter().any(|tag| tags.contains(tag)))
            .take(limit)
            .collect())
    }

    /// Count of live entries created per category inside a window.
    pub async fn category_counts(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<HashMap<String, i64>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT category, COUNT(*) FROM knowledge_entries \
             WHERE tombstoned_at IS NULL AND created_at >= ? AND created_at < ? \
             GROUP BY category",
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }

    /// Per-category aggregates over all live entries, with confidence decayed
    /// to its current effective value.
    pub async fn statistics(&self) -> Result<Vec<CategoryStatistics>> {
        let rows: Vec<EntryRow> = sqlx::query_as(&format!(
            "SELECT {ENTRY_COLUMNS} FROM knowledge_entries WHERE tombstoned_at IS NULL",
        ))
        .fetch_all(&self.pool)
        .await?;

        let decay = self.config.load().confidence_decay_per_day;
        let now = Utc::now();
        let mut grouped: HashMap<KnowledgeCategory, (i64, i64, f64)> = HashMap::new();
        for row in rows {
            let entry = row.into_entry();
            let slot = grouped.entry(entry.category).or_insert((0, 0, 0.0));
            slot.0 += 1;
            slot.1 += entry.usage_count;
            slot.2 += entry.decayed_confidence(decay, now);
        }

        let mut statistics: Vec<CategoryStatistics> = grouped
            .into_iter()
            .map(|(category, (count, usage, confidence_sum))| CategoryStatistics {
                category,
                entry_count: count,
                total_usage: usage,
                average_confidence: if count > 0 {
                    confidence_sum / count as f64
                } else {
                    0.0
                },
            })
            .collect();
        statistics.sort_by(|a, b| a.category.as_str().cmp(b.category.as_str()));
        Ok(statistics)
    }

    // --- usage batching ---

    /// Queue a usage hit; spills to the database in the background once the
    /// batch grows past the flush threshold.
    fn record_usage(&self, entry_id: &str) {
        let pending = self.usage.bump(entry_id);
        if pending >= self.config.load().usage_flush_threshold {
            let store = self.clone();
            tokio::spawn(async move {
                if let Err(error) = store.flush_usage().await {
                    tracing::warn!(%error, "background usage flush failed");
                }
            });
        }
    }

    /// Apply all pending usage increments with additive SQL. Concurrent
    /// flushes cannot lose updates because each delta is drained exactly once
    /// and applied as `usage_count + delta`.
    pub async fn flush_usage(&self) -> Result<usize> {
        let pending = self.usage.drain();
        let flushed = pending.len();
        for (entry_id, delta) in pending {
            sqlx::query(
                "UPDATE knowledge_entries SET usage_count = usage_count + ? WHERE id = ?",
            )
            .bind(delta)
            .bind(&entry_id)
            .execute(&self.pool)
            .await?;
        }
        Ok(flushed)
    }

    // --- engine state KV (heartbeats, ingestion cursors) ---

    /// Write a key-value pair to the engine_state table (upsert).
    pub async fn set_state(&self, key: &str, value: impl Into<String>) -> Result<()> {
        let value = value.into();
        sqlx::query(
            "INSERT INTO engine_state (key, value, updated_at) VALUES (?, ?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(&value)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Read a value from the engine_state table.
    pub async fn get_state(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM engine_state WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(value,)| value))
    }
}

impl std::fmt::Debug for KnowledgeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KnowledgeStore").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Embedded schema
// ---------------------------------------------------------------------------

/// Core schema: knowledge entries, the append-only interaction log, and the
/// engine state KV. All tables use `IF NOT EXISTS` so re-running is safe.
const SCHEMA_V1: &str = r#"
CREATE TABLE IF NOT EXISTS knowledge_entries (
    id TEXT PRIMARY KEY,
    content TEXT NOT NULL,
    category TEXT NOT NULL,
    tags TEXT NOT NULL DEFAULT '[]',
    source_agent TEXT NOT NULL,
    confidence REAL NOT NULL DEFAULT 0.5,
    usage_count INTEGER NOT NULL DEFAULT 0,
    version INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    tombstoned_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_entries_category ON knowledge_entries(category, updated_at);
CREATE INDEX IF NOT EXISTS idx_entries_tombstone ON knowledge_entries(tombstoned_at);

CREATE TABLE IF NOT EXISTS interactions (
    id TEXT PRIMARY KEY,
    source_agent TEXT NOT NULL,
    target_agent TEXT,
    interaction_type TEXT NOT NULL,
    payload TEXT NOT NULL DEFAULT '{}',
    outcome TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_interactions_created ON interactions(created_at);
CREATE INDEX IF NOT EXISTS idx_interactions_source ON interactions(source_agent, created_at);

CREATE TABLE IF NOT EXISTS engine_state (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

/// Mining layer: detected patterns, generated insights, agent profiles, and
/// explicit feedback.
const SCHEMA_V2: &str = r#"
CREATE TABLE IF NOT EXISTS patterns (
    id TEXT PRIMARY KEY,
    category TEXT NOT NULL,
    description TEXT NOT NULL,
    support_count INTEGER NOT NULL,
    confidence REAL NOT NULL,
    evidence TEXT NOT NULL DEFAULT '[]',
    window_start TEXT NOT NULL,
    window_end TEXT NOT NULL,
    detected_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_patterns_category ON patterns(category, detected_at);
CREATE INDEX IF NOT EXISTS idx_patterns_detected ON patterns(detected_at);

CREATE TABLE IF NOT EXISTS insights (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    basis_pattern_ids TEXT NOT NULL DEFAULT '[]',
    narrative TEXT NOT NULL,
    severity REAL NOT NULL,
    agent_id TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_insights_kind ON insights(kind, created_at);

CREATE TABLE IF NOT EXISTS agent_profiles (
    agent_id TEXT PRIMARY KEY,
    skill_vector TEXT NOT NULL DEFAULT '{}',
    interactions_observed INTEGER NOT NULL DEFAULT 0,
    successes INTEGER NOT NULL DEFAULT 0,
    failures INTEGER NOT NULL DEFAULT 0,
    last_active_at TEXT NOT NULL,
    version INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS feedback (
    id TEXT PRIMARY KEY,
    agent_id TEXT NOT NULL,
    task_id TEXT NOT NULL,
    rating INTEGER NOT NULL,
    details TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_feedback_agent ON feedback(agent_id, created_at);
"#;

/// Distribution layer: relationship edges, subscriptions, and the delivery
/// ledger (dead-lettered rows stay for inspection, never silently dropped).
const SCHEMA_V3: &str = r#"
CREATE TABLE IF NOT EXISTS knowledge_edges (
    from_id TEXT NOT NULL,
    to_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    weight REAL NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (from_id, to_id, kind)
);
CREATE INDEX IF NOT EXISTS idx_edges_to ON knowledge_edges(to_id);

CREATE TABLE IF NOT EXISTS subscriptions (
    id TEXT PRIMARY KEY,
    agent_id TEXT NOT NULL,
    categories TEXT NOT NULL DEFAULT '[]',
    tags TEXT NOT NULL DEFAULT '[]',
    active INTEGER NOT NULL DEFAULT 1,
    one_shot INTEGER NOT NULL DEFAULT 0,
    query TEXT,
    expires_at TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_subscriptions_agent ON subscriptions(agent_id, active);

CREATE TABLE IF NOT EXISTS deliveries (
    id TEXT PRIMARY KEY,
    subscription_id TEXT NOT NULL,
    agent_id TEXT NOT NULL,
    entry_id TEXT NOT NULL,
    state TEXT NOT NULL DEFAULT 'pending',
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_deliveries_state ON deliveries(state, updated_at);
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{self, EngineConfig};

    async fn temp_store() -> (KnowledgeStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("create temp dir");
        let pool = connect(&dir.path().join("knowledge.db"))
            .await
            .expect("connect");
        let store = KnowledgeStore::new(pool, config::shared(EngineConfig::default()));
        (store, dir)
    }

    #[tokio::test]
    async fn put_then_get_preserves_immutable_fields() {
        let (store, _dir) = temp_store().await;
        let entry = store
            .put(
                "retry with backoff",
                KnowledgeCategory::BestPractices,
                &["Resilience".to_string()],
                "agent-1",
                0.8,
            )
            .await
            .expect("put");

        let fetched = store.get(&entry.id).await.expect("get").expect("present");
        assert_eq!(fetched.id, entry.id);
        assert_eq!(fetched.content, "retry with backoff");
        assert_eq!(fetched.category, KnowledgeCategory::BestPractices);
        assert_eq!(fetched.tags, vec!["resilience"]);
        assert_eq!(fetched.source_agent, "agent-1");
        assert_eq!(fetched.created_at, entry.created_at);
    }

    #[tokio::test]
    async fn put_rejects_invalid_input() {
        let (store, _dir) = temp_store().await;
        assert!(matches!(
            store
                .put("  ", KnowledgeCategory::General, &[], "agent-1", 0.5)
                .await,
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            store
                .put("content", KnowledgeCategory::General, &[], "agent-1", 1.5)
                .await,
            Err(EngineError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn update_bumps_version_and_detects_missing() {
        let (store, _dir) = temp_store().await;
        let entry = store
            .put("original", KnowledgeCategory::General, &[], "agent-1", 0.5)
            .await
            .expect("put");

        let patch = EntryPatch {
            content: Some("revised".into()),
            ..Default::default()
        };
        let updated = store.update(&entry.id, &patch).await.expect("update");
        assert_eq!(updated.content, "revised");
        assert_eq!(updated.version, entry.version + 1);

        assert!(matches!(
            store.update("missing", &patch).await,
            Err(EngineError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn delete_tombstones_and_purge_removes() {
        let (store, _dir) = temp_store().await;
        let entry = store
            .put("doomed", KnowledgeCategory::General, &[], "agent-1", 0.5)
            .await
            .expect("put");

        store.delete(&entry.id).await.expect("delete");
        assert!(store.get(&entry.id).await.expect("get").is_none());
        // Second delete reports NotFound rather than double-tombstoning.
        assert!(matches!(
            store.delete(&entry.id).await,
            Err(EngineError::NotFound { .. })
        ));

        // Nothing purged while the retention window is open.
        assert!(store.purge_tombstoned().await.expect("purge").is_empty());

        // Shrink the window to zero and purge for real.
        let mut tight = EngineConfig::default();
        tight.tombstone_retention_days = 0;
        store.config.store(std::sync::Arc::new(tight));
        let purged = store.purge_tombstoned().await.expect("purge");
        assert_eq!(purged, vec![entry.id]);
    }

    #[tokio::test]
    async fn search_filters_and_ranks() {
        let (store, _dir) = temp_store().await;
        store
            .put(
                "retry with exponential backoff",
                KnowledgeCategory::BestPractices,
                &["resilience".to_string()],
                "agent-1",
                0.9,
            )
            .await
            .expect("put");
        store
            .put(
                "cache eviction strategies",
                KnowledgeCategory::Architecture,
                &["caching".to_string()],
                "agent-1",
                0.9,
            )
            .await
            .expect("put");

        let hits = store
            .search("retry backoff", None, &[], 10)
            .await
            .expect("search");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entry.content, "retry with exponential backoff");

        // Category filter excludes the match.
        let hits = store
            .search("retry backoff", Some(KnowledgeCategory::Architecture), &[], 10)
            .await
            .expect("search");
        assert!(hits.is_empty());

        // Tag filter is exact.
        let hits = store
            .search("", None, &["caching".to_string()], 10)
            .await
            .expect("search");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entry.category, KnowledgeCategory::Architecture);
    }

    #[tokio::test]
    async fn search_ranks_higher_usage_above_equal_lexical_ties() {
        let (store, _dir) = temp_store().await;
        let popular = store
            .put("retry backoff", KnowledgeCategory::General, &[], "a", 0.5)
            .await
            .expect("put");
        let _quiet = store
            .put("retry backoff", KnowledgeCategory::General, &[], "a", 0.5)
            .await
            .expect("put");

        // Give one entry a visible usage advantage.
        for _ in 0..5 {
            store.get(&popular.id).await.expect("get");
        }
        store.flush_usage().await.expect("flush");

        let hits = store.search("retry backoff", None, &[], 2).await.expect("search");
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].entry.id, popular.id);
    }

    #[tokio::test]
    async fn usage_hits_are_batched_then_flushed() {
        let (store, _dir) = temp_store().await;
        let entry = store
            .put("counted", KnowledgeCategory::General, &[], "agent-1", 0.5)
            .await
            .expect("put");

        store.get(&entry.id).await.expect("get");
        store.get(&entry.id).await.expect("get");

        // Not yet visible: the read path never writes.
        let raw = store.peek(&entry.id).await.expect("peek").expect("present");
        assert_eq!(raw.usage_count, 0);

        let flushed = store.flush_usage().await.expect("flush");
        assert_eq!(flushed, 1);
        let raw = store.peek(&entry.id).await.expect("peek").expect("present");
        assert_eq!(raw.usage_count, 2);
    }

    #[tokio::test]
    async fn state_kv_round_trips() {
        let (store, _dir) = temp_store().await;
        assert!(store.get_state("cursor").await.expect("get").is_none());
        store.set_state("cursor", "2026-01-01").await.expect("set");
        store.set_state("cursor", "2026-02-01").await.expect("set");
        assert_eq!(
            store.get_state("cursor").await.expect("get").as_deref(),
            Some("2026-02-01")
        );
    }
}
