//! PatternRecognizer: windowed analysis of the interaction log and knowledge
//! store.
//!
//! Detection is idempotent per window: re-running over unchanged input yields
//! patterns with identical `(category, support_count, confidence)` tuples.
//! Each run still mints new pattern ids — records are immutable history, and
//! consumers deduplicate by `(category, window)`. Grouping and evidence lists
//! are sorted so output order is deterministic.

use crate::config::SharedConfig;
use crate::error::Result;
use crate::interactions::InteractionLog;
use crate::store::KnowledgeStore;
use crate::types::{
    InteractionOutcome, InteractionRecord, KnowledgeEntry, Pattern, PatternSource,
};

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use std::collections::BTreeMap;

#[derive(sqlx::FromRow)]
struct PatternRow {
    id: String,
    category: String,
    description: String,
    support_count: i64,
    confidence: f64,
    evidence: String,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    detected_at: DateTime<Utc>,
}

impl PatternRow {
    fn into_pattern(self) -> Pattern {
        Pattern {
            id: self.id,
            category: self.category,
            description: self.description,
            support_count: self.support_count,
            confidence: self.confidence,
            evidence: serde_json::from_str(&self.evidence).unwrap_or_default(),
            window_start: self.window_start,
            window_end: self.window_end,
            detected_at: self.detected_at,
        }
    }
}

/// Batch pattern detection over a bounded time window.
#[derive(Clone)]
pub struct PatternRecognizer {
    pool: SqlitePool,
    store: KnowledgeStore,
    log: InteractionLog,
    config: SharedConfig,
}

impl PatternRecognizer {
    pub fn new(
        pool: SqlitePool,
        store: KnowledgeStore,
        log: InteractionLog,
        config: SharedConfig,
    ) -> Self {
        Self {
            pool,
            store,
            log,
            config,
        }
    }

    /// Detect patterns over one window and persist the survivors. Patterns
    /// below `min_pattern_confidence` are discarded, never stored.
    pub async fn detect(
        &self,
        source: PatternSource,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<Vec<Pattern>> {
        let config = self.config.load();
        let patterns = match source {
            PatternSource::Interactions => {
                let records = self.log.in_window(window_start, window_end).await?;
                detect_interaction_patterns(
                    &records,
                    window_start,
                    window_end,
                    config.min_pattern_support,
                    config.min_pattern_confidence,
                )
            }
            PatternSource::Knowledge => {
                let entries = self.store.created_in_window(window_start, window_end).await?;
                detect_knowledge_patterns(
                    &entries,
                    window_start,
                    window_end,
                    config.min_tag_co_occurrence,
                    config.min_pattern_confidence,
                )
            }
        };

        for pattern in &patterns {
            self.insert(pattern).await?;
        }
        Ok(patterns)
    }

    async fn insert(&self, pattern: &Pattern) -> Result<()> {
        sqlx::query(
            "INSERT INTO patterns \
             (id, category, description, support_count, confidence, evidence, \
              window_start, window_end, detected_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&pattern.id)
        .bind(&pattern.category)
        .bind(&pattern.description)
        .bind(pattern.support_count)
        .bind(pattern.confidence)
        .bind(serde_json::to_string(&pattern.evidence).unwrap_or_else(|_| "[]".into()))
        .bind(pattern.window_start)
        .bind(pattern.window_end)
        .bind(pattern.detected_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Patterns detected after `start`, newest detection first.
    pub async fn since(&self, start: DateTime<Utc>) -> Result<Vec<Pattern>> {
        let rows: Vec<PatternRow> = sqlx::query_as(
            "SELECT id, category, description, support_count, confidence, evidence, \
                    window_start, window_end, detected_at \
             FROM patterns WHERE detected_at >= ? \
             ORDER BY detected_at DESC, category ASC",
        )
        .bind(start)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(PatternRow::into_pattern).collect())
    }

    /// Strongest recent patterns for the analytics surface, deduplicated by
    /// `(category, window)` keeping the latest detection.
    pub async fn top(&self, since: DateTime<Utc>, limit: usize) -> Result<Vec<Pattern>> {
        let mut deduped = dedupe_by_window(self.since(since).await?);
        deduped.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.support_count.cmp(&a.support_count))
                .then_with(|| a.category.cmp(&b.category))
        });
        deduped.truncate(limit);
        Ok(deduped)
    }

    /// Total stored pattern count.
    pub async fn count(&self) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM patterns")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }
}

impl std::fmt::Debug for PatternRecognizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatternRecognizer").finish_non_exhaustive()
    }
}

/// Keep only the latest detection per `(category, window_start, window_end)`.
/// Input must be sorted newest detection first (as `since` returns).
pub(crate) fn dedupe_by_window(patterns: Vec<Pattern>) -> Vec<Pattern> {
    let mut seen: std::collections::HashSet<(String, DateTime<Utc>, DateTime<Utc>)> =
        std::collections::HashSet::new();
    patterns
        .into_iter()
        .filter(|pattern| {
            seen.insert((
                pattern.category.clone(),
                pattern.window_start,
                pattern.window_end,
            ))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Interaction-source detection
// ---------------------------------------------------------------------------

/// Group interactions by `(type, outcome)` and by agent pair; report groups
/// whose occurrence count clears the minimum support.
///
/// For a `(type, outcome)` group, `support_count` is the total number of
/// interactions of that type in the window and `confidence` is the outcome's
/// share of that total. For an agent pair, confidence is the pair's success
/// rate when any outcome is meaningful, else the pair's share of the window.
pub(crate) fn detect_interaction_patterns(
    records: &[InteractionRecord],
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    min_support: i64,
    min_confidence: f64,
) -> Vec<Pattern> {
    let detected_at = Utc::now();
    let mut patterns = Vec::new();

    // --- (type, outcome) groups ---
    // BTreeMap keeps category output ordering deterministic.
    struct TypeGroup {
        total: i64,
        by_outcome: BTreeMap<&'static str, (i64, Vec<String>)>,
    }
    let mut by_type: BTreeMap<String, TypeGroup> = BTreeMap::new();
    for record in records {
        let group = by_type
            .entry(record.interaction_type.clone())
            .or_insert(TypeGroup {
                total: 0,
                by_outcome: BTreeMap::new(),
            });
        group.total += 1;
        let slot = group
            .by_outcome
            .entry(record.outcome.as_str())
            .or_insert((0, Vec::new()));
        slot.0 += 1;
        slot.1.push(record.id.clone());
    }

    for (interaction_type, group) in &by_type {
        for (outcome, (count, evidence)) in &group.by_outcome {
            if *count < min_support {
                continue;
            }
            let confidence = *count as f64 / group.total as f64;
            if confidence < min_confidence {
                continue;
            }
            let mut evidence = evidence.clone();
            evidence.sort();
            patterns.push(Pattern {
                id: uuid::Uuid::new_v4().to_string(),
                category: format!("interaction:{interaction_type}:{outcome}"),
                description: format!(
                    "{count} of {total} '{interaction_type}' interactions ended in {outcome}",
                    total = group.total,
                ),
                support_count: group.total,
                confidence,
                evidence,
                window_start,
                window_end,
                detected_at,
            });
        }
    }

    // --- agent-pair groups ---
    struct PairGroup {
        total: i64,
        successes: i64,
        failures: i64,
        evidence: Vec<String>,
    }
    let mut by_pair: BTreeMap<(String, String), PairGroup> = BTreeMap::new();
    for record in records {
        let Some(target) = &record.target_agent else {
            continue;
        };
        // Undirected pair key.
        let key = if record.source_agent <= *target {
            (record.source_agent.clone(), target.clone())
        } else {
            (target.clone(), record.source_agent.clone())
        };
        let group = by_pair.entry(key).or_insert(PairGroup {
            total: 0,
            successes: 0,
            failures: 0,
            evidence: Vec::new(),
        });
        group.total += 1;
        match record.outcome {
            InteractionOutcome::Success => group.successes += 1,
            InteractionOutcome::Failure => group.failures += 1,
            InteractionOutcome::Neutral => {}
        }
        group.evidence.push(record.id.clone());
    }

    let window_total = records.len().max(1) as f64;
    for ((agent_a, agent_b), group) in &by_pair {
        if group.total < min_support {
            continue;
        }
        let meaningful = group.successes + group.failures;
        let confidence = if meaningful > 0 {
            group.successes as f64 / group.total as f64
        } else {
            group.total as f64 / window_total
        };
        if confidence < min_confidence {
            continue;
        }
        let mut evidence = group.evidence.clone();
        evidence.sort();
        patterns.push(Pattern {
            id: uuid::Uuid::new_v4().to_string(),
            category: format!("collaboration:{agent_a}+{agent_b}"),
            description: format!(
                "agents {agent_a} and {agent_b} interacted {} times ({:.0}% success)",
                group.total,
                100.0 * group.successes as f64 / group.total as f64,
            ),
            support_count: group.total,
            confidence,
            evidence,
            window_start,
            window_end,
            detected_at,
        });
    }

    patterns
}

// ---------------------------------------------------------------------------
// Knowledge-source detection
// ---------------------------------------------------------------------------

/// Group entries by shared tag pairs and report combinations co-occurring
/// across at least `min_co_occurrence` distinct entries. Confidence is the
/// combination's frequency across the window's entries.
pub(crate) fn detect_knowledge_patterns(
    entries: &[KnowledgeEntry],
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    min_co_occurrence: i64,
    min_confidence: f64,
) -> Vec<Pattern> {
    let detected_at = Utc::now();
    let mut by_pair: BTreeMap<(String, String), Vec<String>> = BTreeMap::new();

    for entry in entries {
        // Tags are normalized (sorted, deduplicated) at write time.
        for (index, tag_a) in entry.tags.iter().enumerate() {
            for tag_b in entry.tags.iter().skip(index + 1) {
                by_pair
                    .entry((tag_a.clone(), tag_b.clone()))
                    .or_default()
                    .push(entry.id.clone());
            }
        }
    }

    let total = entries.len().max(1) as f64;
    let mut patterns = Vec::new();
    for ((tag_a, tag_b), mut evidence) in by_pair {
        let count = evidence.len() as i64;
        if count < min_co_occurrence {
            continue;
        }
        let confidence = count as f64 / total;
        if confidence < min_confidence {
            continue;
        }
        evidence.sort();
        patterns.push(Pattern {
            id: uuid::Uuid::new_v4().to_string(),
            category: format!("knowledge:{tag_a}+{tag_b}"),
            description: format!("{count} entries share the tag combination '{tag_a}' + '{tag_b}'"),
            support_count: count,
            confidence,
            evidence,
            window_start,
            window_end,
            detected_at,
        });
    }

    patterns
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{self, EngineConfig};
    use crate::types::KnowledgeCategory;
    use chrono::Duration;
    use serde_json::json;

    fn record(
        source: &str,
        target: Option<&str>,
        interaction_type: &str,
        outcome: InteractionOutcome,
    ) -> InteractionRecord {
        InteractionRecord {
            id: uuid::Uuid::new_v4().to_string(),
            source_agent: source.to_owned(),
            target_agent: target.map(str::to_owned),
            interaction_type: interaction_type.to_owned(),
            payload: json!({}),
            outcome,
            created_at: Utc::now(),
        }
    }

    fn window() -> (DateTime<Utc>, DateTime<Utc>) {
        let end = Utc::now();
        (end - Duration::days(7), end)
    }

    #[test]
    fn failure_heavy_window_yields_expected_confidence() {
        let (start, end) = window();
        let mut records = Vec::new();
        for _ in 0..10 {
            records.push(record("a1", None, "code_review", InteractionOutcome::Failure));
        }
        for _ in 0..2 {
            records.push(record("a1", None, "code_review", InteractionOutcome::Success));
        }

        let patterns = detect_interaction_patterns(&records, start, end, 5, 0.3);
        let failure = patterns
            .iter()
            .find(|pattern| pattern.category == "interaction:code_review:failure")
            .expect("failure pattern present");
        assert_eq!(failure.support_count, 12);
        assert!((failure.confidence - 10.0 / 12.0).abs() < 1e-9);
        // The 2-success group is below min support.
        assert!(patterns
            .iter()
            .all(|pattern| pattern.category != "interaction:code_review:success"));
    }

    #[test]
    fn detection_is_idempotent_over_unchanged_input() {
        let (start, end) = window();
        let mut records = Vec::new();
        for index in 0..8 {
            let outcome = if index % 2 == 0 {
                InteractionOutcome::Success
            } else {
                InteractionOutcome::Failure
            };
            records.push(record("a1", Some("a2"), "pairing", outcome));
        }

        let first = detect_interaction_patterns(&records, start, end, 4, 0.3);
        let second = detect_interaction_patterns(&records, start, end, 4, 0.3);
        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(second.iter()) {
            assert_eq!(a.category, b.category);
            assert_eq!(a.support_count, b.support_count);
            assert_eq!(a.confidence, b.confidence);
            assert_eq!(a.evidence, b.evidence);
            // New detection run, new ids.
            assert_ne!(a.id, b.id);
        }
    }

    #[test]
    fn agent_pairs_group_undirected() {
        let (start, end) = window();
        let mut records = Vec::new();
        for _ in 0..3 {
            records.push(record("a1", Some("a2"), "pairing", InteractionOutcome::Success));
        }
        for _ in 0..2 {
            records.push(record("a2", Some("a1"), "pairing", InteractionOutcome::Success));
        }

        let patterns = detect_interaction_patterns(&records, start, end, 5, 0.3);
        let pair = patterns
            .iter()
            .find(|pattern| pattern.category == "collaboration:a1+a2")
            .expect("pair pattern present");
        assert_eq!(pair.support_count, 5);
        assert_eq!(pair.confidence, 1.0);
    }

    #[test]
    fn tag_combinations_need_minimum_co_occurrence() {
        let (start, end) = window();
        let now = Utc::now();
        let entry = |id: &str, tags: &[&str]| KnowledgeEntry {
            id: id.to_owned(),
            content: "entry".into(),
            category: KnowledgeCategory::General,
            tags: tags.iter().map(|tag| tag.to_string()).collect(),
            source_agent: "a1".into(),
            confidence: 0.5,
            usage_count: 0,
            version: 0,
            created_at: now,
            updated_at: now,
            tombstoned_at: None,
        };

        let entries = vec![
            entry("e1", &["async", "python"]),
            entry("e2", &["async", "python"]),
            entry("e3", &["async", "python"]),
            entry("e4", &["async", "rust"]),
        ];

        let patterns = detect_knowledge_patterns(&entries, start, end, 3, 0.3);
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].category, "knowledge:async+python");
        assert_eq!(patterns[0].support_count, 3);
        assert!((patterns[0].confidence - 0.75).abs() < 1e-9);
        assert_eq!(patterns[0].evidence, vec!["e1", "e2", "e3"]);
    }

    #[tokio::test]
    async fn detect_persists_and_since_reads_back() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let pool = crate::store::connect(&dir.path().join("knowledge.db"))
            .await
            .expect("connect");
        let config = config::shared(EngineConfig {
            min_pattern_support: 2,
            ..EngineConfig::default()
        });
        let store = KnowledgeStore::new(pool.clone(), config.clone());
        let log = InteractionLog::new(pool.clone());
        let recognizer = PatternRecognizer::new(pool, store, log.clone(), config);

        for _ in 0..3 {
            log.record("a1", None, "deploy", json!({}), InteractionOutcome::Failure)
                .await
                .expect("record");
        }

        let end = Utc::now() + Duration::seconds(1);
        let detected = recognizer
            .detect(PatternSource::Interactions, end - Duration::days(7), end)
            .await
            .expect("detect");
        assert_eq!(detected.len(), 1);

        let stored = recognizer
            .since(Utc::now() - Duration::minutes(1))
            .await
            .expect("since");
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].category, "interaction:deploy:failure");
        assert_eq!(stored[0].support_count, 3);
    }
}
