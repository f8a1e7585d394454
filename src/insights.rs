//! InsightGenerator: deterministic rules that turn detected patterns,
//! aggregate statistics, and feedback into actionable insights.
//!
//! Insights are append-only. A later run over the same underlying patterns
//! supersedes earlier insights by referencing the same basis pattern ids;
//! nothing is edited in place. Severity scales with how far the triggering
//! metric sits from its configured threshold.

use crate::config::SharedConfig;
use crate::error::Result;
use crate::interactions::InteractionLog;
use crate::patterns::{dedupe_by_window, PatternRecognizer};
use crate::profiles::ProfileStore;
use crate::store::KnowledgeStore;
use crate::text;
use crate::types::{
    Feedback, Insight, InsightKind, InteractionOutcome, KnowledgeCategory, Pattern,
};

use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;

use std::collections::{BTreeMap, HashSet};

#[derive(sqlx::FromRow)]
struct InsightRow {
    id: String,
    kind: String,
    basis_pattern_ids: String,
    narrative: String,
    severity: f64,
    agent_id: Option<String>,
    created_at: DateTime<Utc>,
}

impl InsightRow {
    fn into_insight(self) -> Insight {
        Insight {
            id: self.id,
            kind: InsightKind::from_str_lossy(&self.kind),
            basis_pattern_ids: serde_json::from_str(&self.basis_pattern_ids).unwrap_or_default(),
            narrative: self.narrative,
            severity: self.severity,
            agent_id: self.agent_id,
            created_at: self.created_at,
        }
    }
}

/// Rule-driven insight generation over the latest pattern windows.
#[derive(Clone)]
pub struct InsightGenerator {
    pool: SqlitePool,
    store: KnowledgeStore,
    log: InteractionLog,
    patterns: PatternRecognizer,
    profiles: ProfileStore,
    config: SharedConfig,
}

impl InsightGenerator {
    pub fn new(
        pool: SqlitePool,
        store: KnowledgeStore,
        log: InteractionLog,
        patterns: PatternRecognizer,
        profiles: ProfileStore,
        config: SharedConfig,
    ) -> Self {
        Self {
            pool,
            store,
            log,
            patterns,
            profiles,
            config,
        }
    }

    /// Run every rule over the current and previous detection windows,
    /// persist the produced insights, and return them.
    ///
    /// With an agent filter, only insights scoped to that agent are returned
    /// (global insights are still persisted).
    pub async fn generate(&self, agent_filter: Option<&str>) -> Result<Vec<Insight>> {
        let config = self.config.load();
        let now = Utc::now();
        let window = Duration::days(config.pattern_window_days);
        let current_start = now - window;
        let previous_start = now - window - window;

        // Latest detection per (category, window), split into the two windows.
        let all_patterns = dedupe_by_window(self.patterns.since(previous_start).await?);
        let (current, previous): (Vec<Pattern>, Vec<Pattern>) = all_patterns
            .into_iter()
            .partition(|pattern| pattern.window_start >= current_start - Duration::seconds(1));

        let mut insights = Vec::new();
        insights.extend(self.trends(current_start, now, previous_start).await?);
        insights.extend(self.anomalies(&current, &previous).await?);
        insights.extend(self.opportunities(&current).await?);
        insights.extend(self.risks(current_start, now).await?);
        insights.extend(self.optimizations(current_start).await?);

        for insight in &insights {
            self.insert(insight).await?;
        }

        Ok(match agent_filter {
            Some(agent_id) => insights
                .into_iter()
                .filter(|insight| insight.agent_id.as_deref() == Some(agent_id))
                .collect(),
            None => insights,
        })
    }

    // --- trend: category growth vs the previous window ---

    async fn trends(
        &self,
        current_start: DateTime<Utc>,
        now: DateTime<Utc>,
        previous_start: DateTime<Utc>,
    ) -> Result<Vec<Insight>> {
        let config = self.config.load();
        let current_counts = self.store.category_counts(current_start, now).await?;
        let previous_counts = self
            .store
            .category_counts(previous_start, current_start)
            .await?;

        let mut insights = Vec::new();
        let categories: BTreeMap<&String, &i64> = current_counts.iter().collect();
        for (category, current_count) in categories {
            let previous_count = previous_counts.get(category).copied().unwrap_or(0);
            if previous_count == 0 {
                continue;
            }
            let ratio = *current_count as f64 / previous_count as f64;
            if ratio < config.trend_growth_ratio {
                continue;
            }
            insights.push(Insight {
                id: uuid::Uuid::new_v4().to_string(),
                kind: InsightKind::Trend,
                basis_pattern_ids: Vec::new(),
                narrative: format!(
                    "knowledge in '{category}' is growing: {current_count} new entries \
                     this window vs {previous_count} in the previous one ({ratio:.1}x)",
                ),
                severity: threshold_excess(ratio, config.trend_growth_ratio),
                agent_id: None,
                created_at: Utc::now(),
            });
        }
        Ok(insights)
    }

    // --- anomaly: confidence drop or subscribed-but-empty category ---

    async fn anomalies(&self, current: &[Pattern], previous: &[Pattern]) -> Result<Vec<Insight>> {
        let config = self.config.load();
        let mut insights = Vec::new();

        for pattern in current {
            let Some(prior) = previous
                .iter()
                .find(|candidate| candidate.category == pattern.category)
            else {
                continue;
            };
            let drop = prior.confidence - pattern.confidence;
            if drop < config.anomaly_confidence_drop {
                continue;
            }
            insights.push(Insight {
                id: uuid::Uuid::new_v4().to_string(),
                kind: InsightKind::Anomaly,
                basis_pattern_ids: vec![prior.id.clone(), pattern.id.clone()],
                narrative: format!(
                    "pattern '{}' weakened: confidence fell from {:.2} to {:.2}",
                    pattern.category, prior.confidence, pattern.confidence,
                ),
                severity: threshold_excess(drop, config.anomaly_confidence_drop),
                agent_id: None,
                created_at: Utc::now(),
            });
        }

        // Subscribed categories with no live entries behind them.
        let covered: HashSet<KnowledgeCategory> = self
            .store
            .statistics()
            .await?
            .into_iter()
            .filter(|stats| stats.entry_count > 0)
            .map(|stats| stats.category)
            .collect();
        let subscribed = self.subscribed_categories().await?;
        for category in subscribed {
            if covered.contains(&category) {
                continue;
            }
            insights.push(Insight {
                id: uuid::Uuid::new_v4().to_string(),
                kind: InsightKind::Anomaly,
                basis_pattern_ids: Vec::new(),
                narrative: format!(
                    "agents subscribe to '{category}' but the store holds no entries for it",
                ),
                severity: 0.5,
                agent_id: None,
                created_at: Utc::now(),
            });
        }

        Ok(insights)
    }

    /// Distinct categories named by active subscriptions, sorted.
    async fn subscribed_categories(&self) -> Result<Vec<KnowledgeCategory>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT categories FROM subscriptions WHERE active = 1")
                .fetch_all(&self.pool)
                .await?;
        let mut categories: Vec<KnowledgeCategory> = rows
            .into_iter()
            .flat_map(|(json,)| {
                serde_json::from_str::<Vec<KnowledgeCategory>>(&json).unwrap_or_default()
            })
            .collect();
        categories.sort_by_key(|category| category.as_str());
        categories.dedup();
        Ok(categories)
    }

    // --- opportunity: strong knowledge patterns whose entries sit unused ---

    async fn opportunities(&self, current: &[Pattern]) -> Result<Vec<Insight>> {
        let config = self.config.load();
        let mut insights = Vec::new();

        for pattern in current {
            if !pattern.category.starts_with("knowledge:") {
                continue;
            }
            if pattern.confidence < config.opportunity_min_confidence
                || pattern.support_count < config.min_pattern_support
            {
                continue;
            }
            let entries = self.store.get_many(&pattern.evidence).await?;
            if entries.is_empty() {
                continue;
            }
            let average_usage = entries
                .iter()
                .map(|entry| entry.usage_count as f64)
                .sum::<f64>()
                / entries.len() as f64;
            if average_usage > config.opportunity_max_usage {
                continue;
            }
            insights.push(Insight {
                id: uuid::Uuid::new_v4().to_string(),
                kind: InsightKind::Opportunity,
                basis_pattern_ids: vec![pattern.id.clone()],
                narrative: format!(
                    "{} is well supported ({} entries, confidence {:.2}) but barely used \
                     (average usage {average_usage:.1}); worth surfacing to more agents",
                    pattern.description, pattern.support_count, pattern.confidence,
                ),
                severity: threshold_excess(pattern.confidence, config.opportunity_min_confidence),
                agent_id: None,
                created_at: Utc::now(),
            });
        }
        Ok(insights)
    }

    // --- risk: low success rate per task type, agent, or feedback stream ---

    async fn risks(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<Insight>> {
        let config = self.config.load();
        let min_support = config.min_pattern_support;
        let records = self.log.in_window(start, end).await?;
        let mut insights = Vec::new();

        struct Tally {
            successes: i64,
            failures: i64,
        }
        impl Tally {
            fn observe(&mut self, outcome: InteractionOutcome) {
                match outcome {
                    InteractionOutcome::Success => self.successes += 1,
                    InteractionOutcome::Failure => self.failures += 1,
                    InteractionOutcome::Neutral => {}
                }
            }
            fn rate(&self) -> Option<(f64, i64)> {
                let total = self.successes + self.failures;
                (total > 0).then(|| (self.successes as f64 / total as f64, total))
            }
        }

        let mut by_type: BTreeMap<String, Tally> = BTreeMap::new();
        let mut by_agent: BTreeMap<String, Tally> = BTreeMap::new();
        for record in &records {
            by_type
                .entry(record.interaction_type.clone())
                .or_insert(Tally {
                    successes: 0,
                    failures: 0,
                })
                .observe(record.outcome);
            by_agent
                .entry(record.source_agent.clone())
                .or_insert(Tally {
                    successes: 0,
                    failures: 0,
                })
                .observe(record.outcome);
        }

        for (interaction_type, tally) in &by_type {
            let Some((rate, total)) = tally.rate() else {
                continue;
            };
            if total < min_support || rate >= config.min_success_rate {
                continue;
            }
            insights.push(Insight {
                id: uuid::Uuid::new_v4().to_string(),
                kind: InsightKind::Risk,
                basis_pattern_ids: Vec::new(),
                narrative: format!(
                    "'{interaction_type}' interactions are failing: \
                     {:.0}% success over {total} attempts",
                    rate * 100.0,
                ),
                severity: threshold_shortfall(rate, config.min_success_rate),
                agent_id: None,
                created_at: Utc::now(),
            });
        }

        for (agent_id, tally) in &by_agent {
            let Some((rate, total)) = tally.rate() else {
                continue;
            };
            if total < min_support || rate >= config.min_success_rate {
                continue;
            }
            insights.push(Insight {
                id: uuid::Uuid::new_v4().to_string(),
                kind: InsightKind::Risk,
                basis_pattern_ids: Vec::new(),
                narrative: format!(
                    "agent {agent_id} is struggling: {:.0}% success over {total} interactions",
                    rate * 100.0,
                ),
                severity: threshold_shortfall(rate, config.min_success_rate),
                agent_id: Some(agent_id.clone()),
                created_at: Utc::now(),
            });
        }

        // Persistent low ratings are a risk even when interactions look fine.
        let feedback = self.profiles.feedback_since(start).await?;
        let mut ratings_by_agent: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        for item in &feedback {
            ratings_by_agent
                .entry(item.agent_id.clone())
                .or_default()
                .push(item.normalized_rating());
        }
        for (agent_id, ratings) in &ratings_by_agent {
            if (ratings.len() as i64) < min_support {
                continue;
            }
            let average = ratings.iter().sum::<f64>() / ratings.len() as f64;
            if average >= config.min_success_rate {
                continue;
            }
            insights.push(Insight {
                id: uuid::Uuid::new_v4().to_string(),
                kind: InsightKind::Risk,
                basis_pattern_ids: Vec::new(),
                narrative: format!(
                    "agent {agent_id} keeps reporting poor outcomes: \
                     average rating {:.1}/5 over {} reports",
                    1.0 + average * 4.0,
                    ratings.len(),
                ),
                severity: threshold_shortfall(average, config.min_success_rate),
                agent_id: Some(agent_id.clone()),
                created_at: Utc::now(),
            });
        }

        Ok(insights)
    }

    // --- optimization: the same complaint from several agents ---

    async fn optimizations(&self, start: DateTime<Utc>) -> Result<Vec<Insight>> {
        let config = self.config.load();
        let feedback = self.profiles.feedback_since(start).await?;
        let clusters = cluster_feedback(&feedback, config.feedback_similarity_threshold);

        let mut insights = Vec::new();
        for cluster in clusters {
            let agents: HashSet<&str> = cluster
                .iter()
                .map(|item| item.agent_id.as_str())
                .collect();
            if agents.len() < config.optimization_min_agents {
                continue;
            }
            let mut agent_list: Vec<&str> = agents.into_iter().collect();
            agent_list.sort();
            let sample = &cluster[0].details;
            insights.push(Insight {
                id: uuid::Uuid::new_v4().to_string(),
                kind: InsightKind::Optimization,
                basis_pattern_ids: Vec::new(),
                narrative: format!(
                    "{} agents ({}) report the same issue: \"{sample}\"",
                    agent_list.len(),
                    agent_list.join(", "),
                ),
                severity: threshold_excess(
                    agent_list.len() as f64,
                    config.optimization_min_agents as f64,
                ),
                agent_id: None,
                created_at: Utc::now(),
            });
        }
        Ok(insights)
    }

    // --- persistence ---

    async fn insert(&self, insight: &Insight) -> Result<()> {
        sqlx::query(
            "INSERT INTO insights (id, kind, basis_pattern_ids, narrative, severity, agent_id, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&insight.id)
        .bind(insight.kind.as_str())
        .bind(serde_json::to_string(&insight.basis_pattern_ids).unwrap_or_else(|_| "[]".into()))
        .bind(&insight.narrative)
        .bind(insight.severity)
        .bind(&insight.agent_id)
        .bind(insight.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Most recent insights, newest first.
    pub async fn recent(&self, limit: i64) -> Result<Vec<Insight>> {
        let rows: Vec<InsightRow> = sqlx::query_as(
            "SELECT id, kind, basis_pattern_ids, narrative, severity, agent_id, created_at \
             FROM insights ORDER BY created_at DESC, id ASC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(InsightRow::into_insight).collect())
    }

    /// Total stored insight count.
    pub async fn count(&self) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM insights")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }
}

impl std::fmt::Debug for InsightGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InsightGenerator").finish_non_exhaustive()
    }
}

/// How far a metric sits past its threshold, scaled onto 0..=1.
fn threshold_excess(value: f64, threshold: f64) -> f64 {
    if threshold <= 0.0 {
        return 1.0;
    }
    ((value - threshold) / threshold).clamp(0.0, 1.0)
}

/// How far a metric sits below its threshold, scaled onto 0..=1.
fn threshold_shortfall(value: f64, threshold: f64) -> f64 {
    if threshold <= 0.0 {
        return 0.0;
    }
    ((threshold - value) / threshold).clamp(0.0, 1.0)
}

/// Greedy single-link clustering of feedback by detail similarity. Inputs
/// come newest first; each item joins the first cluster whose seed it
/// resembles.
fn cluster_feedback(feedback: &[Feedback], similarity_threshold: f64) -> Vec<Vec<&Feedback>> {
    let mut clusters: Vec<Vec<&Feedback>> = Vec::new();
    for item in feedback {
        if item.details.is_empty() {
            continue;
        }
        match clusters.iter_mut().find(|cluster| {
            text::keyword_overlap(&cluster[0].details, &item.details) >= similarity_threshold
        }) {
            Some(cluster) => cluster.push(item),
            None => clusters.push(vec![item]),
        }
    }
    clusters
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{self, EngineConfig};
    use crate::types::PatternSource;
    use serde_json::json;

    struct Fixture {
        generator: InsightGenerator,
        store: KnowledgeStore,
        log: InteractionLog,
        patterns: PatternRecognizer,
        profiles: ProfileStore,
        _dir: tempfile::TempDir,
    }

    async fn fixture(config: EngineConfig) -> Fixture {
        let dir = tempfile::tempdir().expect("create temp dir");
        let pool = crate::store::connect(&dir.path().join("knowledge.db"))
            .await
            .expect("connect");
        let config = config::shared(config);
        let store = KnowledgeStore::new(pool.clone(), config.clone());
        let log = InteractionLog::new(pool.clone());
        let patterns =
            PatternRecognizer::new(pool.clone(), store.clone(), log.clone(), config.clone());
        let profiles = ProfileStore::new(pool.clone(), config.clone());
        let generator = InsightGenerator::new(
            pool,
            store.clone(),
            log.clone(),
            patterns.clone(),
            profiles.clone(),
            config,
        );
        Fixture {
            generator,
            store,
            log,
            patterns,
            profiles,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn failing_interactions_produce_a_risk_insight() {
        let fx = fixture(EngineConfig {
            min_pattern_support: 3,
            ..EngineConfig::default()
        })
        .await;

        for _ in 0..4 {
            fx.log
                .record("a1", None, "deploy", json!({}), InteractionOutcome::Failure)
                .await
                .expect("record");
        }

        let insights = fx.generator.generate(None).await.expect("generate");
        let risks: Vec<&Insight> = insights
            .iter()
            .filter(|insight| insight.kind == InsightKind::Risk)
            .collect();
        // One for the task type, one for the agent.
        assert_eq!(risks.len(), 2);
        assert!(risks.iter().any(|insight| insight.agent_id.is_none()));
        assert!(risks
            .iter()
            .any(|insight| insight.agent_id.as_deref() == Some("a1")));
        // Total failure sits at maximum distance from the threshold.
        assert!(risks.iter().all(|insight| insight.severity == 1.0));
    }

    #[tokio::test]
    async fn low_feedback_stream_produces_an_agent_scoped_risk() {
        let fx = fixture(EngineConfig {
            min_pattern_support: 3,
            ..EngineConfig::default()
        })
        .await;

        for index in 0..3 {
            fx.profiles
                .submit_feedback("a7", &format!("t{index}"), 1, "everything is slow")
                .await
                .expect("submit");
        }

        let insights = fx.generator.generate(Some("a7")).await.expect("generate");
        assert!(insights
            .iter()
            .any(|insight| insight.kind == InsightKind::Risk
                && insight.agent_id.as_deref() == Some("a7")));
    }

    #[tokio::test]
    async fn similar_feedback_across_agents_produces_an_optimization() {
        let fx = fixture(EngineConfig {
            optimization_min_agents: 3,
            feedback_similarity_threshold: 0.5,
            ..EngineConfig::default()
        })
        .await;

        for agent in ["a1", "a2", "a3"] {
            fx.profiles
                .submit_feedback(agent, "t1", 4, "build cache misses slow everything down")
                .await
                .expect("submit");
        }
        fx.profiles
            .submit_feedback("a4", "t2", 4, "unrelated remark about documentation")
            .await
            .expect("submit");

        let insights = fx.generator.generate(None).await.expect("generate");
        let optimizations: Vec<&Insight> = insights
            .iter()
            .filter(|insight| insight.kind == InsightKind::Optimization)
            .collect();
        assert_eq!(optimizations.len(), 1);
        assert!(optimizations[0].narrative.contains("a1, a2, a3"));
    }

    #[tokio::test]
    async fn strong_unused_knowledge_pattern_produces_an_opportunity() {
        let fx = fixture(EngineConfig {
            min_tag_co_occurrence: 3,
            min_pattern_support: 3,
            opportunity_min_confidence: 0.7,
            ..EngineConfig::default()
        })
        .await;

        for index in 0..3 {
            fx.store
                .put(
                    &format!("entry {index}"),
                    KnowledgeCategory::CodePatterns,
                    &["async".to_string(), "python".to_string()],
                    "a1",
                    0.8,
                )
                .await
                .expect("put");
        }

        let end = Utc::now() + Duration::seconds(1);
        fx.patterns
            .detect(PatternSource::Knowledge, end - Duration::days(7), end)
            .await
            .expect("detect");

        let insights = fx.generator.generate(None).await.expect("generate");
        let opportunity = insights
            .iter()
            .find(|insight| insight.kind == InsightKind::Opportunity)
            .expect("opportunity present");
        assert_eq!(opportunity.basis_pattern_ids.len(), 1);
    }

    #[tokio::test]
    async fn insights_are_persisted_append_only() {
        let fx = fixture(EngineConfig {
            min_pattern_support: 2,
            ..EngineConfig::default()
        })
        .await;
        for _ in 0..2 {
            fx.log
                .record("a1", None, "deploy", json!({}), InteractionOutcome::Failure)
                .await
                .expect("record");
        }

        fx.generator.generate(None).await.expect("generate");
        let first_count = fx.generator.count().await.expect("count");
        assert!(first_count > 0);

        fx.generator.generate(None).await.expect("generate");
        // A second run appends rather than replacing.
        assert!(fx.generator.count().await.expect("count") > first_count);
        assert!(!fx.generator.recent(10).await.expect("recent").is_empty());
    }
}
