//! LearningCoordinator: owns every engine component and the periodic
//! background work.
//!
//! Three loops run on independent intervals: the ingestion sweep (usage
//! flush, retention, tombstone purge, one-shot expiry, profile refresh),
//! pattern detection, and insight generation. Each loop guards itself with
//! an atomic flag so a run that outlasts its interval is skipped, never
//! queued, and all loops stop promptly on the shutdown token. Foreground
//! operations stay callable at any time; background failures are logged and
//! the next tick retries.

use crate::config::SharedConfig;
use crate::error::Result;
use crate::flow::{DeliverySink, FlowMetrics, KnowledgeFlowManager, RequestOutcome, Urgency};
use crate::graph::{CentralNode, KnowledgeGraph, RelatedNode};
use crate::insights::InsightGenerator;
use crate::interactions::InteractionLog;
use crate::patterns::PatternRecognizer;
use crate::profiles::ProfileStore;
use crate::recommend::{
    CollaboratorRecommendation, LearningStep, Recommendation, RecommendationEngine,
};
use crate::store::{CategoryStatistics, KnowledgeStore, ScoredEntry};
use crate::types::{
    AgentLearningProfile, EntryPatch, Feedback, Insight, InteractionOutcome, InteractionRecord,
    KnowledgeCategory, KnowledgeEntry, Pattern, PatternSource, RelationKind, Subscription,
};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use sqlx::SqlitePool;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const PROFILE_CURSOR_KEY: &str = "profile_cursor";
const PROFILE_BATCH: i64 = 500;

/// What one ingestion sweep accomplished.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct IngestionSummary {
    pub flushed_usage: usize,
    pub swept_interactions: u64,
    pub purged_entries: usize,
    pub expired_requests: u64,
    pub profiled_interactions: usize,
}

/// Point-in-time summary of everything the engine has learned.
#[derive(Debug, Clone, serde::Serialize)]
pub struct LearningReport {
    pub generated_at: DateTime<Utc>,
    pub total_entries: i64,
    pub total_interactions: i64,
    pub total_patterns: i64,
    pub total_insights: i64,
    pub known_agents: i64,
    pub top_patterns: Vec<Pattern>,
    pub recent_insights: Vec<Insight>,
    pub categories: Vec<CategoryStatistics>,
    pub flow: FlowMetrics,
}

/// Store and graph shape for the analytics surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct KnowledgeStatistics {
    pub total_entries: i64,
    pub categories: Vec<CategoryStatistics>,
    pub edge_count: usize,
    pub central_entries: Vec<CentralNode>,
}

/// An agent profile joined with its active subscriptions.
#[derive(Debug, Clone)]
pub struct AgentProfileView {
    pub profile: AgentLearningProfile,
    pub subscription_ids: Vec<String>,
    pub gaps: Vec<(String, f64)>,
}

/// Top-level handle owning all components and background loops.
#[derive(Clone)]
pub struct LearningCoordinator {
    config: SharedConfig,
    store: KnowledgeStore,
    graph: Arc<KnowledgeGraph>,
    log: InteractionLog,
    patterns: PatternRecognizer,
    insights: InsightGenerator,
    profiles: ProfileStore,
    recommender: RecommendationEngine,
    flow: KnowledgeFlowManager,
    shutdown: CancellationToken,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    ingestion_busy: Arc<AtomicBool>,
    pattern_busy: Arc<AtomicBool>,
    insight_busy: Arc<AtomicBool>,
}

impl LearningCoordinator {
    /// Open (or create) the engine database and wire up every component.
    /// Loops are not started until [`start`] is called.
    ///
    /// [`start`]: LearningCoordinator::start
    pub async fn open(
        path: &Path,
        config: SharedConfig,
        sink: Arc<dyn DeliverySink>,
    ) -> Result<Self> {
        let pool = crate::store::connect(path).await?;
        Self::with_pool(pool, config, sink).await
    }

    /// Wire components onto an already-connected pool.
    pub async fn with_pool(
        pool: SqlitePool,
        config: SharedConfig,
        sink: Arc<dyn DeliverySink>,
    ) -> Result<Self> {
        let store = KnowledgeStore::new(pool.clone(), config.clone());
        let graph = Arc::new(KnowledgeGraph::load(pool.clone(), config.clone()).await?);
        let log = InteractionLog::new(pool.clone());
        let patterns =
            PatternRecognizer::new(pool.clone(), store.clone(), log.clone(), config.clone());
        let profiles = ProfileStore::new(pool.clone(), config.clone());
        let insights = InsightGenerator::new(
            pool.clone(),
            store.clone(),
            log.clone(),
            patterns.clone(),
            profiles.clone(),
            config.clone(),
        );
        let recommender = RecommendationEngine::new(
            store.clone(),
            graph.clone(),
            log.clone(),
            profiles.clone(),
            config.clone(),
        );
        let flow = KnowledgeFlowManager::new(pool, store.clone(), sink, config.clone());

        Ok(Self {
            config,
            store,
            graph,
            log,
            patterns,
            insights,
            profiles,
            recommender,
            flow,
            shutdown: CancellationToken::new(),
            tasks: Arc::new(Mutex::new(Vec::new())),
            ingestion_busy: Arc::new(AtomicBool::new(false)),
            pattern_busy: Arc::new(AtomicBool::new(false)),
            insight_busy: Arc::new(AtomicBool::new(false)),
        })
    }

    // -----------------------------------------------------------------------
    // Knowledge operations
    // -----------------------------------------------------------------------

    /// Store a new entry, link it to entries sharing its tags, and fan it out
    /// to subscribers. Linking or delivery problems never fail the write.
    pub async fn put_knowledge(
        &self,
        content: &str,
        category: KnowledgeCategory,
        tags: &[String],
        source_agent: &str,
        confidence: f64,
    ) -> Result<KnowledgeEntry> {
        let entry = self
            .store
            .put(content, category, tags, source_agent, confidence)
            .await?;

        if let Err(error) = self.link_shared_tags(&entry).await {
            tracing::warn!(%error, entry_id = %entry.id, "shared-tag linking failed");
        }
        if let Err(error) = self.flow.publish(&[entry.id.clone()], None).await {
            tracing::warn!(%error, entry_id = %entry.id, "publish after put failed");
        }
        tracing::debug!(entry_id = %entry.id, category = %entry.category, "knowledge stored");
        Ok(entry)
    }

    async fn link_shared_tags(&self, entry: &KnowledgeEntry) -> Result<()> {
        let config = self.config.load();
        let siblings = self
            .store
            .sharing_tags(&entry.tags, &entry.id, config.co_retrieval_max_results)
            .await?;
        for sibling in siblings {
            self.graph
                .link(
                    &entry.id,
                    &sibling.id,
                    RelationKind::SharedTag,
                    config.shared_tag_weight,
                )
                .await?;
        }
        Ok(())
    }

    /// Fetch an entry (records a usage hit).
    pub async fn get_knowledge(&self, id: &str) -> Result<Option<KnowledgeEntry>> {
        self.store.get(id).await
    }

    /// Patch an entry under optimistic concurrency, then republish it: an
    /// update is a qualifying write for subscribers just like a new entry.
    pub async fn update_knowledge(&self, id: &str, patch: &EntryPatch) -> Result<KnowledgeEntry> {
        let entry = self.store.update(id, patch).await?;
        if let Err(error) = self.flow.publish(&[entry.id.clone()], None).await {
            tracing::warn!(%error, entry_id = %entry.id, "publish after update failed");
        }
        Ok(entry)
    }

    /// Tombstone an entry. Edges are collected when the purge removes it.
    pub async fn delete_knowledge(&self, id: &str) -> Result<()> {
        self.store.delete(id).await
    }

    /// Ranked search. Co-retrieved hits strengthen their mutual edges so the
    /// graph learns from retrieval behavior.
    pub async fn search_knowledge(
        &self,
        query: &str,
        category: Option<KnowledgeCategory>,
        tags: &[String],
        limit: usize,
    ) -> Result<Vec<ScoredEntry>> {
        let hits = self.store.search(query, category, tags, limit).await?;
        if hits.len() > 1 {
            let ids: Vec<String> = hits.iter().map(|hit| hit.entry.id.clone()).collect();
            if let Err(error) = self.graph.link_co_retrieved(&ids).await {
                tracing::warn!(%error, "co-retrieval linking failed");
            }
        }
        Ok(hits)
    }

    // -----------------------------------------------------------------------
    // Graph operations
    // -----------------------------------------------------------------------

    /// Explicitly relate two entries.
    pub async fn link_knowledge(
        &self,
        from_id: &str,
        to_id: &str,
        weight: f64,
    ) -> Result<f64> {
        self.graph
            .link(from_id, to_id, RelationKind::Explicit, weight)
            .await
    }

    pub fn related_knowledge(&self, id: &str, max_depth: u32, limit: usize) -> Vec<RelatedNode> {
        self.graph.related_to(id, max_depth, limit)
    }

    pub fn knowledge_path(&self, from_id: &str, to_id: &str) -> Option<Vec<String>> {
        self.graph.find_path(from_id, to_id)
    }

    pub fn knowledge_clusters(&self, min_size: usize) -> Vec<Vec<String>> {
        self.graph.clusters(min_size)
    }

    pub fn central_knowledge(&self, limit: usize) -> Vec<CentralNode> {
        self.graph.central_nodes(limit)
    }

    // -----------------------------------------------------------------------
    // Interactions, feedback, mining
    // -----------------------------------------------------------------------

    /// Append an interaction. Profile effects land on the next ingestion
    /// sweep; the record itself is durable immediately.
    pub async fn record_interaction(
        &self,
        source_agent: &str,
        target_agent: Option<&str>,
        interaction_type: &str,
        payload: serde_json::Value,
        outcome: InteractionOutcome,
    ) -> Result<InteractionRecord> {
        self.log
            .record(source_agent, target_agent, interaction_type, payload, outcome)
            .await
    }

    /// Record explicit feedback (validated 1..=5 rating).
    pub async fn submit_feedback(
        &self,
        agent_id: &str,
        task_id: &str,
        rating: i64,
        details: &str,
    ) -> Result<Feedback> {
        self.profiles
            .submit_feedback(agent_id, task_id, rating, details)
            .await
    }

    /// Run pattern detection for one source over the configured window.
    /// Skipped (returning `None`) while the periodic run is in flight.
    pub async fn detect_patterns(&self, source: PatternSource) -> Result<Option<Vec<Pattern>>> {
        if self.pattern_busy.swap(true, Ordering::SeqCst) {
            tracing::debug!("pattern detection already running, skipping");
            return Ok(None);
        }
        let result = self.detect_patterns_inner(source).await;
        self.pattern_busy.store(false, Ordering::SeqCst);
        result.map(Some)
    }

    async fn detect_patterns_inner(&self, source: PatternSource) -> Result<Vec<Pattern>> {
        let window_end = Utc::now();
        let window_start = window_end - Duration::days(self.config.load().pattern_window_days);
        self.patterns.detect(source, window_start, window_end).await
    }

    /// Run insight generation now. Skipped while the periodic run is in
    /// flight.
    pub async fn generate_insights(&self, agent_id: Option<&str>) -> Result<Option<Vec<Insight>>> {
        if self.insight_busy.swap(true, Ordering::SeqCst) {
            tracing::debug!("insight generation already running, skipping");
            return Ok(None);
        }
        let result = self.insights.generate(agent_id).await;
        self.insight_busy.store(false, Ordering::SeqCst);
        result.map(Some)
    }

    // -----------------------------------------------------------------------
    // Recommendations
    // -----------------------------------------------------------------------

    pub async fn recommend(
        &self,
        agent_id: &str,
        task_type: &str,
        limit: usize,
    ) -> Result<Vec<Recommendation>> {
        self.recommender.recommend(agent_id, task_type, limit).await
    }

    pub async fn recommend_collaborators(
        &self,
        agent_id: &str,
        task_type: &str,
        limit: usize,
    ) -> Result<Vec<CollaboratorRecommendation>> {
        self.recommender
            .recommend_collaborators(agent_id, task_type, limit)
            .await
    }

    pub async fn recommend_learning_path(
        &self,
        agent_id: &str,
        limit: usize,
    ) -> Result<Vec<LearningStep>> {
        self.recommender.recommend_learning_path(agent_id, limit).await
    }

    // -----------------------------------------------------------------------
    // Flow
    // -----------------------------------------------------------------------

    pub async fn subscribe(
        &self,
        agent_id: &str,
        categories: &[KnowledgeCategory],
        tags: &[String],
    ) -> Result<Subscription> {
        self.flow.subscribe(agent_id, categories, tags).await
    }

    pub async fn unsubscribe(&self, subscription_id: &str) -> Result<()> {
        self.flow.unsubscribe(subscription_id).await
    }

    pub async fn request_knowledge(
        &self,
        agent_id: &str,
        query: &str,
        urgency: Urgency,
    ) -> Result<RequestOutcome> {
        self.flow.request_knowledge(agent_id, query, urgency).await
    }

    /// Share specific entries with specific agents, bypassing matching.
    pub async fn publish(
        &self,
        entry_ids: &[String],
        targets: Option<&[String]>,
    ) -> Result<usize> {
        self.flow.publish(entry_ids, targets).await
    }

    // -----------------------------------------------------------------------
    // Analytics surface
    // -----------------------------------------------------------------------

    pub async fn learning_report(&self) -> Result<LearningReport> {
        let categories = self.store.statistics().await?;
        let total_entries = categories.iter().map(|stats| stats.entry_count).sum();
        let since = Utc::now() - Duration::days(self.config.load().pattern_window_days * 2);
        Ok(LearningReport {
            generated_at: Utc::now(),
            total_entries,
            total_interactions: self.log.count().await?,
            total_patterns: self.patterns.count().await?,
            total_insights: self.insights.count().await?,
            known_agents: self.profiles.count().await?,
            top_patterns: self.patterns.top(since, 10).await?,
            recent_insights: self.insights.recent(10).await?,
            categories,
            flow: self.flow.metrics().await?,
        })
    }

    pub async fn knowledge_statistics(&self) -> Result<KnowledgeStatistics> {
        let categories = self.store.statistics().await?;
        Ok(KnowledgeStatistics {
            total_entries: categories.iter().map(|stats| stats.entry_count).sum(),
            categories,
            edge_count: self.graph.edge_count(),
            central_entries: self.graph.central_nodes(10),
        })
    }

    /// Profile joined with subscriptions; `None` for unknown agents.
    pub async fn agent_profile(&self, agent_id: &str) -> Result<Option<AgentProfileView>> {
        let Some(profile) = self.profiles.get(agent_id).await? else {
            return Ok(None);
        };
        let subscription_ids = self
            .flow
            .subscriptions_for(agent_id)
            .await?
            .into_iter()
            .map(|subscription| subscription.id)
            .collect();
        let gaps = profile.gaps(self.config.load().competence_threshold);
        Ok(Some(AgentProfileView {
            profile,
            subscription_ids,
            gaps,
        }))
    }

    pub async fn flow_metrics(&self) -> Result<FlowMetrics> {
        self.flow.metrics().await
    }

    // -----------------------------------------------------------------------
    // Background loops
    // -----------------------------------------------------------------------

    /// Spawn the three periodic loops. Idempotent only in the sense that
    /// callers are expected to invoke it once; the shutdown token stops
    /// everything it spawned.
    pub fn start(&self) {
        let intervals = {
            let config = self.config.load();
            (
                config.ingestion_interval_secs,
                config.pattern_interval_secs,
                config.insight_interval_secs,
            )
        };
        self.spawn_loop("ingestion", intervals.0, |coordinator| async move {
            coordinator.run_ingestion_sweep().await.map(|_| ())
        });
        self.spawn_loop("pattern-detection", intervals.1, |coordinator| async move {
            coordinator
                .detect_patterns(PatternSource::Interactions)
                .await?;
            coordinator.detect_patterns(PatternSource::Knowledge).await?;
            Ok(())
        });
        self.spawn_loop("insight-generation", intervals.2, |coordinator| async move {
            coordinator.generate_insights(None).await.map(|_| ())
        });
        tracing::info!(
            ingestion_secs = intervals.0,
            pattern_secs = intervals.1,
            insight_secs = intervals.2,
            "learning loops started"
        );
    }

    fn spawn_loop<F, Fut>(&self, name: &'static str, interval_secs: u64, run: F)
    where
        F: Fn(LearningCoordinator) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send,
    {
        let coordinator = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_secs(interval_secs.max(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = coordinator.shutdown.cancelled() => {
                        tracing::info!(loop_name = name, "learning loop stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(error) = run(coordinator.clone()).await {
                            tracing::warn!(loop_name = name, %error, "learning loop tick failed");
                        }
                    }
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    /// Stop all loops and wait for them to finish. In-flight foreground
    /// operations are unaffected.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for handle in handles {
            if let Err(error) = handle.await {
                tracing::warn!(%error, "learning loop panicked");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Sweeps
    // -----------------------------------------------------------------------

    /// Run one ingestion sweep: flush usage counters, apply retention, purge
    /// tombstones (collecting graph edges), expire one-shot requests, and
    /// fold new interactions into agent profiles. Returns `None` when a
    /// sweep is already in flight.
    pub async fn run_ingestion_sweep(&self) -> Result<Option<IngestionSummary>> {
        if self.ingestion_busy.swap(true, Ordering::SeqCst) {
            tracing::debug!("ingestion sweep already running, skipping");
            return Ok(None);
        }
        let result = self.ingestion_sweep_inner().await;
        self.ingestion_busy.store(false, Ordering::SeqCst);
        result.map(Some)
    }

    async fn ingestion_sweep_inner(&self) -> Result<IngestionSummary> {
        let config = self.config.load();
        let mut summary = IngestionSummary::default();

        summary.flushed_usage = self.store.flush_usage().await?;
        summary.swept_interactions = self.log.sweep(config.retention_days).await?;

        let purged = self.store.purge_tombstoned().await?;
        if !purged.is_empty() {
            self.graph.remove_entries(&purged).await?;
        }
        summary.purged_entries = purged.len();

        summary.expired_requests = self.flow.expire_one_shots().await?;
        summary.profiled_interactions = self.refresh_profiles().await?;

        self.store
            .set_state("last_ingestion_at", Utc::now().to_rfc3339())
            .await?;
        tracing::debug!(
            flushed = summary.flushed_usage,
            swept = summary.swept_interactions,
            purged = summary.purged_entries,
            expired = summary.expired_requests,
            profiled = summary.profiled_interactions,
            "ingestion sweep finished"
        );
        Ok(summary)
    }

    /// Fold interactions recorded since the durable cursor into profiles.
    /// Entry-backed interactions also move the matching category skill.
    async fn refresh_profiles(&self) -> Result<usize> {
        let cursor = match self.store.get_state(PROFILE_CURSOR_KEY).await? {
            Some(raw) => DateTime::parse_from_rfc3339(&raw)
                .map(|parsed| parsed.with_timezone(&Utc))
                .unwrap_or(DateTime::<Utc>::MIN_UTC),
            None => DateTime::<Utc>::MIN_UTC,
        };

        let records = self.log.since(cursor, PROFILE_BATCH).await?;
        let mut applied = 0;
        let mut latest = cursor;
        for record in &records {
            let category_hint = match record.payload.get("entry_id").and_then(|v| v.as_str()) {
                Some(entry_id) => self
                    .store
                    .peek(entry_id)
                    .await?
                    .map(|entry| entry.category),
                None => None,
            };
            self.profiles
                .apply_interaction(record, category_hint)
                .await?;
            applied += 1;
            if record.created_at > latest {
                latest = record.created_at;
            }
        }

        if applied > 0 {
            self.store
                .set_state(PROFILE_CURSOR_KEY, latest.to_rfc3339())
                .await?;
        }
        Ok(applied)
    }
}

impl std::fmt::Debug for LearningCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LearningCoordinator").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{self, EngineConfig};
    use crate::flow::NullSink;
    use async_trait::async_trait;
    use serde_json::json;

    #[derive(Default)]
    struct TestSink {
        delivered: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl DeliverySink for TestSink {
        async fn deliver_entry(
            &self,
            agent_id: &str,
            entry: &KnowledgeEntry,
        ) -> anyhow::Result<()> {
            self.delivered
                .lock()
                .push((agent_id.to_owned(), entry.id.clone()));
            Ok(())
        }

        async fn notify_request_expired(&self, _: &str, _: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    async fn coordinator_with(
        engine_config: EngineConfig,
        sink: Arc<dyn DeliverySink>,
    ) -> (LearningCoordinator, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("create temp dir");
        let coordinator = LearningCoordinator::open(
            &dir.path().join("knowledge.db"),
            config::shared(engine_config),
            sink,
        )
        .await
        .expect("open");
        (coordinator, dir)
    }

    async fn wait_until<F>(mut condition: F)
    where
        F: FnMut() -> bool,
    {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("condition not reached within 2s");
    }

    #[tokio::test]
    async fn published_knowledge_reaches_matching_subscribers() {
        let sink = Arc::new(TestSink::default());
        let (coordinator, _dir) =
            coordinator_with(EngineConfig::default(), sink.clone()).await;

        coordinator
            .subscribe("a2", &[KnowledgeCategory::BestPractices], &[])
            .await
            .expect("subscribe");

        let entry = coordinator
            .put_knowledge(
                "retry with exponential backoff",
                KnowledgeCategory::BestPractices,
                &["resilience".to_string()],
                "a1",
                0.9,
            )
            .await
            .expect("put");

        let observer = sink.clone();
        wait_until(move || observer.delivered.lock().len() == 1).await;
        assert_eq!(
            sink.delivered.lock().clone(),
            vec![("a2".to_owned(), entry.id)]
        );
    }

    #[tokio::test]
    async fn co_retrieved_search_hits_grow_an_edge() {
        let (coordinator, _dir) =
            coordinator_with(EngineConfig::default(), Arc::new(NullSink)).await;

        let first = coordinator
            .put_knowledge(
                "tuning postgres indexes",
                KnowledgeCategory::Debugging,
                &[],
                "a1",
                0.8,
            )
            .await
            .expect("put");
        let second = coordinator
            .put_knowledge(
                "postgres indexes for jsonb",
                KnowledgeCategory::Debugging,
                &[],
                "a1",
                0.8,
            )
            .await
            .expect("put");

        let hits = coordinator
            .search_knowledge("postgres indexes", None, &[], 10)
            .await
            .expect("search");
        assert_eq!(hits.len(), 2);

        let weight = coordinator
            .graph
            .edge_weight(&first.id, &second.id)
            .expect("edge exists");
        assert!((weight - EngineConfig::default().co_retrieval_weight).abs() < 1e-9);

        // A related lookup now surfaces the sibling.
        let related = coordinator.related_knowledge(&first.id, 2, 10);
        assert_eq!(related.len(), 1);
        assert_eq!(related[0].id, second.id);
    }

    #[tokio::test]
    async fn failure_heavy_window_is_detected_with_expected_support() {
        let (coordinator, _dir) =
            coordinator_with(EngineConfig::default(), Arc::new(NullSink)).await;

        for _ in 0..10 {
            coordinator
                .record_interaction("a1", None, "code_review", json!({}), InteractionOutcome::Failure)
                .await
                .expect("record");
        }
        for _ in 0..2 {
            coordinator
                .record_interaction("a1", None, "code_review", json!({}), InteractionOutcome::Success)
                .await
                .expect("record");
        }

        let detected = coordinator
            .detect_patterns(PatternSource::Interactions)
            .await
            .expect("detect")
            .expect("not skipped");
        let failure = detected
            .iter()
            .find(|pattern| pattern.category == "interaction:code_review:failure")
            .expect("failure pattern");
        assert_eq!(failure.support_count, 12);
        assert!((failure.confidence - 10.0 / 12.0).abs() < 0.001);
    }

    #[tokio::test]
    async fn sustained_low_feedback_produces_a_risk_insight() {
        let (coordinator, _dir) = coordinator_with(
            EngineConfig {
                min_pattern_support: 3,
                ..EngineConfig::default()
            },
            Arc::new(NullSink),
        )
        .await;

        for index in 0..4 {
            coordinator
                .submit_feedback("a5", &format!("t{index}"), 1, "output was wrong")
                .await
                .expect("feedback");
        }

        let insights = coordinator
            .generate_insights(None)
            .await
            .expect("generate")
            .expect("not skipped");
        assert!(insights.iter().any(|insight| {
            insight.kind == crate::types::InsightKind::Risk
                && insight.agent_id.as_deref() == Some("a5")
        }));
    }

    #[tokio::test]
    async fn ingestion_sweep_builds_profiles_from_the_log() {
        let (coordinator, _dir) =
            coordinator_with(EngineConfig::default(), Arc::new(NullSink)).await;

        let entry = coordinator
            .put_knowledge("gdb basics", KnowledgeCategory::Debugging, &[], "a9", 0.8)
            .await
            .expect("put");
        coordinator
            .record_interaction(
                "a1",
                None,
                "debugging_session",
                json!({"entry_id": entry.id}),
                InteractionOutcome::Success,
            )
            .await
            .expect("record");

        let summary = coordinator
            .run_ingestion_sweep()
            .await
            .expect("sweep")
            .expect("not skipped");
        assert_eq!(summary.profiled_interactions, 1);

        let view = coordinator
            .agent_profile("a1")
            .await
            .expect("profile")
            .expect("present");
        assert_eq!(view.profile.skill_vector["debugging_session"], 1.0);
        // Entry-backed interaction also moved the category skill.
        assert_eq!(view.profile.skill_vector["debugging"], 1.0);

        // The cursor advanced: a second sweep applies nothing.
        let summary = coordinator
            .run_ingestion_sweep()
            .await
            .expect("sweep")
            .expect("not skipped");
        assert_eq!(summary.profiled_interactions, 0);
    }

    #[tokio::test]
    async fn profile_view_carries_subscription_ids() {
        let (coordinator, _dir) =
            coordinator_with(EngineConfig::default(), Arc::new(NullSink)).await;

        coordinator
            .record_interaction("a1", None, "task", json!({}), InteractionOutcome::Success)
            .await
            .expect("record");
        coordinator.run_ingestion_sweep().await.expect("sweep");
        let subscription = coordinator
            .subscribe("a1", &[KnowledgeCategory::Tooling], &[])
            .await
            .expect("subscribe");

        let view = coordinator
            .agent_profile("a1")
            .await
            .expect("profile")
            .expect("present");
        assert_eq!(view.subscription_ids, vec![subscription.id]);
    }

    #[tokio::test]
    async fn report_and_statistics_reflect_engine_state() {
        let (coordinator, _dir) =
            coordinator_with(EngineConfig::default(), Arc::new(NullSink)).await;

        coordinator
            .put_knowledge("entry one", KnowledgeCategory::General, &[], "a1", 0.5)
            .await
            .expect("put");
        coordinator
            .record_interaction("a1", None, "task", json!({}), InteractionOutcome::Success)
            .await
            .expect("record");

        let report = coordinator.learning_report().await.expect("report");
        assert_eq!(report.total_entries, 1);
        assert_eq!(report.total_interactions, 1);

        let statistics = coordinator
            .knowledge_statistics()
            .await
            .expect("statistics");
        assert_eq!(statistics.total_entries, 1);
        assert_eq!(statistics.categories.len(), 1);
        assert_eq!(statistics.edge_count, 0);
    }

    #[tokio::test]
    async fn loops_start_and_stop_cleanly() {
        let (coordinator, _dir) = coordinator_with(
            EngineConfig {
                ingestion_interval_secs: 1,
                pattern_interval_secs: 1,
                insight_interval_secs: 1,
                ..EngineConfig::default()
            },
            Arc::new(NullSink),
        )
        .await;

        coordinator.start();
        // First ticks fire immediately; wait for the sweep's heartbeat.
        let mut heartbeat = None;
        for _ in 0..200 {
            heartbeat = coordinator
                .store
                .get_state("last_ingestion_at")
                .await
                .expect("state");
            if heartbeat.is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(heartbeat.is_some());
        coordinator.shutdown().await;

        // Foreground operations still work after shutdown.
        coordinator
            .put_knowledge("still alive", KnowledgeCategory::General, &[], "a1", 0.5)
            .await
            .expect("put");
    }

    #[tokio::test]
    async fn concurrent_sweeps_skip_instead_of_overlapping() {
        let (coordinator, _dir) =
            coordinator_with(EngineConfig::default(), Arc::new(NullSink)).await;

        coordinator.ingestion_busy.store(true, Ordering::SeqCst);
        let skipped = coordinator.run_ingestion_sweep().await.expect("sweep");
        assert!(skipped.is_none());

        coordinator.ingestion_busy.store(false, Ordering::SeqCst);
        let ran = coordinator.run_ingestion_sweep().await.expect("sweep");
        assert!(ran.is_some());
    }
}
