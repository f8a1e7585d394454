//! RecommendationEngine: knowledge, collaborator, and learning-path
//! suggestions for an agent.
//!
//! Scores blend three signals: lexical match between the task and an entry,
//! graph proximity to entries the agent already used successfully, and the
//! entry's decayed confidence. Every recommendation carries a human-readable
//! reason naming its strongest signal. All orderings are deterministic (score
//! desc, then id).

use crate::config::SharedConfig;
use crate::error::Result;
use crate::graph::KnowledgeGraph;
use crate::interactions::InteractionLog;
use crate::profiles::{ProfileStore, FEEDBACK_SKILL};
use crate::store::KnowledgeStore;
use crate::text;
use crate::types::{InteractionOutcome, KnowledgeCategory, KnowledgeEntry};

use chrono::{Duration, Utc};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// How many of the agent's recent interactions seed the proximity signal.
const SEED_INTERACTION_LIMIT: i64 = 100;
/// Candidate pool multiplier before final ranking.
const CANDIDATE_FACTOR: usize = 4;

/// One recommended knowledge entry.
#[derive(Debug, Clone)]
pub struct Recommendation {
    pub entry: KnowledgeEntry,
    pub score: f64,
    pub reason: String,
}

/// One recommended collaborator.
#[derive(Debug, Clone)]
pub struct CollaboratorRecommendation {
    pub agent_id: String,
    pub score: f64,
    pub reason: String,
}

/// One step of a learning path, fundamentals first.
#[derive(Debug, Clone)]
pub struct LearningStep {
    pub entry: KnowledgeEntry,
    pub category: KnowledgeCategory,
    pub centrality: f64,
}

/// Suggestion engine over the store, graph, log, and profiles.
#[derive(Clone)]
pub struct RecommendationEngine {
    store: KnowledgeStore,
    graph: Arc<KnowledgeGraph>,
    log: InteractionLog,
    profiles: ProfileStore,
    config: SharedConfig,
}

impl RecommendationEngine {
    pub fn new(
        store: KnowledgeStore,
        graph: Arc<KnowledgeGraph>,
        log: InteractionLog,
        profiles: ProfileStore,
        config: SharedConfig,
    ) -> Self {
        Self {
            store,
            graph,
            log,
            profiles,
            config,
        }
    }

    /// Top entries for an agent about to start a task.
    ///
    /// Candidates come from ranked search on the task type plus the graph
    /// neighborhood of entries the agent used successfully; entries the agent
    /// already consumed are excluded.
    pub async fn recommend(
        &self,
        agent_id: &str,
        task_type: &str,
        limit: usize,
    ) -> Result<Vec<Recommendation>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let config = self.config.load();

        let (consumed, successful) = self.consumed_entries(agent_id).await?;

        // Graph proximity: best related_to score from any successful seed.
        let mut proximity: HashMap<String, f64> = HashMap::new();
        for seed in &successful {
            for node in self
                .graph
                .related_to(seed, config.max_graph_depth, limit * CANDIDATE_FACTOR)
            {
                let slot = proximity.entry(node.id).or_insert(0.0);
                if node.score > *slot {
                    *slot = node.score;
                }
            }
        }

        // Candidate pool: search hits plus graph neighbors.
        let mut candidates: HashMap<String, KnowledgeEntry> = HashMap::new();
        for hit in self
            .store
            .search(task_type, None, &[], limit * CANDIDATE_FACTOR)
            .await?
        {
            candidates.insert(hit.entry.id.clone(), hit.entry);
        }
        let neighbor_ids: Vec<String> = proximity
            .keys()
            .filter(|id| !candidates.contains_key(*id))
            .cloned()
            .collect();
        for entry in self.store.get_many(&neighbor_ids).await? {
            candidates.insert(entry.id.clone(), entry);
        }

        let now = Utc::now();
        let decay = config.confidence_decay_per_day;
        let mut recommendations: Vec<Recommendation> = candidates
            .into_values()
            .filter(|entry| !consumed.contains(&entry.id))
            .map(|entry| {
                let mut entry_text = entry.content.clone();
                for tag in &entry.tags {
                    entry_text.push(' ');
                    entry_text.push_str(tag);
                }
                let relevance = text::keyword_overlap(task_type, &entry_text);
                let nearness = proximity.get(&entry.id).copied().unwrap_or(0.0);
                let confidence = entry.decayed_confidence(decay, now);

                let score = 2.0 * relevance + 1.5 * nearness + confidence;
                let reason = if relevance >= nearness && relevance > 0.0 {
                    format!("matches '{task_type}'")
                } else if nearness > 0.0 {
                    "related to knowledge you applied successfully".to_owned()
                } else {
                    format!("high-confidence entry ({confidence:.2})")
                };
                Recommendation {
                    entry,
                    score,
                    reason,
                }
            })
            .collect();

        recommendations.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.entry.id.cmp(&b.entry.id))
        });
        recommendations.truncate(limit);
        Ok(recommendations)
    }

    /// Other agents ranked by how well their skills cover the requester's
    /// gaps, boosted by recent successful history between the pair.
    pub async fn recommend_collaborators(
        &self,
        agent_id: &str,
        task_type: &str,
        limit: usize,
    ) -> Result<Vec<CollaboratorRecommendation>> {
        let config = self.config.load();
        let threshold = config.competence_threshold;

        let requester = self.profiles.ensure(agent_id).await?;
        let mut gaps: Vec<(String, f64)> = requester.gaps(threshold);
        // The task at hand counts as a gap until proven otherwise.
        let task_skill = requester
            .skill_vector
            .get(task_type)
            .copied()
            .unwrap_or(0.0);
        if task_skill < threshold && !gaps.iter().any(|(key, _)| key == task_type) {
            gaps.push((task_type.to_owned(), task_skill));
        }

        let history_start = Utc::now() - Duration::days(config.pattern_window_days);
        let mut ranked = Vec::new();
        for candidate in self.profiles.all().await? {
            if candidate.agent_id == agent_id {
                continue;
            }
            let mut coverage = 0.0;
            let mut covered: Vec<&str> = Vec::new();
            for (gap_key, gap_score) in &gaps {
                if gap_key == FEEDBACK_SKILL {
                    continue;
                }
                let Some(their_skill) = candidate.skill_vector.get(gap_key) else {
                    continue;
                };
                if *their_skill >= threshold {
                    coverage += their_skill - gap_score;
                    covered.push(gap_key);
                }
            }
            if coverage == 0.0 {
                continue;
            }

            let shared_successes = self
                .log
                .successes_between(agent_id, &candidate.agent_id, history_start)
                .await?;
            let history = (1.0 + shared_successes as f64).ln();
            let score = coverage + 0.25 * history;

            let reason = if shared_successes > 0 {
                format!(
                    "strong at {} and {shared_successes} recent successes together",
                    covered.join(", "),
                )
            } else {
                format!("strong at {}", covered.join(", "))
            };
            ranked.push(CollaboratorRecommendation {
                agent_id: candidate.agent_id,
                score,
                reason,
            });
        }

        ranked.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.agent_id.cmp(&b.agent_id))
        });
        ranked.truncate(limit);
        Ok(ranked)
    }

    /// Unconsumed entries in the agent's weakest categories, ordered by
    /// ascending graph centrality so foundational material comes first.
    pub async fn recommend_learning_path(
        &self,
        agent_id: &str,
        limit: usize,
    ) -> Result<Vec<LearningStep>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let config = self.config.load();
        let profile = self.profiles.ensure(agent_id).await?;
        let (consumed, _) = self.consumed_entries(agent_id).await?;

        // Weak categories: category-keyed skills below the threshold, plus
        // categories the agent has never touched at all.
        let mut weak: Vec<KnowledgeCategory> = KnowledgeCategory::ALL
            .iter()
            .copied()
            .filter(|category| {
                profile
                    .skill_vector
                    .get(category.as_str())
                    .map(|score| *score < config.competence_threshold)
                    .unwrap_or(true)
            })
            .collect();
        weak.sort_by(|a, b| {
            let score_a = profile.skill_vector.get(a.as_str()).copied().unwrap_or(0.0);
            let score_b = profile.skill_vector.get(b.as_str()).copied().unwrap_or(0.0);
            score_a
                .partial_cmp(&score_b)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.as_str().cmp(b.as_str()))
        });

        let mut path = Vec::new();
        for category in weak {
            let mut steps: Vec<LearningStep> = self
                .store
                .by_category(category, (limit * CANDIDATE_FACTOR) as i64)
                .await?
                .into_iter()
                .filter(|entry| !consumed.contains(&entry.id))
                .map(|entry| {
                    let centrality = self.graph.weighted_degree(&entry.id);
                    LearningStep {
                        entry,
                        category,
                        centrality,
                    }
                })
                .collect();
            steps.sort_by(|a, b| {
                a.centrality
                    .partial_cmp(&b.centrality)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.entry.id.cmp(&b.entry.id))
            });
            path.extend(steps);
            if path.len() >= limit {
                break;
            }
        }
        path.truncate(limit);
        Ok(path)
    }

    /// Entry ids the agent has interacted with, and the successful subset.
    async fn consumed_entries(&self, agent_id: &str) -> Result<(HashSet<String>, Vec<String>)> {
        let recent = self
            .log
            .recent_for_agent(agent_id, SEED_INTERACTION_LIMIT)
            .await?;
        let mut consumed = HashSet::new();
        let mut successful = Vec::new();
        for record in recent {
            let Some(entry_id) = record.payload.get("entry_id").and_then(|v| v.as_str()) else {
                continue;
            };
            consumed.insert(entry_id.to_owned());
            if record.outcome == InteractionOutcome::Success {
                successful.push(entry_id.to_owned());
            }
        }
        successful.sort();
        successful.dedup();
        Ok((consumed, successful))
    }
}

impl std::fmt::Debug for RecommendationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecommendationEngine").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{self, EngineConfig};
    use crate::types::RelationKind;
    use serde_json::json;

    struct Fixture {
        engine: RecommendationEngine,
        store: KnowledgeStore,
        graph: Arc<KnowledgeGraph>,
        log: InteractionLog,
        profiles: ProfileStore,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().expect("create temp dir");
        let pool = crate::store::connect(&dir.path().join("knowledge.db"))
            .await
            .expect("connect");
        let config = config::shared(EngineConfig::default());
        let store = KnowledgeStore::new(pool.clone(), config.clone());
        let graph = Arc::new(
            KnowledgeGraph::load(pool.clone(), config.clone())
                .await
                .expect("load"),
        );
        let log = InteractionLog::new(pool.clone());
        let profiles = ProfileStore::new(pool, config.clone());
        let engine = RecommendationEngine::new(
            store.clone(),
            graph.clone(),
            log.clone(),
            profiles.clone(),
            config,
        );
        Fixture {
            engine,
            store,
            graph,
            log,
            profiles,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn recommend_matches_task_and_excludes_consumed() {
        let fx = fixture().await;
        let relevant = fx
            .store
            .put(
                "debugging async deadlocks",
                KnowledgeCategory::Debugging,
                &["async".to_string()],
                "a9",
                0.9,
            )
            .await
            .expect("put");
        let consumed = fx
            .store
            .put(
                "debugging async timeouts",
                KnowledgeCategory::Debugging,
                &["async".to_string()],
                "a9",
                0.9,
            )
            .await
            .expect("put");
        fx.store
            .put(
                "kubernetes rollout checklist",
                KnowledgeCategory::Tooling,
                &[],
                "a9",
                0.9,
            )
            .await
            .expect("put");

        fx.log
            .record(
                "a1",
                None,
                "debugging async",
                json!({"entry_id": consumed.id}),
                InteractionOutcome::Success,
            )
            .await
            .expect("record");

        let recommendations = fx
            .engine
            .recommend("a1", "debugging async", 5)
            .await
            .expect("recommend");
        let ids: Vec<&str> = recommendations
            .iter()
            .map(|r| r.entry.id.as_str())
            .collect();
        assert!(ids.contains(&relevant.id.as_str()));
        assert!(!ids.contains(&consumed.id.as_str()));
        assert!(recommendations[0].reason.contains("debugging async"));
    }

    #[tokio::test]
    async fn recommend_pulls_in_graph_neighbors_of_successful_entries() {
        let fx = fixture().await;
        let used = fx
            .store
            .put("known trick", KnowledgeCategory::General, &[], "a9", 0.9)
            .await
            .expect("put");
        let neighbor = fx
            .store
            .put("adjacent trick", KnowledgeCategory::General, &[], "a9", 0.9)
            .await
            .expect("put");
        fx.graph
            .link(&used.id, &neighbor.id, RelationKind::CoRetrieved, 0.9)
            .await
            .expect("link");
        fx.log
            .record(
                "a1",
                None,
                "task",
                json!({"entry_id": used.id}),
                InteractionOutcome::Success,
            )
            .await
            .expect("record");

        // Query that lexically matches nothing still surfaces the neighbor.
        let recommendations = fx
            .engine
            .recommend("a1", "zzz unrelated query", 5)
            .await
            .expect("recommend");
        assert_eq!(recommendations.len(), 1);
        assert_eq!(recommendations[0].entry.id, neighbor.id);
        assert!(recommendations[0].reason.contains("applied successfully"));
    }

    #[tokio::test]
    async fn collaborators_cover_the_requesters_gaps() {
        let fx = fixture().await;
        // a1 fails at deploys; a2 succeeds at them; a3 is good at something else.
        for _ in 0..3 {
            fx.log
                .record("a1", None, "deploy", json!({}), InteractionOutcome::Failure)
                .await
                .expect("record");
        }
        let records = fx
            .log
            .in_window(Utc::now() - Duration::days(1), Utc::now() + Duration::seconds(1))
            .await
            .expect("window");
        for record in &records {
            fx.profiles
                .apply_interaction(record, None)
                .await
                .expect("apply");
        }
        for agent in ["a2", "a3"] {
            let kind = if agent == "a2" { "deploy" } else { "code_review" };
            for _ in 0..3 {
                let record = fx
                    .log
                    .record(agent, None, kind, json!({}), InteractionOutcome::Success)
                    .await
                    .expect("record");
                fx.profiles
                    .apply_interaction(&record, None)
                    .await
                    .expect("apply");
            }
        }

        let collaborators = fx
            .engine
            .recommend_collaborators("a1", "deploy", 5)
            .await
            .expect("recommend");
        assert_eq!(collaborators.len(), 1);
        assert_eq!(collaborators[0].agent_id, "a2");
        assert!(collaborators[0].reason.contains("deploy"));
    }

    #[tokio::test]
    async fn collaborators_prefer_proven_pairs() {
        let fx = fixture().await;
        for _ in 0..3 {
            let record = fx
                .log
                .record("a1", None, "deploy", json!({}), InteractionOutcome::Failure)
                .await
                .expect("record");
            fx.profiles
                .apply_interaction(&record, None)
                .await
                .expect("apply");
        }
        // a2 and a3 look identical on skills...
        for agent in ["a2", "a3"] {
            for _ in 0..3 {
                let record = fx
                    .log
                    .record(agent, None, "deploy", json!({}), InteractionOutcome::Success)
                    .await
                    .expect("record");
                fx.profiles
                    .apply_interaction(&record, None)
                    .await
                    .expect("apply");
            }
        }
        // ...but a3 has worked with a1 before.
        fx.log
            .record("a1", Some("a3"), "pairing", json!({}), InteractionOutcome::Success)
            .await
            .expect("record");

        let collaborators = fx
            .engine
            .recommend_collaborators("a1", "deploy", 5)
            .await
            .expect("recommend");
        assert_eq!(collaborators[0].agent_id, "a3");
    }

    #[tokio::test]
    async fn learning_path_orders_fundamentals_first() {
        let fx = fixture().await;
        let fundamental = fx
            .store
            .put("tooling basics", KnowledgeCategory::Tooling, &[], "a9", 0.9)
            .await
            .expect("put");
        let advanced = fx
            .store
            .put("tooling internals", KnowledgeCategory::Tooling, &[], "a9", 0.9)
            .await
            .expect("put");
        let other = fx
            .store
            .put("spare node", KnowledgeCategory::General, &[], "a9", 0.9)
            .await
            .expect("put");
        // The advanced entry is highly connected; the fundamental one is not.
        fx.graph
            .link(&advanced.id, &other.id, RelationKind::Explicit, 2.0)
            .await
            .expect("link");

        // An agent strong everywhere except tooling.
        for category in KnowledgeCategory::ALL {
            if *category == KnowledgeCategory::Tooling {
                continue;
            }
            for _ in 0..5 {
                let record = fx
                    .log
                    .record("a1", None, "work", json!({}), InteractionOutcome::Success)
                    .await
                    .expect("record");
                fx.profiles
                    .apply_interaction(&record, Some(*category))
                    .await
                    .expect("apply");
            }
        }

        let path = fx
            .engine
            .recommend_learning_path("a1", 2)
            .await
            .expect("path");
        assert_eq!(path.len(), 2);
        assert_eq!(path[0].category, KnowledgeCategory::Tooling);
        assert_eq!(path[0].entry.id, fundamental.id);
        assert_eq!(path[1].entry.id, advanced.id);
        assert!(path[0].centrality < path[1].centrality);
    }
}
