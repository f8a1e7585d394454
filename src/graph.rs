//! KnowledgeGraph: relationship index over knowledge entry ids.
//!
//! Edges live in an in-memory adjacency map guarded by a read-write lock,
//! with write-through persistence to the `knowledge_edges` table. Weight
//! updates are idempotent-additive in both places (`weight = weight + delta`
//! upserts), so concurrent increments never lose updates. All traversals work
//! on the in-memory map, track visited sets for cycle safety, and honor the
//! configured depth cap.

use crate::config::SharedConfig;
use crate::error::{EngineError, Result};
use crate::types::RelationKind;

use chrono::Utc;
use parking_lot::RwLock;
use sqlx::SqlitePool;

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};

/// Aggregated edge between two entries (all relation kinds combined).
#[derive(Debug, Clone, Copy)]
struct EdgeInfo {
    weight: f64,
    kind: RelationKind,
}

/// A node reached by `related_to`, scored by the best discovered path.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RelatedNode {
    pub id: String,
    /// Product of edge weights along the best path from the origin.
    pub score: f64,
    /// Hops from the origin along that path.
    pub depth: u32,
}

/// A node ranked by weighted degree.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CentralNode {
    pub id: String,
    pub weighted_degree: f64,
}

/// Relationship index over entry ids.
pub struct KnowledgeGraph {
    pool: SqlitePool,
    config: SharedConfig,
    /// node id -> neighbor id -> aggregated edge.
    adjacency: RwLock<HashMap<String, HashMap<String, EdgeInfo>>>,
}

impl KnowledgeGraph {
    /// Load all persisted edges into the adjacency map.
    pub async fn load(pool: SqlitePool, config: SharedConfig) -> Result<Self> {
        let rows: Vec<(String, String, String, f64)> =
            sqlx::query_as("SELECT from_id, to_id, kind, weight FROM knowledge_edges")
                .fetch_all(&pool)
                .await?;

        let mut adjacency: HashMap<String, HashMap<String, EdgeInfo>> = HashMap::new();
        for (from_id, to_id, kind, weight) in rows {
            let kind = RelationKind::from_str_lossy(&kind);
            insert_undirected(&mut adjacency, &from_id, &to_id, weight, kind);
        }

        Ok(Self {
            pool,
            config,
            adjacency: RwLock::new(adjacency),
        })
    }

    /// Create or strengthen the edge between two entries. Returns the new
    /// aggregated weight for the pair.
    ///
    /// Self-loops and negative deltas are rejected before any write.
    pub async fn link(
        &self,
        from_id: &str,
        to_id: &str,
        kind: RelationKind,
        weight_delta: f64,
    ) -> Result<f64> {
        if from_id == to_id {
            return Err(EngineError::validation("self-loop edges are not allowed"));
        }
        if weight_delta < 0.0 {
            return Err(EngineError::validation("edge weight delta must be >= 0"));
        }

        // Canonical row ordering keeps the undirected edge on a single row.
        let (a, b) = if from_id < to_id {
            (from_id, to_id)
        } else {
            (to_id, from_id)
        };

        sqlx::query(
            "INSERT INTO knowledge_edges (from_id, to_id, kind, weight, updated_at) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(from_id, to_id, kind) \
             DO UPDATE SET weight = weight + excluded.weight, updated_at = excluded.updated_at",
        )
        .bind(a)
        .bind(b)
        .bind(kind.as_str())
        .bind(weight_delta)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        let mut adjacency = self.adjacency.write();
        insert_undirected(&mut adjacency, from_id, to_id, weight_delta, kind);
        Ok(adjacency
            .get(from_id)
            .and_then(|neighbors| neighbors.get(to_id))
            .map(|edge| edge.weight)
            .unwrap_or(weight_delta))
    }

    /// Strengthen co-retrieval edges between every pair in one search result
    /// set (bounded to the first few hits to keep the pairwise work small).
    pub async fn link_co_retrieved(&self, entry_ids: &[String]) -> Result<()> {
        let config = self.config.load();
        let ids: Vec<&String> = entry_ids
            .iter()
            .take(config.co_retrieval_max_results)
            .collect();
        for (index, from_id) in ids.iter().enumerate() {
            for to_id in ids.iter().skip(index + 1) {
                self.link(
                    from_id,
                    to_id,
                    RelationKind::CoRetrieved,
                    config.co_retrieval_weight,
                )
                .await?;
            }
        }
        Ok(())
    }

    /// Bounded breadth-first traversal up to `max_depth`, scoring each reached
    /// node by the product of edge weights along the best path discovered.
    /// Never returns the origin itself; `max_depth = 0` returns the empty
    /// list. Ties break by shortest path, then smallest id.
    pub fn related_to(&self, id: &str, max_depth: u32, limit: usize) -> Vec<RelatedNode> {
        let max_depth = max_depth.min(self.config.load().max_graph_depth);
        if max_depth == 0 || limit == 0 {
            return Vec::new();
        }

        let adjacency = self.adjacency.read();
        // Best (score, depth) discovered per node so far.
        let mut best: HashMap<String, (f64, u32)> = HashMap::new();
        best.insert(id.to_owned(), (1.0, 0));
        let mut frontier: Vec<String> = vec![id.to_owned()];

        for depth in 1..=max_depth {
            let mut next_frontier: Vec<String> = Vec::new();
            frontier.sort();
            frontier.dedup();
            for node in &frontier {
                let (node_score, _) = best[node];
                let Some(neighbors) = adjacency.get(node) else {
                    continue;
                };
                let mut ordered: Vec<(&String, &EdgeInfo)> = neighbors.iter().collect();
                ordered.sort_by(|a, b| a.0.cmp(b.0));
                for (neighbor, edge) in ordered {
                    if neighbor == id {
                        continue;
                    }
                    let candidate = node_score * edge.weight;
                    let improved = match best.get(neighbor) {
                        None => true,
                        Some((score, existing_depth)) => {
                            candidate > *score
                                || (candidate == *score && depth < *existing_depth)
                        }
                    };
                    if improved {
                        best.insert(neighbor.clone(), (candidate, depth));
                        next_frontier.push(neighbor.clone());
                    }
                }
            }
            if next_frontier.is_empty() {
                break;
            }
            frontier = next_frontier;
        }

        let mut related: Vec<RelatedNode> = best
            .into_iter()
            .filter(|(node, _)| node != id)
            .map(|(node, (score, depth))| RelatedNode {
                id: node,
                score,
                depth,
            })
            .collect();
        related.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.depth.cmp(&b.depth))
                .then_with(|| a.id.cmp(&b.id))
        });
        related.truncate(limit);
        related
    }

    /// Weighted shortest path between two entries, stronger edges being
    /// cheaper to traverse. Bounded by the configured depth cap; returns
    /// `None` rather than erroring when no path exists within the cap.
    /// `find_path(a, a)` is the zero-length path `[a]`.
    pub fn find_path(&self, from_id: &str, to_id: &str) -> Option<Vec<String>> {
        if from_id == to_id {
            return Some(vec![from_id.to_owned()]);
        }
        let max_hops = self.config.load().max_graph_depth;
        let adjacency = self.adjacency.read();

        let mut heap: BinaryHeap<Visit> = BinaryHeap::new();
        let mut best_cost: HashMap<String, f64> = HashMap::new();
        let mut previous: HashMap<String, String> = HashMap::new();

        heap.push(Visit {
            cost: 0.0,
            hops: 0,
            id: from_id.to_owned(),
        });
        best_cost.insert(from_id.to_owned(), 0.0);

        while let Some(visit) = heap.pop() {
            if visit.id == to_id {
                return Some(reconstruct_path(&previous, from_id, to_id));
            }
            if visit.hops >= max_hops {
                continue;
            }
            if visit.cost > *best_cost.get(&visit.id).unwrap_or(&f64::INFINITY) {
                continue; // stale heap entry
            }
            let Some(neighbors) = adjacency.get(&visit.id) else {
                continue;
            };
            for (neighbor, edge) in neighbors {
                if edge.weight <= 0.0 {
                    continue;
                }
                let cost = visit.cost + 1.0 / edge.weight;
                if cost < *best_cost.get(neighbor).unwrap_or(&f64::INFINITY) {
                    best_cost.insert(neighbor.clone(), cost);
                    previous.insert(neighbor.clone(), visit.id.clone());
                    heap.push(Visit {
                        cost,
                        hops: visit.hops + 1,
                        id: neighbor.clone(),
                    });
                }
            }
        }

        None
    }

    /// Connected components over edges whose weight exceeds the configured
    /// threshold, discarding components smaller than `min_size`. Components
    /// are sorted largest first; ids inside a component are sorted.
    pub fn clusters(&self, min_size: usize) -> Vec<Vec<String>> {
        let threshold = self.config.load().cluster_weight_threshold;
        let adjacency = self.adjacency.read();

        let mut visited: HashSet<&String> = HashSet::new();
        let mut components: Vec<Vec<String>> = Vec::new();

        let mut nodes: Vec<&String> = adjacency.keys().collect();
        nodes.sort();

        for start in nodes {
            if visited.contains(start) {
                continue;
            }
            let mut component: Vec<String> = Vec::new();
            let mut stack: Vec<&String> = vec![start];
            visited.insert(start);
            while let Some(node) = stack.pop() {
                component.push(node.clone());
                let Some(neighbors) = adjacency.get(node) else {
                    continue;
                };
                for (neighbor, edge) in neighbors {
                    if edge.weight > threshold && !visited.contains(neighbor) {
                        visited.insert(neighbor);
                        stack.push(neighbor);
                    }
                }
            }
            if component.len() >= min_size {
                component.sort();
                components.push(component);
            }
        }

        components.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a[0].cmp(&b[0])));
        components
    }

    /// Nodes ranked by weighted degree (sum of incident edge weights),
    /// deterministic tie-break by id.
    pub fn central_nodes(&self, limit: usize) -> Vec<CentralNode> {
        let adjacency = self.adjacency.read();
        let mut ranked: Vec<CentralNode> = adjacency
            .iter()
            .map(|(node, neighbors)| CentralNode {
                id: node.clone(),
                weighted_degree: neighbors.values().map(|edge| edge.weight).sum(),
            })
            .collect();
        ranked.sort_by(|a, b| {
            b.weighted_degree
                .partial_cmp(&a.weighted_degree)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        ranked.truncate(limit);
        ranked
    }

    /// Sum of incident edge weights for one node.
    pub fn weighted_degree(&self, id: &str) -> f64 {
        self.adjacency
            .read()
            .get(id)
            .map(|neighbors| neighbors.values().map(|edge| edge.weight).sum())
            .unwrap_or(0.0)
    }

    /// Garbage-collect all edges touching the given (purged) entries.
    pub async fn remove_entries(&self, entry_ids: &[String]) -> Result<()> {
        for id in entry_ids {
            sqlx::query("DELETE FROM knowledge_edges WHERE from_id = ? OR to_id = ?")
                .bind(id)
                .bind(id)
                .execute(&self.pool)
                .await?;
        }

        let mut adjacency = self.adjacency.write();
        for id in entry_ids {
            adjacency.remove(id);
        }
        for neighbors in adjacency.values_mut() {
            for id in entry_ids {
                neighbors.remove(id);
            }
        }
        adjacency.retain(|_, neighbors| !neighbors.is_empty());
        Ok(())
    }

    /// Number of distinct undirected edges.
    pub fn edge_count(&self) -> usize {
        let adjacency = self.adjacency.read();
        adjacency
            .values()
            .map(|neighbors| neighbors.len())
            .sum::<usize>()
            / 2
    }

    /// Aggregated weight between two entries, if linked.
    pub fn edge_weight(&self, from_id: &str, to_id: &str) -> Option<f64> {
        self.adjacency
            .read()
            .get(from_id)
            .and_then(|neighbors| neighbors.get(to_id))
            .map(|edge| edge.weight)
    }
}

impl std::fmt::Debug for KnowledgeGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KnowledgeGraph")
            .field("nodes", &self.adjacency.read().len())
            .finish_non_exhaustive()
    }
}

fn insert_undirected(
    adjacency: &mut HashMap<String, HashMap<String, EdgeInfo>>,
    from_id: &str,
    to_id: &str,
    weight_delta: f64,
    kind: RelationKind,
) {
    for (a, b) in [(from_id, to_id), (to_id, from_id)] {
        let edge = adjacency
            .entry(a.to_owned())
            .or_default()
            .entry(b.to_owned())
            .or_insert(EdgeInfo { weight: 0.0, kind });
        edge.weight = (edge.weight + weight_delta).max(0.0);
        edge.kind = kind;
    }
}

fn reconstruct_path(
    previous: &HashMap<String, String>,
    from_id: &str,
    to_id: &str,
) -> Vec<String> {
    let mut path = vec![to_id.to_owned()];
    let mut cursor = to_id;
    while cursor != from_id {
        let Some(parent) = previous.get(cursor) else {
            break;
        };
        path.push(parent.clone());
        cursor = parent;
    }
    path.reverse();
    path
}

/// Dijkstra heap entry, ordered so the cheapest visit pops first.
struct Visit {
    cost: f64,
    hops: u32,
    id: String,
}

impl Ord for Visit {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .cost
            .partial_cmp(&self.cost)
            .unwrap_or(Ordering::Equal)
            .then_with(|| other.hops.cmp(&self.hops))
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for Visit {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Visit {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Visit {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{self, EngineConfig};

    async fn temp_graph() -> (KnowledgeGraph, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("create temp dir");
        let pool = crate::store::connect(&dir.path().join("knowledge.db"))
            .await
            .expect("connect");
        let graph = KnowledgeGraph::load(pool, config::shared(EngineConfig::default()))
            .await
            .expect("load");
        (graph, dir)
    }

    #[tokio::test]
    async fn link_is_additive_and_rejects_self_loops() {
        let (graph, _dir) = temp_graph().await;
        let weight = graph
            .link("a", "b", RelationKind::Explicit, 0.5)
            .await
            .expect("link");
        assert_eq!(weight, 0.5);
        let weight = graph
            .link("b", "a", RelationKind::Explicit, 0.25)
            .await
            .expect("link");
        assert!((weight - 0.75).abs() < 1e-9);

        assert!(matches!(
            graph.link("a", "a", RelationKind::Explicit, 1.0).await,
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            graph.link("a", "b", RelationKind::Explicit, -1.0).await,
            Err(EngineError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn edges_survive_a_reload() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let path = dir.path().join("knowledge.db");
        let config = config::shared(EngineConfig::default());

        let pool = crate::store::connect(&path).await.expect("connect");
        let graph = KnowledgeGraph::load(pool.clone(), config.clone())
            .await
            .expect("load");
        graph
            .link("a", "b", RelationKind::Explicit, 2.0)
            .await
            .expect("link");

        let reloaded = KnowledgeGraph::load(pool, config).await.expect("reload");
        assert_eq!(reloaded.edge_weight("a", "b"), Some(2.0));
    }

    #[tokio::test]
    async fn related_to_is_depth_bounded_and_excludes_origin() {
        let (graph, _dir) = temp_graph().await;
        // a - b - c - d chain.
        graph.link("a", "b", RelationKind::Explicit, 1.0).await.expect("link");
        graph.link("b", "c", RelationKind::Explicit, 1.0).await.expect("link");
        graph.link("c", "d", RelationKind::Explicit, 1.0).await.expect("link");

        assert!(graph.related_to("a", 0, 10).is_empty());

        let depth_one: Vec<String> = graph
            .related_to("a", 1, 10)
            .into_iter()
            .map(|node| node.id)
            .collect();
        assert_eq!(depth_one, vec!["b"]);

        let depth_three: Vec<String> = graph
            .related_to("a", 3, 10)
            .into_iter()
            .map(|node| node.id)
            .collect();
        // Deeper traversal only adds nodes.
        assert!(depth_one.iter().all(|id| depth_three.contains(id)));
        assert_eq!(depth_three.len(), 3);
        assert!(!depth_three.contains(&"a".to_string()));
    }

    #[tokio::test]
    async fn related_to_scores_by_path_weight_product() {
        let (graph, _dir) = temp_graph().await;
        graph.link("a", "b", RelationKind::Explicit, 0.9).await.expect("link");
        graph.link("a", "c", RelationKind::Explicit, 0.2).await.expect("link");
        graph.link("b", "d", RelationKind::Explicit, 0.9).await.expect("link");

        let related = graph.related_to("a", 2, 10);
        assert_eq!(related[0].id, "b");
        assert!((related[0].score - 0.9).abs() < 1e-9);
        // d via b: 0.9 * 0.9 = 0.81 beats c's direct 0.2.
        assert_eq!(related[1].id, "d");
        assert_eq!(related[1].depth, 2);
        assert_eq!(related[2].id, "c");
    }

    #[tokio::test]
    async fn related_to_is_cycle_safe() {
        let (graph, _dir) = temp_graph().await;
        graph.link("a", "b", RelationKind::Explicit, 1.0).await.expect("link");
        graph.link("b", "c", RelationKind::Explicit, 1.0).await.expect("link");
        graph.link("c", "a", RelationKind::Explicit, 1.0).await.expect("link");

        let related = graph.related_to("a", 6, 10);
        assert_eq!(related.len(), 2);
    }

    #[tokio::test]
    async fn find_path_handles_identity_and_unreachable() {
        let (graph, _dir) = temp_graph().await;
        graph.link("a", "b", RelationKind::Explicit, 1.0).await.expect("link");
        graph.link("b", "c", RelationKind::Explicit, 1.0).await.expect("link");
        graph.link("x", "y", RelationKind::Explicit, 1.0).await.expect("link");

        assert_eq!(graph.find_path("a", "a"), Some(vec!["a".to_string()]));
        assert_eq!(
            graph.find_path("a", "c"),
            Some(vec!["a".to_string(), "b".to_string(), "c".to_string()])
        );
        assert_eq!(graph.find_path("a", "x"), None);
        assert_eq!(graph.find_path("a", "ghost"), None);
    }

    #[tokio::test]
    async fn find_path_prefers_stronger_edges() {
        let (graph, _dir) = temp_graph().await;
        // Weak direct edge vs strong two-hop route.
        graph.link("a", "c", RelationKind::Explicit, 0.1).await.expect("link");
        graph.link("a", "b", RelationKind::Explicit, 5.0).await.expect("link");
        graph.link("b", "c", RelationKind::Explicit, 5.0).await.expect("link");

        // direct cost 10.0 > via-b cost 0.4
        assert_eq!(
            graph.find_path("a", "c"),
            Some(vec!["a".to_string(), "b".to_string(), "c".to_string()])
        );
    }

    #[tokio::test]
    async fn clusters_respect_threshold_and_min_size() {
        let (graph, _dir) = temp_graph().await;
        // Strong triangle.
        graph.link("a", "b", RelationKind::Explicit, 1.0).await.expect("link");
        graph.link("b", "c", RelationKind::Explicit, 1.0).await.expect("link");
        // Weak pair, below the 0.5 default threshold.
        graph.link("x", "y", RelationKind::Explicit, 0.1).await.expect("link");

        let clusters = graph.clusters(2);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0], vec!["a", "b", "c"]);

        // min_size = 1 admits the weak pair's singleton components.
        let clusters = graph.clusters(1);
        assert_eq!(clusters.len(), 3);
    }

    #[tokio::test]
    async fn central_nodes_rank_by_weighted_degree() {
        let (graph, _dir) = temp_graph().await;
        graph.link("hub", "a", RelationKind::Explicit, 1.0).await.expect("link");
        graph.link("hub", "b", RelationKind::Explicit, 1.0).await.expect("link");
        graph.link("a", "b", RelationKind::Explicit, 0.5).await.expect("link");

        let central = graph.central_nodes(3);
        assert_eq!(central[0].id, "hub");
        assert_eq!(central[0].weighted_degree, 2.0);
        // a and b tie at 1.5; id breaks the tie.
        assert_eq!(central[1].id, "a");
        assert_eq!(central[2].id, "b");
    }

    #[tokio::test]
    async fn removing_entries_collects_their_edges() {
        let (graph, _dir) = temp_graph().await;
        graph.link("a", "b", RelationKind::Explicit, 1.0).await.expect("link");
        graph.link("b", "c", RelationKind::Explicit, 1.0).await.expect("link");

        graph.remove_entries(&["b".to_string()]).await.expect("remove");
        assert_eq!(graph.edge_count(), 0);
        assert!(graph.related_to("a", 3, 10).is_empty());
        assert_eq!(graph.edge_weight("a", "b"), None);
    }
}
