//! Engine configuration.
//!
//! All thresholds, intervals, and caps live here as explicit fields rather
//! than hard-coded constants. The engine holds the config behind an
//! [`arc_swap::ArcSwap`] so an external configuration collaborator can swap a
//! new snapshot in at any time without a restart; every unit of work loads a
//! fresh snapshot when it starts.

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

use std::sync::Arc;

/// Shared, hot-reloadable handle to the engine configuration.
pub type SharedConfig = Arc<ArcSwap<EngineConfig>>;

/// Wrap a config in a hot-reloadable handle.
pub fn shared(config: EngineConfig) -> SharedConfig {
    Arc::new(ArcSwap::from_pointee(config))
}

/// Tunables for the knowledge engine. All fields have defaults sized for a
/// small fleet of agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct EngineConfig {
    // --- periodic task intervals ---
    /// Seconds between ingestion sweeps (usage flush, retention, profiles).
    pub ingestion_interval_secs: u64,
    /// Seconds between pattern detection runs.
    pub pattern_interval_secs: u64,
    /// Seconds between insight generation runs.
    pub insight_interval_secs: u64,

    // --- pattern detection ---
    /// Width of the detection window in days.
    pub pattern_window_days: i64,
    /// Minimum occurrences of a group within the window before it is
    /// reported as a pattern.
    pub min_pattern_support: i64,
    /// Patterns below this confidence are discarded, never stored.
    pub min_pattern_confidence: f64,
    /// Minimum number of distinct entries sharing a tag combination.
    pub min_tag_co_occurrence: i64,

    // --- insight generation ---
    /// Success rate below which a risk insight fires.
    pub min_success_rate: f64,
    /// Category growth ratio (this window / previous) above which a trend
    /// insight fires.
    pub trend_growth_ratio: f64,
    /// Confidence drop (previous - current) above which an anomaly fires.
    pub anomaly_confidence_drop: f64,
    /// Minimum pattern confidence for an opportunity insight.
    pub opportunity_min_confidence: f64,
    /// Maximum average evidence usage count for an opportunity insight.
    pub opportunity_max_usage: f64,
    /// Token-set similarity above which two feedback details are "similar".
    pub feedback_similarity_threshold: f64,
    /// Distinct agents with similar feedback before an optimization fires.
    pub optimization_min_agents: usize,

    // --- knowledge store ---
    /// Multiplicative confidence decay per elapsed day, applied at read time.
    pub confidence_decay_per_day: f64,
    /// Days interaction records are retained before the sweep removes them.
    pub retention_days: i64,
    /// Days a tombstoned entry is kept before physical removal.
    pub tombstone_retention_days: i64,
    /// Pending usage-count increments that trigger an opportunistic flush.
    pub usage_flush_threshold: usize,
    /// Rows scanned per search before in-memory ranking.
    pub search_scan_limit: i64,
    /// CAS retries before an update surfaces `Conflict`.
    pub update_retry_limit: u32,

    // --- graph ---
    /// Hard depth cap for all traversals.
    pub max_graph_depth: u32,
    /// Edges at or below this weight are ignored by clustering.
    pub cluster_weight_threshold: f64,
    /// Weight added to an edge each time two entries are co-retrieved.
    pub co_retrieval_weight: f64,
    /// Weight added when two entries share a tag at write time.
    pub shared_tag_weight: f64,
    /// Top search hits considered for pairwise co-retrieval linking.
    pub co_retrieval_max_results: usize,

    // --- knowledge flow ---
    /// Maximum concurrent active subscriptions per agent; the oldest is
    /// evicted when a new registration exceeds the cap.
    pub subscription_cap: i64,
    /// Delivery attempts before an item is dead-lettered.
    pub max_delivery_attempts: u32,
    /// Per-attempt delivery timeout in milliseconds.
    pub delivery_timeout_ms: u64,
    /// Base backoff between delivery attempts in milliseconds (doubles per
    /// attempt).
    pub delivery_backoff_ms: u64,
    /// Upper bound on concurrent outbound deliveries.
    pub delivery_workers: usize,
    /// Seconds before an urgent one-shot knowledge request expires.
    pub request_ttl_secs: i64,

    // --- profiles & recommendations ---
    /// Skill scores below this are treated as gaps.
    pub competence_threshold: f64,
    /// EMA step for incremental skill vector updates.
    pub skill_ema_alpha: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ingestion_interval_secs: 30,
            pattern_interval_secs: 300,
            insight_interval_secs: 600,
            pattern_window_days: 7,
            min_pattern_support: 5,
            min_pattern_confidence: 0.3,
            min_tag_co_occurrence: 3,
            min_success_rate: 0.5,
            trend_growth_ratio: 1.5,
            anomaly_confidence_drop: 0.2,
            opportunity_min_confidence: 0.7,
            opportunity_max_usage: 3.0,
            feedback_similarity_threshold: 0.6,
            optimization_min_agents: 3,
            confidence_decay_per_day: 0.99,
            retention_days: 30,
            tombstone_retention_days: 7,
            usage_flush_threshold: 64,
            search_scan_limit: 500,
            update_retry_limit: 3,
            max_graph_depth: 6,
            cluster_weight_threshold: 0.5,
            co_retrieval_weight: 0.1,
            shared_tag_weight: 0.2,
            co_retrieval_max_results: 8,
            subscription_cap: 10,
            max_delivery_attempts: 3,
            delivery_timeout_ms: 10_000,
            delivery_backoff_ms: 250,
            delivery_workers: 8,
            request_ttl_secs: 300,
            competence_threshold: 0.6,
            skill_ema_alpha: 0.2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_serde() {
        let config = EngineConfig::default();
        let json = serde_json::to_string(&config).expect("serialize");
        let parsed: EngineConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed.min_pattern_support, config.min_pattern_support);
        assert_eq!(parsed.subscription_cap, config.subscription_cap);
    }

    #[test]
    fn partial_config_fills_in_defaults() {
        let parsed: EngineConfig =
            serde_json::from_str(r#"{"min_pattern_support": 2}"#).expect("deserialize");
        assert_eq!(parsed.min_pattern_support, 2);
        assert_eq!(
            parsed.max_delivery_attempts,
            EngineConfig::default().max_delivery_attempts
        );
    }

    #[test]
    fn shared_handle_hot_swaps() {
        let handle = shared(EngineConfig::default());
        assert_eq!(handle.load().min_pattern_support, 5);
        let mut updated = EngineConfig::default();
        updated.min_pattern_support = 2;
        handle.store(Arc::new(updated));
        assert_eq!(handle.load().min_pattern_support, 2);
    }
}
