//! Data model for the knowledge engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use std::collections::HashMap;

// ---------------------------------------------------------------------------
// Knowledge entries
// ---------------------------------------------------------------------------

/// Fixed category taxonomy for knowledge entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KnowledgeCategory {
    CodePatterns,
    BestPractices,
    Architecture,
    Debugging,
    Tooling,
    Collaboration,
    General,
}

impl KnowledgeCategory {
    pub const ALL: &'static [KnowledgeCategory] = &[
        Self::CodePatterns,
        Self::BestPractices,
        Self::Architecture,
        Self::Debugging,
        Self::Tooling,
        Self::Collaboration,
        Self::General,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CodePatterns => "code_patterns",
            Self::BestPractices => "best_practices",
            Self::Architecture => "architecture",
            Self::Debugging => "debugging",
            Self::Tooling => "tooling",
            Self::Collaboration => "collaboration",
            Self::General => "general",
        }
    }

    /// Parse from a string, defaulting to General.
    pub fn from_str_lossy(value: &str) -> Self {
        match value {
            "code_patterns" => Self::CodePatterns,
            "best_practices" => Self::BestPractices,
            "architecture" => Self::Architecture,
            "debugging" => Self::Debugging,
            "tooling" => Self::Tooling,
            "collaboration" => Self::Collaboration,
            _ => Self::General,
        }
    }
}

impl std::fmt::Display for KnowledgeCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of reusable knowledge stored by the engine.
///
/// `id`, `source_agent`, `created_at` are immutable after creation. The
/// `confidence` column stores the value as last written; the effective value
/// decays with age and is computed at read time via [`decayed_confidence`].
///
/// [`decayed_confidence`]: KnowledgeEntry::decayed_confidence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    pub id: String,
    pub content: String,
    pub category: KnowledgeCategory,
    /// Normalized: lowercase, deduplicated, sorted.
    pub tags: Vec<String>,
    pub source_agent: String,
    /// Confidence as last written (0.0 - 1.0). Decays with age.
    pub confidence: f64,
    pub usage_count: i64,
    /// Optimistic-concurrency stamp; bumped on every update.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Soft-delete marker. Tombstoned entries are invisible to reads and
    /// physically removed after the retention window.
    pub tombstoned_at: Option<DateTime<Utc>>,
}

impl KnowledgeEntry {
    /// Effective confidence at `now`: multiplicative decay per elapsed day
    /// since the entry was last reinforced (written).
    pub fn decayed_confidence(&self, decay_per_day: f64, now: DateTime<Utc>) -> f64 {
        let elapsed_days = (now - self.updated_at).num_seconds().max(0) as f64 / 86_400.0;
        (self.confidence * decay_per_day.powf(elapsed_days)).clamp(0.0, 1.0)
    }
}

/// Partial update applied through the store's CAS update operation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntryPatch {
    pub content: Option<String>,
    pub category: Option<KnowledgeCategory>,
    pub tags: Option<Vec<String>>,
    /// Writing confidence reinforces the entry and restarts decay.
    pub confidence: Option<f64>,
}

impl EntryPatch {
    pub fn is_empty(&self) -> bool {
        self.content.is_none()
            && self.category.is_none()
            && self.tags.is_none()
            && self.confidence.is_none()
    }
}

/// Lowercase, trim, drop empties, dedup, sort. Keeps tag matching and
/// pattern grouping deterministic.
pub fn normalize_tags(tags: &[String]) -> Vec<String> {
    let mut normalized: Vec<String> = tags
        .iter()
        .map(|tag| tag.trim().to_lowercase())
        .filter(|tag| !tag.is_empty())
        .collect();
    normalized.sort();
    normalized.dedup();
    normalized
}

// ---------------------------------------------------------------------------
// Interactions
// ---------------------------------------------------------------------------

/// Outcome of an agent-to-agent or agent-to-task interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionOutcome {
    Success,
    Failure,
    Neutral,
}

impl InteractionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Neutral => "neutral",
        }
    }

    /// Parse from a string, defaulting to Neutral.
    pub fn from_str_lossy(value: &str) -> Self {
        match value {
            "success" => Self::Success,
            "failure" => Self::Failure,
            _ => Self::Neutral,
        }
    }
}

impl std::fmt::Display for InteractionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only interaction record. Never mutated; removed only by the
/// retention sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionRecord {
    pub id: String,
    pub source_agent: String,
    pub target_agent: Option<String>,
    pub interaction_type: String,
    /// Typed key-value payload, validated at ingestion. Known keys per type
    /// are documented on [`crate::interactions::InteractionLog::record`].
    pub payload: serde_json::Value,
    pub outcome: InteractionOutcome,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Patterns & insights
// ---------------------------------------------------------------------------

/// Which corpus a pattern detection run scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternSource {
    Interactions,
    Knowledge,
}

/// A statistically supported regularity detected over one window.
///
/// Immutable once written; a new detection run mints new records. Consumers
/// deduplicate by `(category, window_start, window_end)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pattern {
    pub id: String,
    pub category: String,
    pub description: String,
    pub support_count: i64,
    pub confidence: f64,
    /// Ids of the interaction records or knowledge entries backing this
    /// pattern, sorted for determinism.
    pub evidence: Vec<String>,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub detected_at: DateTime<Utc>,
}

/// Classification of a generated insight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightKind {
    Trend,
    Anomaly,
    Opportunity,
    Risk,
    Optimization,
}

impl InsightKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trend => "trend",
            Self::Anomaly => "anomaly",
            Self::Opportunity => "opportunity",
            Self::Risk => "risk",
            Self::Optimization => "optimization",
        }
    }

    pub fn from_str_lossy(value: &str) -> Self {
        match value {
            "trend" => Self::Trend,
            "anomaly" => Self::Anomaly,
            "opportunity" => Self::Opportunity,
            "risk" => Self::Risk,
            _ => Self::Optimization,
        }
    }
}

impl std::fmt::Display for InsightKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An actionable interpretation derived from one or more patterns.
/// Append-only; newer insights supersede older ones by referencing the same
/// patterns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Insight {
    pub id: String,
    pub kind: InsightKind,
    pub basis_pattern_ids: Vec<String>,
    pub narrative: String,
    /// 0.0 - 1.0, scaled by how far the triggering metric sits from its
    /// threshold.
    pub severity: f64,
    /// Set when the insight concerns a single agent.
    pub agent_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Graph
// ---------------------------------------------------------------------------

/// Relation kind carried on a graph edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    CoRetrieved,
    SharedTag,
    Explicit,
}

impl RelationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CoRetrieved => "co_retrieved",
            Self::SharedTag => "shared_tag",
            Self::Explicit => "explicit",
        }
    }

    pub fn from_str_lossy(value: &str) -> Self {
        match value {
            "co_retrieved" => Self::CoRetrieved,
            "shared_tag" => Self::SharedTag,
            _ => Self::Explicit,
        }
    }
}

impl std::fmt::Display for RelationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Profiles & feedback
// ---------------------------------------------------------------------------

/// Per-agent accumulated skill and interaction summary.
///
/// Created lazily on first interaction and updated incrementally; never
/// recomputed from scratch on the hot path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentLearningProfile {
    pub agent_id: String,
    /// Skill key (interaction type or category) to competence score 0.0 - 1.0.
    pub skill_vector: HashMap<String, f64>,
    pub interactions_observed: i64,
    pub successes: i64,
    pub failures: i64,
    pub last_active_at: DateTime<Utc>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
}

impl AgentLearningProfile {
    /// Skills below the competence threshold, weakest first, ties by key.
    pub fn gaps(&self, competence_threshold: f64) -> Vec<(String, f64)> {
        let mut gaps: Vec<(String, f64)> = self
            .skill_vector
            .iter()
            .filter(|(_, score)| **score < competence_threshold)
            .map(|(key, score)| (key.clone(), *score))
            .collect();
        gaps.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        gaps
    }
}

/// Explicit agent feedback on a task. Rating is a bounded 1..=5 scale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feedback {
    pub id: String,
    pub agent_id: String,
    pub task_id: String,
    pub rating: i64,
    pub details: String,
    pub created_at: DateTime<Utc>,
}

impl Feedback {
    /// Rating mapped onto 0.0 - 1.0 so it is comparable to success rates.
    pub fn normalized_rating(&self) -> f64 {
        ((self.rating - 1) as f64 / 4.0).clamp(0.0, 1.0)
    }
}

// ---------------------------------------------------------------------------
// Subscriptions & deliveries
// ---------------------------------------------------------------------------

/// A standing agent interest used to route newly published knowledge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub agent_id: String,
    pub categories: Vec<KnowledgeCategory>,
    pub tags: Vec<String>,
    pub active: bool,
    /// One-shot subscriptions back urgent knowledge requests and deactivate
    /// after the first matching delivery or on expiry.
    pub one_shot: bool,
    /// Original query text for one-shot subscriptions, echoed back on expiry.
    pub query: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Subscription {
    /// Whether a written entry qualifies for delivery to this subscription.
    pub fn matches(&self, category: KnowledgeCategory, tags: &[String]) -> bool {
        if self.categories.contains(&category) {
            return true;
        }
        self.tags.iter().any(|tag| tags.contains(tag))
    }

    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }
}

/// Delivery attempt lifecycle: Pending -> Delivered, or Pending -> Retrying
/// (bounded backoff) -> Delivered | DeadLettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Pending,
    Retrying,
    Delivered,
    DeadLettered,
}

impl DeliveryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Retrying => "retrying",
            Self::Delivered => "delivered",
            Self::DeadLettered => "dead_lettered",
        }
    }

    pub fn from_str_lossy(value: &str) -> Self {
        match value {
            "retrying" => Self::Retrying,
            "delivered" => Self::Delivered,
            "dead_lettered" => Self::DeadLettered,
            _ => Self::Pending,
        }
    }
}

impl std::fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One enqueued delivery of an entry to a subscriber.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delivery {
    pub id: String,
    pub subscription_id: String,
    pub agent_id: String,
    pub entry_id: String,
    pub state: DeliveryState,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
