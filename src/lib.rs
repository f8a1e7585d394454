//! Hivemind: a knowledge and learning engine for a fleet of worker agents.
//!
//! Agents store and search reusable knowledge, the engine observes their
//! interactions, and background loops distill those observations into
//! patterns, insights, profiles, and recommendations. A subscription-based
//! flow pushes newly published knowledge to interested agents with retries
//! and dead-lettering.
//!
//! [`LearningCoordinator`] is the entry point: it owns every component, the
//! SQLite-backed stores, and the periodic loops.
//!
//! ```no_run
//! use hivemind::{EngineConfig, LearningCoordinator, NullSink};
//! use std::sync::Arc;
//!
//! # async fn example() -> hivemind::Result<()> {
//! let config = hivemind::config::shared(EngineConfig::default());
//! let coordinator = LearningCoordinator::open(
//!     std::path::Path::new("knowledge.db"),
//!     config,
//!     Arc::new(NullSink),
//! )
//! .await?;
//! coordinator.start();
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod coordinator;
pub mod error;
pub mod flow;
pub mod graph;
pub mod insights;
pub mod interactions;
pub mod patterns;
pub mod profiles;
pub mod recommend;
pub mod store;
mod text;
pub mod types;

pub use config::{EngineConfig, SharedConfig};
pub use coordinator::{
    AgentProfileView, IngestionSummary, KnowledgeStatistics, LearningCoordinator, LearningReport,
};
pub use error::{EngineError, Result};
pub use flow::{
    DeliverySink, FlowMetrics, KnowledgeFlowManager, NullSink, RequestOutcome, Urgency,
};
pub use graph::{CentralNode, KnowledgeGraph, RelatedNode};
pub use insights::InsightGenerator;
pub use interactions::InteractionLog;
pub use patterns::PatternRecognizer;
pub use profiles::ProfileStore;
pub use recommend::{
    CollaboratorRecommendation, LearningStep, Recommendation, RecommendationEngine,
};
pub use store::{CategoryStatistics, KnowledgeStore, ScoredEntry};
pub use types::{
    AgentLearningProfile, Delivery, DeliveryState, EntryPatch, Feedback, Insight, InsightKind,
    InteractionOutcome, InteractionRecord, KnowledgeCategory, KnowledgeEntry, Pattern,
    PatternSource, RelationKind, Subscription,
};
