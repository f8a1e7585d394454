//! Outbound delivery boundary.
//!
//! The engine never talks to a transport directly; everything leaving the
//! process goes through [`DeliverySink`]. Implementations are expected to be
//! cheap to call and internally retried only by the flow manager, which owns
//! the attempt budget, backoff, and dead-lettering.

use crate::types::KnowledgeEntry;

use async_trait::async_trait;

/// Transport seam for knowledge leaving the engine.
#[async_trait]
pub trait DeliverySink: Send + Sync + 'static {
    /// Deliver one knowledge entry to a subscribed agent. An `Err` counts as
    /// a failed attempt and is retried by the caller.
    async fn deliver_entry(&self, agent_id: &str, entry: &KnowledgeEntry) -> anyhow::Result<()>;

    /// Tell an agent that its urgent knowledge request expired with no
    /// matching entry published in time.
    async fn notify_request_expired(&self, agent_id: &str, query: &str) -> anyhow::Result<()>;
}

/// Sink that logs and drops everything. Useful for embedding the engine
/// before a real transport exists.
#[derive(Debug, Default)]
pub struct NullSink;

#[async_trait]
impl DeliverySink for NullSink {
    async fn deliver_entry(&self, agent_id: &str, entry: &KnowledgeEntry) -> anyhow::Result<()> {
        tracing::debug!(agent_id, entry_id = %entry.id, "dropping delivery (null sink)");
        Ok(())
    }

    async fn notify_request_expired(&self, agent_id: &str, query: &str) -> anyhow::Result<()> {
        tracing::debug!(agent_id, query, "dropping expiry notice (null sink)");
        Ok(())
    }
}
