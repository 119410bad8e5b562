//! Observability hooks, injected at agent construction.
//!
//! Every method has an empty default, so implementers subscribe to only the
//! events they care about.

use std::time::Duration;

use crate::address::AgentAddress;
use crate::envelope::Conversation;
use crate::error::CloseReason;
use crate::model::Evaluation;

pub trait Observer: Send + Sync {
    fn round_started(&self, _round: u64, _available: usize) {}

    fn round_completed(
        &self,
        _round: u64,
        _contributions: usize,
        _reason: CloseReason,
        _elapsed: Duration,
    ) {
    }

    fn message_sent(&self, _to: &AgentAddress, _conversation: Conversation, _bytes: usize) {}

    fn message_received(&self, _from: &AgentAddress, _conversation: Conversation, _bytes: usize) {}

    fn trained(&self, _round: u64, _epochs: u32, _loss: Option<f32>) {}

    fn evaluated(&self, _round: u64, _evaluation: Evaluation) {}
}

/// Discards every event.
pub struct NullObserver;

impl Observer for NullObserver {}

/// Emits every event as a structured tracing record, tagged with the agent
/// name.
pub struct TracingObserver {
    agent: String,
}

impl TracingObserver {
    pub fn new(agent: impl Into<String>) -> Self {
        Self { agent: agent.into() }
    }
}

impl Observer for TracingObserver {
    fn round_started(&self, round: u64, available: usize) {
        tracing::info!(agent = %self.agent, round, available, "round started");
    }

    fn round_completed(
        &self,
        round: u64,
        contributions: usize,
        reason: CloseReason,
        elapsed: Duration,
    ) {
        tracing::info!(
            agent = %self.agent,
            round,
            contributions,
            reason = reason.as_str(),
            elapsed_ms = elapsed.as_millis() as u64,
            "round completed"
        );
    }

    fn message_sent(&self, to: &AgentAddress, conversation: Conversation, bytes: usize) {
        tracing::debug!(
            agent = %self.agent,
            to = %to,
            conversation = conversation.as_str(),
            bytes,
            "message sent"
        );
    }

    fn message_received(&self, from: &AgentAddress, conversation: Conversation, bytes: usize) {
        tracing::debug!(
            agent = %self.agent,
            from = %from,
            conversation = conversation.as_str(),
            bytes,
            "message received"
        );
    }

    fn trained(&self, round: u64, epochs: u32, loss: Option<f32>) {
        match loss {
            Some(loss) => {
                tracing::info!(agent = %self.agent, round, epochs, loss, "training finished");
            }
            None => tracing::debug!(agent = %self.agent, round, "training skipped"),
        }
    }

    fn evaluated(&self, round: u64, evaluation: Evaluation) {
        tracing::info!(
            agent = %self.agent,
            round,
            loss = evaluation.loss,
            accuracy = evaluation.accuracy,
            "evaluation"
        );
    }
}
