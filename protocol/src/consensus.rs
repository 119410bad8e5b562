//! Round state and decentralized averaging.
//!
//! "Consensus" here is value convergence by iterative averaging. A round
//! collects contributions from peers into a queue; once the round closes
//! (enough distinct senders, or the deadline) the queue is drained and
//! folded into the local layers.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, RwLock};
use tokio::time::Instant;

use crate::address::AgentAddress;
use crate::error::CloseReason;
use crate::model::LayerMap;

/// One neighbour's contribution to a round. `request_reply` asks the
/// receiver to send its own layers back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Consensus {
    pub sender: AgentAddress,
    pub layers: LayerMap,
    #[serde(default)]
    pub request_reply: bool,
}

impl Consensus {
    pub fn new(sender: AgentAddress, layers: LayerMap) -> Self {
        Self { sender, layers, request_reply: false }
    }

    pub fn with_reply_request(mut self, request_reply: bool) -> Self {
        self.request_reply = request_reply;
        self
    }
}

/// One uniform averaging pass: each local layer becomes the element-wise
/// mean of itself and every contribution that carries that layer. A layer
/// no contribution carries stays as it is; a tensor whose length disagrees
/// with the local one is skipped with a warning.
fn average_pass(local: &LayerMap, contributions: &[Consensus]) -> LayerMap {
    let mut out = LayerMap::new();
    for (name, tensor) in local {
        let mut stack: Vec<&[f32]> = vec![tensor.as_slice()];
        for c in contributions {
            if let Some(t) = c.layers.get(name) {
                if t.len() == tensor.len() {
                    stack.push(t.as_slice());
                } else {
                    tracing::warn!(
                        layer = %name,
                        sender = %c.sender,
                        expected = tensor.len(),
                        got = t.len(),
                        "tensor length mismatch, skipping layer from contribution"
                    );
                }
            }
        }
        let scale = 1.0 / stack.len() as f32;
        let mut avg = vec![0.0f32; tensor.len()];
        for t in &stack {
            for (o, &v) in avg.iter_mut().zip(t.iter()) {
                *o += v;
            }
        }
        for o in &mut avg {
            *o *= scale;
        }
        out.insert(name.clone(), avg);
    }
    out
}

/// Folds a closed contribution set into the local layers, running the
/// configured number of averaging passes against the same set.
pub fn apply_consensus(local: &LayerMap, contributions: &[Consensus], iterations: u32) -> LayerMap {
    let mut merged = local.clone();
    for _ in 0..iterations {
        merged = average_pass(&merged, contributions);
    }
    merged
}

#[derive(Debug, Default)]
struct RoundState {
    round: u64,
    queue: VecDeque<Consensus>,
}

/// Per-agent round bookkeeping: the monotonic round counter and the queue
/// of contributions awaiting the next close. Contributions arriving after
/// a close simply wait for the following round.
pub struct ConsensusManager {
    max_order: usize,
    accept_timeout: Duration,
    iterations: u32,
    state: RwLock<RoundState>,
    arrived: Notify,
}

impl ConsensusManager {
    pub fn new(max_order: usize, accept_timeout: Duration, iterations: u32) -> Self {
        Self {
            max_order,
            accept_timeout,
            iterations,
            state: RwLock::new(RoundState::default()),
            arrived: Notify::new(),
        }
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    pub async fn current_round(&self) -> u64 {
        self.state.read().await.round
    }

    /// Bumps the round counter once a round has fully completed. Returns
    /// the new value. The counter never decreases.
    pub async fn advance_round(&self) -> u64 {
        let mut state = self.state.write().await;
        state.round += 1;
        state.round
    }

    /// Appends a received contribution and wakes the round driver.
    pub async fn push(&self, contribution: Consensus) {
        self.state.write().await.queue.push_back(contribution);
        self.arrived.notify_waiters();
    }

    pub async fn pending(&self) -> usize {
        self.state.read().await.queue.len()
    }

    /// How many distinct peers (bare addresses) are represented in the
    /// queue right now.
    pub async fn distinct_senders(&self) -> usize {
        let state = self.state.read().await;
        state
            .queue
            .iter()
            .map(|c| &c.sender)
            .collect::<HashSet<_>>()
            .len()
    }

    /// Waits for the round to close: contributions from `max_order`
    /// distinct senders, or `accept_timeout` from now. Reaching the order
    /// bound is checked first, so it wins when both hold at once.
    pub async fn await_close(&self) -> CloseReason {
        let deadline = Instant::now() + self.accept_timeout;
        loop {
            let notified = self.arrived.notified();
            if self.distinct_senders().await >= self.max_order {
                return CloseReason::MaxOrder;
            }
            let now = Instant::now();
            if now >= deadline {
                return CloseReason::Deadline;
            }
            let _ = tokio::time::timeout(deadline - now, notified).await;
        }
    }

    /// Takes every queued contribution, in arrival order.
    pub async fn drain(&self) -> Vec<Consensus> {
        self.state.write().await.queue.drain(..).collect()
    }
}
