//! Agent runtime: presence bootstrap, the inbound listeners, and the round
//! driver, wired together over one shared state block.
//!
//! Concurrency discipline: the round driver is the only task that closes
//! rounds and imports layers; the receive loop is the only task that feeds
//! the contribution queue and the reassembly codec. Everything they share
//! sits behind the managers' own locks.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::time::Instant;

use crate::address::AgentAddress;
use crate::bootstrap::{self, BootstrapState};
use crate::consensus::{apply_consensus, Consensus, ConsensusManager};
use crate::envelope::{Conversation, Envelope};
use crate::error::{ConfigError, TransportError};
use crate::fragment::{self, FragmentCodec, MIN_MESSAGE_SIZE};
use crate::model::{Evaluation, ModelManager};
use crate::observer::Observer;
use crate::presence::PresenceEvent;
use crate::similarity::{SimilarityFunction, SimilarityManager, SimilarityVector};
use crate::strategy::SelectionStrategy;
use crate::transport::Transport;

/// How long the listeners block on the transport before re-checking stop.
const RECEIVE_POLL: Duration = Duration::from_millis(200);

/// Everything an agent needs to participate in a swarm.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub address: AgentAddress,
    pub neighbours: Vec<AgentAddress>,
    /// Presence coordinator. When unset, the bootstrap phase is skipped and
    /// the agent starts rounds immediately.
    pub coordinator: Option<AgentAddress>,
    /// Hard per-message size limit of the underlying substrate, in bytes.
    pub max_message_size: usize,
    /// Distinct contributors that close a round early.
    pub max_order: usize,
    /// Wall-clock bound on collecting contributions per round.
    pub accept_timeout: Duration,
    /// Averaging passes applied to a closed contribution set.
    pub consensus_iterations: u32,
    /// Last round number to run; `None` keeps going until shutdown.
    pub max_rounds: Option<u64>,
    /// Local training epochs per round; 0 skips training.
    pub training_epochs: u32,
    /// How long to wait for peers' similarity vectors each round.
    pub similarity_timeout: Duration,
    pub presence_poll_interval: Duration,
    /// Reassembly buffers idle longer than this are discarded.
    pub prune_stale_after: Duration,
}

impl AgentConfig {
    pub fn new(address: AgentAddress) -> Self {
        Self {
            address,
            neighbours: Vec::new(),
            coordinator: None,
            max_message_size: 250_000,
            max_order: 1,
            accept_timeout: Duration::from_secs(60),
            consensus_iterations: 1,
            max_rounds: Some(70),
            training_epochs: 1,
            similarity_timeout: Duration::from_secs(300),
            presence_poll_interval: Duration::from_millis(500),
            prune_stale_after: Duration::from_secs(300),
        }
    }

    /// Construction-time checks. These are the only fatal errors in the
    /// protocol; everything at runtime degrades per-peer instead.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_message_size < MIN_MESSAGE_SIZE {
            return Err(ConfigError::MessageSizeTooSmall(self.max_message_size));
        }
        if self.max_order == 0 {
            return Err(ConfigError::ZeroMaxOrder);
        }
        if self.accept_timeout.is_zero() {
            return Err(ConfigError::ZeroDeadline);
        }
        if self.neighbours.is_empty() && self.coordinator.is_none() {
            return Err(ConfigError::NoPeers);
        }
        Ok(())
    }
}

/// What an agent hands back when its run ends.
#[derive(Debug, Clone, Copy)]
pub struct AgentSummary {
    pub rounds: u64,
    pub evaluation: Evaluation,
}

struct Shared {
    config: AgentConfig,
    transport: Arc<dyn Transport>,
    model: Mutex<Box<dyn ModelManager>>,
    similarity: SimilarityManager,
    consensus: ConsensusManager,
    observer: Arc<dyn Observer>,
}

impl Shared {
    /// Available contacts restricted to the configured neighbour list.
    async fn available_neighbours(&self) -> Vec<AgentAddress> {
        self.transport
            .available_peers()
            .await
            .into_iter()
            .filter(|peer| self.config.neighbours.contains(peer))
            .collect()
    }

    /// Fragments and ships one logical payload. Encoding and splitting
    /// failures are logged and swallowed; only transport errors surface,
    /// and callers skip just the affected peer.
    async fn send_envelope(
        &self,
        to: &AgentAddress,
        conversation: Conversation,
        body: String,
    ) -> Result<(), TransportError> {
        let size = body.len();
        let envelope = Envelope::new(self.config.address.clone(), to.clone(), conversation, body);
        let fragments = match fragment::split(envelope, self.config.max_message_size) {
            Ok(fragments) => fragments,
            Err(error) => {
                tracing::error!(agent = %self.config.address, %error, "fragmentation failed");
                return Ok(());
            }
        };
        let count = fragments.len();
        for frag in fragments {
            self.transport.send(frag).await?;
        }
        if count > 1 {
            tracing::debug!(
                agent = %self.config.address,
                to = %to,
                fragments = count,
                bytes = size,
                "payload sent in fragments"
            );
        }
        self.observer.message_sent(to, conversation, size);
        Ok(())
    }

    async fn send_similarity(
        &self,
        to: &AgentAddress,
        vector: &SimilarityVector,
    ) -> Result<(), TransportError> {
        match serde_json::to_string(vector) {
            Ok(body) => self.send_envelope(to, Conversation::Similarity, body).await,
            Err(error) => {
                tracing::error!(agent = %self.config.address, %error, "similarity encode failed");
                Ok(())
            }
        }
    }

    async fn send_consensus(
        &self,
        to: &AgentAddress,
        payload: &Consensus,
    ) -> Result<(), TransportError> {
        match serde_json::to_string(payload) {
            Ok(body) => self.send_envelope(to, Conversation::Layers, body).await,
            Err(error) => {
                tracing::error!(agent = %self.config.address, %error, "consensus encode failed");
                Ok(())
            }
        }
    }

    async fn handle_envelope(&self, codec: &mut FragmentCodec, envelope: Envelope) {
        let envelope = if fragment::is_fragment(&envelope) {
            match codec.reassemble(envelope) {
                Ok(Some(complete)) => complete,
                Ok(None) => return,
                Err(error) => {
                    tracing::warn!(agent = %self.config.address, %error, "malformed fragment dropped");
                    return;
                }
            }
        } else {
            envelope
        };

        self.observer
            .message_received(&envelope.sender, envelope.conversation, envelope.body_len());
        match envelope.conversation {
            Conversation::Similarity => self.handle_similarity(envelope).await,
            Conversation::Layers => self.handle_consensus(envelope).await,
        }
    }

    async fn handle_similarity(&self, envelope: Envelope) {
        let vector: SimilarityVector = match serde_json::from_str(&envelope.body) {
            Ok(vector) => vector,
            Err(error) => {
                tracing::warn!(
                    agent = %self.config.address,
                    from = %envelope.sender,
                    %error,
                    "undecodable similarity vector dropped"
                );
                return;
            }
        };
        let wants_reply = vector.request_reply;
        let sender = envelope.sender.bare();
        self.similarity.record_peer(sender.clone(), vector).await;

        if wants_reply {
            // Echo our own vector back, without asking for another reply.
            if let Some(own) = self.similarity.own().await {
                let reply = own.with_reply_request(false);
                if let Err(error) = self.send_similarity(&sender, &reply).await {
                    tracing::warn!(
                        agent = %self.config.address,
                        peer = %sender,
                        %error,
                        "similarity reply failed"
                    );
                }
            }
        }
    }

    async fn handle_consensus(&self, envelope: Envelope) {
        let contribution: Consensus = match serde_json::from_str(&envelope.body) {
            Ok(contribution) => contribution,
            Err(error) => {
                tracing::warn!(
                    agent = %self.config.address,
                    from = %envelope.sender,
                    %error,
                    "undecodable consensus payload dropped"
                );
                return;
            }
        };

        // A payload naming a layer we do not have is dropped whole.
        let reply_layers = {
            let model = self.model.lock().await;
            let known: BTreeSet<String> = model.layer_names().into_iter().collect();
            if let Some(unknown) = contribution.layers.keys().find(|name| !known.contains(*name)) {
                tracing::warn!(
                    agent = %self.config.address,
                    from = %contribution.sender,
                    layer = %unknown,
                    "contribution with unknown layer dropped"
                );
                return;
            }
            if contribution.request_reply {
                // Snapshot the echo before the queue can close a round and
                // rewrite the model underneath us.
                let names: BTreeSet<String> = contribution.layers.keys().cloned().collect();
                Some(model.export_named(&names))
            } else {
                None
            }
        };

        let sender = contribution.sender.bare();
        self.consensus.push(contribution).await;

        if let Some(layers) = reply_layers {
            let reply = Consensus::new(self.config.address.clone(), layers);
            if let Err(error) = self.send_consensus(&sender, &reply).await {
                tracing::warn!(
                    agent = %self.config.address,
                    peer = %sender,
                    %error,
                    "consensus reply failed"
                );
            }
        }
    }
}

async fn receiver_loop(shared: Arc<Shared>, mut stop: watch::Receiver<bool>) {
    let mut codec = FragmentCodec::new();
    let mut last_prune = Instant::now();
    loop {
        if *stop.borrow() {
            break;
        }
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            received = shared.transport.receive(RECEIVE_POLL) => {
                if let Some(envelope) = received {
                    shared.handle_envelope(&mut codec, envelope).await;
                }
            }
        }
        if last_prune.elapsed() >= shared.config.prune_stale_after {
            let dropped = codec.prune_stale(shared.config.prune_stale_after);
            if dropped > 0 {
                tracing::debug!(agent = %shared.config.address, dropped, "stale reassemblies pruned");
            }
            last_prune = Instant::now();
        }
    }
    if codec.any_pending() {
        tracing::debug!(agent = %shared.config.address, "abandoning in-flight reassemblies");
    }
}

/// Keeps approving (and countering) subscription requests after bootstrap,
/// so late joiners can still reach mutual status.
async fn presence_loop(shared: Arc<Shared>, mut stop: watch::Receiver<bool>) {
    loop {
        if *stop.borrow() {
            break;
        }
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            event = shared.transport.next_presence_event(RECEIVE_POLL) => {
                if let Some(PresenceEvent::Subscribe { from }) = event {
                    if let Err(error) = shared.transport.approve(&from).await {
                        tracing::debug!(peer = %from, %error, "approve failed");
                    }
                    if let Err(error) = shared.transport.subscribe(&from).await {
                        tracing::debug!(peer = %from, %error, "counter-subscription failed");
                    }
                }
            }
        }
    }
}

/// One autonomous peer. Owns its model, managers and strategy; talks to the
/// rest of the swarm only through the transport.
pub struct Agent {
    shared: Arc<Shared>,
    strategy: Box<dyn SelectionStrategy>,
}

impl Agent {
    pub fn new(
        config: AgentConfig,
        transport: Arc<dyn Transport>,
        model: Box<dyn ModelManager>,
        strategy: Box<dyn SelectionStrategy>,
        function: Arc<dyn SimilarityFunction>,
        observer: Arc<dyn Observer>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        if *transport.local_address() != config.address {
            return Err(ConfigError::AddressMismatch {
                config: config.address.clone(),
                transport: transport.local_address().clone(),
            });
        }
        let similarity = SimilarityManager::new(function, config.similarity_timeout);
        let consensus = ConsensusManager::new(
            config.max_order,
            config.accept_timeout,
            config.consensus_iterations,
        );
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                transport,
                model: Mutex::new(model),
                similarity,
                consensus,
                observer,
            }),
            strategy,
        })
    }

    pub fn address(&self) -> &AgentAddress {
        &self.shared.config.address
    }

    /// Runs the agent to completion: bootstrap, then rounds until the
    /// round bound or shutdown. An in-progress round is abandoned on
    /// shutdown, never forced to completion.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> AgentSummary {
        let shared = self.shared.clone();
        tracing::info!(
            agent = %shared.config.address,
            neighbours = shared.config.neighbours.len(),
            strategy = self.strategy.name(),
            similarity = shared.similarity.function().name(),
            "agent starting"
        );
        if let Err(error) = shared.transport.set_available(true).await {
            tracing::warn!(agent = %shared.config.address, %error, "could not announce availability");
        }

        if let Some(coordinator) = shared.config.coordinator.clone() {
            let mut required = shared.config.neighbours.clone();
            required.push(coordinator);
            let state = bootstrap::negotiate_presence(
                shared.transport.as_ref(),
                &required,
                shared.config.presence_poll_interval,
                &mut shutdown,
            )
            .await;
            if state != BootstrapState::Ready {
                let evaluation = shared.model.lock().await.evaluate();
                return AgentSummary { rounds: 0, evaluation };
            }
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let receiver = tokio::spawn(receiver_loop(shared.clone(), stop_rx.clone()));
        let presence = tokio::spawn(presence_loop(shared.clone(), stop_rx));

        let rounds = self.drive_rounds(&mut shutdown).await;

        let _ = stop_tx.send(true);
        let _ = receiver.await;
        let _ = presence.await;
        if let Err(error) = shared.transport.set_available(false).await {
            tracing::debug!(agent = %shared.config.address, %error, "availability withdrawal failed");
        }

        let evaluation = shared.model.lock().await.evaluate();
        tracing::info!(
            agent = %shared.config.address,
            rounds,
            accuracy = evaluation.accuracy,
            loss = evaluation.loss,
            "agent finished"
        );
        AgentSummary { rounds, evaluation }
    }

    async fn drive_rounds(&self, shutdown: &mut watch::Receiver<bool>) -> u64 {
        let shared = &self.shared;
        loop {
            if *shutdown.borrow() {
                break;
            }
            let round = shared.consensus.current_round().await;
            if let Some(max) = shared.config.max_rounds {
                if round > max {
                    tracing::info!(agent = %shared.config.address, round, "round bound reached");
                    break;
                }
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!(agent = %shared.config.address, round, "round abandoned on shutdown");
                        break;
                    }
                }
                _ = self.run_round(round) => {
                    shared.consensus.advance_round().await;
                }
            }
        }
        shared.consensus.current_round().await
    }

    async fn run_round(&self, round: u64) {
        let shared = &self.shared;
        let started = Instant::now();

        let available = shared.available_neighbours().await;
        shared.observer.round_started(round, available.len());

        // Local training, then the round's own vector: per-layer drift of
        // this round's training against the pre-training snapshot.
        let (snapshot, current, layer_names) = {
            let mut model = shared.model.lock().await;
            let snapshot = model.export_layers();
            let loss = model.train(shared.config.training_epochs);
            shared
                .observer
                .trained(round, shared.config.training_epochs, loss);
            let current = model.export_layers();
            let names: BTreeSet<String> = model.layer_names().into_iter().collect();
            (snapshot, current, names)
        };
        let own_vector = match shared.similarity.publish_own(&current, &snapshot).await {
            Ok(vector) => Some(vector),
            Err(error) => {
                tracing::warn!(agent = %shared.config.address, %error, "own similarity vector failed");
                None
            }
        };

        // Similarity exchange: offer our vector to every available
        // neighbour and give them until the timeout to answer. A silent
        // peer is just absent from this round's vector map.
        if let Some(vector) = &own_vector {
            let outbound = vector.clone().with_reply_request(true);
            for peer in &available {
                if let Err(error) = shared.send_similarity(peer, &outbound).await {
                    tracing::warn!(
                        agent = %shared.config.address,
                        peer = %peer,
                        %error,
                        "similarity send failed"
                    );
                }
            }
            let deadline = Instant::now() + shared.similarity.wait_timeout();
            for peer in &available {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                if shared.similarity.await_vector(peer, deadline - now).await.is_none() {
                    tracing::debug!(
                        agent = %shared.config.address,
                        peer = %peer,
                        "no similarity vector this round"
                    );
                }
            }
        }

        let selected = self.strategy.select_neighbours(&available);
        let peer_vectors = shared.similarity.peer_vectors().await;
        let assignment =
            self.strategy
                .assign_layers(own_vector.as_ref(), &peer_vectors, &selected, &layer_names);

        for (peer, names) in &assignment {
            let layers = shared.model.lock().await.export_named(names);
            let payload =
                Consensus::new(shared.config.address.clone(), layers).with_reply_request(true);
            if let Err(error) = shared.send_consensus(peer, &payload).await {
                tracing::warn!(
                    agent = %shared.config.address,
                    peer = %peer,
                    %error,
                    "consensus send failed, peer skipped"
                );
            }
        }

        let reason = shared.consensus.await_close().await;
        let contributions = shared.consensus.drain().await;
        shared
            .observer
            .round_completed(round, contributions.len(), reason, started.elapsed());

        if !contributions.is_empty() {
            let mut model = shared.model.lock().await;
            let merged = apply_consensus(
                &model.export_layers(),
                &contributions,
                shared.consensus.iterations(),
            );
            model.import_layers(merged);
        }

        let evaluation = shared.model.lock().await.evaluate();
        shared.observer.evaluated(round, evaluation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AgentConfig {
        let mut config = AgentConfig::new("a0@swarm".parse().unwrap());
        config.neighbours = vec!["a1@swarm".parse().unwrap()];
        config
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(config().validate().is_ok());
    }

    #[test]
    fn test_message_size_below_minimum_rejected() {
        let mut c = config();
        c.max_message_size = 3;
        assert_eq!(c.validate(), Err(ConfigError::MessageSizeTooSmall(3)));
    }

    #[test]
    fn test_zero_max_order_rejected() {
        let mut c = config();
        c.max_order = 0;
        assert_eq!(c.validate(), Err(ConfigError::ZeroMaxOrder));
    }

    #[test]
    fn test_zero_deadline_rejected() {
        let mut c = config();
        c.accept_timeout = Duration::ZERO;
        assert_eq!(c.validate(), Err(ConfigError::ZeroDeadline));
    }

    #[test]
    fn test_isolated_agent_rejected() {
        let mut c = config();
        c.neighbours.clear();
        c.coordinator = None;
        assert_eq!(c.validate(), Err(ConfigError::NoPeers));
    }

    #[test]
    fn test_neighbours_plus_no_coordinator_is_fine() {
        let c = config();
        assert!(c.coordinator.is_none());
        assert!(c.validate().is_ok());
    }
}
