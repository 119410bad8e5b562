use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use uuid::Uuid;

use murmur_protocol::{
    by_name, run_coordinator, Agent, AgentAddress, AgentConfig, AgentSummary, ChannelNetwork,
    CloseReason, Conversation, Evaluation, EuclideanDistance, LinearModel, Observer,
    TracingObserver,
};

use crate::config::Experiment;

/// How often the coordinator polls its presence inbox.
const COORDINATOR_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Default, Clone, Copy)]
struct RoundRow {
    participants: usize,
    elapsed_ms: u64,
    loss: f32,
    accuracy: f32,
}

/// Collects per-round observations from every agent of the swarm. A row is
/// keyed by round and agent so the two halves (completion and evaluation)
/// land in the same record whichever arrives first.
pub struct MetricsSink {
    rows: Mutex<BTreeMap<(u64, String), RoundRow>>,
}

impl MetricsSink {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(BTreeMap::new()),
        }
    }

    fn rows(&self) -> MutexGuard<'_, BTreeMap<(u64, String), RoundRow>> {
        match self.rows.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn record_round(&self, agent: &str, round: u64, contributions: usize, elapsed: Duration) {
        let mut rows = self.rows();
        let row = rows.entry((round, agent.to_string())).or_default();
        row.participants = contributions;
        row.elapsed_ms = elapsed.as_millis() as u64;
    }

    fn record_evaluation(&self, agent: &str, round: u64, evaluation: Evaluation) {
        let mut rows = self.rows();
        let row = rows.entry((round, agent.to_string())).or_default();
        row.loss = evaluation.loss;
        row.accuracy = evaluation.accuracy;
    }

    /// Rows as CSV, ordered by round then agent. Empty when nothing was
    /// recorded.
    pub fn to_csv(&self) -> String {
        let rows = self.rows();
        if rows.is_empty() {
            return String::new();
        }
        let mut csv = String::from("round,agent,participants,elapsed_ms,loss,accuracy\n");
        for ((round, agent), row) in rows.iter() {
            csv.push_str(&format!(
                "{},{},{},{},{},{}\n",
                round, agent, row.participants, row.elapsed_ms, row.loss, row.accuracy
            ));
        }
        csv
    }
}

/// Logs every agent event and mirrors the per-round ones into the sink.
struct RecordingObserver {
    agent: String,
    log: TracingObserver,
    sink: Arc<MetricsSink>,
}

impl RecordingObserver {
    fn new(agent: String, sink: Arc<MetricsSink>) -> Self {
        Self {
            log: TracingObserver::new(agent.clone()),
            agent,
            sink,
        }
    }
}

impl Observer for RecordingObserver {
    fn round_started(&self, round: u64, available: usize) {
        self.log.round_started(round, available);
    }

    fn round_completed(
        &self,
        round: u64,
        contributions: usize,
        reason: CloseReason,
        elapsed: Duration,
    ) {
        self.log.round_completed(round, contributions, reason, elapsed);
        self.sink.record_round(&self.agent, round, contributions, elapsed);
    }

    fn message_sent(&self, to: &AgentAddress, conversation: Conversation, bytes: usize) {
        self.log.message_sent(to, conversation, bytes);
    }

    fn message_received(&self, from: &AgentAddress, conversation: Conversation, bytes: usize) {
        self.log.message_received(from, conversation, bytes);
    }

    fn trained(&self, round: u64, epochs: u32, loss: Option<f32>) {
        self.log.trained(round, epochs, loss);
    }

    fn evaluated(&self, round: u64, evaluation: Evaluation) {
        self.log.evaluated(round, evaluation);
        self.sink.record_evaluation(&self.agent, round, evaluation);
    }
}

pub struct SwarmOutcome {
    pub summaries: Vec<(AgentAddress, AgentSummary)>,
    pub csv: String,
}

/// Runs one experiment to completion: a coordinator plus `agents` peers over
/// the in-process channel network, joined once every agent finishes its
/// rounds or the shutdown signal fires.
pub async fn run_experiment(
    experiment: &Experiment,
    shutdown: watch::Receiver<bool>,
) -> Result<SwarmOutcome> {
    experiment.validate()?;

    let run = experiment
        .run_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let addresses = experiment.agent_addresses(&run);
    let coordinator = Experiment::coordinator_address(&run);
    tracing::info!(
        run = %run,
        agents = experiment.agents,
        topology = ?experiment.topology,
        algorithm = %experiment.algorithm,
        "Launching swarm"
    );

    let network = ChannelNetwork::new();
    let sink = Arc::new(MetricsSink::new());
    let coordinator_transport = network.register(coordinator.clone()).await;

    // Build the whole swarm before starting any of it, so a bad experiment
    // fails without leaving half a swarm running.
    let mut agents = Vec::with_capacity(experiment.agents);
    for (index, address) in addresses.iter().enumerate() {
        let neighbours = experiment.neighbours_of(index, &addresses);
        let max_order = experiment.max_order.unwrap_or(neighbours.len());

        let mut config = AgentConfig::new(address.clone());
        config.neighbours = neighbours;
        config.coordinator = Some(coordinator.clone());
        config.max_message_size = experiment.max_message_size;
        config.max_order = max_order;
        config.accept_timeout = Duration::from_secs(experiment.accept_timeout_secs);
        config.consensus_iterations = experiment.consensus_iterations;
        config.max_rounds = experiment.max_rounds;
        config.training_epochs = experiment.training_epochs;
        config.similarity_timeout = Duration::from_secs(experiment.similarity_timeout_secs);

        let strategy = by_name(&experiment.algorithm, Some(experiment.seed))
            .ok_or_else(|| anyhow::anyhow!("unknown algorithm '{}'", experiment.algorithm))?;
        // Each agent trains on its own data, so the seed is offset per agent.
        let model = LinearModel::new(
            experiment.seed + index as u64,
            experiment.model_dim,
            experiment.train_samples,
            experiment.test_samples,
        );
        let observer = Arc::new(RecordingObserver::new(address.to_string(), sink.clone()));

        let transport = network.register(address.clone()).await;
        let agent = Agent::new(
            config,
            Arc::new(transport),
            Box::new(model),
            strategy,
            Arc::new(EuclideanDistance),
            observer,
        )?;
        agents.push((address.clone(), agent));
    }

    let mut coordinator_rx = shutdown.clone();
    let coordinator_task = tokio::spawn(async move {
        run_coordinator(&coordinator_transport, COORDINATOR_POLL, &mut coordinator_rx).await;
    });

    let mut tasks = Vec::with_capacity(agents.len());
    for (address, agent) in agents {
        let agent_rx = shutdown.clone();
        tasks.push((address, tokio::spawn(agent.run(agent_rx))));
    }

    let mut summaries = Vec::with_capacity(tasks.len());
    for (address, task) in tasks {
        let summary = task
            .await
            .with_context(|| format!("agent {address} stopped abnormally"))?;
        tracing::info!(
            agent = %address,
            rounds = summary.rounds,
            loss = summary.evaluation.loss,
            accuracy = summary.evaluation.accuracy,
            "Agent finished"
        );
        summaries.push((address, summary));
    }

    coordinator_task.abort();
    let _ = coordinator_task.await;

    Ok(SwarmOutcome {
        summaries,
        csv: sink.to_csv(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Topology;

    #[test]
    fn test_sink_merges_completion_and_evaluation() {
        let sink = MetricsSink::new();
        assert_eq!(sink.to_csv(), "");

        // The evaluation half may land first.
        let evaluation = Evaluation {
            loss: 0.5,
            accuracy: 0.75,
        };
        sink.record_evaluation("a1@swarm", 0, evaluation);
        sink.record_round("a1@swarm", 0, 2, Duration::from_millis(40));
        sink.record_round("a0@swarm", 0, 3, Duration::from_millis(25));

        let csv = sink.to_csv();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "round,agent,participants,elapsed_ms,loss,accuracy");
        assert_eq!(lines[1], "0,a0@swarm,3,25,0,0");
        assert_eq!(lines[2], "0,a1@swarm,2,40,0.5,0.75");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_small_swarm_runs_one_round_per_agent() {
        let experiment = Experiment {
            run_id: Some("launchertest".to_string()),
            agents: 3,
            topology: Topology::Complete,
            max_rounds: Some(0),
            consensus_iterations: 2,
            training_epochs: 1,
            max_order: Some(1),
            accept_timeout_secs: 10,
            similarity_timeout_secs: 2,
            seed: 7,
            model_dim: 4,
            train_samples: 32,
            test_samples: 16,
            ..Experiment::default()
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let outcome = run_experiment(&experiment, shutdown_rx).await.unwrap();
        drop(shutdown_tx);

        assert_eq!(outcome.summaries.len(), 3);
        for (address, summary) in &outcome.summaries {
            assert_eq!(summary.rounds, 1, "agent {address} should run exactly round 0");
            assert!(summary.evaluation.loss.is_finite());
        }

        // Header plus one row per agent, all for round 0.
        let lines: Vec<&str> = outcome.csv.lines().collect();
        assert_eq!(lines.len(), 4);
        for line in &lines[1..] {
            assert!(line.starts_with("0,a"), "unexpected row {line}");
            assert!(line.contains("__launchertest@swarm,"), "unexpected row {line}");
        }
    }
}
