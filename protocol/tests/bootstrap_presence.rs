use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use murmur_protocol::{
    negotiate_presence, run_coordinator, Agent, AgentAddress, AgentConfig, BootstrapState,
    ChannelNetwork, EuclideanDistance, LinearModel, NullObserver, RandomFullShare, Transport,
};

fn address(s: &str) -> AgentAddress {
    s.parse().unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_swarm_reaches_ready_when_every_contact_is_mutual() {
    let network = ChannelNetwork::new();
    let addresses: Vec<AgentAddress> = (0..3)
        .map(|i| address(&format!("a{i}@swarm.local")))
        .collect();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut handles = Vec::new();
    for me in addresses.clone() {
        let transport = network.register(me.clone()).await;
        let required: Vec<AgentAddress> =
            addresses.iter().filter(|a| **a != me).cloned().collect();
        let mut rx = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            negotiate_presence(&transport, &required, Duration::from_millis(20), &mut rx).await
        }));
    }

    for handle in handles {
        assert_eq!(
            handle.await.unwrap(),
            BootstrapState::Ready,
            "every node must reach ready once all contacts are mutual"
        );
    }
    drop(shutdown_tx);
}

#[tokio::test]
async fn test_negotiation_stays_incomplete_without_counterpart() {
    let network = ChannelNetwork::new();
    let a0 = address("a0@swarm.local");
    let a1 = address("a1@swarm.local");
    let transport = network.register(a0).await;
    // a1 is on the network but never approves anything.
    let _silent = network.register(a1.clone()).await;
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let handle = tokio::spawn(async move {
        negotiate_presence(&transport, &[a1], Duration::from_millis(20), &mut shutdown_rx).await
    });
    tokio::time::sleep(Duration::from_millis(150)).await;
    shutdown_tx.send(true).unwrap();

    assert_eq!(
        handle.await.unwrap(),
        BootstrapState::WaitingForCompletion,
        "an unanswered subscription must not unblock the node"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_coordinator_anchors_the_roster() {
    let network = ChannelNetwork::new();
    let coordinator = address("coordinator@swarm.local");
    let a0 = address("a0@swarm.local");
    let a1 = address("a1@swarm.local");
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let coordinator_transport = network.register(coordinator.clone()).await;
    let mut coordinator_rx = shutdown_rx.clone();
    let coordinator_task = tokio::spawn(async move {
        run_coordinator(
            &coordinator_transport,
            Duration::from_millis(20),
            &mut coordinator_rx,
        )
        .await;
    });

    let mut handles = Vec::new();
    for (me, other) in [(a0.clone(), a1.clone()), (a1, a0)] {
        let transport = network.register(me).await;
        let required = vec![other, coordinator.clone()];
        let mut rx = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            negotiate_presence(&transport, &required, Duration::from_millis(20), &mut rx).await
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap(), BootstrapState::Ready);
    }

    shutdown_tx.send(true).unwrap();
    coordinator_task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_agents_run_rounds_after_coordinated_bootstrap() {
    let network = ChannelNetwork::new();
    let coordinator = address("coordinator@swarm.local");
    let a0 = address("a0@swarm.local");
    let a1 = address("a1@swarm.local");
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let coordinator_transport = network.register(coordinator.clone()).await;
    let mut coordinator_rx = shutdown_rx.clone();
    let coordinator_task = tokio::spawn(async move {
        run_coordinator(
            &coordinator_transport,
            Duration::from_millis(20),
            &mut coordinator_rx,
        )
        .await;
    });

    let mut handles = Vec::new();
    for (seed, me, other) in [(1u64, a0.clone(), a1.clone()), (2u64, a1, a0)] {
        let transport: Arc<dyn Transport> = Arc::new(network.register(me.clone()).await);
        let mut config = AgentConfig::new(me);
        config.neighbours = vec![other];
        config.coordinator = Some(coordinator.clone());
        config.max_rounds = Some(0);
        config.accept_timeout = Duration::from_secs(2);
        config.similarity_timeout = Duration::from_secs(2);
        config.presence_poll_interval = Duration::from_millis(20);

        let agent = Agent::new(
            config,
            transport,
            Box::new(LinearModel::new(seed, 4, 64, 32)),
            Box::new(RandomFullShare::new(Some(seed))),
            Arc::new(EuclideanDistance),
            Arc::new(NullObserver),
        )
        .unwrap();
        handles.push(tokio::spawn(agent.run(shutdown_rx.clone())));
    }

    for handle in handles {
        let summary = handle.await.unwrap();
        // A failed bootstrap returns before round zero, so one completed
        // round proves the presence phase went all the way to ready.
        assert_eq!(summary.rounds, 1);
        assert!(summary.evaluation.loss.is_finite());
        assert!((0.0..=1.0).contains(&summary.evaluation.accuracy));
    }

    shutdown_tx.send(true).unwrap();
    coordinator_task.await.unwrap();
}
