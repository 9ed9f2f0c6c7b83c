//! Tests for deterministic simulation.
//!
//! These tests verify that the simulation produces identical results
//! given the same seed, which is the core property we need for debugging
//! and replay.

use keel_bft::BftConfig;
use keel_core::{Event, Notification};
use keel_node::NodeRole;
use keel_simulation::{NetworkConfig, SimulationRunner, SimulationStats};
use keel_types::test_utils::{test_genesis, test_key, test_producer};
use keel_types::{BlockId, BlockNum};
use std::time::Duration;
use tracing_test::traced_test;

/// Create a basic network configuration for testing.
fn test_network_config() -> NetworkConfig {
    NetworkConfig {
        latency: Duration::from_millis(20),
        jitter_fraction: 0.3,
        packet_loss_rate: 0.02,
        ..Default::default()
    }
}

fn runner(seed: u64) -> SimulationRunner {
    let keys: Vec<_> = (0..4).map(test_key).collect();
    let roles = (0..4)
        .map(|i| NodeRole::producer(test_producer(i)).with_finalizer(test_key(i)))
        .collect();
    SimulationRunner::new(
        test_genesis(4, &keys),
        roles,
        BftConfig::default(),
        test_network_config(),
        seed,
    )
}

/// Everything observable about a finished run.
#[derive(Debug, PartialEq)]
struct Outcome {
    stats: SimulationStats,
    libs: Vec<Option<BlockNum>>,
    heads: Vec<Option<BlockId>>,
    notifications: Vec<Vec<(Duration, Notification)>>,
}

fn outcome(runner: &SimulationRunner) -> Outcome {
    let nodes = 0..runner.num_nodes() as u32;
    Outcome {
        stats: runner.stats().clone(),
        libs: nodes.clone().map(|n| runner.lib(n)).collect(),
        heads: nodes
            .clone()
            .map(|n| runner.node(n).map(|node| node.bft().head().id()))
            .collect(),
        notifications: nodes.map(|n| runner.notifications(n).to_vec()).collect(),
    }
}

/// A scenario with crashes, partitions and operator events.
fn eventful_run(seed: u64) -> Outcome {
    let mut runner = runner(seed);
    runner
        .network_mut()
        .slow_link(0, 2, Duration::from_millis(150));
    runner.initialize();
    runner.run_for(Duration::from_secs(5));

    runner.kill_node(3);
    runner.network_mut().partition_bidirectional(0, 1);
    runner.run_for(Duration::from_secs(4));

    runner.network_mut().heal_all();
    runner.relaunch_node(3);
    runner.schedule_initial_event(2, Duration::from_millis(300), Event::PauseProduction);
    runner.schedule_initial_event(2, Duration::from_secs(3), Event::ResumeProduction);
    runner.run_for(Duration::from_secs(10));
    outcome(&runner)
}

#[traced_test]
#[test]
fn test_simulation_runner_creation() {
    let runner = runner(42);
    assert_eq!(runner.num_nodes(), 4);
    assert!(runner.node(0).is_some());
    assert!(runner.node(3).is_some());
    assert!(runner.node(4).is_none());
    assert_eq!(runner.stats(), &SimulationStats::default());
}

#[test]
fn test_same_seed_same_outcome() {
    let first = eventful_run(12345);
    let second = eventful_run(12345);
    assert_eq!(first.stats, second.stats);
    assert_eq!(first.libs, second.libs);
    assert_eq!(first.heads, second.heads);
    assert_eq!(first.notifications, second.notifications);
    assert!(first.stats.events_processed > 0);
    assert!(first.libs.iter().all(|lib| lib.is_some_and(|l| l > 1)));
}

#[test]
fn test_different_seeds_diverge_in_timing() {
    let a = eventful_run(1);
    let b = eventful_run(2);
    // Jitter and loss draw from the seed, so message timing differs even
    // though both runs finalize.
    assert_ne!(a.notifications, b.notifications);
    assert!(a.libs.iter().chain(&b.libs).all(|lib| lib.is_some_and(|l| l > 1)));
}

#[test]
fn test_events_by_priority_sum_to_total() {
    let mut runner = runner(7);
    runner.initialize();
    runner.run_for(Duration::from_secs(3));
    let stats = runner.stats();
    assert_eq!(
        stats.events_by_priority.iter().sum::<u64>(),
        stats.events_processed
    );
    let [internal, timer, network, client] = stats.events_by_priority;
    assert!(internal > 0 && timer > 0 && network > 0);
    assert_eq!(client, 0);
    assert!(stats.delivery_rate() > 0.9);
}
