//! End-to-end tests for the production runner.
//!
//! Runners are wired through the in-process transport and use real RocksDB
//! storage and safety files in temp directories. Block production follows
//! the wall clock, so these tests take a few seconds each. All tests use
//! `#[serial]` to keep them from competing for CPU.

use keel_bft::BftConfig;
use keel_core::{NodeIndex, Notification, OutboundMessage};
use keel_node::NodeRole;
use keel_production::network::{LocalNetwork, Transport};
use keel_production::{
    load_snapshot, ProductionRunner, RocksDbStorage, RunnerError, RunnerHandle, ShutdownHandle,
    ThreadPoolConfig, ThreadPoolManager, SAFETY_FILE_NAME,
};
use keel_types::test_utils::{test_genesis, test_key, test_producer};
use keel_types::{BlockNum, Genesis};
use serial_test::serial;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::info;

const FINALITY_TIMEOUT: Duration = Duration::from_secs(30);

struct TestNode {
    handle: RunnerHandle,
    shutdown: ShutdownHandle,
    task: JoinHandle<Result<(), RunnerError>>,
}

impl TestNode {
    async fn stop(self) {
        self.shutdown.shutdown();
        self.task.await.unwrap().unwrap();
    }
}

fn pools() -> Arc<ThreadPoolManager> {
    Arc::new(ThreadPoolManager::new(ThreadPoolConfig::minimal()).unwrap())
}

fn build_runner(
    index: NodeIndex,
    role: NodeRole,
    genesis: &Genesis,
    dir: &Path,
    network: &Arc<LocalNetwork>,
) -> Result<ProductionRunner, RunnerError> {
    let storage = RocksDbStorage::open(dir.join("db"))?;
    let inbound_rx = network.register(index)?;
    ProductionRunner::builder()
        .node_index(index)
        .role(role)
        .genesis(genesis.clone())
        .bft_config(BftConfig::default())
        .storage(Arc::new(storage))
        .data_dir(dir)
        .thread_pools(pools())
        .network(network.clone(), inbound_rx)
        .build()
}

fn start(mut runner: ProductionRunner) -> TestNode {
    let handle = runner.handle();
    let shutdown = runner.shutdown_handle().unwrap();
    let task = tokio::spawn(runner.run());
    TestNode {
        handle,
        shutdown,
        task,
    }
}

async fn wait_for_lib(handle: &RunnerHandle, min: BlockNum) -> BlockNum {
    timeout(FINALITY_TIMEOUT, async {
        loop {
            let lib = handle.status().lib_block_num;
            if lib >= min {
                return lib;
            }
            sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("LIB did not reach {min}: {:?}", handle.status().lib_block_num))
}

// ============================================================================
// Finality
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn test_four_nodes_reach_finality() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let keys: Vec<_> = (0..4).map(test_key).collect();
    let genesis = test_genesis(4, &keys);
    let network = Arc::new(LocalNetwork::new(4096));
    let dirs: Vec<_> = (0..4).map(|_| TempDir::new().unwrap()).collect();

    let mut nodes = Vec::new();
    for i in 0..4u8 {
        let role = NodeRole::producer(test_producer(i)).with_finalizer(test_key(i));
        let runner = build_runner(
            i as NodeIndex,
            role,
            &genesis,
            dirs[i as usize].path(),
            &network,
        )
        .unwrap();
        nodes.push(start(runner));
    }

    let mut irreversible = nodes[3].handle.subscribe();
    let lib = wait_for_lib(&nodes[0].handle, 4).await;
    info!(lib, "Node 0 reached finality");

    for node in &nodes[1..] {
        wait_for_lib(&node.handle, 4).await;
    }

    // Every node agrees on the finalized block id.
    let id = |handle: &RunnerHandle, num: BlockNum| {
        let status = handle.status();
        (status.lib_block_num == num).then_some(status.lib_block_id)
    };
    let reference = nodes[0].handle.status();
    for node in &nodes[1..] {
        if let Some(other) = id(&node.handle, reference.lib_block_num) {
            assert_eq!(other, reference.lib_block_id);
        }
    }

    let saw_irreversible = timeout(FINALITY_TIMEOUT, async {
        loop {
            if let Ok(Notification::IrreversibleBlock { .. }) = irreversible.recv().await {
                return;
            }
        }
    })
    .await;
    assert!(saw_irreversible.is_ok());

    for node in nodes {
        node.stop().await;
    }
}

// ============================================================================
// Persistence
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn test_restart_recovers_chain_and_safety() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let genesis = test_genesis(1, &[test_key(0)]);
    let dir = TempDir::new().unwrap();
    let role = || NodeRole::producer(test_producer(0)).with_finalizer(test_key(0));

    let network = Arc::new(LocalNetwork::new(256));
    let node = start(build_runner(0, role(), &genesis, dir.path(), &network).unwrap());
    let lib_before = wait_for_lib(&node.handle, 4).await;
    node.stop().await;
    assert!(dir.path().join(SAFETY_FILE_NAME).exists());

    let network = Arc::new(LocalNetwork::new(256));
    let runner = build_runner(0, role(), &genesis, dir.path(), &network).unwrap();
    let bft = runner.state().bft();
    assert!(bft.lib() >= lib_before);
    assert!(bft.head().block_num() >= bft.lib());
    assert!(!runner.state().chain_status().voting_halted);

    // The restarted node keeps finalizing on top of what it recovered.
    let node = start(runner);
    wait_for_lib(&node.handle, lib_before + 2).await;
    node.stop().await;
}

#[tokio::test]
#[serial]
async fn test_corrupt_safety_file_blocks_finalizer_start() {
    let genesis = test_genesis(1, &[test_key(0)]);
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join(SAFETY_FILE_NAME), b"definitely not a safety file").unwrap();

    let network = Arc::new(LocalNetwork::new(16));
    let result = build_runner(
        0,
        NodeRole::finalizer(test_key(0)),
        &genesis,
        dir.path(),
        &network,
    );
    assert!(matches!(result, Err(RunnerError::SafetyCorrupt(_))));

    // A node without finalizer keys has nothing to protect.
    let network = Arc::new(LocalNetwork::new(16));
    let result = build_runner(
        0,
        NodeRole::producer(test_producer(0)),
        &genesis,
        dir.path(),
        &network,
    );
    assert!(result.is_ok());
}

#[tokio::test]
#[serial]
async fn test_chain_id_mismatch_rejected() {
    let dir = TempDir::new().unwrap();
    let network = Arc::new(LocalNetwork::new(16));
    let first = test_genesis(1, &[test_key(0)]);
    drop(build_runner(0, NodeRole::default(), &first, dir.path(), &network).unwrap());

    let network = Arc::new(LocalNetwork::new(16));
    let second = test_genesis(2, &[test_key(0)]);
    let result = build_runner(0, NodeRole::default(), &second, dir.path(), &network);
    assert!(matches!(result, Err(RunnerError::Storage(_))));
}

// ============================================================================
// Snapshots
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn test_snapshot_bootstraps_fresh_node() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let genesis = test_genesis(1, &[test_key(0)]);
    let dir = TempDir::new().unwrap();
    let network = Arc::new(LocalNetwork::new(256));
    let role = NodeRole::producer(test_producer(0)).with_finalizer(test_key(0));
    let node = start(build_runner(0, role, &genesis, dir.path(), &network).unwrap());

    wait_for_lib(&node.handle, 3).await;
    let path = node.handle.create_snapshot().await.unwrap();
    node.stop().await;

    let snapshot = load_snapshot(&path).unwrap();
    assert!(snapshot.header.head_block_num >= 3);
    assert_eq!(snapshot.header.chain_id, genesis.chain_id());

    let fresh = TempDir::new().unwrap();
    let storage = RocksDbStorage::open(fresh.path().join("db")).unwrap();
    let network = Arc::new(LocalNetwork::new(16));
    let inbound_rx = network.register(1).unwrap();
    let runner = ProductionRunner::builder()
        .node_index(1)
        .genesis(genesis.clone())
        .storage(Arc::new(storage))
        .data_dir(fresh.path())
        .snapshot(snapshot.clone())
        .thread_pools(pools())
        .network(network.clone(), inbound_rx)
        .build()
        .unwrap();

    assert_eq!(runner.state().bft().lib(), snapshot.header.head_block_num);
    assert_eq!(
        runner.state().bft().head().block_num(),
        snapshot.header.head_block_num
    );
}

#[tokio::test]
#[serial]
async fn test_snapshot_from_other_chain_refuses_start() {
    let network = Arc::new(LocalNetwork::new(16));
    let other_dir = TempDir::new().unwrap();
    let other = test_genesis(2, &[test_key(0)]);
    let runner = build_runner(0, NodeRole::default(), &other, other_dir.path(), &network).unwrap();
    let snapshot = runner.state().bft().snapshot();
    drop(runner);

    let genesis = test_genesis(1, &[test_key(0)]);
    let dir = TempDir::new().unwrap();
    let storage = RocksDbStorage::open(dir.path().join("db")).unwrap();
    let inbound_rx = network.register(1).unwrap();
    let result = ProductionRunner::builder()
        .node_index(1)
        .role(NodeRole::finalizer(test_key(0)))
        .genesis(genesis)
        .storage(Arc::new(storage))
        .data_dir(dir.path())
        .snapshot(snapshot)
        .thread_pools(pools())
        .network(network.clone(), inbound_rx)
        .build();
    assert!(matches!(result, Err(RunnerError::SnapshotRejected(_))));
}

// ============================================================================
// Sync
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn test_sync_request_served_from_log_and_fork_db() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let genesis = test_genesis(1, &[test_key(0)]);
    let dir = TempDir::new().unwrap();
    let network = Arc::new(LocalNetwork::new(4096));
    let role = NodeRole::producer(test_producer(0)).with_finalizer(test_key(0));
    let node = start(build_runner(0, role, &genesis, dir.path(), &network).unwrap());
    wait_for_lib(&node.handle, 3).await;

    // A bare peer asks for blocks 1..=4; 4 may still be reversible.
    let mut peer_rx = network.register(9).unwrap();
    network
        .send_to(
            9,
            0,
            &OutboundMessage::SyncRequest {
                from_num: 1,
                to_num: 4,
            },
        )
        .unwrap();

    let wanted: BTreeSet<BlockNum> = (1..=4).collect();
    let received = timeout(FINALITY_TIMEOUT, async {
        let mut seen = BTreeSet::new();
        while let Some(inbound) = peer_rx.recv().await {
            if let OutboundMessage::Block(block) = inbound.message {
                seen.insert(block.block_num());
                if wanted.is_subset(&seen) {
                    break;
                }
            }
        }
        seen
    })
    .await
    .unwrap();
    assert!(wanted.is_subset(&received));

    node.stop().await;
}
