//! Keel devnet node.
//!
//! Runs a local network of consensus nodes in one process. Each node has its
//! own RocksDB block store, safety file and snapshot directory; nodes talk
//! through the in-process transport.
//!
//! # Usage
//!
//! ```bash
//! # Four nodes with defaults
//! keel-node --nodes 4
//!
//! # Configuration file with overrides
//! keel-node --config devnet.toml --data-dir /var/lib/keel --metrics-port 9100
//!
//! # Start every node from a snapshot
//! keel-node --config devnet.toml --snapshot ./snapshot-0000001200.bin
//! ```
//!
//! # Configuration
//!
//! ```toml
//! [devnet]
//! nodes = 4
//! data_dir = "./keel-data"
//! key_seed = "keel-devnet"
//!
//! [genesis]
//! initial_timestamp = 0
//! finality = true
//!
//! [consensus]
//! commit_chain_length = 2
//! max_reversible_blocks = 3600
//! production_pause_vote_timeout_ms = 6000
//!
//! [threads]
//! vote_threads = 2
//! io_threads = 2
//!
//! [metrics]
//! enabled = true
//! port = 9090
//!
//! [logging]
//! format = "json"
//! ```

use anyhow::{bail, Context, Result};
use clap::Parser;
use keel_bft::BftConfig;
use keel_node::NodeRole;
use keel_production::network::LocalNetwork;
use keel_production::telemetry::LogFormat;
use keel_production::{
    init_telemetry, load_snapshot, ProductionRunner, RocksDbConfig, RocksDbStorage, RunnerHandle,
    ShutdownHandle, TelemetryConfig, ThreadPoolConfig, ThreadPoolManager,
};
use keel_types::{
    BlockTimestamp, FinalizerAuthority, FinalizerPolicy, Genesis, KeyPair, ProducerName,
};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Keel Devnet Node
///
/// Runs a local instant-finality network.
#[derive(Parser, Debug)]
#[command(name = "keel-node")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Root data directory (overrides config)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Number of nodes (overrides config)
    #[arg(long)]
    nodes: Option<usize>,

    /// Metrics port; enables the metrics endpoint (overrides config)
    #[arg(long)]
    metrics_port: Option<u16>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    /// Snapshot file every node starts from
    #[arg(long)]
    snapshot: Option<PathBuf>,

    /// Write a snapshot from node 0 at this interval in seconds
    #[arg(long)]
    snapshot_interval_secs: Option<u64>,
}

/// Top-level devnet configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct DevnetConfig {
    #[serde(default)]
    pub devnet: NodesConfig,

    #[serde(default)]
    pub genesis: GenesisConfig,

    #[serde(default)]
    pub consensus: ConsensusConfig,

    #[serde(default)]
    pub threads: ThreadsConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Network shape and key material.
#[derive(Debug, Clone, Deserialize)]
pub struct NodesConfig {
    /// Nodes in the devnet; each one produces and finalizes.
    #[serde(default = "default_nodes")]
    pub nodes: usize,

    /// Root directory; node `i` uses `<data_dir>/node-<i>`.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Finalizer keys are derived from this seed and the node index.
    #[serde(default = "default_key_seed")]
    pub key_seed: String,

    /// Inbound queue capacity per node.
    #[serde(default = "default_inbound_capacity")]
    pub inbound_capacity: usize,
}

impl Default for NodesConfig {
    fn default() -> Self {
        Self {
            nodes: default_nodes(),
            data_dir: default_data_dir(),
            key_seed: default_key_seed(),
            inbound_capacity: default_inbound_capacity(),
        }
    }
}

fn default_nodes() -> usize {
    4
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./keel-data")
}

fn default_key_seed() -> String {
    "keel-devnet".to_string()
}

fn default_inbound_capacity() -> usize {
    10_000
}

/// Genesis parameters. Changing any of them changes the chain id.
#[derive(Debug, Clone, Deserialize)]
pub struct GenesisConfig {
    /// Genesis time in 500ms slots since the unix epoch.
    #[serde(default)]
    pub initial_timestamp: u32,

    /// Start with a finalizer policy over all nodes. When false, the chain
    /// runs without finality until a policy is proposed.
    #[serde(default = "default_finality")]
    pub finality: bool,
}

impl Default for GenesisConfig {
    fn default() -> Self {
        Self {
            initial_timestamp: 0,
            finality: default_finality(),
        }
    }
}

fn default_finality() -> bool {
    true
}

/// Consensus configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ConsensusConfig {
    #[serde(default = "default_commit_chain_length")]
    pub commit_chain_length: u32,

    /// 0 disables the reversible-blocks pause.
    #[serde(default = "default_max_reversible_blocks")]
    pub max_reversible_blocks: u32,

    /// 0 disables the vote timeout pause.
    #[serde(default = "default_production_pause_vote_timeout_ms")]
    pub production_pause_vote_timeout_ms: u64,

    #[serde(default = "default_sync_fetch_span")]
    pub sync_fetch_span: u32,

    #[serde(default = "default_vote_buffer_horizon")]
    pub vote_buffer_horizon: u32,

    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            commit_chain_length: default_commit_chain_length(),
            max_reversible_blocks: default_max_reversible_blocks(),
            production_pause_vote_timeout_ms: default_production_pause_vote_timeout_ms(),
            sync_fetch_span: default_sync_fetch_span(),
            vote_buffer_horizon: default_vote_buffer_horizon(),
            cleanup_interval_ms: default_cleanup_interval_ms(),
        }
    }
}

fn default_commit_chain_length() -> u32 {
    2
}

fn default_max_reversible_blocks() -> u32 {
    3600
}

fn default_production_pause_vote_timeout_ms() -> u64 {
    6000
}

fn default_sync_fetch_span() -> u32 {
    100
}

fn default_vote_buffer_horizon() -> u32 {
    120
}

fn default_cleanup_interval_ms() -> u64 {
    1000
}

/// Thread pool configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ThreadsConfig {
    /// Number of vote verification threads (0 = auto)
    #[serde(default)]
    pub vote_threads: usize,

    /// Number of I/O threads (0 = auto)
    #[serde(default)]
    pub io_threads: usize,
}

/// Storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_max_background_jobs")]
    pub max_background_jobs: i32,

    #[serde(default = "default_write_buffer_mb")]
    pub write_buffer_mb: usize,

    /// Block cache size in MB (0 to disable)
    #[serde(default = "default_block_cache_mb")]
    pub block_cache_mb: usize,

    /// fsync the WAL on every block write.
    #[serde(default = "default_sync_writes")]
    pub sync_writes: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_background_jobs: default_max_background_jobs(),
            write_buffer_mb: default_write_buffer_mb(),
            block_cache_mb: default_block_cache_mb(),
            sync_writes: default_sync_writes(),
        }
    }
}

fn default_max_background_jobs() -> i32 {
    2
}

fn default_write_buffer_mb() -> usize {
    16
}

fn default_block_cache_mb() -> usize {
    32
}

fn default_sync_writes() -> bool {
    true
}

/// Metrics configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

fn default_metrics_port() -> u16 {
    9090
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is unset.
    #[serde(default = "default_filter")]
    pub filter: String,

    /// "pretty" or "json".
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
            format: default_log_format(),
        }
    }
}

fn default_filter() -> String {
    "info,keel=debug".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl DevnetConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Apply CLI overrides to the configuration.
    fn apply_overrides(&mut self, cli: &Cli) {
        if let Some(ref data_dir) = cli.data_dir {
            self.devnet.data_dir = data_dir.clone();
        }

        if let Some(nodes) = cli.nodes {
            self.devnet.nodes = nodes;
        }

        if let Some(port) = cli.metrics_port {
            self.metrics.enabled = true;
            self.metrics.port = port;
        }

        if cli.json_logs {
            self.logging.format = "json".to_string();
        }
    }
}

/// Finalizer key of node `index`, derived from the devnet seed.
fn derive_finalizer_key(seed: &str, index: usize) -> KeyPair {
    let digest = blake3::hash(format!("{seed}/finalizer/{index}").as_bytes());
    KeyPair::from_seed(digest.as_bytes())
}

fn producer_name(index: usize) -> ProducerName {
    ProducerName::new(format!("node-{index}"))
}

/// Build the genesis shared by every node.
fn build_genesis(config: &DevnetConfig, keys: &[KeyPair]) -> Genesis {
    let initial_finalizer_policy = config.genesis.finality.then(|| {
        let finalizers = keys
            .iter()
            .enumerate()
            .map(|(i, key)| FinalizerAuthority {
                description: format!("node-{i}"),
                weight: 1,
                public_key: key.public_key(),
            })
            .collect();
        FinalizerPolicy::with_two_thirds_threshold(1, finalizers)
    });

    Genesis {
        initial_timestamp: BlockTimestamp(config.genesis.initial_timestamp),
        initial_producers: (0..config.devnet.nodes).map(producer_name).collect(),
        initial_finalizer_policy,
    }
}

/// Build thread pool configuration from TOML config.
fn build_thread_pool_config(config: &ThreadsConfig) -> Result<ThreadPoolConfig> {
    let mut builder = ThreadPoolConfig::builder();

    if config.vote_threads > 0 {
        builder = builder.vote_threads(config.vote_threads);
    }
    if config.io_threads > 0 {
        builder = builder.io_threads(config.io_threads);
    }

    builder.build().context("Invalid thread configuration")
}

/// Build BFT configuration from TOML config.
fn build_bft_config(config: &ConsensusConfig) -> BftConfig {
    BftConfig::new()
        .with_commit_chain_length(config.commit_chain_length)
        .with_max_reversible_blocks(config.max_reversible_blocks)
        .with_production_pause_vote_timeout(Duration::from_millis(
            config.production_pause_vote_timeout_ms,
        ))
        .with_sync_fetch_span(config.sync_fetch_span)
        .with_vote_buffer_horizon(config.vote_buffer_horizon)
        .with_cleanup_interval(Duration::from_millis(config.cleanup_interval_ms))
}

/// Build RocksDB configuration from TOML config.
fn build_rocksdb_config(config: &StorageConfig) -> RocksDbConfig {
    RocksDbConfig {
        max_background_jobs: config.max_background_jobs,
        write_buffer_size: config.write_buffer_mb * 1024 * 1024,
        block_cache_size: if config.block_cache_mb > 0 {
            Some(config.block_cache_mb * 1024 * 1024)
        } else {
            None
        },
        sync_writes: config.sync_writes,
        ..RocksDbConfig::default()
    }
}

fn build_telemetry_config(config: &DevnetConfig) -> Result<TelemetryConfig> {
    let log_format = match config.logging.format.as_str() {
        "pretty" => LogFormat::Pretty,
        "json" => LogFormat::Json,
        other => bail!("Unknown log format: {other}"),
    };
    Ok(TelemetryConfig {
        default_filter: config.logging.filter.clone(),
        log_format,
        prometheus_enabled: config.metrics.enabled,
        prometheus_port: config.metrics.port,
    })
}

struct RunningNode {
    handle: RunnerHandle,
    shutdown: Option<ShutdownHandle>,
    task: JoinHandle<()>,
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

/// Tick of an optional interval; pending forever when absent.
async fn next_tick(interval: &mut Option<tokio::time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn run(config: DevnetConfig, cli: Cli, thread_pools: Arc<ThreadPoolManager>) -> Result<()> {
    let telemetry_guard = init_telemetry(&build_telemetry_config(&config)?)?;

    if config.devnet.nodes == 0 {
        bail!("Devnet needs at least one node");
    }

    let keys: Vec<KeyPair> = (0..config.devnet.nodes)
        .map(|i| derive_finalizer_key(&config.devnet.key_seed, i))
        .collect();
    let genesis = build_genesis(&config, &keys);
    info!(
        chain_id = %genesis.chain_id(),
        nodes = config.devnet.nodes,
        finality = config.genesis.finality,
        "Genesis configured"
    );

    let snapshot = match cli.snapshot {
        Some(ref path) => {
            let snapshot = load_snapshot(path)
                .with_context(|| format!("Failed to load snapshot: {}", path.display()))?;
            if snapshot.header.chain_id != genesis.chain_id() {
                bail!(
                    "Snapshot {} is for chain {}, devnet runs {}",
                    path.display(),
                    snapshot.header.chain_id,
                    genesis.chain_id()
                );
            }
            info!(
                path = %path.display(),
                block_num = snapshot.header.head_block_num,
                "Starting from snapshot"
            );
            Some(snapshot)
        }
        None => None,
    };

    let bft_config = build_bft_config(&config.consensus);
    let rocksdb_config = build_rocksdb_config(&config.storage);
    let network = Arc::new(LocalNetwork::new(config.devnet.inbound_capacity));

    let mut nodes = Vec::with_capacity(config.devnet.nodes);
    for (index, key) in keys.into_iter().enumerate() {
        let data_dir = config.devnet.data_dir.join(format!("node-{index}"));
        fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data dir: {}", data_dir.display()))?;

        let db_path = data_dir.join("db");
        let storage = RocksDbStorage::open_with_config(&db_path, rocksdb_config.clone())
            .with_context(|| format!("Failed to open database at {}", db_path.display()))?;

        let inbound_rx = network.register(index as u32)?;
        let mut builder = ProductionRunner::builder()
            .node_index(index as u32)
            .role(NodeRole::producer(producer_name(index)).with_finalizer(key))
            .genesis(genesis.clone())
            .bft_config(bft_config.clone())
            .storage(Arc::new(storage))
            .data_dir(&data_dir)
            .thread_pools(thread_pools.clone())
            .network(network.clone(), inbound_rx);
        if let Some(ref snapshot) = snapshot {
            builder = builder.snapshot(snapshot.clone());
        }

        let mut runner = builder
            .build()
            .with_context(|| format!("Failed to create runner for node {index}"))?;
        let handle = runner.handle();
        let shutdown = runner.shutdown_handle();
        let task = tokio::spawn(async move {
            if let Err(e) = runner.run().await {
                error!(node = index, error = %e, "Runner stopped with error");
            }
        });
        nodes.push(RunningNode {
            handle,
            shutdown,
            task,
        });
    }

    telemetry_guard.set_ready(true);
    info!("Devnet started, press Ctrl+C to stop");

    let observer = nodes[0].handle.clone();
    let mut status_tick = tokio::time::interval(Duration::from_secs(5));
    let snapshot_period = cli.snapshot_interval_secs.map(|secs| Duration::from_secs(secs.max(1)));
    let mut snapshot_tick = snapshot_period.map(|period| {
        tokio::time::interval_at(tokio::time::Instant::now() + period, period)
    });

    let shutdown_signal = wait_for_signal();
    tokio::pin!(shutdown_signal);
    loop {
        tokio::select! {
            _ = &mut shutdown_signal => break,

            _ = status_tick.tick() => {
                let status = observer.status();
                info!(
                    head = status.head_block_num,
                    lib = status.lib_block_num,
                    "Chain status"
                );
            }

            _ = next_tick(&mut snapshot_tick) => {
                match observer.create_snapshot().await {
                    Ok(path) => info!(path = %path.display(), "Periodic snapshot written"),
                    Err(e) => warn!(error = %e, "Periodic snapshot failed"),
                }
            }
        }
    }

    info!("Initiating graceful shutdown...");
    telemetry_guard.set_ready(false);
    for node in &mut nodes {
        if let Some(shutdown) = node.shutdown.take() {
            shutdown.shutdown();
        }
    }
    for node in nodes {
        if let Err(e) = node.task.await {
            warn!(error = %e, "Runner task failed to join");
        }
    }

    telemetry_guard.shutdown();
    info!("Devnet shutdown complete");
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match cli.config {
        Some(ref path) => DevnetConfig::load(path)?,
        None => DevnetConfig::default(),
    };
    config.apply_overrides(&cli);

    let thread_pools = Arc::new(
        ThreadPoolManager::new(build_thread_pool_config(&config.threads)?)
            .context("Failed to initialize thread pools")?,
    );
    let runtime = thread_pools
        .build_tokio_runtime()
        .context("Failed to build tokio runtime")?;

    runtime.block_on(run(config, cli, thread_pools))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_and_overrides() {
        let mut config: DevnetConfig = toml::from_str(
            r#"
            [devnet]
            nodes = 3

            [consensus]
            max_reversible_blocks = 50
            "#,
        )
        .unwrap();
        assert_eq!(config.devnet.nodes, 3);
        assert_eq!(config.consensus.max_reversible_blocks, 50);
        assert_eq!(config.consensus.commit_chain_length, 2);
        assert!(config.genesis.finality);
        assert!(!config.metrics.enabled);

        let cli = Cli::parse_from(["keel-node", "--nodes", "5", "--metrics-port", "9100"]);
        config.apply_overrides(&cli);
        assert_eq!(config.devnet.nodes, 5);
        assert!(config.metrics.enabled);
        assert_eq!(config.metrics.port, 9100);
    }

    #[test]
    fn test_genesis_is_stable() {
        let config = DevnetConfig::default();
        let keys: Vec<_> = (0..4)
            .map(|i| derive_finalizer_key(&config.devnet.key_seed, i))
            .collect();
        let a = build_genesis(&config, &keys);
        let b = build_genesis(&config, &keys);
        assert_eq!(a.chain_id(), b.chain_id());
        assert_eq!(a.initial_producers.len(), 4);

        let policy = a.initial_finalizer_policy.unwrap();
        assert_eq!(policy.finalizers.len(), 4);
        assert_eq!(policy.threshold, 3);
    }

    #[test]
    fn test_unknown_log_format() {
        let mut config = DevnetConfig::default();
        config.logging.format = "xml".to_string();
        assert!(build_telemetry_config(&config).is_err());
    }
}
