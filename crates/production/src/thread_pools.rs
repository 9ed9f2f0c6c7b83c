//! Thread pool management for production deployment.
//!
//! Two workload types run off the state machine thread:
//!
//! - **Vote pool** (rayon, "vote-threads"): BLS signature verification of
//!   incoming votes
//! - **Async I/O** (tokio): network, storage, timers
//!
//! # Example
//!
//! ```no_run
//! use keel_production::{ThreadPoolConfig, ThreadPoolManager};
//!
//! let config = ThreadPoolConfig::builder()
//!     .vote_threads(4)
//!     .io_threads(2)
//!     .build()
//!     .unwrap();
//! let manager = ThreadPoolManager::new(config).unwrap();
//! ```

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Errors from thread pool configuration.
#[derive(Debug, Error)]
pub enum ThreadPoolError {
    #[error("Failed to build thread pool: {0}")]
    BuildError(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Configuration for production thread pools.
#[derive(Debug, Clone)]
pub struct ThreadPoolConfig {
    /// Threads verifying vote signatures.
    pub vote_threads: usize,

    /// Worker threads of the tokio runtime.
    pub io_threads: usize,

    /// Stack size for vote threads (bytes).
    pub vote_stack_size: usize,
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        Self::auto()
    }
}

impl ThreadPoolConfig {
    /// Configure based on available CPU cores.
    pub fn auto() -> Self {
        let available = std::thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(4);
        Self::for_core_count(available)
    }

    /// One core is left for the state machine; the rest is split evenly
    /// between vote verification and I/O.
    pub fn for_core_count(total_cores: usize) -> Self {
        let remaining = total_cores.saturating_sub(1).max(2);
        let vote = (remaining / 2).max(1);
        let io = remaining.saturating_sub(vote).max(1);
        Self {
            vote_threads: vote,
            io_threads: io,
            vote_stack_size: 2 * 1024 * 1024,
        }
    }

    pub fn builder() -> ThreadPoolConfigBuilder {
        ThreadPoolConfigBuilder::new()
    }

    /// One thread per pool, for tests.
    pub fn minimal() -> Self {
        Self {
            vote_threads: 1,
            io_threads: 1,
            vote_stack_size: 2 * 1024 * 1024,
        }
    }

    pub fn total_threads(&self) -> usize {
        self.vote_threads + self.io_threads
    }

    pub fn validate(&self) -> Result<(), ThreadPoolError> {
        if self.vote_threads == 0 {
            return Err(ThreadPoolError::InvalidConfig(
                "vote_threads must be at least 1".to_string(),
            ));
        }
        if self.io_threads == 0 {
            return Err(ThreadPoolError::InvalidConfig(
                "io_threads must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for ThreadPoolConfig.
#[derive(Debug, Clone)]
pub struct ThreadPoolConfigBuilder {
    config: ThreadPoolConfig,
}

impl ThreadPoolConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ThreadPoolConfig::auto(),
        }
    }

    pub fn vote_threads(mut self, count: usize) -> Self {
        self.config.vote_threads = count;
        self
    }

    pub fn io_threads(mut self, count: usize) -> Self {
        self.config.io_threads = count;
        self
    }

    pub fn vote_stack_size(mut self, size: usize) -> Self {
        self.config.vote_stack_size = size;
        self
    }

    pub fn build(self) -> Result<ThreadPoolConfig, ThreadPoolError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for ThreadPoolConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Owns the vote verification pool and sizes the tokio runtime.
pub struct ThreadPoolManager {
    config: ThreadPoolConfig,
    vote_pool: rayon::ThreadPool,
    /// Queued and running verification tasks (for metrics).
    vote_pending: Arc<AtomicUsize>,
}

impl ThreadPoolManager {
    pub fn new(config: ThreadPoolConfig) -> Result<Self, ThreadPoolError> {
        config.validate()?;
        let vote_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.vote_threads)
            .stack_size(config.vote_stack_size)
            .thread_name(|i| format!("vote-{}", i))
            .build()
            .map_err(|e| ThreadPoolError::BuildError(e.to_string()))?;

        tracing::info!(
            vote_threads = config.vote_threads,
            io_threads = config.io_threads,
            "Thread pools initialized"
        );

        Ok(Self {
            config,
            vote_pool,
            vote_pending: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn auto() -> Result<Self, ThreadPoolError> {
        Self::new(ThreadPoolConfig::auto())
    }

    pub fn config(&self) -> &ThreadPoolConfig {
        &self.config
    }

    pub fn io_threads(&self) -> usize {
        self.config.io_threads
    }

    /// Build a tokio runtime with the configured I/O threads.
    pub fn build_tokio_runtime(&self) -> Result<tokio::runtime::Runtime, ThreadPoolError> {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(self.config.io_threads)
            .thread_name("io")
            .enable_all()
            .build()
            .map_err(|e| ThreadPoolError::BuildError(e.to_string()))
    }

    /// Run `f` on the vote pool. Returns immediately.
    pub fn spawn_vote<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.vote_pending.fetch_add(1, Ordering::Relaxed);
        let pending = self.vote_pending.clone();
        self.vote_pool.spawn(move || {
            f();
            pending.fetch_sub(1, Ordering::Relaxed);
        });
    }

    pub fn vote_queue_depth(&self) -> usize {
        self.vote_pending.load(Ordering::Relaxed)
    }
}
