//! BFT configuration.

use std::time::Duration;

/// Configuration for the finality engine.
///
/// `commit_chain_length` is a protocol parameter and must match across the
/// network. Everything else is local policy.
#[derive(Debug, Clone)]
pub struct BftConfig {
    /// Number of QC-linked blocks needed to finalize (2 = two-chain rule).
    pub commit_chain_length: u32,

    /// Pause production while `head - lib` exceeds this. 0 disables.
    pub max_reversible_blocks: u32,

    /// Pause production when no votes arrived and LIB did not move for this
    /// long. Zero disables.
    pub production_pause_vote_timeout: Duration,

    /// Maximum number of blocks requested in one sync request; also the
    /// bound on consecutive unlinkable blocks kept in the orphan pool.
    pub sync_fetch_span: u32,

    /// Votes for unknown blocks more than this far above head are dropped.
    pub vote_buffer_horizon: u32,

    /// Maximum buffered votes per connection.
    pub max_buffered_votes_per_connection: usize,

    /// Maximum buffered votes overall.
    pub max_buffered_votes: usize,

    /// Interval of the cleanup timer (vote buffer and orphan pool sweep).
    pub cleanup_interval: Duration,
}

impl Default for BftConfig {
    fn default() -> Self {
        Self {
            commit_chain_length: 2,
            max_reversible_blocks: 3600,
            production_pause_vote_timeout: Duration::from_secs(6),
            sync_fetch_span: 100,
            vote_buffer_horizon: 120,
            max_buffered_votes_per_connection: 2500,
            max_buffered_votes: 25_000,
            cleanup_interval: Duration::from_secs(1),
        }
    }
}

impl BftConfig {
    /// Create a new BFT configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_commit_chain_length(mut self, length: u32) -> Self {
        self.commit_chain_length = length.max(2);
        self
    }

    pub fn with_max_reversible_blocks(mut self, blocks: u32) -> Self {
        self.max_reversible_blocks = blocks;
        self
    }

    pub fn with_production_pause_vote_timeout(mut self, timeout: Duration) -> Self {
        self.production_pause_vote_timeout = timeout;
        self
    }

    pub fn with_sync_fetch_span(mut self, span: u32) -> Self {
        self.sync_fetch_span = span.max(1);
        self
    }

    pub fn with_vote_buffer_horizon(mut self, horizon: u32) -> Self {
        self.vote_buffer_horizon = horizon;
        self
    }

    pub fn with_vote_buffer_limits(mut self, per_connection: usize, total: usize) -> Self {
        self.max_buffered_votes_per_connection = per_connection;
        self.max_buffered_votes = total;
        self
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_chain_length_floor() {
        let config = BftConfig::new().with_commit_chain_length(1);
        assert_eq!(config.commit_chain_length, 2);
        let config = BftConfig::new().with_commit_chain_length(3);
        assert_eq!(config.commit_chain_length, 3);
    }
}
