//! Simulated peer links with seeded latency, loss and partitions.
//!
//! Every directed pair of nodes is a link. A link is either up, cut by a
//! partition, or slowed by extra one-way delay. Routing a message through
//! [`SimulatedNetwork::route`] yields a [`Delivery`] decision; only the
//! loss and jitter draws consume the runner's RNG.

use crate::NodeIndex;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeMap;
use std::time::Duration;

/// Configuration for simulated network.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Number of nodes; indices are `0..num_nodes`.
    pub num_nodes: u32,
    /// Base one-way latency of every link.
    pub latency: Duration,
    /// Jitter as a fraction of base latency (0.0 - 1.0).
    pub jitter_fraction: f64,
    /// Probability that a message on an open link is lost.
    pub packet_loss_rate: f64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            num_nodes: 4,
            latency: Duration::from_millis(50),
            jitter_fraction: 0.1,
            packet_loss_rate: 0.0,
        }
    }
}

impl NetworkConfig {
    pub fn with_nodes(num_nodes: u32) -> Self {
        Self {
            num_nodes,
            ..Self::default()
        }
    }
}

/// State of one directed link that differs from the default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Cut,
    Slow(Duration),
}

/// Outcome of routing one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Arrives after this one-way delay.
    After(Duration),
    /// The link is cut by a partition.
    Partitioned,
    /// Lost to random packet loss.
    Lost,
}

/// The links between simulated nodes.
#[derive(Debug)]
pub struct SimulatedNetwork {
    config: NetworkConfig,
    /// Directed links that are cut or slowed. Absent means up at base latency.
    links: BTreeMap<(NodeIndex, NodeIndex), LinkState>,
}

impl SimulatedNetwork {
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            config,
            links: BTreeMap::new(),
        }
    }

    // ─── Partitions ───

    /// Whether messages from `from` to `to` are currently cut.
    pub fn is_partitioned(&self, from: NodeIndex, to: NodeIndex) -> bool {
        self.links.get(&(from, to)) == Some(&LinkState::Cut)
    }

    /// Cut the link from `from` to `to` only.
    pub fn partition_unidirectional(&mut self, from: NodeIndex, to: NodeIndex) {
        self.links.insert((from, to), LinkState::Cut);
    }

    pub fn partition_bidirectional(&mut self, a: NodeIndex, b: NodeIndex) {
        self.partition_unidirectional(a, b);
        self.partition_unidirectional(b, a);
    }

    /// Cut every link between the two groups. Links inside a group stay up.
    pub fn partition_groups(&mut self, group_a: &[NodeIndex], group_b: &[NodeIndex]) {
        for &a in group_a {
            for &b in group_b {
                self.partition_bidirectional(a, b);
            }
        }
    }

    pub fn isolate_node(&mut self, node: NodeIndex) {
        for other in self.all_nodes() {
            if other != node {
                self.partition_bidirectional(node, other);
            }
        }
    }

    pub fn heal_unidirectional(&mut self, from: NodeIndex, to: NodeIndex) {
        if self.is_partitioned(from, to) {
            self.links.remove(&(from, to));
        }
    }

    pub fn heal_bidirectional(&mut self, a: NodeIndex, b: NodeIndex) {
        self.heal_unidirectional(a, b);
        self.heal_unidirectional(b, a);
    }

    /// Reconnect every cut link. Slow links keep their extra delay.
    pub fn heal_all(&mut self) {
        self.links.retain(|_, state| *state != LinkState::Cut);
    }

    /// Number of cut directed links.
    pub fn partition_count(&self) -> usize {
        self.links
            .values()
            .filter(|state| **state == LinkState::Cut)
            .count()
    }

    // ─── Link delay ───

    /// Add `extra` one-way delay to both directions between `a` and `b`.
    /// A cut link stays cut.
    pub fn slow_link(&mut self, a: NodeIndex, b: NodeIndex, extra: Duration) {
        for key in [(a, b), (b, a)] {
            if self.links.get(&key) != Some(&LinkState::Cut) {
                self.links.insert(key, LinkState::Slow(extra));
            }
        }
    }

    fn extra_delay(&self, from: NodeIndex, to: NodeIndex) -> Duration {
        match self.links.get(&(from, to)) {
            Some(LinkState::Slow(extra)) => *extra,
            _ => Duration::ZERO,
        }
    }

    // ─── Loss ───

    pub fn should_drop_packet(&self, rng: &mut ChaCha8Rng) -> bool {
        self.config.packet_loss_rate > 0.0 && rng.gen::<f64>() < self.config.packet_loss_rate
    }

    /// Set the loss rate, clamped to `0.0..=1.0`.
    pub fn set_packet_loss_rate(&mut self, rate: f64) {
        self.config.packet_loss_rate = rate.clamp(0.0, 1.0);
    }

    pub fn packet_loss_rate(&self) -> f64 {
        self.config.packet_loss_rate
    }

    // ─── Routing ───

    /// Decide the fate of one message from `from` to `to`.
    ///
    /// A cut link is checked before any RNG draw, so partitions do not
    /// shift the random sequence of the rest of the run.
    pub fn route(&self, from: NodeIndex, to: NodeIndex, rng: &mut ChaCha8Rng) -> Delivery {
        if self.is_partitioned(from, to) {
            return Delivery::Partitioned;
        }
        if self.should_drop_packet(rng) {
            return Delivery::Lost;
        }
        Delivery::After(self.sample_latency(rng) + self.extra_delay(from, to))
    }

    /// Base latency with jitter, at least one millisecond.
    pub fn sample_latency(&self, rng: &mut ChaCha8Rng) -> Duration {
        let base = self.config.latency.as_secs_f64();
        let spread = base * self.config.jitter_fraction;
        let jitter = if spread > 0.0 {
            rng.gen_range(-spread..spread)
        } else {
            0.0
        };
        Duration::from_secs_f64((base + jitter).max(0.001))
    }

    pub fn all_nodes(&self) -> Vec<NodeIndex> {
        (0..self.config.num_nodes).collect()
    }

    pub fn total_nodes(&self) -> usize {
        self.config.num_nodes as usize
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }
}
