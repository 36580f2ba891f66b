//! Simulated network with deterministic latency, packet loss, and partitions.

use crate::NodeIndex;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use std::collections::HashSet;
use std::time::Duration;

/// Configuration for the simulated network.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Base point-to-point latency.
    pub latency: Duration,
    /// Jitter as a fraction of base latency (0.0 - 1.0).
    pub jitter_fraction: f64,
    /// Packet loss rate (0.0 - 1.0). Messages are dropped with this
    /// probability.
    pub packet_loss_rate: f64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            latency: Duration::from_millis(10),
            jitter_fraction: 0.1,
            packet_loss_rate: 0.0,
        }
    }
}

/// Simulated network for deterministic message delivery.
///
/// Supports configurable latency with jitter, probabilistic packet loss, and
/// directional partitions between node pairs.
#[derive(Debug)]
pub struct SimulatedNetwork {
    config: NetworkConfig,
    /// Partitioned node pairs. If (a, b) is in this set, messages from a to b
    /// are dropped. Partitions are directional.
    partitions: HashSet<(NodeIndex, NodeIndex)>,
}

impl SimulatedNetwork {
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            config,
            partitions: HashSet::new(),
        }
    }

    // ─── Partition management ───

    pub fn is_partitioned(&self, from: NodeIndex, to: NodeIndex) -> bool {
        self.partitions.contains(&(from, to))
    }

    pub fn partition_unidirectional(&mut self, from: NodeIndex, to: NodeIndex) {
        self.partitions.insert((from, to));
    }

    pub fn partition_bidirectional(&mut self, a: NodeIndex, b: NodeIndex) {
        self.partitions.insert((a, b));
        self.partitions.insert((b, a));
    }

    pub fn heal_all(&mut self) {
        self.partitions.clear();
    }

    // ─── Delivery decision ───

    /// Returns `None` if the message should be dropped, `Some(latency)`
    /// otherwise.
    pub fn should_deliver(
        &self,
        from: NodeIndex,
        to: NodeIndex,
        rng: &mut ChaCha8Rng,
    ) -> Option<Duration> {
        if self.is_partitioned(from, to) {
            return None;
        }
        if self.config.packet_loss_rate > 0.0 && rng.gen::<f64>() < self.config.packet_loss_rate {
            return None;
        }
        Some(self.sample_latency(rng))
    }

    pub fn sample_latency(&self, rng: &mut ChaCha8Rng) -> Duration {
        let base = self.config.latency.as_secs_f64();
        let jitter_range = base * self.config.jitter_fraction;
        let jitter = if jitter_range > 0.0 {
            rng.gen_range(-jitter_range..jitter_range)
        } else {
            0.0
        };
        Duration::from_secs_f64((base + jitter).max(0.0001))
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_deterministic_latency() {
        let network = SimulatedNetwork::new(NetworkConfig::default());
        let mut rng1 = ChaCha8Rng::seed_from_u64(42);
        let mut rng2 = ChaCha8Rng::seed_from_u64(42);
        assert_eq!(
            network.sample_latency(&mut rng1),
            network.sample_latency(&mut rng2)
        );
    }

    #[test]
    fn test_partition_blocks_delivery() {
        let mut network = SimulatedNetwork::new(NetworkConfig::default());
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        assert!(network.should_deliver(0, 1, &mut rng).is_some());

        network.partition_bidirectional(0, 1);
        assert!(network.should_deliver(0, 1, &mut rng).is_none());
        assert!(network.should_deliver(1, 0, &mut rng).is_none());
        assert!(network.should_deliver(0, 2, &mut rng).is_some());

        network.heal_all();
        assert!(network.should_deliver(0, 1, &mut rng).is_some());
    }

    #[test]
    fn test_full_packet_loss_drops_everything() {
        let network = SimulatedNetwork::new(NetworkConfig {
            packet_loss_rate: 1.0,
            ..Default::default()
        });
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        for _ in 0..10 {
            assert!(network.should_deliver(0, 1, &mut rng).is_none());
        }
    }
}
