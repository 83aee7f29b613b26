//! Metrics collection for simulation analysis.

use bitrelay::Timestamp;
use hashbrown::{HashMap, HashSet};

use crate::node::NodeId;

/// Chat message id.
pub type MessageId = Vec<u8>;

/// Simulation metrics collected over time.
#[derive(Debug, Clone, Default)]
pub struct SimMetrics {
    /// Payloads handed to a link by any node.
    pub transmissions: u64,
    /// Payloads that reached the other end of their link.
    pub deliveries: u64,
    /// Payloads lost to the loss rate, a dead path or a vanished link.
    pub drops: u64,
    /// BLE links established.
    pub links_established: u64,
    /// BLE links torn down.
    pub links_dropped: u64,
    /// Connect attempts that failed.
    pub connect_failures: u64,
    /// Copies of a message a node already held.
    pub duplicates: u64,
    /// Message ids each node has stored, including its own.
    pub seen: HashMap<NodeId, HashSet<MessageId>>,
    /// Link sends per message id, across all nodes.
    pub relays: HashMap<MessageId, u64>,
    /// Messages originated, in order, with their node and time.
    pub originated: Vec<(NodeId, MessageId, Timestamp)>,
}

impl SimMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `node` now holds message `id`.
    pub fn record_seen(&mut self, node: NodeId, id: MessageId) {
        self.seen.entry(node).or_default().insert(id);
    }

    pub fn record_origin(&mut self, node: NodeId, id: MessageId, time: Timestamp) {
        self.record_seen(node, id.clone());
        self.originated.push((node, id, time));
    }

    pub fn record_relay(&mut self, id: MessageId) {
        *self.relays.entry(id).or_default() += 1;
    }

    pub fn has_seen(&self, node: &NodeId, id: &[u8]) -> bool {
        self.seen.get(node).is_some_and(|ids| ids.contains(id))
    }

    /// Number of nodes holding message `id`.
    pub fn reach(&self, id: &[u8]) -> usize {
        self.seen.values().filter(|ids| ids.contains(id)).count()
    }

    /// Times message `id` was put on a link.
    pub fn relay_count(&self, id: &[u8]) -> u64 {
        self.relays.get(id).copied().unwrap_or(0)
    }

    /// Id of the `n`th originated message.
    pub fn originated_id(&self, n: usize) -> Option<&[u8]> {
        self.originated.get(n).map(|(_, id, _)| id.as_slice())
    }

    /// Fraction of transmitted payloads that arrived.
    pub fn delivery_ratio(&self) -> f64 {
        if self.transmissions == 0 {
            return 1.0;
        }
        self.deliveries as f64 / self.transmissions as f64
    }
}

/// Result of running a simulation.
#[derive(Debug, Clone)]
pub struct SimulationResult {
    /// Final simulation time.
    pub end_time: Timestamp,
    /// Collected metrics.
    pub metrics: SimMetrics,
    /// Whether simulation ended due to event queue exhaustion (vs time limit).
    pub queue_exhausted: bool,
    /// Nodes in the simulation.
    pub node_count: usize,
}

impl SimulationResult {
    /// Every node holds every originated message.
    pub fn fully_flooded(&self) -> bool {
        self.metrics
            .originated
            .iter()
            .all(|(_, id, _)| self.metrics.reach(id) == self.node_count)
    }

    /// Nodes reached by the first originated message.
    pub fn first_message_reach(&self) -> usize {
        self.metrics.originated_id(0).map_or(0, |id| self.metrics.reach(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reach_counts_nodes() {
        let mut metrics = SimMetrics::new();
        metrics.record_origin([1; 6], b"m1".to_vec(), Timestamp::ZERO);
        metrics.record_seen([2; 6], b"m1".to_vec());
        metrics.record_seen([2; 6], b"m1".to_vec());
        metrics.record_seen([3; 6], b"m2".to_vec());

        assert_eq!(metrics.reach(b"m1"), 2);
        assert_eq!(metrics.reach(b"m2"), 1);
        assert!(metrics.has_seen(&[2; 6], b"m1"));
        assert!(!metrics.has_seen(&[3; 6], b"m1"));
        assert_eq!(metrics.originated_id(0), Some(&b"m1"[..]));
    }

    #[test]
    fn test_fully_flooded() {
        let mut metrics = SimMetrics::new();
        metrics.record_origin([1; 6], b"m1".to_vec(), Timestamp::ZERO);
        metrics.record_seen([2; 6], b"m1".to_vec());

        let mut result = SimulationResult {
            end_time: Timestamp::from_secs(1),
            metrics,
            queue_exhausted: false,
            node_count: 3,
        };
        assert!(!result.fully_flooded());
        assert_eq!(result.first_message_reach(), 2);

        result.metrics.record_seen([3; 6], b"m1".to_vec());
        assert!(result.fully_flooded());
    }

    #[test]
    fn test_delivery_ratio() {
        let mut metrics = SimMetrics::new();
        assert_eq!(metrics.delivery_ratio(), 1.0);
        metrics.transmissions = 4;
        metrics.deliveries = 3;
        metrics.drops = 1;
        assert_eq!(metrics.delivery_ratio(), 0.75);
    }
}
