//! bitsim - Discrete event simulator for bitrelay mesh repeaters.
//!
//! This crate runs many [`bitrelay::Relay`] instances in one process against
//! a simulated BLE radio, so flooding, deduplication and link management can
//! be tested at scale without hardware or real-time delays.
//!
//! # Features
//!
//! - **Discrete event simulation**: No real-time delays, deterministic ordering
//! - **Simulated BLE stack**: Scans, connects, GATT discovery, MTU exchange
//!   and notification writes, driven by what each relay asks its link layer for
//! - **Configurable topology**: Fully connected, chain, star, grid, or custom
//! - **Path properties**: RSSI, payload loss, delay per radio path
//! - **Scenario builder**: Scheduled partitions, healing and chat messages
//! - **Metrics collection**: Message reach, relay counts, link churn
//!
//! # Example
//!
//! ```
//! use bitsim::{Duration, ScenarioBuilder, Timestamp};
//!
//! // Three repeaters in range of each other; one sends a message at 5 s.
//! let result = ScenarioBuilder::new(3)
//!     .fully_connected()
//!     .originate_at(Timestamp::from_secs(5), 0, b"hello mesh")
//!     .run_for(Duration::from_secs(10));
//!
//! assert!(result.fully_flooded());
//! ```
//!
//! # Architecture
//!
//! The simulator keeps a priority queue of events ordered by
//! (time, sequence_number). The main loop:
//! 1. Pop next event from queue
//! 2. Advance simulation time
//! 3. Feed the event to the node's relay
//! 4. Collect the link operations the relay issued
//! 5. Answer them through the topology, scheduling the resulting events
//!
//! Relays are driven through `handle_event` and `handle_timer` directly
//! instead of the async `run()` loop.

pub mod event;
pub mod metrics;
pub mod node;
pub mod scenario;
pub mod sim;
pub mod topology;

// Host builds take the std critical-section implementation for relay channels.
use critical_section as _;

// Re-export main types
pub use bitrelay::{Duration, Timestamp};
pub use event::{Event, ScenarioAction, ScheduledEvent};
pub use metrics::{MessageId, SimMetrics, SimulationResult};
pub use node::{node_address, LinkOp, NodeId, SimConfig, SimLink, SimNode};
pub use scenario::{corridor_scenario, simple_scenario, ScenarioBuilder};
pub use sim::Simulator;
pub use topology::{Link, Topology};

#[cfg(test)]
mod tests {
    use super::*;

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn test_full_mesh_floods() {
        init_logging();
        let result = simple_scenario(5)
            .originate_at(Timestamp::from_secs(5), 0, b"hello")
            .run_until(Timestamp::from_secs(10));

        assert_eq!(result.metrics.originated.len(), 1);
        assert!(result.fully_flooded());
        assert_eq!(result.metrics.drops, 0);
    }

    #[test]
    fn test_ttl_bounds_reach_along_corridor() {
        init_logging();
        let (mut sim, nodes) = corridor_scenario(10)
            .originate_at(Timestamp::from_secs(5), 0, b"far away")
            .build();
        let result = sim.run_until(Timestamp::from_secs(40));

        // Sent with 7 hops: the eighth repeater stores it with none left.
        assert_eq!(result.first_message_reach(), 8);
        let id = result.metrics.originated_id(0).map(<[u8]>::to_vec).unwrap_or_default();
        assert!(result.metrics.has_seen(&nodes[7], &id));
        assert!(!result.metrics.has_seen(&nodes[8], &id));
        assert!(!result.metrics.has_seen(&nodes[9], &id));
    }

    #[test]
    fn test_no_echo_to_sender() {
        init_logging();
        let result = simple_scenario(2)
            .originate_at(Timestamp::from_secs(5), 0, b"ping")
            .run_until(Timestamp::from_secs(10));

        let id = result.metrics.originated_id(0).map(<[u8]>::to_vec).unwrap_or_default();
        assert_eq!(result.first_message_reach(), 2);
        assert_eq!(result.metrics.relay_count(&id), 1);
        assert_eq!(result.metrics.duplicates, 0);
    }

    #[test]
    fn test_triangle_relays_once_per_link() {
        init_logging();
        let result = simple_scenario(3)
            .originate_at(Timestamp::from_secs(5), 0, b"tri")
            .run_until(Timestamp::from_secs(10));

        let id = result.metrics.originated_id(0).map(<[u8]>::to_vec).unwrap_or_default();
        assert_eq!(result.first_message_reach(), 3);
        // Origin to both, then each receiver forwards away from the origin.
        assert_eq!(result.metrics.relay_count(&id), 4);
        assert_eq!(result.metrics.duplicates, 2);
    }

    #[test]
    fn test_partition_heal_delivers_retained_message() {
        init_logging();
        let (mut sim, nodes) = simple_scenario(4)
            .partition_at(Timestamp::from_secs(3), vec![vec![0, 1], vec![2, 3]])
            .originate_at(Timestamp::from_secs(5), 0, b"across")
            .heal_at(Timestamp::from_secs(10))
            .build();

        let result = sim.run_until(Timestamp::from_secs(10));
        let id = result.metrics.originated_id(0).map(<[u8]>::to_vec).unwrap_or_default();
        assert!(result.metrics.has_seen(&nodes[1], &id));
        assert!(!result.metrics.has_seen(&nodes[2], &id));
        assert!(!result.metrics.has_seen(&nodes[3], &id));

        // Links come back after the next scan and the stored broadcast
        // goes out on them.
        let result = sim.run_until(Timestamp::from_secs(30));
        assert!(result.metrics.has_seen(&nodes[2], &id));
        assert!(result.metrics.has_seen(&nodes[3], &id));
        assert!(result.fully_flooded());
    }

    #[test]
    fn test_total_loss_isolates_origin() {
        init_logging();
        let result = simple_scenario(3)
            .with_loss_rate(1.0)
            .originate_at(Timestamp::from_secs(5), 0, b"void")
            .run_until(Timestamp::from_secs(10));

        assert_eq!(result.first_message_reach(), 1);
        assert!(result.metrics.drops > 0);
        assert_eq!(result.metrics.deliveries, 0);
    }

    #[test]
    fn test_star_floods_through_hub() {
        init_logging();
        let result = ScenarioBuilder::new(5)
            .star_topology()
            .originate_at(Timestamp::from_secs(8), 3, b"via hub")
            .run_until(Timestamp::from_secs(15));

        assert!(result.fully_flooded());
    }

    #[test]
    fn test_same_seed_same_run() {
        let run = || {
            ScenarioBuilder::new(4)
                .grid_topology(2)
                .with_seed(9)
                .with_loss_rate(0.3)
                .originate_at(Timestamp::from_secs(5), 0, b"again")
                .run_until(Timestamp::from_secs(12))
        };
        let (a, b) = (run(), run());

        assert_eq!(a.metrics.transmissions, b.metrics.transmissions);
        assert_eq!(a.metrics.drops, b.metrics.drops);
        assert_eq!(a.first_message_reach(), b.first_message_reach());
    }
}
