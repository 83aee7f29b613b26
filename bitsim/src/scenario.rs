//! Scenario builder for setting up and running simulations.
//!
//! Nodes are referred to by index; node `i` gets the address
//! `node_address(i + 1)`, so scheduled actions can name nodes before the
//! simulator exists.

use bitrelay::{Duration, Timestamp};

use crate::event::ScenarioAction;
use crate::metrics::SimulationResult;
use crate::node::{node_address, NodeId};
use crate::sim::Simulator;
use crate::topology::Topology;

/// Network time nodes boot with unless told otherwise (October 2025).
pub const DEFAULT_NETWORK_EPOCH: Timestamp = Timestamp::from_millis(1_760_000_000_000);

/// Type of topology to generate.
#[derive(Debug, Clone)]
enum TopologyType {
    FullyConnected,
    Chain,
    Star,
    Grid { columns: usize },
    Custom(Topology),
}

/// Builder for simulation scenarios.
pub struct ScenarioBuilder {
    num_nodes: usize,
    /// RNG seed for payload loss.
    seed: u64,
    /// Topology type to generate (must be explicitly specified).
    topology_type: Option<TopologyType>,
    loss_rate: f64,
    delay: Option<Duration>,
    /// Network time at boot; `None` leaves clocks unsynced.
    network_epoch: Option<Timestamp>,
    actions: Vec<(Timestamp, ScenarioAction)>,
}

impl Default for ScenarioBuilder {
    fn default() -> Self {
        Self::new(0)
    }
}

impl ScenarioBuilder {
    /// Create a new scenario with the specified number of nodes.
    ///
    /// A topology must be chosen before calling [`build`](Self::build).
    pub fn new(num_nodes: usize) -> Self {
        Self {
            num_nodes,
            seed: 42,
            topology_type: None,
            loss_rate: 0.0,
            delay: None,
            network_epoch: Some(DEFAULT_NETWORK_EPOCH),
            actions: Vec::new(),
        }
    }

    /// Address of node `index`.
    pub fn node(index: usize) -> NodeId {
        node_address(index as u64 + 1)
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn topology(mut self, topo: Topology) -> Self {
        self.topology_type = Some(TopologyType::Custom(topo));
        self
    }

    pub fn fully_connected(mut self) -> Self {
        self.topology_type = Some(TopologyType::FullyConnected);
        self
    }

    pub fn chain_topology(mut self) -> Self {
        self.topology_type = Some(TopologyType::Chain);
        self
    }

    /// Node 0 is the hub.
    pub fn star_topology(mut self) -> Self {
        self.topology_type = Some(TopologyType::Star);
        self
    }

    pub fn grid_topology(mut self, columns: usize) -> Self {
        self.topology_type = Some(TopologyType::Grid { columns });
        self
    }

    /// Loss rate applied to every radio path.
    pub fn with_loss_rate(mut self, rate: f64) -> Self {
        self.loss_rate = rate;
        self
    }

    /// Delay applied to every radio path.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Boot without network time. Repeaters still link up and relay, but
    /// never announce.
    pub fn unsynced(mut self) -> Self {
        self.network_epoch = None;
        self
    }

    pub fn with_network_epoch(mut self, epoch: Timestamp) -> Self {
        self.network_epoch = Some(epoch);
        self
    }

    /// Partition the nodes into groups of indices at `time`.
    pub fn partition_at(mut self, time: Timestamp, groups: Vec<Vec<usize>>) -> Self {
        let groups = groups
            .into_iter()
            .map(|g| g.into_iter().map(Self::node).collect())
            .collect();
        self.actions.push((time, ScenarioAction::Partition { groups }));
        self
    }

    pub fn heal_at(mut self, time: Timestamp) -> Self {
        self.actions.push((time, ScenarioAction::HealPartition));
        self
    }

    pub fn disable_link_at(mut self, time: Timestamp, a: usize, b: usize) -> Self {
        self.actions.push((
            time,
            ScenarioAction::DisableLink {
                from: Self::node(a),
                to: Self::node(b),
            },
        ));
        self
    }

    pub fn enable_link_at(mut self, time: Timestamp, a: usize, b: usize) -> Self {
        self.actions.push((
            time,
            ScenarioAction::EnableLink {
                from: Self::node(a),
                to: Self::node(b),
            },
        ));
        self
    }

    pub fn loss_rate_at(mut self, time: Timestamp, a: usize, b: usize, rate: f64) -> Self {
        self.actions.push((
            time,
            ScenarioAction::SetLossRate {
                from: Self::node(a),
                to: Self::node(b),
                rate,
            },
        ));
        self
    }

    /// Have node `index` send a chat message at `time`.
    pub fn originate_at(mut self, time: Timestamp, index: usize, content: &[u8]) -> Self {
        self.actions.push((
            time,
            ScenarioAction::Originate {
                node: Self::node(index),
                content: content.to_vec(),
            },
        ));
        self
    }

    /// Build the simulator with all nodes and topology.
    ///
    /// # Panics
    ///
    /// If no topology was chosen.
    pub fn build(self) -> (Simulator, Vec<NodeId>) {
        let node_ids: Vec<NodeId> = (0..self.num_nodes).map(Self::node).collect();

        let mut topo = match self.topology_type {
            Some(TopologyType::FullyConnected) => Topology::fully_connected(&node_ids),
            Some(TopologyType::Chain) => Topology::chain(&node_ids),
            Some(TopologyType::Star) => Topology::star(&node_ids),
            Some(TopologyType::Grid { columns }) => Topology::grid(&node_ids, columns),
            Some(TopologyType::Custom(t)) => t,
            None => panic!(
                "Topology must be explicitly specified. \
                Use .fully_connected(), .chain_topology(), .star_topology(), \
                .grid_topology() or .topology()"
            ),
        };
        if self.loss_rate > 0.0 {
            topo.set_global_loss_rate(self.loss_rate);
        }
        if let Some(delay) = self.delay {
            topo.set_global_delay(delay);
        }

        let mut sim = Simulator::new(self.seed).with_topology(topo);
        if let Some(epoch) = self.network_epoch {
            sim = sim.with_synced_clocks(epoch);
        }
        for (i, &expected) in node_ids.iter().enumerate() {
            let node_id = sim.add_node(i as u64 + 1);
            debug_assert_eq!(node_id, expected);
        }
        for (time, action) in self.actions {
            sim.schedule_action(time, action);
        }

        (sim, node_ids)
    }

    /// Build and run the simulation for the specified duration.
    pub fn run_for(self, duration: Duration) -> SimulationResult {
        let (mut sim, _) = self.build();
        sim.run_for(duration)
    }

    /// Build and run until the specified time.
    pub fn run_until(self, time: Timestamp) -> SimulationResult {
        let (mut sim, _) = self.build();
        sim.run_until(time)
    }
}

/// N repeaters all in range of each other.
pub fn simple_scenario(num_nodes: usize) -> ScenarioBuilder {
    ScenarioBuilder::new(num_nodes).fully_connected()
}

/// N repeaters along a corridor, each hearing only the next.
pub fn corridor_scenario(num_nodes: usize) -> ScenarioBuilder {
    ScenarioBuilder::new(num_nodes).chain_topology()
}
