//! Radio topology: which repeaters are in BLE range of each other.
//!
//! A [`Link`] here is a radio path, not a BLE connection. Repeaters only see
//! each other's advertisements and can only connect over active paths; the
//! simulator tears down connections whose path goes inactive.

use bitrelay::Duration;
use hashbrown::HashMap;

use crate::node::NodeId;

/// Properties of the radio path between two repeaters.
#[derive(Debug, Clone)]
pub struct Link {
    /// Signal strength in dBm, reported in scans and RSSI reads.
    pub rssi: i8,
    /// Payload loss rate (0.0 to 1.0).
    pub loss_rate: f64,
    /// Air time plus stack latency for one event.
    pub delay: Duration,
    /// Whether the nodes are currently in range.
    pub active: bool,
}

impl Default for Link {
    fn default() -> Self {
        Self {
            rssi: -60,
            loss_rate: 0.0,
            delay: Duration::from_millis(1),
            active: true,
        }
    }
}

impl Link {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rssi(mut self, rssi: i8) -> Self {
        self.rssi = rssi;
        self
    }

    /// Set the loss rate, clamped to [0, 1].
    pub fn with_loss_rate(mut self, rate: f64) -> Self {
        self.loss_rate = rate.clamp(0.0, 1.0);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }
}

/// Radio paths between pairs of nodes. Paths are symmetric.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    links: HashMap<(NodeId, NodeId), Link>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every node in range of every other.
    pub fn fully_connected(nodes: &[NodeId]) -> Self {
        Self::fully_connected_with(nodes, Link::default())
    }

    /// Fully connected, every path built from `link`.
    pub fn fully_connected_with(nodes: &[NodeId], link: Link) -> Self {
        let mut topo = Self::new();
        for (i, &a) in nodes.iter().enumerate() {
            for &b in nodes.iter().skip(i + 1) {
                topo.add_link(a, b, link.clone());
            }
        }
        topo
    }

    /// Each node in range of its list neighbours only, like repeaters
    /// strung along a corridor.
    pub fn chain(nodes: &[NodeId]) -> Self {
        let mut topo = Self::new();
        for window in nodes.windows(2) {
            topo.add_link(window[0], window[1], Link::default());
        }
        topo
    }

    /// First node is the hub, in range of all others.
    pub fn star(nodes: &[NodeId]) -> Self {
        let mut topo = Self::new();
        let Some((&hub, spokes)) = nodes.split_first() else {
            return topo;
        };
        for &spoke in spokes {
            topo.add_link(hub, spoke, Link::default());
        }
        topo
    }

    /// Nodes laid out row by row, `columns` wide, each in range of the
    /// nodes directly beside, above and below it.
    pub fn grid(nodes: &[NodeId], columns: usize) -> Self {
        let mut topo = Self::new();
        if columns == 0 {
            return topo;
        }
        for (i, &node) in nodes.iter().enumerate() {
            if (i + 1) % columns != 0 {
                if let Some(&right) = nodes.get(i + 1) {
                    topo.add_link(node, right, Link::default());
                }
            }
            if let Some(&below) = nodes.get(i + columns) {
                topo.add_link(node, below, Link::default());
            }
        }
        topo
    }

    pub fn add_link(&mut self, a: NodeId, b: NodeId, link: Link) {
        self.links.insert(Self::canonical_pair(a, b), link);
    }

    pub fn get_link(&self, a: NodeId, b: NodeId) -> Option<&Link> {
        self.links.get(&Self::canonical_pair(a, b))
    }

    pub fn get_link_mut(&mut self, a: NodeId, b: NodeId) -> Option<&mut Link> {
        self.links.get_mut(&Self::canonical_pair(a, b))
    }

    /// Path exists and is active.
    pub fn is_connected(&self, a: NodeId, b: NodeId) -> bool {
        self.get_link(a, b).is_some_and(|link| link.active)
    }

    /// All nodes in range of `node`, in address order.
    pub fn neighbors(&self, node: NodeId) -> Vec<NodeId> {
        let mut result: Vec<NodeId> = self
            .links
            .iter()
            .filter(|(_, link)| link.active)
            .filter_map(|(&(a, b), _)| match node {
                n if n == a => Some(b),
                n if n == b => Some(a),
                _ => None,
            })
            .collect();
        result.sort();
        result
    }

    /// Disable all paths crossing between partition groups.
    ///
    /// Nodes listed in no group count as one more group of their own.
    pub fn partition(&mut self, groups: &[Vec<NodeId>]) {
        for (&(a, b), link) in self.links.iter_mut() {
            let a_group = groups.iter().position(|g| g.contains(&a));
            let b_group = groups.iter().position(|g| g.contains(&b));
            if a_group != b_group {
                link.active = false;
            }
        }
    }

    /// Re-enable all paths.
    pub fn heal(&mut self) {
        for link in self.links.values_mut() {
            link.active = true;
        }
    }

    pub fn set_global_loss_rate(&mut self, rate: f64) {
        let rate = rate.clamp(0.0, 1.0);
        for link in self.links.values_mut() {
            link.loss_rate = rate;
        }
    }

    pub fn set_global_delay(&mut self, delay: Duration) {
        for link in self.links.values_mut() {
            link.delay = delay;
        }
    }

    fn canonical_pair(a: NodeId, b: NodeId) -> (NodeId, NodeId) {
        if a < b {
            (a, b)
        } else {
            (b, a)
        }
    }
}
