//! Discrete event simulator for bitrelay meshes.
//!
//! The simulator plays the BLE stack for every node: it answers scans with
//! the advertisements of nodes in range, completes connects, runs GATT
//! discovery against a fixed repeater layout, grants send slots and carries
//! payloads to the other end of each link.

use std::collections::BinaryHeap;

use bitrelay::connection::advertising_data;
use bitrelay::debug::DebugEvent;
use bitrelay::maintenance::local_name;
use bitrelay::types::{CHARACTERISTIC_UUID, SERVICE_UUID};
use bitrelay::{AddressType, ConnHandle, Duration, LinkEvent, PacketKey, Role, Timestamp};
use hashbrown::HashMap;

use crate::event::{Event, ScenarioAction, ScheduledEvent, SequenceNumber};
use crate::metrics::{SimMetrics, SimulationResult};
use crate::node::{node_address, LinkOp, NodeId, SimNode};
use crate::topology::{Link, Topology};

/// Bitchat service range every simulated repeater exposes.
const SERVICE_START: u16 = 0x0010;
const SERVICE_END: u16 = 0x0015;
/// Characteristic value handle inside the service.
const VALUE_HANDLE: u16 = 0x0012;
/// ATT MTU both ends settle on after connecting.
const NEGOTIATED_MTU: u16 = 247;
/// From a send request to its slot.
const SEND_SLOT: Duration = Duration::from_millis(2);
/// How long a connect to an unreachable address takes to fail.
const PAGE_TIMEOUT: Duration = Duration::from_secs(1);

/// Discrete event simulator for bitrelay networks.
pub struct Simulator {
    /// All nodes in the simulation.
    nodes: HashMap<NodeId, SimNode>,
    /// Radio paths.
    topology: Topology,
    current_time: Timestamp,
    /// Priority queue of scheduled events.
    event_queue: BinaryHeap<ScheduledEvent>,
    metrics: SimMetrics,
    /// Next sequence number for event ordering.
    next_seq: u64,
    /// RNG state for payload loss.
    rng_state: u64,
    /// Established BLE links, keyed by either end: (node, handle) -> (peer, peer handle).
    links: HashMap<(NodeId, ConnHandle), (NodeId, ConnHandle)>,
    /// Network time at simulation start, for nodes that boot synced.
    network_epoch: Option<Timestamp>,
}

impl Simulator {
    /// Create a new simulator with given RNG seed.
    pub fn new(seed: u64) -> Self {
        Self {
            nodes: HashMap::new(),
            topology: Topology::new(),
            current_time: Timestamp::ZERO,
            event_queue: BinaryHeap::new(),
            metrics: SimMetrics::new(),
            next_seq: 0,
            rng_state: seed,
            links: HashMap::new(),
            network_epoch: None,
        }
    }

    pub fn with_topology(mut self, topology: Topology) -> Self {
        self.topology = topology;
        self
    }

    /// Boot nodes knowing network time, as if a phone had already been heard.
    /// Without it nodes relay but never announce.
    pub fn with_synced_clocks(mut self, epoch: Timestamp) -> Self {
        self.network_epoch = Some(epoch);
        self
    }

    /// Power on a node now. Its first tick runs immediately and scans.
    pub fn add_node(&mut self, seed: u64) -> NodeId {
        let now = self.current_time;
        let mut node = SimNode::new(node_address(seed), now);
        if let Some(epoch) = self.network_epoch {
            node.sync_clock(epoch + now.saturating_sub(Timestamp::ZERO));
        }
        let node_id = node.node_id();
        self.nodes.insert(node_id, node);
        self.schedule(now, Event::TimerFire { node: node_id });
        node_id
    }

    pub fn node(&self, id: &NodeId) -> Option<&SimNode> {
        self.nodes.get(id)
    }

    pub fn node_mut(&mut self, id: &NodeId) -> Option<&mut SimNode> {
        self.nodes.get_mut(id)
    }

    /// All node ids in address order.
    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.nodes.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn current_time(&self) -> Timestamp {
        self.current_time
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn topology_mut(&mut self) -> &mut Topology {
        &mut self.topology
    }

    pub fn metrics(&self) -> &SimMetrics {
        &self.metrics
    }

    /// Established BLE links.
    pub fn link_count(&self) -> usize {
        self.links.len() / 2
    }

    /// Node and handle at the other end of `handle`.
    pub fn peer_of(&self, node: NodeId, handle: ConnHandle) -> Option<(NodeId, ConnHandle)> {
        self.links.get(&(node, handle)).copied()
    }

    /// Whether the two nodes share a BLE link.
    pub fn linked(&self, a: NodeId, b: NodeId) -> bool {
        self.links.iter().any(|(&(n, _), &(p, _))| n == a && p == b)
    }

    pub fn schedule(&mut self, time: Timestamp, event: Event) {
        let seq = SequenceNumber::new(self.next_seq);
        self.next_seq += 1;
        self.event_queue.push(ScheduledEvent::new(time, seq, event));
    }

    pub fn schedule_action(&mut self, time: Timestamp, action: ScenarioAction) {
        self.schedule(time, Event::ScenarioAction(action));
    }

    /// Run simulation until specified time.
    pub fn run_until(&mut self, end_time: Timestamp) -> SimulationResult {
        while self.event_queue.peek().is_some_and(|e| e.time <= end_time) {
            let Some(event) = self.event_queue.pop() else {
                break;
            };
            self.advance_time(event.time);
            self.process_event(event.event);
        }
        self.advance_time(end_time);
        self.result()
    }

    pub fn run_for(&mut self, duration: Duration) -> SimulationResult {
        self.run_until(self.current_time + duration)
    }

    /// Run until event queue is empty or max events processed.
    pub fn run_events(&mut self, max_events: usize) -> SimulationResult {
        for _ in 0..max_events {
            let Some(event) = self.event_queue.pop() else {
                break;
            };
            self.advance_time(event.time);
            self.process_event(event.event);
        }
        self.result()
    }

    fn result(&self) -> SimulationResult {
        SimulationResult {
            end_time: self.current_time,
            metrics: self.metrics.clone(),
            queue_exhausted: self.event_queue.is_empty(),
            node_count: self.nodes.len(),
        }
    }

    fn advance_time(&mut self, time: Timestamp) {
        if time > self.current_time {
            self.current_time = time;
        }
    }

    fn process_event(&mut self, event: Event) {
        match event {
            Event::Deliver { to, handle, data } => self.deliver(to, handle, data),
            Event::CanSendNow {
                node,
                handle,
                direction,
            } => {
                if self.links.contains_key(&(node, handle)) {
                    self.dispatch(node, LinkEvent::CanSendNow { handle, direction });
                }
            }
            Event::Establish { initiator, target } => self.establish(initiator, target),
            Event::Teardown { node, handle } => self.teardown(node, handle),
            Event::Link { node, event } => self.dispatch(node, event),
            Event::TimerFire { node } => self.fire_timer(node),
            Event::ScenarioAction(action) => self.execute_action(action),
        }
    }

    /// Hand one link event to a node, then act on what it asked for.
    fn dispatch(&mut self, node_id: NodeId, event: LinkEvent) {
        let now = self.current_time;
        let Some(node) = self.nodes.get_mut(&node_id) else {
            return;
        };
        node.handle_link_event(event, now);
        self.collect(node_id);
    }

    fn fire_timer(&mut self, node_id: NodeId) {
        let now = self.current_time;
        let Some(node) = self.nodes.get_mut(&node_id) else {
            return;
        };
        node.handle_timer(now);
        let next = node.next_wake();
        self.collect(node_id);
        self.schedule(next, Event::TimerFire { node: node_id });
    }

    /// Drain a node's trace events and link requests.
    fn collect(&mut self, node_id: NodeId) {
        let Some(node) = self.nodes.get_mut(&node_id) else {
            return;
        };
        let trace = node.take_debug_events();
        let ops = node.take_ops();

        for event in trace {
            self.record_trace(node_id, event);
        }
        for op in ops {
            self.apply_op(node_id, op);
        }
    }

    fn record_trace(&mut self, node: NodeId, event: DebugEvent) {
        match event {
            DebugEvent::Stored {
                key: PacketKey::Message(id),
                ..
            } => self.metrics.record_seen(node, id),
            DebugEvent::Duplicate {
                key: PacketKey::Message(_),
            } => self.metrics.duplicates += 1,
            DebugEvent::Queued {
                key: PacketKey::Message(id),
                ..
            } => self.metrics.record_relay(id),
            _ => {}
        }
    }

    /// Play the radio's part in one link request.
    fn apply_op(&mut self, node: NodeId, op: LinkOp) {
        let now = self.current_time;
        match op {
            LinkOp::StartScan => self.scan(node),
            LinkOp::Connect(target) => self.connect(node, target),
            LinkOp::Disconnect(handle) => self.schedule(now, Event::Teardown { node, handle }),
            LinkOp::DiscoverServices(handle) => {
                let Some((_, _, link)) = self.link_path(node, handle) else {
                    return;
                };
                let at = now + link.delay;
                self.schedule_link(
                    at,
                    node,
                    LinkEvent::ServiceDiscovered {
                        handle,
                        uuid: SERVICE_UUID,
                        start: SERVICE_START,
                        end: SERVICE_END,
                    },
                );
                self.schedule_link(at, node, LinkEvent::DiscoveryComplete { handle });
            }
            LinkOp::DiscoverCharacteristics(handle, start, end) => {
                let Some((_, _, link)) = self.link_path(node, handle) else {
                    return;
                };
                let at = now + link.delay;
                if (start..=end).contains(&VALUE_HANDLE) {
                    self.schedule_link(
                        at,
                        node,
                        LinkEvent::CharacteristicDiscovered {
                            handle,
                            uuid: CHARACTERISTIC_UUID,
                            value_handle: VALUE_HANDLE,
                        },
                    );
                }
                self.schedule_link(at, node, LinkEvent::DiscoveryComplete { handle });
            }
            LinkOp::EnableNotifications(handle, _) => {
                // The subscription lands on the peer's GATT server.
                let Some((peer, peer_handle, link)) = self.link_path(node, handle) else {
                    return;
                };
                self.schedule_link(
                    now + link.delay,
                    peer,
                    LinkEvent::NotificationsEnabled {
                        handle: peer_handle,
                        value_handle: VALUE_HANDLE,
                        enabled: true,
                    },
                );
            }
            LinkOp::Rssi(handle) => {
                if let Some((_, _, link)) = self.link_path(node, handle) {
                    let rssi = link.rssi;
                    self.schedule_link(now + link.delay, node, LinkEvent::Rssi { handle, rssi });
                }
            }
            LinkOp::CanSend(handle, direction) => self.schedule(
                now + SEND_SLOT,
                Event::CanSendNow {
                    node,
                    handle,
                    direction,
                },
            ),
            LinkOp::Send { handle, data, .. } => self.transmit(node, handle, data),
        }
    }

    fn schedule_link(&mut self, time: Timestamp, node: NodeId, event: LinkEvent) {
        self.schedule(time, Event::Link { node, event });
    }

    /// Peer and radio path behind one end of a link.
    fn link_path(&self, node: NodeId, handle: ConnHandle) -> Option<(NodeId, ConnHandle, Link)> {
        let &(peer, peer_handle) = self.links.get(&(node, handle))?;
        let link = self.topology.get_link(node, peer)?.clone();
        Some((peer, peer_handle, link))
    }

    /// Report every node in range, each after its path delay.
    fn scan(&mut self, node: NodeId) {
        let now = self.current_time;
        for neighbour in self.topology.neighbors(node) {
            if !self.nodes.contains_key(&neighbour) {
                continue;
            }
            let Some(link) = self.topology.get_link(node, neighbour).cloned() else {
                continue;
            };
            let event = LinkEvent::Advertisement {
                address: neighbour,
                address_type: AddressType::Public,
                data: advertising_data(&local_name(&neighbour)),
                rssi: link.rssi,
            };
            self.schedule_link(now + link.delay, node, event);
        }
    }

    fn connect(&mut self, initiator: NodeId, target: NodeId) {
        let now = self.current_time;
        match self.topology.get_link(initiator, target) {
            Some(link) if link.active && self.nodes.contains_key(&target) => {
                let at = now + link.delay;
                self.schedule(at, Event::Establish { initiator, target });
            }
            _ => {
                self.metrics.connect_failures += 1;
                self.schedule_link(now + PAGE_TIMEOUT, initiator, LinkEvent::ConnectFailed { address: target });
            }
        }
    }

    /// Complete a connect. A pair already linked refuses a second link.
    fn establish(&mut self, initiator: NodeId, target: NodeId) {
        let now = self.current_time;
        let reachable = self.topology.is_connected(initiator, target) && self.nodes.contains_key(&target);
        if !reachable || self.linked(initiator, target) {
            self.metrics.connect_failures += 1;
            log::debug!("{:02x?} -> {:02x?} refused", initiator, target);
            self.dispatch(initiator, LinkEvent::ConnectFailed { address: target });
            return;
        }

        let Some(initiator_handle) = self.nodes.get_mut(&initiator).map(SimNode::allocate_handle) else {
            return;
        };
        let Some(target_handle) = self.nodes.get_mut(&target).map(SimNode::allocate_handle) else {
            return;
        };
        self.links.insert((initiator, initiator_handle), (target, target_handle));
        self.links.insert((target, target_handle), (initiator, initiator_handle));
        self.metrics.links_established += 1;
        log::debug!(
            "{:02x?}/0x{:x} linked to {:02x?}/0x{:x}",
            initiator,
            initiator_handle,
            target,
            target_handle
        );

        let delay = self
            .topology
            .get_link(initiator, target)
            .map_or(Duration::from_millis(0), |l| l.delay);
        for (node, handle) in [(initiator, initiator_handle), (target, target_handle)] {
            self.schedule_link(
                now + delay,
                node,
                LinkEvent::MtuExchanged {
                    handle,
                    mtu: NEGOTIATED_MTU,
                },
            );
        }

        self.dispatch(
            initiator,
            LinkEvent::Connected {
                handle: initiator_handle,
                address: target,
                address_type: AddressType::Public,
                role: Role::Initiator,
            },
        );
        self.dispatch(
            target,
            LinkEvent::Connected {
                handle: target_handle,
                address: initiator,
                address_type: AddressType::Public,
                role: Role::Acceptor,
            },
        );
    }

    fn teardown(&mut self, node: NodeId, handle: ConnHandle) {
        let Some((peer, peer_handle)) = self.links.remove(&(node, handle)) else {
            return;
        };
        self.links.remove(&(peer, peer_handle));
        self.metrics.links_dropped += 1;
        self.dispatch(node, LinkEvent::Disconnected { handle });
        self.dispatch(peer, LinkEvent::Disconnected { handle: peer_handle });
    }

    /// Put a payload on the air toward the other end of `handle`.
    fn transmit(&mut self, node: NodeId, handle: ConnHandle, data: Vec<u8>) {
        self.metrics.transmissions += 1;
        let Some((peer, peer_handle, link)) = self.link_path(node, handle) else {
            self.metrics.drops += 1;
            return;
        };
        if !link.active || (link.loss_rate > 0.0 && self.random_f64() < link.loss_rate) {
            self.metrics.drops += 1;
            return;
        }
        self.schedule(
            self.current_time + link.delay,
            Event::Deliver {
                to: peer,
                handle: peer_handle,
                data,
            },
        );
    }

    fn deliver(&mut self, to: NodeId, handle: ConnHandle, data: Vec<u8>) {
        if !self.links.contains_key(&(to, handle)) {
            self.metrics.drops += 1;
            return;
        }
        self.metrics.deliveries += 1;
        self.dispatch(to, LinkEvent::Received { handle, data });
    }

    /// Tear down links whose radio path has gone.
    fn drop_broken_links(&mut self) {
        let now = self.current_time;
        let mut broken: Vec<(NodeId, ConnHandle)> = self
            .links
            .iter()
            .filter(|&(&(a, _), &(b, _))| a < b && !self.topology.is_connected(a, b))
            .map(|(&end, _)| end)
            .collect();
        broken.sort();
        for (node, handle) in broken {
            self.schedule(now, Event::Teardown { node, handle });
        }
    }

    fn execute_action(&mut self, action: ScenarioAction) {
        match action {
            ScenarioAction::Partition { groups } => {
                self.topology.partition(&groups);
                self.drop_broken_links();
            }
            ScenarioAction::HealPartition => {
                self.topology.heal();
            }
            ScenarioAction::DisableLink { from, to } => {
                if let Some(link) = self.topology.get_link_mut(from, to) {
                    link.active = false;
                }
                self.drop_broken_links();
            }
            ScenarioAction::EnableLink { from, to } => {
                if let Some(link) = self.topology.get_link_mut(from, to) {
                    link.active = true;
                }
            }
            ScenarioAction::SetLossRate { from, to, rate } => {
                if let Some(link) = self.topology.get_link_mut(from, to) {
                    link.loss_rate = rate.clamp(0.0, 1.0);
                }
            }
            ScenarioAction::Originate { node, content } => {
                let now = self.current_time;
                let Some(sim_node) = self.nodes.get_mut(&node) else {
                    return;
                };
                if let Some(id) = sim_node.originate(&content, now) {
                    log::debug!("{:02x?} originated {}", node, String::from_utf8_lossy(&id));
                    self.metrics.record_origin(node, id, now);
                }
                self.collect(node);
            }
        }
    }

    /// Generate a random f64 in [0, 1).
    fn random_f64(&mut self) -> f64 {
        self.rng_state = self
            .rng_state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1);
        (self.rng_state >> 11) as f64 / (1u64 << 53) as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPOCH: Timestamp = Timestamp::from_millis(1_760_000_000_000);

    fn pair(link: Link) -> (Simulator, NodeId, NodeId) {
        let (a, b) = (node_address(1), node_address(2));
        let mut sim = Simulator::new(7)
            .with_topology(Topology::fully_connected_with(&[a, b], link))
            .with_synced_clocks(EPOCH);
        sim.add_node(1);
        sim.add_node(2);
        (sim, a, b)
    }

    fn usable_links(sim: &Simulator, node: &NodeId) -> usize {
        sim.node(node)
            .map_or(0, |n| n.tracker().connections().filter(|c| c.is_usable()).count())
    }

    #[test]
    fn test_simulator_creation() {
        let sim = Simulator::new(42);
        assert_eq!(sim.current_time(), Timestamp::ZERO);
        assert!(sim.node_ids().is_empty());
        assert_eq!(sim.link_count(), 0);
    }

    #[test]
    fn test_add_nodes() {
        let mut sim = Simulator::new(42);
        let n1 = sim.add_node(1);
        let n2 = sim.add_node(2);

        assert_ne!(n1, n2);
        assert_eq!(sim.node_ids(), vec![n1, n2]);
        assert!(sim.node(&n1).is_some());
    }

    #[test]
    fn test_nodes_in_range_link_up() {
        let (mut sim, a, b) = pair(Link::new());
        sim.run_for(Duration::from_secs(1));

        // Both connect after the scan window; the second attempt is refused.
        assert_eq!(sim.metrics().links_established, 1);
        assert_eq!(sim.metrics().connect_failures, 1);
        assert_eq!(sim.link_count(), 1);
        assert!(sim.linked(a, b) && sim.linked(b, a));
        assert_eq!(usable_links(&sim, &a), 1);
        assert_eq!(usable_links(&sim, &b), 1);

        let mtu = sim.node(&b).and_then(|n| n.tracker().connections().next().map(|c| c.mtu));
        assert_eq!(mtu, Some(NEGOTIATED_MTU));
    }

    #[test]
    fn test_nodes_out_of_range_stay_apart() {
        let mut sim = Simulator::new(7);
        let a = sim.add_node(1);
        sim.add_node(2);
        sim.run_for(Duration::from_secs(2));

        assert_eq!(sim.link_count(), 0);
        assert_eq!(usable_links(&sim, &a), 0);
        assert_eq!(sim.metrics().transmissions, 0);
    }

    #[test]
    fn test_announces_cross_the_link() {
        let (mut sim, a, b) = pair(Link::new());
        sim.run_for(Duration::from_secs(3));

        let metrics = sim.metrics();
        assert!(metrics.transmissions >= 2);
        assert_eq!(metrics.deliveries, metrics.transmissions);
        assert_eq!(metrics.drops, 0);

        let handle = sim
            .node(&b)
            .and_then(|n| n.tracker().connections().find(|c| c.connected).map(|c| c.handle));
        let peer = handle.and_then(|h| sim.node(&b).and_then(|n| n.tracker().peer_for_handle(h)));
        assert_eq!(peer.map(|p| p.name.clone()), Some(b"Repeater0001".to_vec()));
        assert_eq!(sim.peer_of(b, handle.unwrap_or(0)).map(|(n, _)| n), Some(a));
    }

    #[test]
    fn test_loss_drops_payloads() {
        let (mut sim, _, _) = pair(Link::new().with_loss_rate(1.0));
        sim.run_for(Duration::from_secs(3));

        let metrics = sim.metrics();
        assert_eq!(metrics.links_established, 1);
        assert!(metrics.transmissions > 0);
        assert_eq!(metrics.deliveries, 0);
        assert_eq!(metrics.drops, metrics.transmissions);
    }

    #[test]
    fn test_partition_tears_down_links() {
        let (mut sim, a, b) = pair(Link::new());
        sim.schedule_action(
            Timestamp::from_secs(1),
            ScenarioAction::Partition {
                groups: vec![vec![a], vec![b]],
            },
        );
        sim.run_for(Duration::from_millis(1500));

        assert_eq!(sim.metrics().links_dropped, 1);
        assert_eq!(sim.link_count(), 0);
        for node in [a, b] {
            assert_eq!(sim.node(&node).map(|n| n.tracker().active_connections_count()), Some(0));
        }
    }

    #[test]
    fn test_heal_reconnects_on_next_scan() {
        let (mut sim, a, b) = pair(Link::new());
        sim.schedule_action(Timestamp::from_secs(1), ScenarioAction::DisableLink { from: a, to: b });
        sim.schedule_action(Timestamp::from_secs(2), ScenarioAction::EnableLink { from: a, to: b });

        sim.run_until(Timestamp::from_secs(15));
        assert_eq!(sim.link_count(), 0);

        // Scans repeat 20 s after boot.
        sim.run_until(Timestamp::from_secs(22));
        assert_eq!(sim.metrics().links_established, 2);
        assert_eq!(usable_links(&sim, &a), 1);
        assert_eq!(usable_links(&sim, &b), 1);
    }

    #[test]
    fn test_rssi_polled_from_path() {
        let (mut sim, _, b) = pair(Link::new().with_rssi(-75));
        sim.run_for(Duration::from_secs(31));

        let rssi = sim
            .node(&b)
            .and_then(|n| n.tracker().connections().find(|c| c.connected).and_then(|c| c.rssi));
        assert_eq!(rssi, Some(-75));
    }

    #[test]
    fn test_run_events_bounded() {
        let (mut sim, _, _) = pair(Link::new());
        let result = sim.run_events(3);
        assert!(!result.queue_exhausted);
        assert_eq!(result.node_count, 2);
    }
}
