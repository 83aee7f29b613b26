//! Event types and priority queue for discrete event simulation.

use std::cmp::Ordering;

use bitrelay::{ConnHandle, Direction, LinkEvent, Timestamp};

use crate::node::NodeId;

/// Unique sequence number for deterministic event ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SequenceNumber(u64);

impl SequenceNumber {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

/// Scenario actions that can be scheduled during simulation.
#[derive(Debug, Clone)]
pub enum ScenarioAction {
    /// Partition the network into isolated groups. Links crossing groups drop.
    Partition { groups: Vec<Vec<NodeId>> },
    /// Heal all partitions. Links come back with the next scan.
    HealPartition,
    /// Disable a specific radio path.
    DisableLink { from: NodeId, to: NodeId },
    /// Enable a specific radio path.
    EnableLink { from: NodeId, to: NodeId },
    /// Set loss rate on a radio path.
    SetLossRate { from: NodeId, to: NodeId, rate: f64 },
    /// Have a node originate a chat message.
    Originate { node: NodeId, content: Vec<u8> },
}

/// Events in the discrete event simulation.
#[derive(Debug, Clone)]
pub enum Event {
    /// Payload arriving over an established link, on the receiver's handle.
    Deliver {
        to: NodeId,
        handle: ConnHandle,
        data: Vec<u8>,
    },
    /// Send slot granted on a link.
    CanSendNow {
        node: NodeId,
        handle: ConnHandle,
        direction: Direction,
    },
    /// Outgoing connect reaching its target.
    Establish { initiator: NodeId, target: NodeId },
    /// Link dropped; both ends are told.
    Teardown { node: NodeId, handle: ConnHandle },
    /// Any other link-layer event for one node (scan reports, GATT results,
    /// RSSI readings).
    Link { node: NodeId, event: LinkEvent },
    /// Fire timer for a node.
    TimerFire { node: NodeId },
    /// Execute a scenario action.
    ScenarioAction(ScenarioAction),
}

/// A scheduled event with timestamp and sequence number for ordering.
#[derive(Debug, Clone)]
pub struct ScheduledEvent {
    /// When the event should occur.
    pub time: Timestamp,
    /// Sequence number for deterministic ordering of same-time events.
    pub seq: SequenceNumber,
    /// The event to process.
    pub event: Event,
}

impl ScheduledEvent {
    pub fn new(time: Timestamp, seq: SequenceNumber, event: Event) -> Self {
        Self { time, seq, event }
    }
}

// Implement ordering for min-heap (BinaryHeap is max-heap, so we reverse).
impl PartialEq for ScheduledEvent {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.seq == other.seq
    }
}

impl Eq for ScheduledEvent {}

impl PartialOrd for ScheduledEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        // Earlier time first, then lower sequence number.
        match other.time.as_millis().cmp(&self.time.as_millis()) {
            Ordering::Equal => other.seq.cmp(&self.seq),
            ord => ord,
        }
    }
}
