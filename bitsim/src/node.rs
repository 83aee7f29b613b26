//! SimNode wrapper for simulated repeaters.

use std::cell::Cell;
use std::future::{ready, Ready};
use std::sync::{Arc, Mutex};

use bitrelay::debug::{DebugEmitter, DebugEvent};
use bitrelay::{
    Address, AddressType, Clock, ConnHandle, DefaultConfig, Direction, Duration, LinkError,
    LinkEvent, LinkEventChannel, LinkLayer, PacketKey, Relay, RelayConfig, Timestamp, Tracker,
};
use embassy_sync::channel::TrySendError;

/// Nodes are known by their BLE address.
pub type NodeId = Address;

/// Address of the node built from `seed`.
pub fn node_address(seed: u64) -> NodeId {
    let b = seed.to_le_bytes();
    [0xb1, 0x7c, b[3], b[2], b[1], b[0]]
}

/// Relay cadence compressed so scans and sweeps happen within seconds of
/// simulated time. Store sizes follow [`DefaultConfig`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SimConfig;

impl RelayConfig for SimConfig {
    const RETENTION: Duration = Duration::from_mins(2);
    const CLEANUP_INTERVAL: Duration = Duration::from_mins(1);
    const FIRST_CLEANUP: Duration = Duration::from_secs(90);
    const POLL_INTERVAL: Duration = DefaultConfig::POLL_INTERVAL;
    const ANNOUNCE_INTERVAL: Duration = DefaultConfig::ANNOUNCE_INTERVAL;
    const RSSI_RESTART_INTERVAL: Duration = Duration::from_secs(30);
    const SCAN_INTERVAL: Duration = Duration::from_secs(20);
    const SCAN_WINDOW: Duration = Duration::from_millis(500);
    const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    const RECONNECT_BACKOFF: Duration = DefaultConfig::RECONNECT_BACKOFF;
    const CLOCK_DIVERGENCE: Duration = DefaultConfig::CLOCK_DIVERGENCE;
    const CLOCK_SYNC_FLOOR: u64 = DefaultConfig::CLOCK_SYNC_FLOOR;
    const DEFAULT_MTU: u16 = DefaultConfig::DEFAULT_MTU;
    const MAX_MAILBOX_DEPTH: usize = DefaultConfig::MAX_MAILBOX_DEPTH;
    const MAX_MESSAGES: usize = DefaultConfig::MAX_MESSAGES;
    const MAX_PACKETS: usize = DefaultConfig::MAX_PACKETS;
    const MAX_PEERS: usize = DefaultConfig::MAX_PEERS;
    const MAX_NEIGHBOURS: usize = DefaultConfig::MAX_NEIGHBOURS;
}

/// Request a relay made of its link layer, for the simulator to act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOp {
    CanSend(ConnHandle, Direction),
    Send {
        handle: ConnHandle,
        direction: Direction,
        data: Vec<u8>,
    },
    Rssi(ConnHandle),
    Connect(Address),
    Disconnect(ConnHandle),
    DiscoverServices(ConnHandle),
    DiscoverCharacteristics(ConnHandle, u16, u16),
    EnableNotifications(ConnHandle, u16),
    StartScan,
}

/// Link layer that records every request; the simulator plays the radio.
pub struct SimLink {
    address: Address,
    ops: Vec<LinkOp>,
}

impl SimLink {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            ops: Vec::new(),
        }
    }

    /// Take the requests made since the last call, oldest first.
    pub fn take_ops(&mut self) -> Vec<LinkOp> {
        std::mem::take(&mut self.ops)
    }

    fn record(&mut self, op: LinkOp) -> Result<(), LinkError> {
        self.ops.push(op);
        Ok(())
    }
}

impl LinkLayer for SimLink {
    fn local_address(&self) -> Address {
        self.address
    }

    fn request_can_send(&mut self, handle: ConnHandle, direction: Direction) -> Result<(), LinkError> {
        self.record(LinkOp::CanSend(handle, direction))
    }

    fn send(
        &mut self,
        handle: ConnHandle,
        _value_handle: u16,
        direction: Direction,
        data: &[u8],
    ) -> Result<(), LinkError> {
        self.record(LinkOp::Send {
            handle,
            direction,
            data: data.to_vec(),
        })
    }

    fn read_rssi(&mut self, handle: ConnHandle) -> Result<(), LinkError> {
        self.record(LinkOp::Rssi(handle))
    }

    fn connect(&mut self, address: Address, _address_type: AddressType) -> Result<(), LinkError> {
        self.record(LinkOp::Connect(address))
    }

    fn disconnect(&mut self, handle: ConnHandle) -> Result<(), LinkError> {
        self.record(LinkOp::Disconnect(handle))
    }

    fn discover_services(&mut self, handle: ConnHandle) -> Result<(), LinkError> {
        self.record(LinkOp::DiscoverServices(handle))
    }

    fn discover_characteristics(&mut self, handle: ConnHandle, start: u16, end: u16) -> Result<(), LinkError> {
        self.record(LinkOp::DiscoverCharacteristics(handle, start, end))
    }

    fn enable_notifications(&mut self, handle: ConnHandle, value_handle: u16) -> Result<(), LinkError> {
        self.record(LinkOp::EnableNotifications(handle, value_handle))
    }

    fn start_scan(&mut self) -> Result<(), LinkError> {
        self.record(LinkOp::StartScan)
    }
}

/// Mock clock for simulation.
///
/// Time is controlled externally by the simulator.
pub struct SimClock {
    current: Cell<Timestamp>,
}

impl SimClock {
    pub fn new() -> Self {
        Self::at(Timestamp::ZERO)
    }

    pub fn at(time: Timestamp) -> Self {
        Self {
            current: Cell::new(time),
        }
    }

    pub fn set(&self, time: Timestamp) {
        self.current.set(time);
    }
}

impl Default for SimClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SimClock {
    type SleepFuture<'a> = Ready<()>;

    fn now(&self) -> Timestamp {
        self.current.get()
    }

    fn sleep_until(&self, _time: Timestamp) -> Self::SleepFuture<'_> {
        ready(())
    }
}

/// Collects trace events from the tracker.
#[derive(Clone, Default)]
struct TraceLog(Arc<Mutex<Vec<DebugEvent>>>);

impl DebugEmitter for TraceLog {
    fn emit(&mut self, event: DebugEvent) {
        if let Ok(mut events) = self.0.lock() {
            events.push(event);
        }
    }
}

pub type SimRelay = Relay<'static, SimLink, SimClock, SimConfig>;
pub type SimTracker = Tracker<SimLink, SimClock, SimConfig>;

/// One simulated repeater.
///
/// Link events go through the relay's event channel, as they would from a
/// radio callback, and are handled straight away. The channel is leaked so
/// the relay can borrow it for the life of the simulation.
pub struct SimNode {
    relay: SimRelay,
    trace: TraceLog,
    next_handle: ConnHandle,
    /// When the node was powered on.
    pub booted_at: Timestamp,
}

impl SimNode {
    /// First connection handle handed out; stacks rarely start at zero.
    const FIRST_HANDLE: ConnHandle = 0x40;

    pub fn new(address: Address, booted_at: Timestamp) -> Self {
        let events: &'static LinkEventChannel = Box::leak(Box::new(LinkEventChannel::new()));
        let mut relay: SimRelay = Relay::new(SimLink::new(address), SimClock::at(booted_at), events);
        let trace = TraceLog::default();
        relay.tracker_mut().set_debug_emitter(Box::new(trace.clone()));
        Self {
            relay,
            trace,
            next_handle: Self::FIRST_HANDLE,
            booted_at,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.relay.tracker().link().local_address()
    }

    pub fn relay(&self) -> &SimRelay {
        &self.relay
    }

    pub fn relay_mut(&mut self) -> &mut SimRelay {
        &mut self.relay
    }

    pub fn tracker(&self) -> &SimTracker {
        self.relay.tracker()
    }

    pub fn tracker_mut(&mut self) -> &mut SimTracker {
        self.relay.tracker_mut()
    }

    /// Learn network time as if a phone's announce had been heard.
    pub fn sync_clock(&mut self, network_time: Timestamp) {
        self.relay.tracker_mut().observe_time(network_time);
    }

    /// Number for the next link this node takes part in.
    pub fn allocate_handle(&mut self) -> ConnHandle {
        let handle = self.next_handle;
        self.next_handle = self.next_handle.wrapping_add(1).max(Self::FIRST_HANDLE);
        handle
    }

    /// Deliver a link-layer event at `now`.
    pub fn handle_link_event(&mut self, event: LinkEvent, now: Timestamp) {
        self.relay.tracker().clock().set(now);
        if let Err(TrySendError::Full(event)) = self.relay.events().try_send(event) {
            self.relay.handle_event(event);
        }
        while let Ok(event) = self.relay.events().try_receive() {
            self.relay.handle_event(event);
        }
    }

    /// Originate a chat message at `now`. Returns its id.
    pub fn originate(&mut self, content: &[u8], now: Timestamp) -> Option<Vec<u8>> {
        self.relay.tracker().clock().set(now);
        match self.relay.tracker_mut().originate_message(content)? {
            PacketKey::Message(id) => Some(id),
            _ => None,
        }
    }

    /// Run the relay's periodic duties at `now`.
    pub fn handle_timer(&mut self, now: Timestamp) {
        self.relay.tracker().clock().set(now);
        self.relay.handle_timer(now);
    }

    pub fn next_wake(&self) -> Timestamp {
        self.relay.next_wake()
    }

    /// Take the link requests made since the last call.
    pub fn take_ops(&mut self) -> Vec<LinkOp> {
        self.relay.tracker_mut().link_mut().take_ops()
    }

    /// Take all trace events emitted since the last call.
    pub fn take_debug_events(&self) -> Vec<DebugEvent> {
        match self.trace.0.lock() {
            Ok(mut events) => std::mem::take(&mut *events),
            Err(_) => Vec::new(),
        }
    }
}
