//! Tracker - all mutable relay state.
//!
//! The Tracker owns every link, peer and stored packet, plus the bookkeeping
//! that keeps flooding at-most-once per link. Behaviour is split across
//! modules by concern, each adding an `impl` block:
//!
//! - [`processor`](crate::processor) - decoding writes and dispatching by type
//! - [`queue`](crate::queue) - targeted/broadcast queues and link mailboxes
//! - [`maintenance`](crate::maintenance) - announce, clock, sweep, RSSI and link hygiene
//!
//! # Usage
//!
//! ```
//! use bitrelay::Tracker;
//! use bitrelay::traits::test_impls::{MockClock, MockLink};
//!
//! let mut tracker: Tracker<_, _> = Tracker::new(MockLink::new(), MockClock::new());
//! tracker.connection_for_handle(1).connected = true;
//! assert_eq!(tracker.connections_count(), 1);
//! ```

#[cfg(feature = "debug")]
use alloc::boxed::Box;
use alloc::collections::{BTreeMap, BTreeSet};
use alloc::vec::Vec;
use core::marker::PhantomData;

use hashbrown::{Equivalent, HashMap, HashSet};

use crate::collections::{ShrinkingHashMap, ShrinkingVecDeque};
use crate::config::{DefaultConfig, RelayConfig};
use crate::connection::Connection;
#[cfg(feature = "debug")]
use crate::debug::{DebugEmitter, DebugEvent};
use crate::queue::Mailbox;
use crate::time::{ClockOffset, Timestamp};
use crate::traits::{Clock, Direction, LinkLayer};
use crate::types::{
    Address, Announce, ConnHandle, Header, Message, PacketKey, PassAlong, Peer, PeerId,
    RelayMetrics,
};
use crate::wire::Encode;

// Type aliases for collections
pub type ConnectionMap = BTreeMap<ConnHandle, Connection>;
pub type NeighbourMap = HashMap<Address, Connection>;
pub type PeerMap = HashMap<PeerId, Peer>;
/// Link handle -> peer believed to be on the other end.
pub type HandlePeerMap = BTreeMap<ConnHandle, PeerId>;
/// Message id -> message.
pub type MessageStore = ShrinkingHashMap<Vec<u8>, Message>;
/// Dedup hash -> pass-along packet.
pub type PacketStore = ShrinkingHashMap<u64, PassAlong>;
pub type SentToConnections = HashSet<(PacketKey, ConnHandle)>;
pub type SentToPeers = HashSet<(PacketKey, PeerId)>;
pub type BroadcastQueue = ShrinkingVecDeque<PacketKey>;
pub type TargetedQueue = BTreeSet<(PacketKey, ConnHandle)>;
pub type MailboxMap = BTreeMap<(ConnHandle, Direction), Mailbox>;

/// Borrowed lookup into the sent-mark sets, so checks need no key clone.
#[derive(Hash)]
pub(crate) struct SentMark<'a, T>(pub &'a PacketKey, pub T);

impl<T: PartialEq> Equivalent<(PacketKey, T)> for SentMark<'_, T> {
    fn equivalent(&self, mark: &(PacketKey, T)) -> bool {
        *self.0 == mark.0 && self.1 == mark.1
    }
}

/// Relay state for one repeater.
///
/// Generic over:
/// - `L`: Link layer implementation
/// - `C`: Clock implementation
/// - `Cfg`: Store capacities and timing
///
/// Stores are reachable crate-wide so the processing modules can borrow
/// disjoint parts at once.
pub struct Tracker<L, C, Cfg = DefaultConfig> {
    // Dependencies (injected)
    pub(crate) link: L,
    pub(crate) clock: C,

    // Identity
    pub(crate) announce: Announce,
    pub(crate) clock_offset: ClockOffset,

    // Links and peers
    pub(crate) connections: ConnectionMap,
    pub(crate) neighbours: NeighbourMap,
    pub(crate) peers: PeerMap,
    pub(crate) handle_peers: HandlePeerMap,

    // Dedup stores
    pub(crate) messages: MessageStore,
    pub(crate) packets: PacketStore,

    // Send bookkeeping
    pub(crate) sent_to_connections: SentToConnections,
    pub(crate) sent_to_peers: SentToPeers,
    pub(crate) broadcast: BroadcastQueue,
    pub(crate) targeted: TargetedQueue,
    pub(crate) mailboxes: MailboxMap,

    // RSSI polling: next handle to read
    pub(crate) rssi_cursor: Option<ConnHandle>,

    pub(crate) metrics: RelayMetrics,

    #[cfg(feature = "debug")]
    debug_emitter: Option<Box<dyn DebugEmitter>>,

    _config: PhantomData<Cfg>,
}

impl<L, C, Cfg> Tracker<L, C, Cfg>
where
    L: LinkLayer,
    C: Clock,
    Cfg: RelayConfig,
{
    /// Create an empty tracker. The self announce is built on first use.
    pub fn new(link: L, clock: C) -> Self {
        Self {
            link,
            clock,

            announce: Announce::unset(),
            clock_offset: ClockOffset::ZERO,

            connections: BTreeMap::new(),
            neighbours: HashMap::new(),
            peers: HashMap::new(),
            handle_peers: BTreeMap::new(),

            messages: ShrinkingHashMap::with_max_capacity(Cfg::MAX_MESSAGES),
            packets: ShrinkingHashMap::with_max_capacity(Cfg::MAX_PACKETS),

            sent_to_connections: HashSet::new(),
            sent_to_peers: HashSet::new(),
            broadcast: ShrinkingVecDeque::with_max_capacity(Cfg::MAX_MESSAGES + Cfg::MAX_PACKETS),
            targeted: BTreeSet::new(),
            mailboxes: BTreeMap::new(),

            rssi_cursor: None,

            metrics: RelayMetrics::new(),

            #[cfg(feature = "debug")]
            debug_emitter: None,

            _config: PhantomData,
        }
    }

    /// Install a receiver for relay trace events.
    #[cfg(feature = "debug")]
    pub fn set_debug_emitter(&mut self, emitter: Box<dyn DebugEmitter>) {
        self.debug_emitter = Some(emitter);
    }

    #[cfg(feature = "debug")]
    pub(crate) fn emit_debug(&mut self, event: DebugEvent) {
        if let Some(emitter) = self.debug_emitter.as_mut() {
            emitter.emit(event);
        }
    }

    /// Get the link layer reference.
    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    /// Get the clock reference.
    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Corrected (network) time.
    pub fn now(&self) -> Timestamp {
        self.clock_offset.apply(self.clock.now())
    }

    /// Uncorrected monotonic time, used for timer deadlines.
    pub fn monotonic_now(&self) -> Timestamp {
        self.clock.now()
    }

    pub fn clock_offset(&self) -> ClockOffset {
        self.clock_offset
    }

    /// Get relay metrics for monitoring.
    pub fn metrics(&self) -> &RelayMetrics {
        &self.metrics
    }

    /// The self announce as last built.
    pub fn announce(&self) -> &Announce {
        &self.announce
    }

    // --- Links ---

    /// Get the link record for `handle`, creating it if needed.
    ///
    /// Every mutation path goes through here so a record always exists
    /// before any field is touched.
    pub fn connection_for_handle(&mut self, handle: ConnHandle) -> &mut Connection {
        let now = self.now();
        self.connections
            .entry(handle)
            .or_insert_with(|| Connection::new(handle, Cfg::DEFAULT_MTU, now))
    }

    pub fn connection(&self, handle: ConnHandle) -> Option<&Connection> {
        self.connections.get(&handle)
    }

    /// All link records, connected or not, in handle order.
    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    pub fn neighbour(&self, address: &Address) -> Option<&Connection> {
        self.neighbours.get(address)
    }

    /// Links plus scanned neighbours.
    pub fn connections_count(&self) -> usize {
        self.connections.len() + self.neighbours.len()
    }

    /// Connected links.
    pub fn active_connections_count(&self) -> usize {
        self.connections.values().filter(|c| c.connected).count()
    }

    // --- Peers ---

    pub fn peer_with_id(&self, id: PeerId) -> Option<&Peer> {
        self.peers.get(&id)
    }

    /// Get the peer for a sender id, creating it on first sighting.
    ///
    /// When the peer map is full the peer heard from least recently is
    /// dropped first.
    pub fn peer_for_sender(&mut self, id: PeerId) -> &mut Peer {
        let now = self.now();
        if self.peers.len() >= Cfg::MAX_PEERS && !self.peers.contains_key(&id) {
            if let Some(oldest) = self
                .peers
                .values()
                .min_by_key(|p| p.last_seen)
                .map(|p| p.id)
            {
                self.peers.remove(&oldest);
                self.handle_peers.retain(|_, peer| *peer != oldest);
                self.metrics.evictions += 1;
            }
        }
        let peer = self.peers.entry(id).or_insert_with(|| Peer::new(id, now));
        peer.last_seen = now;
        peer
    }

    pub fn peers_count(&self) -> usize {
        self.peers.len()
    }

    // --- Dedup stores ---

    /// Store a message unless its id was seen before.
    ///
    /// Returns the key to queue it under only on first insertion.
    pub fn store_message_if_new(&mut self, message: Message) -> Option<PacketKey> {
        let key = PacketKey::Message(message.id.clone());
        let id = message.id.clone();
        let (inserted, evicted) =
            self.messages
                .insert_new_bounded(id, message, |m: &Message| m.header.timestamp);
        if evicted.is_some() {
            self.metrics.evictions += 1;
        }
        if inserted {
            self.metrics.messages_stored += 1;
            Some(key)
        } else {
            self.metrics.duplicates_dropped += 1;
            None
        }
    }

    /// Store a pass-along packet unless its dedup hash was seen before.
    pub fn store_packet_if_new(&mut self, packet: PassAlong) -> Option<PacketKey> {
        let hash = packet.dedup_hash();
        let (inserted, evicted) =
            self.packets
                .insert_new_bounded(hash, packet, |p: &PassAlong| p.header.timestamp);
        if evicted.is_some() {
            self.metrics.evictions += 1;
        }
        if inserted {
            self.metrics.packets_stored += 1;
            Some(PacketKey::PassAlong(hash))
        } else {
            self.metrics.duplicates_dropped += 1;
            None
        }
    }

    pub fn message_with_id(&self, id: &[u8]) -> Option<&Message> {
        self.messages.get(id)
    }

    pub fn packet_with_hash(&self, hash: u64) -> Option<&PassAlong> {
        self.packets.get(&hash)
    }

    /// Any stored pass-along packet.
    pub fn any_packet(&self) -> Option<&PassAlong> {
        self.packets.values().next()
    }

    pub fn messages_count(&self) -> usize {
        self.messages.len()
    }

    pub fn packets_count(&self) -> usize {
        self.packets.len()
    }

    /// Header of the packet a key refers to.
    pub(crate) fn packet_header(&self, key: &PacketKey) -> Option<&Header> {
        match key {
            PacketKey::Announce => Some(&self.announce.header),
            PacketKey::Message(id) => self.messages.get(id.as_slice()).map(|m| &m.header),
            PacketKey::PassAlong(hash) => self.packets.get(hash).map(|p| &p.header),
        }
    }

    /// Serialize the packet a key refers to, spending one hop.
    pub(crate) fn encode_packet(&self, key: &PacketKey) -> Option<Vec<u8>> {
        match key {
            PacketKey::Announce => Some(self.announce.encode_to_vec()),
            PacketKey::Message(id) => self.messages.get(id.as_slice()).map(Encode::encode_to_vec),
            PacketKey::PassAlong(hash) => self.packets.get(hash).map(Encode::encode_to_vec),
        }
    }
}
