//! Periodic upkeep and link bookkeeping.
//!
//! Covers the self announce, network clock correction, the eviction sweep,
//! round-robin RSSI polling, neighbour selection and the link/peer reverse
//! map. Locally originated messages are built here as well.

use alloc::vec::Vec;
use core::ops::Bound;

use hashbrown::{HashMap, HashSet};

use crate::config::RelayConfig;
use crate::connection::{AddressType, Connection, Role, ServiceStatus};
use crate::tracker::Tracker;
use crate::traits::{Clock, LinkLayer};
use crate::types::{
    Address, ConnHandle, Header, Message, PacketKey, PacketType, Peer, PeerId, ANNOUNCE_TTL,
    ORIGINATED_MESSAGE_TTL, SERVICE_NAME,
};
use crate::time::Timestamp;
use crate::wire::Writer;

/// What one eviction sweep removed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub connections: usize,
    pub neighbours: usize,
    pub messages: usize,
    pub packets: usize,
    pub sent_to_connections: usize,
    pub sent_to_peers: usize,
    pub broadcast: usize,
    pub targeted: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.connections
            + self.neighbours
            + self.messages
            + self.packets
            + self.sent_to_connections
            + self.sent_to_peers
            + self.broadcast
            + self.targeted
    }
}

/// Our peer id: the controller address read little-endian.
pub fn local_peer_id(address: &Address) -> PeerId {
    let mut bytes = [0u8; 8];
    bytes[..6].copy_from_slice(address);
    u64::from_le_bytes(bytes)
}

/// "Repeater" followed by the last two address bytes in hex.
pub fn local_name(address: &Address) -> Vec<u8> {
    let mut w = Writer::with_capacity(SERVICE_NAME.len() + 4);
    w.write_bytes(SERVICE_NAME);
    w.write_u8_hex(address[4]);
    w.write_u8_hex(address[5]);
    w.finish()
}

impl<L, C, Cfg> Tracker<L, C, Cfg>
where
    L: LinkLayer,
    C: Clock,
    Cfg: RelayConfig,
{
    // --- Announce ---

    /// Rebuild the self announce if its ttl no longer matches.
    pub fn setup_announce_if_needed(&mut self) {
        if self.announce.header.ttl == ANNOUNCE_TTL {
            return;
        }
        let address = self.link.local_address();
        self.announce.header = Header::new(
            PacketType::Announce,
            ANNOUNCE_TTL,
            self.now(),
            local_peer_id(&address),
        );
        self.announce.name = local_name(&address);
    }

    /// Queue the self announce for every usable link that has not had it.
    ///
    /// Nothing is announced until the corrected clock has been synced past
    /// the floor; before that our timestamps would be meaningless to phones.
    pub fn announce_to_connections(&mut self) {
        self.setup_announce_if_needed();
        if !self.clock_offset.reached(Cfg::CLOCK_SYNC_FLOOR) {
            return;
        }

        let due: Vec<ConnHandle> = self
            .connections
            .values()
            .filter(|c| c.is_usable())
            .map(|c| c.handle)
            .filter(|h| !self.sent_to_connections.contains(&(PacketKey::Announce, *h)))
            .collect();

        for handle in due {
            let now = self.now();
            self.announce.header.timestamp = now;
            log::debug!("announce to 0x{:x}", handle);
            if self.enqueue_targeted(PacketKey::Announce, handle).is_ok() {
                emit_debug!(
                    self,
                    crate::debug::DebugEvent::AnnounceTargeted {
                        handle,
                        timestamp: now,
                    }
                );
            }
        }
    }

    // --- Clock ---

    /// Fold a packet timestamp into the clock offset.
    pub fn observe_time(&mut self, timestamp: Timestamp) {
        let monotonic = self.clock.now();
        if self.clock_offset.observe(timestamp, monotonic, Cfg::CLOCK_DIVERGENCE) {
            log::debug!("clock offset now {} ms", self.clock_offset.as_millis());
            emit_debug!(
                self,
                crate::debug::DebugEvent::ClockCorrected {
                    offset_ms: self.clock_offset.as_millis(),
                }
            );
        }
    }

    // --- Sweep ---

    fn key_is_stale(&self, key: &PacketKey, now: Timestamp) -> bool {
        self.packet_header(key)
            .map_or(true, |h| h.timestamp.is_older_than(Cfg::RETENTION, now))
    }

    /// Drop everything older than the retention window.
    ///
    /// Packets and their bookkeeping age by header timestamp; links and
    /// neighbours by last sighting, and only once disconnected.
    pub fn cleanup_stale(&mut self) -> SweepReport {
        let now = self.now();
        let mut report = SweepReport::default();

        let mut keys: HashSet<&PacketKey> = HashSet::new();
        keys.extend(self.sent_to_connections.iter().map(|(k, _)| k));
        keys.extend(self.sent_to_peers.iter().map(|(k, _)| k));
        keys.extend(self.broadcast.iter());
        keys.extend(self.targeted.iter().map(|(k, _)| k));
        let stale: HashSet<PacketKey> = keys
            .into_iter()
            .filter(|k| self.key_is_stale(k, now))
            .cloned()
            .collect();

        let connections = &self.connections;
        let link_gone = |handle: &ConnHandle| {
            connections
                .get(handle)
                .map_or(true, |c| c.is_stale(Cfg::RETENTION, now))
        };

        let before = self.sent_to_connections.len();
        self.sent_to_connections
            .retain(|(key, handle)| !stale.contains(key) && !link_gone(handle));
        report.sent_to_connections = before - self.sent_to_connections.len();

        let before = self.sent_to_peers.len();
        self.sent_to_peers.retain(|(key, _)| !stale.contains(key));
        report.sent_to_peers = before - self.sent_to_peers.len();

        let before = self.broadcast.len();
        self.broadcast.retain(|key| !stale.contains(key));
        report.broadcast = before - self.broadcast.len();

        let before = self.targeted.len();
        self.targeted
            .retain(|(key, handle)| !stale.contains(key) && !link_gone(handle));
        report.targeted = before - self.targeted.len();

        let before = self.connections.len();
        self.connections
            .retain(|_, c| !c.is_stale(Cfg::RETENTION, now));
        report.connections = before - self.connections.len();

        let before = self.neighbours.len();
        self.neighbours
            .retain(|_, c| !c.is_stale(Cfg::RETENTION, now));
        report.neighbours = before - self.neighbours.len();

        let before = self.messages.len();
        self.messages
            .retain(|_, m| !m.header.timestamp.is_older_than(Cfg::RETENTION, now));
        report.messages = before - self.messages.len();

        let before = self.packets.len();
        self.packets
            .retain(|_, p| !p.header.timestamp.is_older_than(Cfg::RETENTION, now));
        report.packets = before - self.packets.len();

        let connections = &self.connections;
        self.handle_peers.retain(|h, _| connections.contains_key(h));
        self.mailboxes.retain(|(h, _), _| connections.contains_key(h));
        if let Some(cursor) = self.rssi_cursor {
            if !self.connections.contains_key(&cursor) {
                self.rssi_cursor = None;
            }
        }

        log::debug!(
            "sweep removed: connections({}), neighbours({}), messages({}), packets({}), \
             packet con({}), packet peer({}), broadcast({}), targeted({})",
            report.connections,
            report.neighbours,
            report.messages,
            report.packets,
            report.sent_to_connections,
            report.sent_to_peers,
            report.broadcast,
            report.targeted
        );
        emit_debug!(
            self,
            crate::debug::DebugEvent::Swept {
                timestamp: now,
                removed: alloc::vec![
                    ("connections", report.connections),
                    ("neighbours", report.neighbours),
                    ("messages", report.messages),
                    ("packets", report.packets),
                    ("sent_to_connections", report.sent_to_connections),
                    ("sent_to_peers", report.sent_to_peers),
                    ("broadcast", report.broadcast),
                    ("targeted", report.targeted),
                ],
            }
        );
        report
    }

    // --- RSSI ---

    /// Request one RSSI reading, advancing the cursor.
    ///
    /// Returns true while links remain in this round.
    pub fn request_next_rssi(&mut self, restart: bool) -> bool {
        let start = if restart { None } else { self.rssi_cursor };
        let next = match start {
            Some(cursor) => self
                .connections
                .range(cursor..)
                .next()
                .or_else(|| self.connections.iter().next()),
            None => self.connections.iter().next(),
        };
        let Some(handle) = next.map(|(h, _)| *h) else {
            self.rssi_cursor = None;
            return false;
        };

        if let Err(e) = self.link.read_rssi(handle) {
            self.metrics.link_errors += 1;
            log::debug!("rssi request on 0x{:x} failed: {:?}", handle, e);
        }

        self.rssi_cursor = self
            .connections
            .range((Bound::Excluded(handle), Bound::Unbounded))
            .next()
            .map(|(h, _)| *h);
        self.rssi_cursor.is_some()
    }

    pub fn set_rssi(&mut self, handle: ConnHandle, rssi: i8) {
        self.connection_for_handle(handle).rssi = Some(rssi);
    }

    // --- Links ---

    /// When one peer sits behind two links, the link seen least recently.
    pub fn any_duplicate_handle(&self) -> Option<ConnHandle> {
        let mut seen: HashMap<PeerId, ConnHandle> = HashMap::new();
        for (&handle, &peer) in &self.handle_peers {
            if let Some(&earlier) = seen.get(&peer) {
                let last_seen = |h: ConnHandle| self.connections.get(&h).map(|c| c.last_seen);
                return if last_seen(earlier) < last_seen(handle) {
                    Some(earlier)
                } else {
                    Some(handle)
                };
            }
            seen.insert(peer, handle);
        }
        None
    }

    /// Record a scanned neighbour advertising the bitchat service.
    ///
    /// When the neighbour table is full the neighbour seen least recently
    /// makes room.
    pub fn add_neighbour(
        &mut self,
        address: Address,
        address_type: AddressType,
        status: ServiceStatus,
        rssi: i8,
    ) {
        let now = self.now();
        if !self.neighbours.contains_key(&address) && self.neighbours.len() >= Cfg::MAX_NEIGHBOURS {
            if let Some(oldest) = self
                .neighbours
                .iter()
                .min_by_key(|(_, c)| c.last_seen)
                .map(|(a, _)| *a)
            {
                self.neighbours.remove(&oldest);
                self.metrics.evictions += 1;
            }
        }
        let neighbour = self.neighbours.entry(address).or_insert_with(|| {
            Connection::neighbour(address, address_type, status, rssi, Cfg::DEFAULT_MTU, now)
        });
        neighbour.address_type = address_type;
        neighbour.service_status = status;
        neighbour.rssi = Some(rssi);
        neighbour.last_seen = now;
    }

    /// Neighbours worth connecting to, in address order.
    ///
    /// Random addresses rotate, so they are left for them to connect to us.
    /// Until the clock is synced only other repeaters qualify.
    pub fn connectable_neighbours(&self) -> Vec<&Connection> {
        let synced = self.clock_offset.reached(Cfg::CLOCK_SYNC_FLOOR);
        let mut out: Vec<&Connection> = self
            .neighbours
            .values()
            .filter(|c| !c.connected && !c.is_random() && (synced || c.is_repeater()))
            .collect();
        out.sort_by_key(|c| c.address);
        out
    }

    /// Connected link to `address`, if any.
    pub fn connection_for_address(&self, address: &Address) -> Option<&Connection> {
        self.connections
            .values()
            .find(|c| c.connected && c.address == *address)
    }

    /// A connect to `address` was issued; stop offering it as a neighbour.
    pub fn set_connection_started(&mut self, address: &Address) {
        self.neighbours.remove(address);
    }

    /// Link established. A neighbour record for the address becomes the
    /// link record; otherwise a handle left over from an earlier link starts
    /// from a blank record.
    pub fn report_connection(
        &mut self,
        handle: ConnHandle,
        address: Address,
        address_type: AddressType,
        role: Role,
    ) {
        let now = self.now();
        if let Some(mut neighbour) = self.neighbours.remove(&address) {
            neighbour.handle = handle;
            self.connections.insert(handle, neighbour);
        } else if self.connections.get(&handle).is_some_and(|c| !c.connected) {
            self.connections
                .insert(handle, Connection::new(handle, Cfg::DEFAULT_MTU, now));
        }
        let c = self.connection_for_handle(handle);
        c.connected = true;
        c.address = address;
        c.address_type = address_type;
        c.role = role;
        c.last_seen = now;
        log::info!("connected 0x{:x} ({:?})", handle, role);
    }

    /// Link dropped. The record stays until the sweep; its sent marks,
    /// targeted entries and queued payloads go now so whatever reuses the
    /// handle starts fresh.
    pub fn report_disconnection(&mut self, handle: ConnHandle) {
        let now = self.now();
        let c = self.connection_for_handle(handle);
        c.notifications_enabled = false;
        c.connected = false;
        c.last_seen = now;

        if let Some(peer) = self.handle_peers.remove(&handle) {
            if let Some(p) = self.peers.get_mut(&peer) {
                if p.handle == Some(handle) {
                    p.handle = None;
                }
            }
        }
        self.sent_to_connections.retain(|(_, h)| *h != handle);
        self.targeted.retain(|(_, h)| *h != handle);
        self.discard_mailboxes(handle);
        log::info!("disconnected 0x{:x}", handle);
    }

    // --- Peers by link ---

    pub fn set_handle_for_peer(&mut self, handle: ConnHandle, peer: PeerId) {
        self.handle_peers.insert(handle, peer);
        if let Some(p) = self.peers.get_mut(&peer) {
            p.handle = Some(handle);
        }
    }

    pub fn peer_for_handle(&self, handle: ConnHandle) -> Option<&Peer> {
        self.handle_peers
            .get(&handle)
            .and_then(|id| self.peers.get(id))
    }

    // --- Local traffic ---

    /// Build, store and broadcast a chat message from this node.
    pub fn originate_message(&mut self, content: &[u8]) -> Option<PacketKey> {
        self.setup_announce_if_needed();
        let now = self.now();
        let sender = self.announce.header.sender_id;

        let mut id = Writer::with_capacity(21);
        id.write_u32_hex(now.as_millis() as u32);
        id.write_u8(b'-');
        id.write_u48_hex(sender);

        let header = Header::new(PacketType::Message, ORIGINATED_MESSAGE_TTL, now, sender);
        let message = Message::new(
            header,
            now,
            id.finish(),
            self.announce.name.clone(),
            content.to_vec(),
        );
        let key = self.store_message_if_new(message)?;
        if let Err(e) = self.enqueue_broadcast(key.clone(), None) {
            log::warn!("local message not queued: {}", e);
        }
        Some(key)
    }

    // --- Stats ---

    /// Log store sizes and counters.
    pub fn print_stats(&self) {
        let ms = self.monotonic_now().as_millis();
        let secs = ms / 1000;
        log::info!(
            "[{:02}:{:02}:{:02}.{:03}] synced: {}, con: {}/{}, avail: {}, peers: {}, messages: {}, \
             packets: {}, broadcast: {}, targeted: {}",
            secs / 3600,
            (secs / 60) % 60,
            secs % 60,
            ms % 1000,
            self.clock_offset.reached(Cfg::CLOCK_SYNC_FLOOR),
            self.active_connections_count(),
            self.connections.len(),
            self.neighbours.len(),
            self.peers.len(),
            self.messages.len(),
            self.packets.len(),
            self.broadcast.len(),
            self.targeted.len()
        );
        for c in self.connections.values().filter(|c| c.connected) {
            log::info!(
                "  0x{:x} {:?} mtu {} rssi {:?} peer {:?}",
                c.handle,
                c.role,
                c.mtu,
                c.rssi,
                self.handle_peers.get(&c.handle)
            );
        }
        log::info!("{:?}", self.metrics);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DefaultConfig;
    use crate::time::Duration;
    use crate::traits::test_impls::{LinkRequest, MockClock, MockLink};
    use crate::tracker::tests::{grant_all, make_tracker, open_link, TestTracker};

    const SYNCED: u64 = 1_755_685_519;

    fn synced_tracker() -> TestTracker {
        let mut tracker = make_tracker();
        tracker.observe_time(Timestamp::from_millis(SYNCED));
        tracker
    }

    #[test]
    fn test_local_identity() {
        let address = [0x01, 0x02, 0x03, 0x04, 0x0a, 0xbc];
        assert_eq!(local_peer_id(&address), 0x0000_bc0a_0403_0201);
        assert_eq!(local_name(&address), b"Repeater0abc");
    }

    #[test]
    fn test_time_offset_set() {
        let mut tracker = make_tracker();
        assert_eq!(tracker.now(), Timestamp::ZERO);

        tracker.observe_time(Timestamp::from_millis(SYNCED));
        assert_eq!(tracker.now().as_millis(), 1_755_685_519);

        tracker.observe_time(Timestamp::from_millis(SYNCED + 1000));
        assert_eq!(tracker.now().as_millis(), 1_755_686_519);
        assert_eq!(tracker.monotonic_now(), Timestamp::ZERO);
    }

    #[test]
    fn test_announce_waits_for_clock() {
        let mut tracker = make_tracker();
        open_link(&mut tracker, 1, 1, 517);
        tracker.announce_to_connections();
        assert_eq!(tracker.targeted_len(), 0);
        // Still built, so local messages have a name.
        assert_eq!(tracker.announce().header.ttl, ANNOUNCE_TTL);
    }

    #[test]
    fn test_announce_to_connections() {
        let mut tracker = make_tracker();
        tracker.observe_time(Timestamp::from_millis(SYNCED + 40));
        tracker.report_connection(1, [0; 6], AddressType::Random, Role::Acceptor);
        let c = tracker.connection_for_handle(1);
        c.value_handle = 1;
        c.mtu = 517;

        tracker.announce_to_connections();
        assert_eq!(tracker.targeted_len(), 1);

        tracker.drain();
        tracker.announce_to_connections();
        assert_eq!(tracker.targeted_len(), 0);

        tracker.clock().set(Timestamp::ZERO + Duration::from_mins(15));
        tracker.connection_for_handle(1).connected = false;
        assert_eq!(tracker.connections_count(), 1);
        tracker.cleanup_stale();
        assert_eq!(tracker.connections_count(), 0);
    }

    #[test]
    fn test_announce_only_once() {
        let mut tracker = synced_tracker();
        open_link(&mut tracker, 3, 7, 517);
        tracker.announce_to_connections();
        tracker.drain();
        grant_all(&mut tracker);
        assert_eq!(tracker.link_mut().take_sent().iter().map(|s| s.data.len()).sum::<usize>(), 35);

        open_link(&mut tracker, 5, 7, 517);
        tracker.announce_to_connections();
        tracker.drain();
        grant_all(&mut tracker);
        let sent = tracker.link_mut().take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].handle, 5);
        assert_eq!(sent[0].data.len(), 35);
        assert_eq!(&sent[0].data[22..30], SERVICE_NAME);
    }

    #[test]
    fn test_announce_pending_not_duplicated() {
        let mut tracker = synced_tracker();
        open_link(&mut tracker, 3, 7, 517);
        tracker.announce_to_connections();
        assert!(tracker.link().sent().is_empty());

        open_link(&mut tracker, 5, 7, 517);
        tracker.announce_to_connections();
        assert!(tracker.link().sent().is_empty());
        assert_eq!(tracker.targeted_len(), 2);

        tracker.clock().set(Timestamp::ZERO + Duration::from_mins(15));
        tracker.cleanup_stale();
        assert_eq!(tracker.targeted_len(), 0);
    }

    #[test]
    fn test_reconnect_gets_fresh_announce() {
        let mut tracker = synced_tracker();
        tracker.report_connection(2, [2; 6], AddressType::Public, Role::Initiator);
        tracker.connection_for_handle(2).value_handle = 9;
        tracker.announce_to_connections();
        tracker.drain();
        assert!(tracker.was_sent(&PacketKey::Announce, 2));

        tracker.report_disconnection(2);
        assert!(!tracker.was_sent(&PacketKey::Announce, 2));
        assert_eq!(tracker.mailbox_len(2, crate::traits::Direction::Write), 0);
        assert!(!tracker.connection(2).unwrap().connected);
    }

    #[test]
    fn test_reused_handle_starts_blank() {
        let mut tracker = synced_tracker();
        tracker.report_connection(1, [1; 6], AddressType::Public, Role::Acceptor);
        let c = tracker.connection_for_handle(1);
        c.value_handle = 7;
        c.mtu = 517;
        c.service_start = 0x10;
        c.rssi = Some(-40);
        let key = tracker.originate_message(b"before").unwrap();
        tracker.drain();
        grant_all(&mut tracker);
        assert_eq!(tracker.link_mut().take_sent().len(), 1);

        tracker.report_disconnection(1);
        tracker.report_connection(1, [9; 6], AddressType::Public, Role::Acceptor);
        let c = tracker.connection(1).unwrap();
        assert!(c.connected);
        assert!(!c.is_usable());
        assert_eq!(c.address, [9; 6]);
        assert_eq!(c.mtu, DefaultConfig::DEFAULT_MTU);
        assert_eq!(c.service_start, 0);
        assert_eq!(c.rssi, None);
        assert!(!tracker.was_sent(&key, 1));

        // The new device subscribes and gets the retained broadcast.
        tracker.drain();
        assert!(tracker.link().requests().is_empty());
        let c = tracker.connection_for_handle(1);
        c.value_handle = 7;
        c.mtu = 517;
        tracker.drain();
        grant_all(&mut tracker);
        let sent = tracker.link_mut().take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].handle, 1);
    }

    #[test]
    fn test_sweep_keeps_fresh_entries() {
        let mut tracker = synced_tracker();
        open_link(&mut tracker, 1, 7, 517);
        let old = tracker.originate_message(b"old").unwrap();
        tracker.clock().advance(Duration::from_mins(9));
        let fresh = tracker.originate_message(b"fresh").unwrap();
        tracker.drain();
        grant_all(&mut tracker);
        assert_eq!(tracker.broadcast_len(), 2);

        tracker.clock().advance(Duration::from_mins(2));
        let report = tracker.cleanup_stale();
        assert_eq!(report.messages, 1);
        assert_eq!(report.broadcast, 1);
        assert_eq!(report.sent_to_connections, 1);
        assert_eq!(report.connections, 0);
        assert!(!tracker.was_sent(&old, 1));
        assert!(tracker.was_sent(&fresh, 1));
        assert_eq!(tracker.messages_count(), 1);
    }

    #[test]
    fn test_originate_message_layout() {
        let link = MockLink::with_address([0x01, 0x02, 0x03, 0x04, 0x0a, 0xbc]);
        let mut tracker: TestTracker = Tracker::new(link, MockClock::at(Timestamp::from_millis(0x1234)));
        let key = tracker.originate_message(b"[0001] Still alive").unwrap();

        let PacketKey::Message(id) = &key else {
            panic!("expected message key");
        };
        assert_eq!(id, b"00001234-bc0a04030201");
        let message = tracker.message_with_id(id).unwrap();
        assert_eq!(message.header.ttl, ORIGINATED_MESSAGE_TTL);
        assert_eq!(message.header.sender_id, 0xbc0a04030201);
        assert_eq!(message.sender_nickname, b"Repeater0abc");
        assert_eq!(tracker.broadcast_len(), 1);

        // Same millisecond, same id.
        assert!(tracker.originate_message(b"again").is_none());
    }

    #[test]
    fn test_duplicate_handle_is_older_link() {
        let mut tracker = make_tracker();
        tracker.peer_for_sender(0x42);
        tracker.report_connection(1, [1; 6], AddressType::Public, Role::Initiator);
        tracker.clock().advance(Duration::from_secs(5));
        tracker.report_connection(4, [1; 6], AddressType::Public, Role::Acceptor);
        assert_eq!(tracker.any_duplicate_handle(), None);

        tracker.set_handle_for_peer(4, 0x42);
        tracker.set_handle_for_peer(1, 0x42);
        assert_eq!(tracker.any_duplicate_handle(), Some(1));
        assert_eq!(tracker.peer_for_handle(4).map(|p| p.id), Some(0x42));
    }

    #[test]
    fn test_rssi_cursor_round_robin() {
        let mut tracker = make_tracker();
        assert!(!tracker.request_next_rssi(true));
        for handle in [2, 5, 9] {
            tracker.connection_for_handle(handle);
        }

        assert!(tracker.request_next_rssi(true));
        assert!(tracker.request_next_rssi(false));
        assert!(!tracker.request_next_rssi(false));
        // Wraps after the last link.
        tracker.request_next_rssi(false);
        assert!(tracker.request_next_rssi(true));

        assert_eq!(
            tracker.link_mut().take_requests(),
            alloc::vec![
                LinkRequest::Rssi(2),
                LinkRequest::Rssi(5),
                LinkRequest::Rssi(9),
                LinkRequest::Rssi(2),
                LinkRequest::Rssi(2),
            ]
        );

        tracker.set_rssi(5, -61);
        assert_eq!(tracker.connection(5).unwrap().rssi, Some(-61));
    }

    #[test]
    fn test_connectable_neighbours() {
        let mut tracker = make_tracker();
        tracker.add_neighbour([3; 6], AddressType::Public, ServiceStatus::FoundRepeater, -50);
        tracker.add_neighbour([1; 6], AddressType::Public, ServiceStatus::Found, -40);
        tracker.add_neighbour([2; 6], AddressType::Random, ServiceStatus::FoundRepeater, -40);

        let before: Vec<Address> = tracker.connectable_neighbours().iter().map(|c| c.address).collect();
        assert_eq!(before, alloc::vec![[3; 6]]);

        tracker.observe_time(Timestamp::from_millis(SYNCED));
        let after: Vec<Address> = tracker.connectable_neighbours().iter().map(|c| c.address).collect();
        assert_eq!(after, alloc::vec![[1; 6], [3; 6]]);

        tracker.set_connection_started(&[1; 6]);
        assert_eq!(tracker.connectable_neighbours().len(), 1);
        assert_eq!(tracker.connections_count(), 2);
    }

    #[test]
    fn test_neighbour_becomes_link() {
        let mut tracker = make_tracker();
        tracker.add_neighbour([7; 6], AddressType::Public, ServiceStatus::FoundRepeater, -48);
        tracker.report_connection(3, [7; 6], AddressType::Public, Role::Initiator);

        assert!(tracker.neighbour(&[7; 6]).is_none());
        let c = tracker.connection(3).unwrap();
        assert!(c.is_repeater());
        assert_eq!(c.rssi, Some(-48));
        assert_eq!(c.handle, 3);
        assert_eq!(tracker.connection_for_address(&[7; 6]).map(|c| c.handle), Some(3));
        assert_eq!(tracker.connections_count(), 1);
    }

    #[test]
    fn test_neighbour_table_bounded() {
        let mut tracker: Tracker<MockLink, MockClock, crate::config::SmallConfig> =
            Tracker::new(MockLink::new(), MockClock::new());
        for i in 0..=crate::config::SmallConfig::MAX_NEIGHBOURS as u8 {
            tracker.add_neighbour([i; 6], AddressType::Public, ServiceStatus::Found, -70);
            tracker.clock().advance(Duration::from_millis(1));
        }
        assert_eq!(tracker.connections_count(), crate::config::SmallConfig::MAX_NEIGHBOURS);
        assert!(tracker.neighbour(&[0; 6]).is_none());
    }

    #[test]
    fn test_stale_neighbour_swept() {
        let mut tracker = make_tracker();
        tracker.add_neighbour([1; 6], AddressType::Public, ServiceStatus::Found, -70);
        tracker.clock().advance(DefaultConfig::RETENTION + Duration::from_millis(1));
        assert_eq!(tracker.cleanup_stale().neighbours, 1);
    }
}
