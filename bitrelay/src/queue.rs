//! Send queues and per-link mailboxes.
//!
//! Two queues feed the links:
//!
//! - **Targeted**: `(packet, link)` pairs, delivered once and then dropped.
//!   Used for the announce handshake.
//! - **Broadcast**: packet keys fanned out to every usable link that has not
//!   had them yet. Entries stay queued until the sweep ages them out, so links
//!   that come up later still receive recent traffic.
//!
//! Serialized payloads go into a [`Mailbox`] per link and direction. Sending
//! is two-phase: the mailbox asks the link layer for a slot and transmits its
//! head payload when [`LinkEvent::CanSendNow`](crate::traits::LinkEvent)
//! arrives, re-arming while payloads remain.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use crate::config::RelayConfig;
use crate::tracker::{SentMark, Tracker};
use crate::traits::{Clock, Direction, LinkError, LinkLayer};
use crate::types::{ConnHandle, Error, PacketKey, PeerId};

/// Whether a send slot has been requested for a mailbox.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MailboxState {
    /// No request outstanding.
    Idle,
    /// Slot requested; the head payload goes out on the completion.
    Pending,
    /// Slot request refused this pass; asked again on the next drain.
    Failed,
}

/// Outbound payloads for one link direction.
#[derive(Clone, Debug)]
pub struct Mailbox {
    pub(crate) queue: VecDeque<Vec<u8>>,
    pub(crate) state: MailboxState,
}

impl Mailbox {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            state: MailboxState::Idle,
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn state(&self) -> MailboxState {
        self.state
    }

    /// Has payloads but no slot requested.
    fn needs_request(&self) -> bool {
        self.state == MailboxState::Idle && !self.queue.is_empty()
    }
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}

impl<L, C, Cfg> Tracker<L, C, Cfg>
where
    L: LinkLayer,
    C: Clock,
    Cfg: RelayConfig,
{
    /// Queue a stored packet for one link.
    pub fn enqueue_targeted(&mut self, key: PacketKey, handle: ConnHandle) -> Result<(), Error> {
        let ttl = self.packet_header(&key).ok_or(Error::UnknownPacket)?.ttl;
        if ttl == 0 {
            return Err(Error::ZeroTtl);
        }
        self.connection_for_handle(handle);
        self.targeted.insert((key, handle));
        Ok(())
    }

    /// Queue a stored packet for every link.
    ///
    /// With a source, the packet is first marked as already held by the
    /// originating link and sender so it is never echoed back.
    pub fn enqueue_broadcast(
        &mut self,
        key: PacketKey,
        source: Option<(ConnHandle, PeerId)>,
    ) -> Result<(), Error> {
        let ttl = self.packet_header(&key).ok_or(Error::UnknownPacket)?.ttl;
        if ttl == 0 {
            return Err(Error::ZeroTtl);
        }
        if let Some((handle, peer)) = source {
            self.sent_to_connections.insert((key.clone(), handle));
            self.sent_to_peers.insert((key.clone(), peer));
        }
        if !self.broadcast.contains(&key) {
            self.broadcast.push_back(key);
        }
        Ok(())
    }

    pub fn targeted_len(&self) -> usize {
        self.targeted.len()
    }

    pub fn broadcast_len(&self) -> usize {
        self.broadcast.len()
    }

    /// Payloads waiting in one link direction.
    pub fn mailbox_len(&self, handle: ConnHandle, direction: Direction) -> usize {
        self.mailboxes.get(&(handle, direction)).map_or(0, Mailbox::len)
    }

    /// True if `handle` has already been given `key`.
    pub fn was_sent(&self, key: &PacketKey, handle: ConnHandle) -> bool {
        self.sent_to_connections.contains(&SentMark(key, handle))
    }

    /// Hand queued packets to the links.
    ///
    /// Mailboxes whose slot request failed on an earlier pass are re-armed
    /// first. Targeted pairs are then delivered once and removed. Broadcast
    /// keys go to every usable link not yet marked, in handle order. A slot
    /// request refused during this pass waits for the next one.
    pub fn drain(&mut self) {
        self.rearm_mailboxes();

        let targeted = core::mem::take(&mut self.targeted);
        for (key, handle) in targeted {
            if self.was_sent(&key, handle) {
                continue;
            }
            if !self.deliver(&key, handle, None) {
                self.targeted.insert((key, handle));
            }
        }

        if !self.broadcast.is_empty() {
            let usable: Vec<ConnHandle> = self
                .connections
                .values()
                .filter(|c| c.is_usable())
                .map(|c| c.handle)
                .collect();
            let keys: Vec<PacketKey> = self.broadcast.iter().cloned().collect();
            for key in keys {
                for &handle in &usable {
                    if self.was_sent(&key, handle) {
                        continue;
                    }
                    let peer = self.handle_peers.get(&handle).copied();
                    if let Some(peer) = peer {
                        if self.sent_to_peers.contains(&SentMark(&key, peer)) {
                            continue;
                        }
                    }
                    self.deliver(&key, handle, peer);
                }
            }
        }
    }

    /// Transmit and record delivery. Returns false if the packet should be
    /// tried again on a later pass.
    fn deliver(&mut self, key: &PacketKey, handle: ConnHandle, peer: Option<PeerId>) -> bool {
        match self.transmit(key, handle) {
            Ok(()) | Err(Error::MessageTooLarge { .. }) => {
                self.sent_to_connections.insert((key.clone(), handle));
                if let Some(peer) = peer {
                    self.sent_to_peers.insert((key.clone(), peer));
                }
                true
            }
            Err(Error::UnknownPacket) => true,
            Err(e) => {
                log::debug!("deferred send to 0x{:x}: {}", handle, e);
                false
            }
        }
    }

    /// Serialize a stored packet and post it to a link's mailbox.
    pub fn transmit(&mut self, key: &PacketKey, handle: ConnHandle) -> Result<(), Error> {
        let (mtu, direction) = match self.connections.get(&handle) {
            Some(c) if c.is_usable() => (c.mtu as usize, c.send_direction()),
            _ => return Err(Error::NotConnected),
        };
        let data = self.encode_packet(key).ok_or(Error::UnknownPacket)?;
        if data.len() > mtu {
            self.metrics.oversize_dropped += 1;
            log::warn!(
                "packet of {} bytes does not fit mtu {} on 0x{:x}, dropped",
                data.len(),
                mtu,
                handle
            );
            emit_debug!(
                self,
                crate::debug::DebugEvent::Oversize {
                    key: key.clone(),
                    handle,
                    size: data.len(),
                    limit: mtu,
                }
            );
            return Err(Error::MessageTooLarge {
                size: data.len(),
                limit: mtu,
            });
        }

        emit_debug!(
            self,
            crate::debug::DebugEvent::Queued {
                key: key.clone(),
                handle,
                len: data.len(),
            }
        );
        self.post(handle, direction, data)
    }

    /// Append a payload to a mailbox and request a slot if none is pending.
    pub(crate) fn post(&mut self, handle: ConnHandle, direction: Direction, data: Vec<u8>) -> Result<(), Error> {
        let mailbox = self.mailboxes.entry((handle, direction)).or_default();
        if mailbox.queue.len() >= Cfg::MAX_MAILBOX_DEPTH {
            return Err(Error::MailboxFull);
        }
        mailbox.queue.push_back(data);
        self.connection_for_handle(handle).has_data = true;
        self.arm(handle, direction);
        Ok(())
    }

    /// Request a send slot if the mailbox has payloads and none is pending.
    ///
    /// On failure the mailbox is marked failed and left for the next drain.
    fn arm(&mut self, handle: ConnHandle, direction: Direction) {
        let Some(mailbox) = self.mailboxes.get_mut(&(handle, direction)) else {
            return;
        };
        if !mailbox.needs_request() {
            return;
        }
        match self.link.request_can_send(handle, direction) {
            Ok(()) => mailbox.state = MailboxState::Pending,
            Err(e) => {
                mailbox.state = MailboxState::Failed;
                self.metrics.link_errors += 1;
                log::debug!("send request on 0x{:x} failed: {:?}", handle, e);
            }
        }
    }

    fn rearm_mailboxes(&mut self) {
        let failed: Vec<(ConnHandle, Direction)> = self
            .mailboxes
            .iter_mut()
            .filter(|(_, m)| m.state == MailboxState::Failed)
            .map(|(k, m)| {
                m.state = MailboxState::Idle;
                *k
            })
            .collect();
        for (handle, direction) in failed {
            self.arm(handle, direction);
        }
    }

    /// Send slot granted: transmit the head payload, then re-arm or go idle.
    ///
    /// A payload rejected for anything but an unknown connection stays at the
    /// head and is retried on the next slot.
    pub fn on_can_send(&mut self, handle: ConnHandle, direction: Direction) {
        let value_handle = self.connections.get(&handle).map_or(0, |c| c.value_handle);
        let Some(mailbox) = self.mailboxes.get_mut(&(handle, direction)) else {
            return;
        };
        mailbox.state = MailboxState::Idle;

        if let Some(data) = mailbox.queue.front() {
            match self.link.send(handle, value_handle, direction, data) {
                Ok(()) => {
                    mailbox.queue.pop_front();
                    self.metrics.transmissions += 1;
                }
                Err(LinkError::UnknownConnection) => {
                    mailbox.queue.pop_front();
                    self.metrics.link_errors += 1;
                    log::debug!("send on 0x{:x}: unknown connection", handle);
                }
                Err(e) => {
                    self.metrics.link_errors += 1;
                    log::warn!("send on 0x{:x} failed: {:?}", handle, e);
                }
            }
        }

        if mailbox.queue.is_empty() {
            self.mailboxes.remove(&(handle, direction));
            let other = match direction {
                Direction::Notify => Direction::Write,
                Direction::Write => Direction::Notify,
            };
            if !self.mailboxes.contains_key(&(handle, other)) {
                if let Some(c) = self.connections.get_mut(&handle) {
                    c.has_data = false;
                }
            }
        } else {
            self.arm(handle, direction);
        }
    }

    /// Drop every payload queued for a link.
    pub(crate) fn discard_mailboxes(&mut self, handle: ConnHandle) {
        self.mailboxes.remove(&(handle, Direction::Notify));
        self.mailboxes.remove(&(handle, Direction::Write));
        if let Some(c) = self.connections.get_mut(&handle) {
            c.has_data = false;
        }
    }
}
