//! Inbound packet processing.
//!
//! [`Tracker::process_write`] is the single entry point for bytes received
//! on a link, whether written to our characteristic or notified by theirs.
//! A frame is fully decoded into owned values before any state is touched,
//! so a truncated or corrupt write leaves the tracker unchanged.

use alloc::borrow::Cow;

use crate::config::RelayConfig;
use crate::tracker::Tracker;
use crate::traits::{Clock, LinkLayer};
use crate::types::{ConnHandle, Header, PacketKey, PacketType, PeerId};
use crate::wire::{decode_message, inflate, DecodeError, Frame, Reader};

impl<L, C, Cfg> Tracker<L, C, Cfg>
where
    L: LinkLayer,
    C: Clock,
    Cfg: RelayConfig,
{
    /// Decode one received write starting at `offset` and act on it.
    ///
    /// - Identity announces record the sender's public key.
    /// - Messages are decoded, deduplicated by id and flooded.
    /// - Announces record the sender's name and ttl, correct the clock and
    ///   are then flooded like pass-along packets.
    /// - Pass-along types are deduplicated by hash and flooded while they
    ///   have hops left.
    /// - Everything else is ignored.
    pub fn process_write(&mut self, handle: ConnHandle, offset: usize, data: &[u8]) {
        self.metrics.packets_received += 1;

        let mut reader = Reader::with_offset(data, offset);
        let frame = match Frame::read(&mut reader) {
            Ok(frame) => frame,
            Err(error) => {
                self.reject(handle, error, data.len());
                return;
            }
        };

        let now = self.now();
        self.connection_for_handle(handle).last_seen = now;

        log::debug!(
            "rx 0x{:x}: {} ttl {} from {:016x}",
            handle,
            PacketType::from_u8(frame.header.packet_type).map_or("UNKNOWN", PacketType::name),
            frame.header.ttl,
            frame.header.sender_id
        );
        emit_debug!(
            self,
            crate::debug::DebugEvent::PacketReceived {
                timestamp: now,
                handle,
                packet_type: frame.header.packet_type,
                ttl: frame.header.ttl,
                sender: frame.header.sender_id,
            }
        );

        let body = self.frame_body(handle, &frame);
        let sender = frame.header.sender_id;

        match PacketType::from_u8(frame.header.packet_type) {
            Some(PacketType::NoiseIdentityAnnounce) => {
                // Usually ttl 0; never relayed.
                let key = body.into_owned();
                self.peer_for_sender(sender).public_key = key;
            }
            Some(PacketType::Message) => {
                let message = match decode_message(frame.header.clone(), &body) {
                    Ok(message) => message,
                    Err(error) => {
                        self.reject(handle, error, data.len());
                        return;
                    }
                };
                self.peer_for_sender(sender);
                if let Some(peer) = message.sender_peer {
                    self.peer_for_sender(peer);
                }
                let key = PacketKey::Message(message.id.clone());
                let is_new = self.store_message_if_new(message).is_some();
                self.relay_if_new(key, is_new, handle, sender);
            }
            Some(PacketType::Announce) => {
                self.record_announce(handle, &frame.header, &body);
                self.observe_time(frame.header.timestamp);
                self.pass_along(handle, frame);
            }
            Some(t) if t.is_pass_along() => self.pass_along(handle, frame),
            Some(t) => log::debug!("ignoring {} from {:016x}", t.name(), sender),
            None => log::debug!("ignoring unknown type 0x{:02x}", frame.header.packet_type),
        }
    }

    fn reject(&mut self, handle: ConnHandle, error: DecodeError, data_len: usize) {
        self.metrics.decode_failures += 1;
        log::debug!("dropping {} byte write on 0x{:x}: {:?}", data_len, handle, error);
        emit_debug!(
            self,
            crate::debug::DebugEvent::DecodeFailed {
                handle,
                error,
                data_len,
            }
        );
    }

    /// Inflated payload, or the raw bytes if it is not compressed or does
    /// not inflate.
    fn frame_body<'a>(&mut self, handle: ConnHandle, frame: &Frame<'a>) -> Cow<'a, [u8]> {
        let Some(declared) = frame.original_size else {
            return Cow::Borrowed(frame.payload);
        };
        match inflate(frame.payload, declared) {
            Ok(body) => Cow::Owned(body),
            Err(error) => {
                self.metrics.inflate_failures += 1;
                log::debug!("inflate failed on 0x{:x} ({:?}), using raw payload", handle, error);
                emit_debug!(self, crate::debug::DebugEvent::InflateFallback { handle, declared });
                Cow::Borrowed(frame.payload)
            }
        }
    }

    /// Name the sender, and map the link to it when this announce came from
    /// at least as far away as any before.
    fn record_announce(&mut self, handle: ConnHandle, header: &Header, name: &[u8]) {
        let peer = self.peer_for_sender(header.sender_id);
        peer.name = name.to_vec();
        if header.ttl >= peer.announce_ttl {
            peer.announce_ttl = header.ttl;
            self.set_handle_for_peer(handle, header.sender_id);
        }
    }

    /// Store an opaque packet and flood it if it has hops left.
    fn pass_along(&mut self, handle: ConnHandle, frame: Frame<'_>) {
        if frame.header.ttl < 1 {
            return;
        }
        let sender = frame.header.sender_id;
        self.peer_for_sender(sender);
        let packet = frame.into_pass_along();
        let key = PacketKey::PassAlong(packet.dedup_hash());
        let is_new = self.store_packet_if_new(packet).is_some();
        self.relay_if_new(key, is_new, handle, sender);
    }

    /// Broadcast a newly stored packet away from where it came from.
    fn relay_if_new(&mut self, key: PacketKey, is_new: bool, handle: ConnHandle, sender: PeerId) {
        if !is_new {
            emit_debug!(self, crate::debug::DebugEvent::Duplicate { key: key.clone() });
            return;
        }
        emit_debug!(
            self,
            crate::debug::DebugEvent::Stored {
                key: key.clone(),
                ttl: self.packet_header(&key).map_or(0, |h| h.ttl),
            }
        );
        if let Err(error) = self.enqueue_broadcast(key, Some((handle, sender))) {
            log::debug!("not relaying from 0x{:x}: {}", handle, error);
        }
    }
}
