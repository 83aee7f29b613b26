//! Core types: packet model, identities, errors and counters.

use alloc::vec::Vec;
use core::fmt;

use crate::time::Timestamp;
use crate::traits::LinkError;

/// Link-layer connection handle.
pub type ConnHandle = u16;
/// 64-bit bitchat peer identifier.
pub type PeerId = u64;
/// Bluetooth device address, in the order the controller reports it.
pub type Address = [u8; 6];

// Protocol constants
pub const PROTOCOL_VERSION: u8 = 1;
pub const ANNOUNCE_TTL: u8 = 3;
pub const ORIGINATED_MESSAGE_TTL: u8 = 7;
pub const SIGNATURE_LEN: usize = 64;
/// Smallest payload that can hold a message sub-header.
pub const MIN_MESSAGE_PAYLOAD: usize = 13;
/// Length of the hex-encoded sender peer id inside a message.
pub const PEER_ID_HEX_LEN: usize = 16;

/// Advertised local name prefix; peers using it are other repeaters.
pub const SERVICE_NAME: &[u8] = b"Repeater";

/// Bitchat GATT service `F47B5E2D-4A9E-4C5A-9B3F-8E1D2C3A4B5C`.
pub const SERVICE_UUID: [u8; 16] = [
    0xF4, 0x7B, 0x5E, 0x2D, 0x4A, 0x9E, 0x4C, 0x5A, 0x9B, 0x3F, 0x8E, 0x1D, 0x2C, 0x3A, 0x4B, 0x5C,
];

/// Bitchat GATT characteristic `A1B2C3D4-E5F6-4A5B-8C9D-0E1F2A3B4C5D`.
pub const CHARACTERISTIC_UUID: [u8; 16] = [
    0xA1, 0xB2, 0xC3, 0xD4, 0xE5, 0xF6, 0x4A, 0x5B, 0x8C, 0x9D, 0x0E, 0x1F, 0x2A, 0x3B, 0x4C, 0x5D,
];

// Packet flags
pub const FLAG_HAS_RECIPIENT: u8 = 0x01;
pub const FLAG_HAS_SIGNATURE: u8 = 0x02;
pub const FLAG_IS_COMPRESSED: u8 = 0x04;
const FLAGS_DERIVED: u8 = FLAG_HAS_RECIPIENT | FLAG_HAS_SIGNATURE | FLAG_IS_COMPRESSED;

// Message flags
pub const MSG_FLAG_RELAY: u8 = 0x01;
pub const MSG_FLAG_PRIVATE: u8 = 0x02;
pub const MSG_FLAG_ORIGINAL_SENDER: u8 = 0x04;
pub const MSG_FLAG_RECIPIENT_NICKNAME: u8 = 0x08;
pub const MSG_FLAG_SENDER_PEER_ID: u8 = 0x10;
pub const MSG_FLAG_MENTIONS: u8 = 0x20;
pub const MSG_FLAG_CHANNEL: u8 = 0x40;
pub const MSG_FLAG_ENCRYPTED: u8 = 0x80;

/// Bitchat packet types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum PacketType {
    Announce = 0x01,
    Leave = 0x03,
    Message = 0x04,
    FragmentStart = 0x05,
    FragmentContinue = 0x06,
    FragmentEnd = 0x07,
    ChannelAnnounce = 0x08,
    ChannelRetention = 0x09,
    DeliveryAck = 0x0A,
    DeliveryStatusRequest = 0x0B,
    ReadReceipt = 0x0C,
    NoiseHandshakeInit = 0x10,
    NoiseHandshakeResp = 0x11,
    NoiseEncrypted = 0x12,
    NoiseIdentityAnnounce = 0x13,
    ChannelKeyVerifyRequest = 0x14,
    ChannelKeyVerifyResponse = 0x15,
    ChannelPasswordUpdate = 0x16,
    ChannelMetadata = 0x17,
    VersionHello = 0x20,
    VersionAck = 0x21,
    ProtocolAck = 0x22,
    ProtocolNack = 0x23,
    SystemValidation = 0x24,
    HandshakeRequest = 0x25,
    Favorited = 0x30,
    Unfavorited = 0x31,
}

impl PacketType {
    pub fn from_u8(value: u8) -> Option<Self> {
        use PacketType::*;
        Some(match value {
            0x01 => Announce,
            0x03 => Leave,
            0x04 => Message,
            0x05 => FragmentStart,
            0x06 => FragmentContinue,
            0x07 => FragmentEnd,
            0x08 => ChannelAnnounce,
            0x09 => ChannelRetention,
            0x0A => DeliveryAck,
            0x0B => DeliveryStatusRequest,
            0x0C => ReadReceipt,
            0x10 => NoiseHandshakeInit,
            0x11 => NoiseHandshakeResp,
            0x12 => NoiseEncrypted,
            0x13 => NoiseIdentityAnnounce,
            0x14 => ChannelKeyVerifyRequest,
            0x15 => ChannelKeyVerifyResponse,
            0x16 => ChannelPasswordUpdate,
            0x17 => ChannelMetadata,
            0x20 => VersionHello,
            0x21 => VersionAck,
            0x22 => ProtocolAck,
            0x23 => ProtocolNack,
            0x24 => SystemValidation,
            0x25 => HandshakeRequest,
            0x30 => Favorited,
            0x31 => Unfavorited,
            _ => return None,
        })
    }

    /// Name used in logs.
    pub fn name(self) -> &'static str {
        use PacketType::*;
        match self {
            Announce => "ANNOUNCE",
            Leave => "LEAVE",
            Message => "MESSAGE",
            FragmentStart => "FRAGMENT_START",
            FragmentContinue => "FRAGMENT_CONTINUE",
            FragmentEnd => "FRAGMENT_END",
            ChannelAnnounce => "CHANNEL_ANNOUNCE",
            ChannelRetention => "CHANNEL_RETENTION",
            DeliveryAck => "DELIVERY_ACK",
            DeliveryStatusRequest => "DELIVERY_STATUS_REQUEST",
            ReadReceipt => "READ_RECEIPT",
            NoiseHandshakeInit => "NOISE_HANDSHAKE_INIT",
            NoiseHandshakeResp => "NOISE_HANDSHAKE_RESP",
            NoiseEncrypted => "NOISE_ENCRYPTED",
            NoiseIdentityAnnounce => "NOISE_IDENTITY_ANNOUNCE",
            ChannelKeyVerifyRequest => "CHANNEL_KEY_VERIFY_REQUEST",
            ChannelKeyVerifyResponse => "CHANNEL_KEY_VERIFY_RESPONSE",
            ChannelPasswordUpdate => "CHANNEL_PASSWORD_UPDATE",
            ChannelMetadata => "CHANNEL_METADATA",
            VersionHello => "VERSION_HELLO",
            VersionAck => "VERSION_ACK",
            ProtocolAck => "PROTOCOL_ACK",
            ProtocolNack => "PROTOCOL_NACK",
            SystemValidation => "SYSTEM_VALIDATION",
            HandshakeRequest => "HANDSHAKE_REQUEST",
            Favorited => "FAVORITED",
            Unfavorited => "UNFAVORITED",
        }
    }

    /// Types relayed opaquely, without decoding the payload.
    ///
    /// Announces are relayed opaquely too, but only after their name has
    /// been recorded.
    pub fn is_pass_along(self) -> bool {
        use PacketType::*;
        matches!(
            self,
            FragmentStart
                | FragmentContinue
                | FragmentEnd
                | DeliveryAck
                | DeliveryStatusRequest
                | ReadReceipt
                | NoiseHandshakeInit
                | NoiseHandshakeResp
                | NoiseEncrypted
                | ChannelKeyVerifyRequest
                | ChannelKeyVerifyResponse
                | ChannelPasswordUpdate
                | ChannelMetadata
        )
    }
}

/// Fields common to every packet.
///
/// `ttl` is stored as received; the encoder writes `ttl - 1`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Header {
    pub packet_type: u8,
    pub ttl: u8,
    pub timestamp: Timestamp,
    /// Flags as received. The recipient, signature and compressed bits are
    /// recomputed on encode; other bits pass through untouched.
    pub flags: u8,
    pub sender_id: PeerId,
    pub recipient_id: Option<PeerId>,
    pub signature: Option<Vec<u8>>,
}

impl Header {
    pub fn new(packet_type: PacketType, ttl: u8, timestamp: Timestamp, sender_id: PeerId) -> Self {
        Self {
            packet_type: packet_type as u8,
            ttl,
            timestamp,
            flags: 0,
            sender_id,
            recipient_id: None,
            signature: None,
        }
    }

    /// Flags byte to put on the wire.
    pub fn wire_flags(&self, compressed: bool) -> u8 {
        let mut flags = self.flags & !FLAGS_DERIVED;
        if self.recipient_id.is_some() {
            flags |= FLAG_HAS_RECIPIENT;
        }
        if self.signature.is_some() {
            flags |= FLAG_HAS_SIGNATURE;
        }
        if compressed {
            flags |= FLAG_IS_COMPRESSED;
        }
        flags
    }
}

/// This node's identity announcement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Announce {
    pub header: Header,
    pub name: Vec<u8>,
}

impl Announce {
    /// An announce that has never been set up; its ttl is 0 so it is rebuilt
    /// before first use.
    pub fn unset() -> Self {
        Self {
            header: Header::new(PacketType::Announce, 0, Timestamp::ZERO, 0),
            name: Vec::new(),
        }
    }
}

/// Chat message body; plain and encrypted content are mutually exclusive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MessageContent {
    Plain(Vec<u8>),
    Encrypted(Vec<u8>),
}

impl MessageContent {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            MessageContent::Plain(b) | MessageContent::Encrypted(b) => b,
        }
    }
}

/// Decoded chat message.
///
/// Optional fields are populated during decode in flag order. The message
/// flags byte is derived from them by [`Message::flags`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub header: Header,
    pub is_relay: bool,
    pub is_private: bool,
    pub timestamp: Timestamp,
    /// Application-level dedup key.
    pub id: Vec<u8>,
    pub sender_nickname: Vec<u8>,
    pub content: MessageContent,
    pub original_sender: Option<Vec<u8>>,
    pub recipient_nickname: Option<Vec<u8>>,
    /// Peer resolved from the hex sender-peer-id field.
    pub sender_peer: Option<PeerId>,
    /// Sender-peer-id bytes that are not 16 hex chars, relayed unchanged.
    pub sender_peer_raw: Option<Vec<u8>>,
    pub mentions: Option<Vec<Vec<u8>>>,
    pub channel: Option<Vec<u8>>,
}

impl Message {
    /// Plain message with no optional fields.
    pub fn new(header: Header, timestamp: Timestamp, id: Vec<u8>, sender_nickname: Vec<u8>, content: Vec<u8>) -> Self {
        Self {
            header,
            is_relay: false,
            is_private: false,
            timestamp,
            id,
            sender_nickname,
            content: MessageContent::Plain(content),
            original_sender: None,
            recipient_nickname: None,
            sender_peer: None,
            sender_peer_raw: None,
            mentions: None,
            channel: None,
        }
    }

    /// Message flags derived from the populated fields.
    pub fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.is_relay {
            flags |= MSG_FLAG_RELAY;
        }
        if self.is_private {
            flags |= MSG_FLAG_PRIVATE;
        }
        if self.original_sender.is_some() {
            flags |= MSG_FLAG_ORIGINAL_SENDER;
        }
        if self.recipient_nickname.is_some() {
            flags |= MSG_FLAG_RECIPIENT_NICKNAME;
        }
        if self.sender_peer.is_some() || self.sender_peer_raw.is_some() {
            flags |= MSG_FLAG_SENDER_PEER_ID;
        }
        if self.mentions.is_some() {
            flags |= MSG_FLAG_MENTIONS;
        }
        if self.channel.is_some() {
            flags |= MSG_FLAG_CHANNEL;
        }
        if matches!(self.content, MessageContent::Encrypted(_)) {
            flags |= MSG_FLAG_ENCRYPTED;
        }
        flags
    }
}

/// Packet relayed without decoding its payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PassAlong {
    pub header: Header,
    /// Payload exactly as it appeared on the wire (still compressed if
    /// `original_size` is set).
    pub payload: Vec<u8>,
    /// Declared uncompressed size when the payload is compressed.
    pub original_size: Option<u16>,
}

impl PassAlong {
    /// Dedup key: payload hash combined with a hash of the identifying
    /// header fields. The ttl is left out so later hops of the same packet
    /// collide.
    pub fn dedup_hash(&self) -> u64 {
        use xxhash_rust::xxh3::xxh3_64;

        let mut meta = [0u8; 26];
        meta[0] = self.header.packet_type;
        meta[1] = self.header.flags;
        meta[2..10].copy_from_slice(&self.header.timestamp.as_millis().to_be_bytes());
        meta[10..18].copy_from_slice(&self.header.sender_id.to_be_bytes());
        meta[18..26].copy_from_slice(&self.header.recipient_id.unwrap_or(0).to_be_bytes());

        xxh3_64(&self.payload) ^ (xxh3_64(&meta) << 1)
    }
}

/// Every packet the relay can hold.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Packet {
    Announce(Announce),
    Message(Message),
    PassAlong(PassAlong),
}

impl Packet {
    pub fn header(&self) -> &Header {
        match self {
            Packet::Announce(a) => &a.header,
            Packet::Message(m) => &m.header,
            Packet::PassAlong(p) => &p.header,
        }
    }
}

/// Reference to a stored packet, used by queues and sent-bookkeeping.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PacketKey {
    /// The singleton self announce.
    Announce,
    /// A chat message, by message id.
    Message(Vec<u8>),
    /// A pass-along packet, by dedup hash.
    PassAlong(u64),
}

/// Chat identity seen on the mesh.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Peer {
    pub id: PeerId,
    pub name: Vec<u8>,
    pub public_key: Vec<u8>,
    /// Highest announce ttl observed; never decreases.
    pub announce_ttl: u8,
    /// Link currently believed to carry this peer.
    pub handle: Option<ConnHandle>,
    pub last_seen: Timestamp,
}

impl Peer {
    pub fn new(id: PeerId, now: Timestamp) -> Self {
        Self {
            id,
            name: Vec::new(),
            public_key: Vec::new(),
            announce_ttl: 0,
            handle: None,
            last_seen: now,
        }
    }
}

/// Relay counters for monitoring.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RelayMetrics {
    /// Write/notification payloads handed to the decoder.
    pub packets_received: u32,
    /// Payloads abandoned during decode.
    pub decode_failures: u32,
    /// Compressed payloads that did not inflate.
    pub inflate_failures: u32,
    /// Messages and pass-along packets already seen.
    pub duplicates_dropped: u32,
    /// New messages stored.
    pub messages_stored: u32,
    /// New pass-along packets stored.
    pub packets_stored: u32,
    /// Payloads handed to the link layer.
    pub transmissions: u32,
    /// Packets that did not fit a link's MTU.
    pub oversize_dropped: u32,
    /// Non-success link-layer statuses.
    pub link_errors: u32,
    /// Store entries evicted to make room.
    pub evictions: u32,
}

impl RelayMetrics {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Error type for relay operations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// Serialized packet exceeds the link's MTU.
    MessageTooLarge { size: usize, limit: usize },
    /// Link is not connected or has no characteristic handle.
    NotConnected,
    /// Packet has no hops left.
    ZeroTtl,
    /// Mailbox for the link direction is full.
    MailboxFull,
    /// Key does not refer to a stored packet.
    UnknownPacket,
    /// Link layer rejected the request.
    Link(LinkError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::MessageTooLarge { size, limit } => {
                write!(f, "packet of {} bytes exceeds mtu {}", size, limit)
            }
            Error::NotConnected => write!(f, "link not usable"),
            Error::ZeroTtl => write!(f, "packet ttl exhausted"),
            Error::MailboxFull => write!(f, "link mailbox full"),
            Error::UnknownPacket => write!(f, "packet not stored"),
            Error::Link(e) => write!(f, "link error: {:?}", e),
        }
    }
}

impl From<LinkError> for Error {
    fn from(e: LinkError) -> Self {
        Error::Link(e)
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;

    use super::*;

    fn pass_along(ttl: u8, payload: &[u8]) -> PassAlong {
        let mut header = Header::new(PacketType::NoiseEncrypted, ttl, Timestamp::from_millis(0x198d35e50ee), 0x1a4d912f6a99af5e);
        header.recipient_id = Some(0x6ff9f65a6858d8ff);
        header.flags = FLAG_HAS_RECIPIENT;
        PassAlong {
            header,
            payload: payload.to_vec(),
            original_size: None,
        }
    }

    #[test]
    fn test_packet_type_roundtrip() {
        for value in 0u8..=0xff {
            if let Some(t) = PacketType::from_u8(value) {
                assert_eq!(t as u8, value);
            }
        }
        assert_eq!(PacketType::from_u8(0x02), None);
        assert_eq!(PacketType::from_u8(0x12), Some(PacketType::NoiseEncrypted));
    }

    #[test]
    fn test_pass_along_classification() {
        assert!(PacketType::FragmentStart.is_pass_along());
        assert!(PacketType::ChannelMetadata.is_pass_along());
        assert!(!PacketType::Announce.is_pass_along());
        assert!(!PacketType::Message.is_pass_along());
        assert!(!PacketType::NoiseIdentityAnnounce.is_pass_along());
        assert!(!PacketType::VersionHello.is_pass_along());
        assert!(!PacketType::Leave.is_pass_along());
    }

    #[test]
    fn test_dedup_hash_ignores_ttl() {
        let a = pass_along(7, b"opaque");
        let b = pass_along(2, b"opaque");
        assert_eq!(a.dedup_hash(), b.dedup_hash());
    }

    #[test]
    fn test_dedup_hash_covers_payload_and_meta() {
        let a = pass_along(7, b"opaque");
        assert_ne!(a.dedup_hash(), pass_along(7, b"opaquE").dedup_hash());

        let mut other_sender = a.clone();
        other_sender.header.sender_id ^= 1;
        assert_ne!(a.dedup_hash(), other_sender.dedup_hash());

        let mut no_recipient = a.clone();
        no_recipient.header.recipient_id = None;
        assert_ne!(a.dedup_hash(), no_recipient.dedup_hash());
    }

    #[test]
    fn test_message_flags_derived() {
        let header = Header::new(PacketType::Message, 3, Timestamp::ZERO, 1);
        let mut msg = Message::new(header, Timestamp::ZERO, b"id".to_vec(), b"nick".to_vec(), b"hi".to_vec());
        assert_eq!(msg.flags(), 0);

        msg.sender_peer = Some(0xc67ff7caf2952326);
        assert_eq!(msg.flags(), MSG_FLAG_SENDER_PEER_ID);

        msg.mentions = Some(vec![b"adam".to_vec()]);
        msg.content = MessageContent::Encrypted(vec![1, 2, 3]);
        msg.is_private = true;
        assert_eq!(
            msg.flags(),
            MSG_FLAG_SENDER_PEER_ID | MSG_FLAG_MENTIONS | MSG_FLAG_ENCRYPTED | MSG_FLAG_PRIVATE
        );
    }

    #[test]
    fn test_wire_flags_recomputed() {
        let mut header = Header::new(PacketType::Message, 3, Timestamp::ZERO, 1);
        header.flags = FLAG_IS_COMPRESSED | FLAG_HAS_SIGNATURE | 0x40;
        assert_eq!(header.wire_flags(false), 0x40);

        header.recipient_id = Some(7);
        assert_eq!(header.wire_flags(true), 0x40 | FLAG_HAS_RECIPIENT | FLAG_IS_COMPRESSED);
    }

    #[test]
    fn test_error_display() {
        use alloc::string::ToString;

        let err = Error::MessageTooLarge { size: 106, limit: 23 };
        assert_eq!(err.to_string(), "packet of 106 bytes exceeds mtu 23");
        assert_eq!(Error::from(LinkError::UnknownConnection), Error::Link(LinkError::UnknownConnection));
    }
}
