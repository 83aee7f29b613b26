//! Wire format serialization and deserialization.
//!
//! All integers are big-endian.
//!
//! ## Frame
//!
//! ```text
//! version (1) = 1 || type (1) || ttl (1) || timestamp (8) || flags (1)
//! || payload_len (2) || sender_id (8) || [recipient_id (8)]
//! || [original_size (2)] || payload || [signature] || pad (1) = 0
//!
//! Flags byte:
//! - bit 0: has_recipient
//! - bit 1: has_signature
//! - bit 2: is_compressed (payload is zlib; payload_len counts original_size)
//! ```
//!
//! Inbound signatures are a fixed 64 bytes. Outbound signatures carry a
//! one-byte length prefix. Anything after the signature is ignored.
//!
//! ## Message payload
//!
//! ```text
//! msg_flags (1) || timestamp (8) || id_len (1) || id || nick_len (1) || nick
//! || content_len (2) || content
//! || [orig_len (1) || original_sender] || [rnick_len (1) || recipient_nickname]
//! || [16 || sender_peer_id as 16 lowercase hex chars]
//! || [count (1) || count × (len (1) || mention)] || [chan_len (1) || channel]
//! ```

use alloc::vec::Vec;

use crate::time::Timestamp;
use crate::types::{
    Announce, Header, Message, MessageContent, Packet, PacketType, PassAlong, FLAG_HAS_RECIPIENT,
    FLAG_HAS_SIGNATURE, FLAG_IS_COMPRESSED, MIN_MESSAGE_PAYLOAD, MSG_FLAG_CHANNEL,
    MSG_FLAG_ENCRYPTED, MSG_FLAG_MENTIONS, MSG_FLAG_ORIGINAL_SENDER, MSG_FLAG_PRIVATE,
    MSG_FLAG_RECIPIENT_NICKNAME, MSG_FLAG_RELAY, MSG_FLAG_SENDER_PEER_ID, PEER_ID_HEX_LEN,
    PROTOCOL_VERSION, SIGNATURE_LEN,
};

/// Decoding error types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecodeError {
    /// Version byte other than 1.
    InvalidVersion(u8),
    /// Unexpected end of buffer.
    UnexpectedEof,
    /// Length field inconsistent with the frame.
    InvalidLength,
    /// Field content failed validation.
    InvalidValue,
}

/// Zero-copy reader over a byte slice.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    /// Create a new reader over a byte slice.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Create a reader starting `offset` bytes into the slice.
    pub fn with_offset(buf: &'a [u8], offset: usize) -> Self {
        Self {
            buf,
            pos: offset.min(buf.len()),
        }
    }

    /// Returns the number of bytes remaining.
    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    /// Returns true if there are no more bytes to read.
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Returns the current position.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Read a single byte.
    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        let v = *self.buf.get(self.pos).ok_or(DecodeError::UnexpectedEof)?;
        self.pos += 1;
        Ok(v)
    }

    /// Read a fixed number of bytes.
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if len > self.remaining() {
            return Err(DecodeError::UnexpectedEof);
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    /// Read a u16 in big-endian format.
    pub fn read_u16_be(&mut self) -> Result<u16, DecodeError> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    /// Read a u64 in big-endian format.
    pub fn read_u64_be(&mut self) -> Result<u64, DecodeError> {
        let bytes = self.read_bytes(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(u64::from_be_bytes(raw))
    }

    /// Read bytes prefixed by a one-byte length.
    pub fn read_len8_prefixed(&mut self) -> Result<&'a [u8], DecodeError> {
        let len = self.read_u8()? as usize;
        self.read_bytes(len)
    }

    /// Read bytes prefixed by a two-byte length.
    pub fn read_len16_prefixed(&mut self) -> Result<&'a [u8], DecodeError> {
        let len = self.read_u16_be()? as usize;
        self.read_bytes(len)
    }
}

/// Growable writer.
#[derive(Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    /// Create an empty writer.
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Create an empty writer with room for `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    /// Returns the number of bytes written.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Returns true if nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Write a single byte.
    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    /// Write raw bytes.
    pub fn write_bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    /// Write a u16 in big-endian format.
    pub fn write_u16_be(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    /// Write a u64 in big-endian format.
    pub fn write_u64_be(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    /// Write bytes with a one-byte length prefix, truncating at 255.
    pub fn write_len8_prefixed(&mut self, v: &[u8]) {
        let len = v.len().min(u8::MAX as usize);
        self.write_u8(len as u8);
        self.write_bytes(&v[..len]);
    }

    /// Write bytes with a two-byte length prefix, truncating at 65535.
    pub fn write_len16_prefixed(&mut self, v: &[u8]) {
        let len = v.len().min(u16::MAX as usize);
        self.write_u16_be(len as u16);
        self.write_bytes(&v[..len]);
    }

    /// Write the low `digits` nibbles of `v` as lowercase hex, most
    /// significant first.
    fn write_hex(&mut self, v: u64, digits: u32) {
        for i in (0..digits).rev() {
            self.buf.push(hex_digit((v >> (i * 4)) as u8 & 0x0f));
        }
    }

    /// Write a byte as two lowercase hex characters.
    pub fn write_u8_hex(&mut self, v: u8) {
        self.write_hex(v as u64, 2);
    }

    /// Write a u16 as four lowercase hex characters.
    pub fn write_u16_hex(&mut self, v: u16) {
        self.write_hex(v as u64, 4);
    }

    /// Write a u32 as eight lowercase hex characters.
    pub fn write_u32_hex(&mut self, v: u32) {
        self.write_hex(v as u64, 8);
    }

    /// Write the low 48 bits as twelve lowercase hex characters.
    pub fn write_u48_hex(&mut self, v: u64) {
        self.write_hex(v, 12);
    }

    /// Write a u64 as sixteen lowercase hex characters.
    pub fn write_u64_hex(&mut self, v: u64) {
        self.write_hex(v, 16);
    }

    /// Consume the writer and return the bytes.
    pub fn finish(self) -> Vec<u8> {
        self.buf
    }

    /// Get a reference to the written bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }
}

fn hex_digit(nibble: u8) -> u8 {
    if nibble < 10 {
        b'0' + nibble
    } else {
        b'a' + nibble - 10
    }
}

fn hex_value(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

/// Parse exactly sixteen hex characters (either case) into a u64.
pub fn parse_hex_u64(s: &[u8]) -> Option<u64> {
    if s.len() != PEER_ID_HEX_LEN {
        return None;
    }
    s.iter()
        .try_fold(0u64, |acc, &c| Some((acc << 4) | hex_value(c)? as u64))
}

/// Types that can be encoded to wire format.
pub trait Encode {
    /// Encode into a writer.
    fn encode(&self, w: &mut Writer);

    /// Encode into a new Vec.
    fn encode_to_vec(&self) -> Vec<u8> {
        let mut w = Writer::new();
        self.encode(&mut w);
        w.finish()
    }
}

/// Types that can be decoded from wire format.
pub trait Decode: Sized {
    /// Decode from a reader.
    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError>;

    /// Decode from a byte slice. Trailing bytes are ignored.
    fn decode_from_slice(data: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(data);
        Self::decode(&mut r)
    }
}

/// A decoded frame before its payload has been interpreted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame<'a> {
    pub header: Header,
    /// Payload as carried on the wire.
    pub payload: &'a [u8],
    /// Declared uncompressed size, present iff the payload is compressed.
    pub original_size: Option<u16>,
}

impl<'a> Frame<'a> {
    /// Parse a frame header, payload and signature.
    ///
    /// Trailing bytes (padding) are ignored. The payload is not inflated.
    pub fn read(r: &mut Reader<'a>) -> Result<Self, DecodeError> {
        let version = r.read_u8()?;
        if version != PROTOCOL_VERSION {
            return Err(DecodeError::InvalidVersion(version));
        }
        let packet_type = r.read_u8()?;
        let ttl = r.read_u8()?;
        let timestamp = Timestamp::from_millis(r.read_u64_be()?);
        let flags = r.read_u8()?;
        let mut payload_len = r.read_u16_be()? as usize;
        let sender_id = r.read_u64_be()?;
        let recipient_id = if flags & FLAG_HAS_RECIPIENT != 0 {
            Some(r.read_u64_be()?)
        } else {
            None
        };
        let original_size = if flags & FLAG_IS_COMPRESSED != 0 {
            let size = r.read_u16_be()?;
            // payload_len covers the original_size field too
            payload_len = payload_len.checked_sub(2).ok_or(DecodeError::InvalidLength)?;
            Some(size)
        } else {
            None
        };
        let payload = r.read_bytes(payload_len)?;
        let signature = if flags & FLAG_HAS_SIGNATURE != 0 {
            Some(r.read_bytes(SIGNATURE_LEN)?.to_vec())
        } else {
            None
        };

        Ok(Frame {
            header: Header {
                packet_type,
                ttl,
                timestamp,
                flags,
                sender_id,
                recipient_id,
                signature,
            },
            payload,
            original_size,
        })
    }

    /// Parse a frame from the start of `data`.
    pub fn parse(data: &'a [u8]) -> Result<Self, DecodeError> {
        Self::read(&mut Reader::new(data))
    }

    /// Take ownership of the wire payload as a pass-along packet.
    pub fn into_pass_along(self) -> PassAlong {
        PassAlong {
            header: self.header,
            payload: self.payload.to_vec(),
            original_size: self.original_size,
        }
    }
}

/// Inflate a zlib payload bounded by its declared original size.
///
/// Output shorter than declared is accepted; empty output or output that
/// would exceed the bound is an error.
pub fn inflate(payload: &[u8], original_size: u16) -> Result<Vec<u8>, DecodeError> {
    match miniz_oxide::inflate::decompress_to_vec_zlib_with_limit(payload, original_size as usize) {
        Ok(out) if !out.is_empty() => {
            if out.len() != original_size as usize {
                log::debug!("inflated {} bytes, header declared {}", out.len(), original_size);
            }
            Ok(out)
        }
        Ok(_) => Err(DecodeError::InvalidLength),
        Err(_) => Err(DecodeError::InvalidValue),
    }
}

/// Decode a message payload into a message carrying `header`.
///
/// A sender-peer-id that is not sixteen valid hex characters is consumed
/// but not resolved.
pub fn decode_message(header: Header, payload: &[u8]) -> Result<Message, DecodeError> {
    if payload.len() < MIN_MESSAGE_PAYLOAD {
        return Err(DecodeError::InvalidLength);
    }
    let mut r = Reader::new(payload);
    let flags = r.read_u8()?;
    let timestamp = Timestamp::from_millis(r.read_u64_be()?);
    let id = r.read_len8_prefixed()?.to_vec();
    let sender_nickname = r.read_len8_prefixed()?.to_vec();
    let body = r.read_len16_prefixed()?.to_vec();
    let content = if flags & MSG_FLAG_ENCRYPTED != 0 {
        MessageContent::Encrypted(body)
    } else {
        MessageContent::Plain(body)
    };

    let mut message = Message {
        header,
        is_relay: flags & MSG_FLAG_RELAY != 0,
        is_private: flags & MSG_FLAG_PRIVATE != 0,
        timestamp,
        id,
        sender_nickname,
        content,
        original_sender: None,
        recipient_nickname: None,
        sender_peer: None,
        sender_peer_raw: None,
        mentions: None,
        channel: None,
    };

    if flags & MSG_FLAG_ORIGINAL_SENDER != 0 {
        message.original_sender = Some(r.read_len8_prefixed()?.to_vec());
    }
    if flags & MSG_FLAG_RECIPIENT_NICKNAME != 0 {
        message.recipient_nickname = Some(r.read_len8_prefixed()?.to_vec());
    }
    if flags & MSG_FLAG_SENDER_PEER_ID != 0 {
        let hex = r.read_len8_prefixed()?;
        message.sender_peer = parse_hex_u64(hex);
        if message.sender_peer.is_none() {
            log::debug!("unresolvable sender peer id ({} bytes)", hex.len());
            message.sender_peer_raw = Some(hex.to_vec());
        }
    }
    if flags & MSG_FLAG_MENTIONS != 0 {
        let count = r.read_u8()?;
        let mut mentions = Vec::with_capacity(count as usize);
        for _ in 0..count {
            mentions.push(r.read_len8_prefixed()?.to_vec());
        }
        message.mentions = Some(mentions);
    }
    if flags & MSG_FLAG_CHANNEL != 0 {
        message.channel = Some(r.read_len8_prefixed()?.to_vec());
    }

    Ok(message)
}

/// Encode a message payload (no frame).
pub fn encode_message_body(message: &Message, w: &mut Writer) {
    w.write_u8(message.flags());
    w.write_u64_be(message.timestamp.as_millis());
    w.write_len8_prefixed(&message.id);
    w.write_len8_prefixed(&message.sender_nickname);
    w.write_len16_prefixed(message.content.as_bytes());
    if let Some(original_sender) = &message.original_sender {
        w.write_len8_prefixed(original_sender);
    }
    if let Some(recipient_nickname) = &message.recipient_nickname {
        w.write_len8_prefixed(recipient_nickname);
    }
    if let Some(peer) = message.sender_peer {
        w.write_u8(PEER_ID_HEX_LEN as u8);
        w.write_u64_hex(peer);
    } else if let Some(raw) = &message.sender_peer_raw {
        w.write_len8_prefixed(raw);
    }
    if let Some(mentions) = &message.mentions {
        let count = mentions.len().min(u8::MAX as usize);
        w.write_u8(count as u8);
        for mention in &mentions[..count] {
            w.write_len8_prefixed(mention);
        }
    }
    if let Some(channel) = &message.channel {
        w.write_len8_prefixed(channel);
    }
}

/// Write a frame around an already built payload, decrementing the ttl.
fn write_frame(w: &mut Writer, header: &Header, payload: &[u8], original_size: Option<u16>) {
    let size_field = if original_size.is_some() { 2 } else { 0 };
    let payload_len = (payload.len() + size_field).min(u16::MAX as usize);

    w.write_u8(PROTOCOL_VERSION);
    w.write_u8(header.packet_type);
    w.write_u8(header.ttl.saturating_sub(1));
    w.write_u64_be(header.timestamp.as_millis());
    w.write_u8(header.wire_flags(original_size.is_some()));
    w.write_u16_be(payload_len as u16);
    w.write_u64_be(header.sender_id);
    if let Some(recipient) = header.recipient_id {
        w.write_u64_be(recipient);
    }
    if let Some(size) = original_size {
        w.write_u16_be(size);
    }
    w.write_bytes(&payload[..payload_len - size_field]);
    if let Some(signature) = &header.signature {
        w.write_len8_prefixed(signature);
    }
    w.write_u8(0);
}

impl Encode for Announce {
    fn encode(&self, w: &mut Writer) {
        write_frame(w, &self.header, &self.name, None);
    }
}

impl Encode for Message {
    fn encode(&self, w: &mut Writer) {
        let mut body = Writer::with_capacity(MIN_MESSAGE_PAYLOAD + self.id.len() + self.content.as_bytes().len());
        encode_message_body(self, &mut body);
        write_frame(w, &self.header, body.as_slice(), None);
    }
}

impl Encode for PassAlong {
    fn encode(&self, w: &mut Writer) {
        write_frame(w, &self.header, &self.payload, self.original_size);
    }
}

impl Encode for Packet {
    fn encode(&self, w: &mut Writer) {
        match self {
            Packet::Announce(a) => a.encode(w),
            Packet::Message(m) => m.encode(w),
            Packet::PassAlong(p) => p.encode(w),
        }
    }
}

impl Decode for Announce {
    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let frame = Frame::read(r)?;
        if frame.header.packet_type != PacketType::Announce as u8 {
            return Err(DecodeError::InvalidValue);
        }
        Ok(Announce {
            name: frame.payload.to_vec(),
            header: frame.header,
        })
    }
}

impl Decode for Message {
    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let frame = Frame::read(r)?;
        if frame.header.packet_type != PacketType::Message as u8 {
            return Err(DecodeError::InvalidValue);
        }
        match frame.original_size {
            Some(size) => {
                let body = inflate(frame.payload, size)?;
                decode_message(frame.header, &body)
            }
            None => decode_message(frame.header, frame.payload),
        }
    }
}

impl Decode for PassAlong {
    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Frame::read(r)?.into_pass_along())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use alloc::vec;

    use super::*;

    /// Decode a hex fixture.
    pub(crate) fn from_hex(s: &str) -> Vec<u8> {
        s.as_bytes()
            .chunks(2)
            .map(|pair| (hex_value(pair[0]).unwrap() << 4) | hex_value(pair[1]).unwrap())
            .collect()
    }

    pub(crate) const ANNOUNCE_ADAM: [u8; 27] = [
        0x01, 0x01, 0x03, 0x00, 0x00, 0x01, 0x98, 0x71, 0x83, 0xcd, 0xf9, 0x00, 0x00, 0x04, 0x1d,
        0x3d, 0x6a, 0x26, 0x15, 0x23, 0xa8, 0x28, 0x61, 0x64, 0x61, 0x6d, 0x00,
    ];

    pub(crate) const ANNOUNCE_SIGNED: &str = "01010300000198717c111400000419077f0222faf5ce6164616de89f19e772b12aea88b2450fbd9c76161304d656dbf817366830b44031e6264714089006b960e6168f5eba7964bf0be4875057b678a4a076314723884b2ef2ae66a23476df2bea4fe370304ed0053e80c61b2dc3b354970dda20282bd5dbd3decd0618d3d8cdc9667a41f538453d0385570018e5f60872eb89e1b7917ae7bc41e3bdae1e70f28b06924f51f38a19535096f9cc66969343f068147c514d3ec0e6400a96833ccb22b5ed3ed225f76efe74e14fecfd54c00612dc2d90f7f1d96930348547eb47dbda537ea95e712dc39377d4304103a01abe8cbbf21e8674b53654989a";
    pub(crate) const IDENTITY_ANNOUNCE: &str = "01130100000198717c110705004b19077f0222faf5ceffffffffffffffff009c7801639064af6752faf5f51c83c2eefd752fec1205f7059806e6c9a5fdbb77c4885571ebf650de7dd3632d6d0fc67a1056c192989298cbc0c038a3b046908dc18181420000ed7b240994fd85a4429eb67b4ecb7c76da3fb5b6986f3f8f9d10708e57427ea9f1eb2cfbb32d17cb3755db5a872a6b8648f334b51423ffbb46dffcf7044e0212dc480c9b194c4202f1d1b82b2ab00ce36c721d37297f9685b0412fb0bef1b3d9503cc4527a96d4fccf460abe8debfe2265e95da5163b49cafc932b045e3217564f14d0e42d23e80264a4f031f9b4139864e2fc4b6f2ec0";
    pub(crate) const MESSAGE_ANON: &str = "0104070000019893abb14c01004feddd326fb00c2b40ffffffffffffffff100000019893abb14b2431454645413636352d313837382d343644312d393538452d46314535353731413833383008616e6f6e32303134000568656c6c6f1065646464333236666230306332623430151bdfade3b1eec297f58a83862efcf098857199715a2de8a28de951489319c101adce8799dee33409c120137e272b60522f6354c1af553b2949b7125d62d849ca69dc7f419dd3e880cd5b57ec6b718241015e75974563ba00a33c8556ef62fe2f266f16e3bde1d313c6209c53549ede95dd8635eb10326bebaca5b1d9f3a406c110ade6bff69f17417ae182436a89";
    pub(crate) const MESSAGE_ADAM: &str = "01040700000198941571c301004bc67ff7caf2952326ffffffffffffffff1000000198941571c12434453337323032392d323035422d344644432d413844362d343736333437303436423944046164616d000568656c6c6f10633637666637636166323935323332368359aac1085a908e03d66c8ec83517ce63f5c202f174ae2e802d6539a7cc7ae3fbfb30dc8e34b188aa87f439d721d4b80adbd61013c7b112c8a3a121e96269e90d82dfe9a700bc4129cfc0a4b257fc94ae0a389066d2747a1f4ff10c0bd9b6aaa9a0365c84b0e18e388f2b0b647616deed3fec91085c49daf96aa7393cc94d039133bfcdbe9ec7b823149b26fb257e929aab60";
    pub(crate) const NOISE_TRUNCATED: &str = "01120700000198d284504b010114e74da1a856b690936ff9f65a6858d8ff000000006ee544eddd2b060d5b628002aed065491fc8b706ccbfafc518aedba00f4bf4d807d79cbcd1d32b8bc1fcb280781a22a2d6ea4814ed32dab76258a74cc695fb79fb520f1f020df4014888cb63d47c25de594c1ca4d76be437a87dec399c12c6d5473d2f44981d88e6f196c91292ecde587b7f2187c129b77b9947b0a48526c201b297204a9d8123f90e4abaa011aef35a93483957634a01d57b495f5dcbeb86d772eaa326575383c15482ddbfd84ce429d6f4390544fc56d55a3c966cecbf76c4837c3078fca2c5258ee7446987d10716b0c6c3233aad4b3f4d17";
    pub(crate) const NOISE_ENCRYPTED: &str = "01120700000198d35e50ee0100861a4d912f6a99af5e6ff9f65a6858d8ff00000000a2973fc96e96acb6176fa9b4aa81f65b44d96e0d0c6956a1a22ab637ed4e2587d63f6490bac66e3b4b08ea6317574d6797132c28cf6b2f2587e62746f7db631a7410eca33be8d35ed6d20cdb56fde7b10bbe1387b274dd02df3c8708f2288943ed3aa0c5a9b14900ecfe87a02c4ef6fce1e849353a8d2a7032ca33ce1666a2ab672200";

    #[test]
    fn test_reader_primitives() {
        let data = [0x01, 0x00, 0x05, 0x02, b'h', b'i', 0xff];
        let mut r = Reader::new(&data);
        assert_eq!(r.read_u8().unwrap(), 1);
        assert_eq!(r.read_u16_be().unwrap(), 5);
        assert_eq!(r.read_len8_prefixed().unwrap(), b"hi");
        assert_eq!(r.remaining(), 1);
        assert_eq!(r.read_u16_be(), Err(DecodeError::UnexpectedEof));
        // A failed read consumes nothing.
        assert_eq!(r.position(), 6);
        assert_eq!(r.read_u8().unwrap(), 0xff);
        assert!(r.is_empty());
    }

    #[test]
    fn test_reader_with_offset() {
        let data = [9, 9, 0x01];
        let mut r = Reader::with_offset(&data, 2);
        assert_eq!(r.read_u8().unwrap(), 1);
        assert!(Reader::with_offset(&data, 10).is_empty());
    }

    #[test]
    fn test_hex_writers() {
        let mut w = Writer::new();
        w.write_u8_hex(0x0a);
        w.write_u16_hex(0xbeef);
        w.write_u32_hex(0x0198_7183);
        w.write_u48_hex(0xffff_1234_5678_9abc);
        w.write_u64_hex(0xc67f_f7ca_f295_2326);
        assert_eq!(w.as_slice(), b"0abeef01987183123456789abcc67ff7caf2952326");
    }

    #[test]
    fn test_parse_hex_u64() {
        assert_eq!(parse_hex_u64(b"c67ff7caf2952326"), Some(0xc67ff7caf2952326));
        assert_eq!(parse_hex_u64(b"C67FF7CAF2952326"), Some(0xc67ff7caf2952326));
        assert_eq!(parse_hex_u64(b"c67ff7caf295232"), None);
        assert_eq!(parse_hex_u64(b"c67ff7caf295232g"), None);
    }

    #[test]
    fn test_length_prefix_truncates() {
        let long = vec![b'x'; 300];
        let mut w = Writer::new();
        w.write_len8_prefixed(&long);
        assert_eq!(w.len(), 256);
        assert_eq!(w.as_slice()[0], 255);
    }

    #[test]
    fn test_announce_encodes_reference_bytes() {
        let mut header = Header::new(PacketType::Announce, 4, Timestamp::from_millis(0x1987183cdf9), 0x1d3d6a261523a828);
        header.flags = 0;
        let announce = Announce {
            header,
            name: b"adam".to_vec(),
        };
        assert_eq!(announce.encode_to_vec(), ANNOUNCE_ADAM);
    }

    #[test]
    fn test_announce_decode_reference_bytes() {
        let announce = Announce::decode_from_slice(&ANNOUNCE_ADAM).unwrap();
        assert_eq!(announce.header.ttl, 3);
        assert_eq!(announce.header.sender_id, 0x1d3d6a261523a828);
        assert_eq!(announce.name, b"adam");
    }

    #[test]
    fn test_frame_ignores_trailing_bytes() {
        let data = from_hex(ANNOUNCE_SIGNED);
        let frame = Frame::parse(&data).unwrap();
        assert_eq!(frame.header.packet_type, PacketType::Announce as u8);
        assert_eq!(frame.header.ttl, 3);
        assert_eq!(frame.header.sender_id, 0x19077f0222faf5ce);
        assert_eq!(frame.header.recipient_id, None);
        assert_eq!(frame.payload, b"adam");
    }

    #[test]
    fn test_frame_rejects_bad_version() {
        let mut data = ANNOUNCE_ADAM;
        data[0] = 2;
        assert_eq!(Frame::parse(&data), Err(DecodeError::InvalidVersion(2)));
    }

    #[test]
    fn test_frame_short_payload_aborts() {
        let data = from_hex(NOISE_TRUNCATED);
        assert_eq!(Frame::parse(&data), Err(DecodeError::UnexpectedEof));
    }

    #[test]
    fn test_frame_missing_signature_aborts() {
        let mut data = ANNOUNCE_ADAM;
        data[11] = FLAG_HAS_SIGNATURE;
        assert_eq!(Frame::parse(&data), Err(DecodeError::UnexpectedEof));
    }

    #[test]
    fn test_compressed_length_underflow() {
        let mut data = ANNOUNCE_ADAM.to_vec();
        data[11] = FLAG_IS_COMPRESSED;
        data[12] = 0;
        data[13] = 1;
        assert_eq!(Frame::parse(&data), Err(DecodeError::InvalidLength));
    }

    #[test]
    fn test_compressed_identity_announce_inflates() {
        let data = from_hex(IDENTITY_ANNOUNCE);
        let frame = Frame::parse(&data).unwrap();
        assert_eq!(frame.header.packet_type, PacketType::NoiseIdentityAnnounce as u8);
        assert_eq!(frame.header.flags, FLAG_HAS_RECIPIENT | FLAG_IS_COMPRESSED);
        assert_eq!(frame.original_size, Some(0x9c));
        assert_eq!(frame.payload.len(), 0x4b - 2);

        let inflated = inflate(frame.payload, 0x9c).unwrap();
        assert_eq!(inflated.len(), 156);
        assert_eq!(
            &inflated[..14],
            &[0x00, 0x19, 0x07, 0x7F, 0x02, 0x22, 0xFA, 0xF5, 0xCE, 0x00, 0x20, 0xBB, 0xBF, 0x7E]
        );
        assert_eq!(&inflated[78..82], b"adam");
    }

    #[test]
    fn test_inflate_rejects_garbage() {
        assert!(inflate(b"not zlib at all", 64).is_err());
    }

    #[test]
    fn test_inflate_respects_bound() {
        let data = from_hex(IDENTITY_ANNOUNCE);
        let frame = Frame::parse(&data).unwrap();
        assert!(inflate(frame.payload, 100).is_err());
    }

    #[test]
    fn test_decode_message_anon() {
        let data = from_hex(MESSAGE_ANON);
        let frame = Frame::parse(&data).unwrap();
        let message = decode_message(frame.header, frame.payload).unwrap();
        assert_eq!(message.id, b"1EFEA665-1878-46D1-958E-F1E5571A8380");
        assert_eq!(message.sender_nickname, b"anon2014");
        assert_eq!(message.content, MessageContent::Plain(b"hello".to_vec()));
        assert_eq!(message.sender_peer, Some(0xeddd326fb00c2b40));
        assert_eq!(message.flags(), MSG_FLAG_SENDER_PEER_ID);
    }

    #[test]
    fn test_decode_message_too_short() {
        let header = Header::new(PacketType::Message, 3, Timestamp::ZERO, 1);
        assert_eq!(decode_message(header, &[0u8; 12]), Err(DecodeError::InvalidLength));
    }

    #[test]
    fn test_decode_message_truncated_field() {
        let data = from_hex(MESSAGE_ADAM);
        let frame = Frame::parse(&data).unwrap();
        // Cut inside the sender peer id.
        let payload = &frame.payload[..frame.payload.len() - 4];
        assert_eq!(decode_message(frame.header, payload), Err(DecodeError::UnexpectedEof));
    }

    #[test]
    fn test_decode_message_unresolved_peer_id() {
        let mut w = Writer::new();
        w.write_u8(MSG_FLAG_SENDER_PEER_ID);
        w.write_u64_be(5);
        w.write_len8_prefixed(b"id");
        w.write_len8_prefixed(b"nick");
        w.write_len16_prefixed(b"hi");
        w.write_len8_prefixed(b"abc");
        let header = Header::new(PacketType::Message, 3, Timestamp::ZERO, 1);
        let message = decode_message(header, w.as_slice()).unwrap();
        assert_eq!(message.sender_peer, None);
        assert_eq!(message.sender_peer_raw.as_deref(), Some(&b"abc"[..]));
        assert_eq!(message.flags(), MSG_FLAG_SENDER_PEER_ID);

        // Relayed byte for byte.
        let mut out = Writer::new();
        encode_message_body(&message, &mut out);
        assert_eq!(out.as_slice(), w.as_slice());
    }

    #[test]
    fn test_message_optional_fields_in_order() {
        let header = Header::new(PacketType::Message, 5, Timestamp::from_millis(77), 0x42);
        let mut message = Message::new(header, Timestamp::from_millis(76), b"m-1".to_vec(), b"bob".to_vec(), b"yo".to_vec());
        message.is_relay = true;
        message.original_sender = Some(b"carol".to_vec());
        message.recipient_nickname = Some(b"dave".to_vec());
        message.sender_peer = Some(0x0123456789abcdef);
        message.mentions = Some(vec![b"erin".to_vec(), b"frank".to_vec()]);
        message.channel = Some(b"#mesh".to_vec());

        let bytes = message.encode_to_vec();
        let decoded = Message::decode_from_slice(&bytes).unwrap();
        // Encoding spent one hop.
        assert_eq!(decoded.header.ttl, 4);
        assert_eq!(decoded.original_sender.as_deref(), Some(&b"carol"[..]));
        assert_eq!(decoded.recipient_nickname.as_deref(), Some(&b"dave"[..]));
        assert_eq!(decoded.sender_peer, Some(0x0123456789abcdef));
        assert_eq!(decoded.mentions, message.mentions);
        assert_eq!(decoded.channel.as_deref(), Some(&b"#mesh"[..]));
        assert_eq!(decoded.flags(), message.flags());
    }

    #[test]
    fn test_message_reencode_matches_capture() {
        let data = from_hex(MESSAGE_ADAM);
        let frame = Frame::parse(&data).unwrap();
        let message = decode_message(frame.header, frame.payload).unwrap();
        assert_eq!(message.sender_peer, Some(0xc67ff7caf2952326));

        let out = message.encode_to_vec();
        assert_eq!(out.len(), 106);
        assert_eq!(out[2], 6);
        assert_eq!(&out[..2], &data[..2]);
        assert_eq!(&out[3..105], &data[3..105]);
        assert_eq!(out[105], 0);
    }

    #[test]
    fn test_pass_along_relays_compressed_bytes() {
        let data = from_hex(IDENTITY_ANNOUNCE);
        let packet = PassAlong::decode_from_slice(&data).unwrap();
        let out = packet.encode_to_vec();
        // Header through payload survive unchanged apart from the ttl.
        assert_eq!(out[2], 0);
        assert_eq!(&out[3..105], &data[3..105]);
        assert_eq!(out.len(), 106);
    }

    #[test]
    fn test_pass_along_noise_encrypted() {
        let data = from_hex(NOISE_ENCRYPTED);
        let packet = PassAlong::decode_from_slice(&data).unwrap();
        assert_eq!(packet.header.packet_type, 18);
        assert_eq!(packet.header.ttl, 7);
        assert_eq!(packet.header.flags, 1);
        assert_eq!(packet.header.timestamp.as_millis(), 0x198d35e50ee);
        assert_eq!(packet.header.sender_id, 0x1a4d912f6a99af5e);
        assert_eq!(packet.header.recipient_id, Some(0x6ff9f65a6858d8ff));
        assert_eq!(packet.payload.len(), 134);
    }

    #[test]
    fn test_signature_written_with_length() {
        let mut header = Header::new(PacketType::DeliveryAck, 2, Timestamp::ZERO, 9);
        header.signature = Some(vec![0xAB; SIGNATURE_LEN]);
        let packet = PassAlong {
            header,
            payload: b"ack".to_vec(),
            original_size: None,
        };
        let out = packet.encode_to_vec();
        assert_eq!(out[11], FLAG_HAS_SIGNATURE);
        assert_eq!(out[22 + 3], SIGNATURE_LEN as u8);
        assert_eq!(out.len(), 22 + 3 + 1 + SIGNATURE_LEN + 1);
        assert_eq!(out[out.len() - 1], 0);
    }
}
