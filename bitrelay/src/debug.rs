//! Debug events for relay tracing.
//!
//! Enabled with the `debug` feature. These events let the simulator trace
//! dedup and fan-out decisions without parsing log output.

use alloc::vec::Vec;

use crate::time::Timestamp;
use crate::types::{ConnHandle, PacketKey, PeerId};
use crate::wire::DecodeError;

/// Emit a debug event through the tracker's emitter, if one is installed.
///
/// Compiles to nothing without the `debug` feature; the event expression is
/// not evaluated.
#[cfg(feature = "debug")]
macro_rules! emit_debug {
    ($t:expr, $event:expr) => {
        $t.emit_debug($event)
    };
}

#[cfg(not(feature = "debug"))]
macro_rules! emit_debug {
    ($t:expr, $event:expr) => {};
}

/// Trait for receiving debug events from a tracker.
/// Implemented by test harnesses to collect/print events.
pub trait DebugEmitter: Send {
    /// Called when a debug event is emitted.
    fn emit(&mut self, event: DebugEvent);
}

/// Debug events emitted by the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebugEvent {
    /// Frame decoded from a link.
    PacketReceived {
        timestamp: Timestamp,
        handle: ConnHandle,
        packet_type: u8,
        ttl: u8,
        sender: PeerId,
    },
    /// Frame or message payload rejected.
    DecodeFailed {
        handle: ConnHandle,
        error: DecodeError,
        data_len: usize,
    },
    /// Compressed payload did not inflate; raw bytes used instead.
    InflateFallback { handle: ConnHandle, declared: u16 },
    /// New message or pass-along packet stored.
    Stored { key: PacketKey, ttl: u8 },
    /// Already seen; dropped.
    Duplicate { key: PacketKey },
    /// Packet handed to a link's mailbox.
    Queued {
        key: PacketKey,
        handle: ConnHandle,
        len: usize,
    },
    /// Packet too large for the link.
    Oversize {
        key: PacketKey,
        handle: ConnHandle,
        size: usize,
        limit: usize,
    },
    /// Self announce queued for a link.
    AnnounceTargeted { handle: ConnHandle, timestamp: Timestamp },
    /// Corrected clock moved.
    ClockCorrected { offset_ms: i64 },
    /// Eviction sweep finished.
    Swept {
        timestamp: Timestamp,
        removed: Vec<(&'static str, usize)>,
    },
}
