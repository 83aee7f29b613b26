//! Compile-time configuration for relay timing and memory bounds.
//!
//! The `RelayConfig` trait lets a board pick store capacities that fit its
//! RAM. Timing constants follow the bitchat repeater cadence and rarely need
//! changing, but are part of the trait so simulations can compress them.
//!
//! # Memory Footprint
//!
//! | Config | Stored packets | Suitable MCUs |
//! |--------|---------------:|---------------|
//! | `DefaultConfig` | ~512 messages + 1024 pass-along | RP2040 (264 KB), nRF52840, ESP32 |
//! | `SmallConfig` | ~64 messages + 128 pass-along | nRF52832, STM32WB with 64 KB |
//!
//! Capacities are upper bounds; the periodic sweep usually keeps the stores
//! far below them. When a store is full, the oldest entry is evicted.
//!
//! # Example
//!
//! ```ignore
//! use bitrelay::{Tracker, SmallConfig};
//!
//! let tracker = Tracker::<_, _, SmallConfig>::new(link, clock);
//! ```

use crate::time::Duration;

/// Configuration trait for relay timing and store capacities.
///
/// All capacities must be non-zero.
pub trait RelayConfig {
    /// How long messages, packets and idle links are kept.
    const RETENTION: Duration;

    /// Interval between eviction sweeps.
    const CLEANUP_INTERVAL: Duration;

    /// Boot-relative time of the first sweep.
    const FIRST_CLEANUP: Duration;

    /// Interval between relay loop passes (drain, link management).
    const POLL_INTERVAL: Duration;

    /// Interval between announce passes.
    const ANNOUNCE_INTERVAL: Duration;

    /// Interval after which RSSI polling restarts from the first link.
    const RSSI_RESTART_INTERVAL: Duration;

    /// Interval between scan restarts.
    const SCAN_INTERVAL: Duration;

    /// How long one scan runs. No connects are issued meanwhile.
    const SCAN_WINDOW: Duration;

    /// Give up waiting for a connect or GATT discovery to complete.
    const CONNECT_TIMEOUT: Duration;

    /// Pause before connecting again after dropping a duplicate link.
    const RECONNECT_BACKOFF: Duration;

    /// Divergence beyond which a lagging packet timestamp still corrects the clock.
    const CLOCK_DIVERGENCE: Duration;

    /// Offset the corrected clock must reach before we announce or connect to
    /// non-repeater neighbours.
    const CLOCK_SYNC_FLOOR: u64;

    /// ATT MTU assumed before an MTU exchange completes.
    const DEFAULT_MTU: u16;

    /// Maximum payloads waiting in one link direction.
    const MAX_MAILBOX_DEPTH: usize;

    /// Maximum stored chat messages.
    const MAX_MESSAGES: usize;

    /// Maximum stored pass-along packets.
    const MAX_PACKETS: usize;

    /// Maximum known peers.
    const MAX_PEERS: usize;

    /// Maximum scanned neighbours.
    const MAX_NEIGHBOURS: usize;
}

/// Default configuration for 256KB+ RAM devices.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultConfig;

impl RelayConfig for DefaultConfig {
    const RETENTION: Duration = Duration::from_mins(10);
    const CLEANUP_INTERVAL: Duration = Duration::from_mins(10);
    const FIRST_CLEANUP: Duration = Duration::from_mins(15);
    const POLL_INTERVAL: Duration = Duration::from_millis(40);
    const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(2);
    const RSSI_RESTART_INTERVAL: Duration = Duration::from_mins(5);
    const SCAN_INTERVAL: Duration = Duration::from_mins(10);
    const SCAN_WINDOW: Duration = Duration::from_secs(2);
    const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
    const RECONNECT_BACKOFF: Duration = Duration::from_secs(2);
    const CLOCK_DIVERGENCE: Duration = Duration::from_mins(5);
    const CLOCK_SYNC_FLOOR: u64 = 1_755_685_519;
    const DEFAULT_MTU: u16 = 23;
    const MAX_MAILBOX_DEPTH: usize = 32;
    const MAX_MESSAGES: usize = 512;
    const MAX_PACKETS: usize = 1024;
    const MAX_PEERS: usize = 256;
    const MAX_NEIGHBOURS: usize = 64;
}

/// Small configuration for 64KB RAM devices.
///
/// Same cadence as [`DefaultConfig`], smaller stores.
#[derive(Debug, Clone, Copy, Default)]
pub struct SmallConfig;

impl RelayConfig for SmallConfig {
    const RETENTION: Duration = Duration::from_mins(10);
    const CLEANUP_INTERVAL: Duration = Duration::from_mins(10);
    const FIRST_CLEANUP: Duration = Duration::from_mins(15);
    const POLL_INTERVAL: Duration = Duration::from_millis(40);
    const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(2);
    const RSSI_RESTART_INTERVAL: Duration = Duration::from_mins(5);
    const SCAN_INTERVAL: Duration = Duration::from_mins(10);
    const SCAN_WINDOW: Duration = Duration::from_secs(2);
    const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
    const RECONNECT_BACKOFF: Duration = Duration::from_secs(2);
    const CLOCK_DIVERGENCE: Duration = Duration::from_mins(5);
    const CLOCK_SYNC_FLOOR: u64 = 1_755_685_519;
    const DEFAULT_MTU: u16 = 23;
    const MAX_MAILBOX_DEPTH: usize = 8;
    const MAX_MESSAGES: usize = 64;
    const MAX_PACKETS: usize = 128;
    const MAX_PEERS: usize = 32;
    const MAX_NEIGHBOURS: usize = 16;
}
