#![forbid(unsafe_code)]
//! bitrelay - flood-relay core for bitchat BLE mesh repeaters
//!
//! A repeater sits between phones running bitchat and other repeaters. It
//! decodes every packet written to its GATT characteristic, keeps one copy
//! of each chat message and pass-along packet, and floods new ones to every
//! other link exactly once, spending one hop of TTL per relay.
//!
//! This crate is `no_std` but **requires the `alloc` crate**. Stores are
//! heap-allocated with capacity limits set by [`RelayConfig`].
//!
//! # Platform Requirements
//!
//! - **RAM**: 64KB with [`SmallConfig`], 256KB recommended (RP2040-class devices)
//! - **BLE stack**: anything that can expose a GATT server, act as a GATT
//!   client and offer single-slot send requests (see [`LinkLayer`])
//! - **Embassy**: Compatible with embassy async runtime
//!
//! # Key Properties
//!
//! - Messages dedup by message id, other relayed types by a content hash
//! - A packet is never sent back to the link or peer it came from
//! - TTL is decremented on the wire; packets that arrive with no hops left
//!   are not stored
//! - Network time is learned from packet timestamps; nothing is announced
//!   until the clock has been synced
//! - Everything is forgotten after the retention window
//!
//! # Example (basic usage)
//!
//! ```
//! use bitrelay::{DefaultConfig, Tracker};
//! use bitrelay::traits::test_impls::{MockClock, MockLink};
//!
//! let mut tracker: Tracker<_, _, DefaultConfig> = Tracker::new(MockLink::new(), MockClock::new());
//!
//! // Garbage is counted and dropped
//! tracker.process_write(1, 0, &[0xff, 0x00]);
//! assert_eq!(tracker.metrics().decode_failures, 1);
//! assert_eq!(tracker.messages_count(), 0);
//! ```
//!
//! # Example (integration pattern)
//!
//! ```text
//! use bitrelay::{Relay, LinkEventChannel, LinkLayer, Clock};
//!
//! // Implement LinkLayer and Clock for your platform...
//!
//! static EVENTS: LinkEventChannel = LinkEventChannel::new();
//!
//! // BLE callbacks push LinkEvents into EVENTS
//!
//! // let mut relay = Relay::new(link, clock, &EVENTS);
//! // spawn(async move {
//! //     relay.run().await;
//! // });
//! ```
//!
//! # Module Structure
//!
//! - [`types`] - Packet, peer and error types
//! - [`wire`] - bitchat binary format
//! - [`traits`] - LinkLayer and Clock traits, link events
//! - [`connection`] - BLE link records and advertising data
//! - [`tracker`] - Relay state and stores
//! - [`processor`] - Decoding writes
//! - [`queue`] - Send queues and link mailboxes
//! - [`maintenance`] - Announce, clock, sweep and link hygiene
//! - [`relay`] - Event loop
//! - [`time`] - Timestamp, Duration and clock offset
//! - [`config`] - Compile-time timing and memory configuration

#![no_std]

// Prevent test/debug features from being used in release builds.
#[cfg(all(feature = "test-support", not(test), not(debug_assertions)))]
compile_error!(
    "The `test-support` feature must not be enabled in release builds. \
     It includes mock link and clock implementations that never touch a radio."
);

#[cfg(all(feature = "debug", not(test), not(debug_assertions)))]
compile_error!(
    "The `debug` feature must not be enabled in release builds. \
     It adds relay tracing overhead intended only for development and simulation."
);

extern crate alloc;

// Host tests take the std critical-section implementation for the event channel.
#[cfg(test)]
use critical_section as _;

pub mod collections;
pub mod config;
pub mod connection;
#[macro_use]
pub mod debug;
pub mod maintenance;
pub mod processor;
pub mod queue;
pub mod relay;
pub mod time;
pub mod traits;
pub mod tracker;
pub mod types;
pub mod wire;

// Re-export main types at crate root
pub use config::{DefaultConfig, RelayConfig, SmallConfig};
pub use connection::{AddressType, Connection, Role, ServiceStatus};
pub use maintenance::SweepReport;
pub use relay::Relay;
pub use time::{ClockOffset, Duration, Timestamp};
pub use traits::{Clock, Direction, LinkError, LinkEvent, LinkEventChannel, LinkLayer};
pub use tracker::Tracker;
pub use types::{
    Address, Announce, ConnHandle, Error, Header, Message, MessageContent, Packet, PacketKey,
    PacketType, PassAlong, Peer, PeerId, RelayMetrics,
};
pub use wire::{Decode, DecodeError, Encode, Frame};

// Re-export constants
pub use types::{ANNOUNCE_TTL, ORIGINATED_MESSAGE_TTL, PROTOCOL_VERSION, SERVICE_NAME};
