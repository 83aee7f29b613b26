//! BLE link records, GATT identifiers and advertising data.
//!
//! The same [`Connection`] shape describes a scanned neighbour (keyed by
//! address) and an active link (keyed by handle). On connect the neighbour
//! record moves into the link store.

use alloc::vec::Vec;

use crate::time::Timestamp;
use crate::traits::Direction;
use crate::types::{Address, ConnHandle, CHARACTERISTIC_UUID, SERVICE_NAME, SERVICE_UUID};

/// Legacy advertising payload limit.
pub const ADVERTISING_MAX_LEN: usize = 31;

// AD structure types
const AD_FLAGS: u8 = 0x01;
const AD_INCOMPLETE_128: u8 = 0x06;
const AD_COMPLETE_128: u8 = 0x07;
const AD_SHORTENED_NAME: u8 = 0x08;
const AD_COMPLETE_NAME: u8 = 0x09;
const AD_SOLICITATION_128: u8 = 0x15;

/// LE general discoverable, BR/EDR not supported.
const ADV_FLAGS_LE_ONLY_GENERAL: u8 = 0x06;

/// Bluetooth address type.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AddressType {
    Public,
    Random,
    #[default]
    Unknown,
}

/// Our side of the link.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Role {
    /// We connected out (GATT client).
    Initiator,
    /// They connected to us (GATT server).
    Acceptor,
    #[default]
    Unknown,
}

/// What a neighbour's advertisement told us.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum ServiceStatus {
    NotFound,
    /// Advertises the bitchat service.
    #[default]
    Found,
    /// Advertises the service under a repeater name.
    FoundRepeater,
}

/// Per-link state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Connection {
    pub handle: ConnHandle,
    pub address: Address,
    pub address_type: AddressType,
    pub role: Role,
    pub connected: bool,
    /// Negotiated ATT MTU; serialized packets must not exceed it.
    pub mtu: u16,
    pub service_start: u16,
    pub service_end: u16,
    /// Bitchat characteristic value handle, 0 until discovered.
    pub value_handle: u16,
    pub notifications_enabled: bool,
    /// Payloads are waiting in the link's mailbox.
    pub has_data: bool,
    pub rssi: Option<i8>,
    pub service_status: ServiceStatus,
    pub last_seen: Timestamp,
}

impl Connection {
    pub fn new(handle: ConnHandle, mtu: u16, now: Timestamp) -> Self {
        Self {
            handle,
            address: [0; 6],
            address_type: AddressType::Unknown,
            role: Role::Unknown,
            connected: false,
            mtu,
            service_start: 0,
            service_end: 0,
            value_handle: 0,
            notifications_enabled: false,
            has_data: false,
            rssi: None,
            service_status: ServiceStatus::Found,
            last_seen: now,
        }
    }

    /// A scanned, unconnected neighbour.
    pub fn neighbour(
        address: Address,
        address_type: AddressType,
        status: ServiceStatus,
        rssi: i8,
        mtu: u16,
        now: Timestamp,
    ) -> Self {
        let mut c = Self::new(0, mtu, now);
        c.address = address;
        c.address_type = address_type;
        c.service_status = status;
        c.rssi = Some(rssi);
        c
    }

    /// Connected with a known characteristic, so packets can be sent.
    pub fn is_usable(&self) -> bool {
        self.connected && self.value_handle > 0
    }

    pub fn is_repeater(&self) -> bool {
        self.service_status == ServiceStatus::FoundRepeater
    }

    pub fn is_random(&self) -> bool {
        self.address_type == AddressType::Random
    }

    /// Service range known but characteristic not yet found.
    pub fn needs_characteristic_discovery(&self) -> bool {
        self.service_start != 0 && self.value_handle == 0
    }

    /// Acceptors notify; everything else writes without response.
    pub fn send_direction(&self) -> Direction {
        match self.role {
            Role::Acceptor => Direction::Notify,
            _ => Direction::Write,
        }
    }

    /// Idle past `window` and no longer connected.
    pub fn is_stale(&self, window: crate::time::Duration, now: Timestamp) -> bool {
        !self.connected && self.last_seen.is_older_than(window, now)
    }
}

/// Reverse a 16-byte UUID into advertising (little-endian) order.
pub const fn reversed_uuid(uuid: &[u8; 16]) -> [u8; 16] {
    let mut out = [0u8; 16];
    let mut i = 0;
    while i < 16 {
        out[i] = uuid[15 - i];
        i += 1;
    }
    out
}

/// Bitchat service UUID as it appears in advertisements.
pub const SERVICE_UUID_REVERSED: [u8; 16] = reversed_uuid(&SERVICE_UUID);

/// True if a discovered service is the bitchat service.
pub fn is_service_uuid(uuid: &[u8; 16]) -> bool {
    *uuid == SERVICE_UUID
}

/// True if a discovered characteristic is the bitchat characteristic.
pub fn is_characteristic_uuid(uuid: &[u8; 16]) -> bool {
    *uuid == CHARACTERISTIC_UUID
}

/// Build the legacy advertisement: flags, the service UUID and as much of
/// `name` as fits.
pub fn advertising_data(name: &[u8]) -> Vec<u8> {
    let mut adv = Vec::with_capacity(ADVERTISING_MAX_LEN);
    adv.extend_from_slice(&[2, AD_FLAGS, ADV_FLAGS_LE_ONLY_GENERAL]);
    adv.push(17);
    adv.push(AD_INCOMPLETE_128);
    adv.extend_from_slice(&SERVICE_UUID_REVERSED);

    let fit = name.len().min(ADVERTISING_MAX_LEN - adv.len() - 2);
    adv.push(fit as u8 + 1);
    adv.push(if fit == name.len() {
        AD_COMPLETE_NAME
    } else {
        AD_SHORTENED_NAME
    });
    adv.extend_from_slice(&name[..fit]);
    adv
}

/// Classify a neighbour by its advertising data.
///
/// A malformed AD length ends the scan; what was seen so far still counts.
pub fn service_status(adv: &[u8]) -> ServiceStatus {
    let mut found_uuid = false;
    let mut found_name = false;
    let mut pos = 0;
    while pos < adv.len() {
        let len = adv[pos] as usize;
        if len == 0 || pos + 1 + len > adv.len() {
            break;
        }
        let ad_type = adv[pos + 1];
        let data = &adv[pos + 2..pos + 1 + len];
        match ad_type {
            AD_INCOMPLETE_128 | AD_COMPLETE_128 | AD_SOLICITATION_128 => {
                found_uuid |= data.chunks_exact(16).any(|uuid| uuid == SERVICE_UUID_REVERSED);
            }
            AD_SHORTENED_NAME | AD_COMPLETE_NAME => {
                found_name |= data.starts_with(SERVICE_NAME);
            }
            _ => {}
        }
        pos += 1 + len;
    }

    match (found_uuid, found_name) {
        (true, true) => ServiceStatus::FoundRepeater,
        (true, false) => ServiceStatus::Found,
        _ => ServiceStatus::NotFound,
    }
}
