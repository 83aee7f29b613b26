//! Core traits for link-layer and time abstraction.
//!
//! These traits allow the relay to be used with different:
//! - BLE stacks (vendor HCI/GATT stacks, host simulation)
//! - Time sources (real hardware time, simulated time)

use alloc::vec::Vec;
use core::future::Future;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;

use crate::connection::{AddressType, Role};
use crate::time::Timestamp;
use crate::types::{Address, ConnHandle};

/// Queue size for the link event channel.
pub(crate) const LINK_EVENT_QUEUE_SIZE: usize = 16;

/// Mutex type used for channels.
pub(crate) type ChannelMutex = CriticalSectionRawMutex;

/// Channel carrying link-layer events into the relay task.
pub type LinkEventChannel = Channel<ChannelMutex, LinkEvent, LINK_EVENT_QUEUE_SIZE>;

/// Which two-phase send primitive a payload goes through.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Direction {
    /// GATT server notification (we accepted the link).
    Notify,
    /// GATT client write without response (we initiated the link).
    Write,
}

/// Non-success link-layer status.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkError {
    /// Handle no longer refers to a connection (HCI 0x02).
    UnknownConnection,
    /// Controller cannot take the request right now.
    Busy,
    /// Any other status code.
    Other(u8),
}

impl LinkError {
    /// Map an HCI/ATT status code.
    pub fn from_status(status: u8) -> Self {
        match status {
            0x02 => LinkError::UnknownConnection,
            0x0C | 0x57 => LinkError::Busy,
            other => LinkError::Other(other),
        }
    }
}

/// Event delivered by the BLE stack.
///
/// Radio callbacks push these into a [`LinkEventChannel`]; the relay task
/// handles them one at a time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkEvent {
    /// Scan report.
    Advertisement {
        address: Address,
        address_type: AddressType,
        data: Vec<u8>,
        rssi: i8,
    },
    /// Link established in either role.
    Connected {
        handle: ConnHandle,
        address: Address,
        address_type: AddressType,
        role: Role,
    },
    Disconnected { handle: ConnHandle },
    /// An outgoing connect did not complete.
    ConnectFailed { address: Address },
    /// Primary service found during discovery.
    ServiceDiscovered {
        handle: ConnHandle,
        uuid: [u8; 16],
        start: u16,
        end: u16,
    },
    /// Characteristic found during discovery.
    CharacteristicDiscovered {
        handle: ConnHandle,
        uuid: [u8; 16],
        value_handle: u16,
    },
    /// A service or characteristic query finished.
    DiscoveryComplete { handle: ConnHandle },
    /// Peer wrote our characteristic's client configuration descriptor.
    NotificationsEnabled {
        handle: ConnHandle,
        value_handle: u16,
        enabled: bool,
    },
    MtuExchanged { handle: ConnHandle, mtu: u16 },
    /// Write to our characteristic, or notification from theirs.
    Received { handle: ConnHandle, data: Vec<u8> },
    /// Completion of an earlier send request.
    CanSendNow {
        handle: ConnHandle,
        direction: Direction,
    },
    /// Result of a read-RSSI request.
    Rssi { handle: ConnHandle, rssi: i8 },
}

/// BLE stack primitives the relay drives.
///
/// Sending is two-phase: [`request_can_send`](LinkLayer::request_can_send)
/// returns immediately and the stack later delivers
/// [`LinkEvent::CanSendNow`], at which point exactly one payload may be
/// passed to [`send`](LinkLayer::send).
pub trait LinkLayer {
    /// Our controller address.
    fn local_address(&self) -> Address;

    /// Ask for a send slot on a link.
    fn request_can_send(&mut self, handle: ConnHandle, direction: Direction) -> Result<(), LinkError>;

    /// Transmit one payload. Only valid inside a granted send slot.
    fn send(
        &mut self,
        handle: ConnHandle,
        value_handle: u16,
        direction: Direction,
        data: &[u8],
    ) -> Result<(), LinkError>;

    /// Request an RSSI reading, answered by [`LinkEvent::Rssi`].
    fn read_rssi(&mut self, handle: ConnHandle) -> Result<(), LinkError>;

    /// Connect out to a neighbour.
    fn connect(&mut self, address: Address, address_type: AddressType) -> Result<(), LinkError>;

    fn disconnect(&mut self, handle: ConnHandle) -> Result<(), LinkError>;

    /// Start primary service discovery.
    fn discover_services(&mut self, handle: ConnHandle) -> Result<(), LinkError>;

    /// Start characteristic discovery within a service range.
    fn discover_characteristics(&mut self, handle: ConnHandle, start: u16, end: u16) -> Result<(), LinkError>;

    /// Subscribe to notifications of a remote characteristic.
    fn enable_notifications(&mut self, handle: ConnHandle, value_handle: u16) -> Result<(), LinkError>;

    /// (Re)start scanning for neighbours.
    fn start_scan(&mut self) -> Result<(), LinkError>;
}

/// Time source trait for real or simulated time.
///
/// Allows the relay to work with:
/// - Real hardware time (embassy_time, std::time)
/// - Simulated time (controlled by simulator for deterministic testing)
///
/// Readings are monotonic milliseconds since boot. Network time is derived
/// by the tracker's clock offset.
///
/// # Example (testing with MockClock)
///
/// ```
/// use bitrelay::traits::test_impls::MockClock;
/// use bitrelay::{Clock, Duration, Timestamp};
///
/// let clock = MockClock::new();
/// assert_eq!(clock.now(), Timestamp::ZERO);
///
/// clock.advance(Duration::from_secs(2));
/// assert_eq!(clock.now().as_secs(), 2);
/// ```
pub trait Clock {
    /// Future type returned by sleep_until.
    type SleepFuture<'a>: Future<Output = ()>
    where
        Self: 'a;

    /// Get the current timestamp.
    fn now(&self) -> Timestamp;

    /// Sleep until the given timestamp.
    ///
    /// For simulation, this should complete when the simulator advances
    /// time past the given timestamp.
    fn sleep_until(&self, time: Timestamp) -> Self::SleepFuture<'_>;
}

#[cfg(any(test, feature = "test-support"))]
pub mod test_impls {
    //! Mock implementations of traits for unit testing and doc tests.
    //!
    //! Available when running tests or with the `test-support` feature enabled.

    use alloc::collections::VecDeque;
    use core::cell::Cell;
    use core::future::{ready, Ready};

    use super::*;

    /// Mock clock for testing (synchronous, time advances manually).
    pub struct MockClock {
        current: Cell<Timestamp>,
    }

    impl Default for MockClock {
        fn default() -> Self {
            Self {
                current: Cell::new(Timestamp::ZERO),
            }
        }
    }

    impl MockClock {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn at(time: Timestamp) -> Self {
            Self {
                current: Cell::new(time),
            }
        }

        /// Advance time to the given timestamp.
        pub fn set(&self, time: Timestamp) {
            self.current.set(time);
        }

        /// Advance time by the given duration.
        pub fn advance(&self, duration: crate::time::Duration) {
            self.current.set(self.current.get() + duration);
        }
    }

    impl Clock for MockClock {
        type SleepFuture<'a> = Ready<()>;

        fn now(&self) -> Timestamp {
            self.current.get()
        }

        fn sleep_until(&self, _time: Timestamp) -> Self::SleepFuture<'_> {
            // In synchronous tests, sleep completes immediately.
            // The test code should advance time manually.
            ready(())
        }
    }

    /// Request recorded by [`MockLink`].
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum LinkRequest {
        CanSend(ConnHandle, Direction),
        Rssi(ConnHandle),
        Connect(Address, AddressType),
        Disconnect(ConnHandle),
        DiscoverServices(ConnHandle),
        DiscoverCharacteristics(ConnHandle, u16, u16),
        EnableNotifications(ConnHandle, u16),
        StartScan,
    }

    /// Payload handed to [`MockLink::send`].
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct SentPayload {
        pub handle: ConnHandle,
        pub value_handle: u16,
        pub direction: Direction,
        pub data: Vec<u8>,
    }

    /// Mock link layer that records every request and payload.
    ///
    /// Statuses for `request_can_send` and `send` can be scripted; each
    /// scripted status is used once, after which calls succeed.
    pub struct MockLink {
        address: Address,
        requests: Vec<LinkRequest>,
        sent: Vec<SentPayload>,
        request_status: VecDeque<LinkError>,
        send_status: VecDeque<LinkError>,
    }

    impl Default for MockLink {
        fn default() -> Self {
            Self::with_address([0; 6])
        }
    }

    impl MockLink {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_address(address: Address) -> Self {
            Self {
                address,
                requests: Vec::new(),
                sent: Vec::new(),
                request_status: VecDeque::new(),
                send_status: VecDeque::new(),
            }
        }

        /// Fail the next send-slot request with `err`.
        pub fn fail_next_request(&mut self, err: LinkError) {
            self.request_status.push_back(err);
        }

        /// Fail the next transmission with `err`.
        pub fn fail_next_send(&mut self, err: LinkError) {
            self.send_status.push_back(err);
        }

        pub fn requests(&self) -> &[LinkRequest] {
            &self.requests
        }

        pub fn sent(&self) -> &[SentPayload] {
            &self.sent
        }

        /// Drain recorded requests.
        pub fn take_requests(&mut self) -> Vec<LinkRequest> {
            core::mem::take(&mut self.requests)
        }

        /// Drain recorded payloads.
        pub fn take_sent(&mut self) -> Vec<SentPayload> {
            core::mem::take(&mut self.sent)
        }

        /// Total bytes transmitted so far.
        pub fn sent_bytes(&self) -> usize {
            self.sent.iter().map(|s| s.data.len()).sum()
        }
    }

    impl LinkLayer for MockLink {
        fn local_address(&self) -> Address {
            self.address
        }

        fn request_can_send(&mut self, handle: ConnHandle, direction: Direction) -> Result<(), LinkError> {
            self.requests.push(LinkRequest::CanSend(handle, direction));
            match self.request_status.pop_front() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }

        fn send(
            &mut self,
            handle: ConnHandle,
            value_handle: u16,
            direction: Direction,
            data: &[u8],
        ) -> Result<(), LinkError> {
            if let Some(err) = self.send_status.pop_front() {
                return Err(err);
            }
            self.sent.push(SentPayload {
                handle,
                value_handle,
                direction,
                data: data.to_vec(),
            });
            Ok(())
        }

        fn read_rssi(&mut self, handle: ConnHandle) -> Result<(), LinkError> {
            self.requests.push(LinkRequest::Rssi(handle));
            Ok(())
        }

        fn connect(&mut self, address: Address, address_type: AddressType) -> Result<(), LinkError> {
            self.requests.push(LinkRequest::Connect(address, address_type));
            Ok(())
        }

        fn disconnect(&mut self, handle: ConnHandle) -> Result<(), LinkError> {
            self.requests.push(LinkRequest::Disconnect(handle));
            Ok(())
        }

        fn discover_services(&mut self, handle: ConnHandle) -> Result<(), LinkError> {
            self.requests.push(LinkRequest::DiscoverServices(handle));
            Ok(())
        }

        fn discover_characteristics(&mut self, handle: ConnHandle, start: u16, end: u16) -> Result<(), LinkError> {
            self.requests.push(LinkRequest::DiscoverCharacteristics(handle, start, end));
            Ok(())
        }

        fn enable_notifications(&mut self, handle: ConnHandle, value_handle: u16) -> Result<(), LinkError> {
            self.requests.push(LinkRequest::EnableNotifications(handle, value_handle));
            Ok(())
        }

        fn start_scan(&mut self) -> Result<(), LinkError> {
            self.requests.push(LinkRequest::StartScan);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_impls::*;
    use super::*;

    #[test]
    fn test_link_error_from_status() {
        assert_eq!(LinkError::from_status(0x02), LinkError::UnknownConnection);
        assert_eq!(LinkError::from_status(0x0C), LinkError::Busy);
        assert_eq!(LinkError::from_status(0x3E), LinkError::Other(0x3E));
    }

    #[test]
    fn test_mock_link_scripted_failures() {
        let mut link = MockLink::new();
        link.fail_next_request(LinkError::Busy);
        assert_eq!(link.request_can_send(1, Direction::Write), Err(LinkError::Busy));
        assert_eq!(link.request_can_send(1, Direction::Write), Ok(()));
        assert_eq!(link.requests().len(), 2);

        link.fail_next_send(LinkError::UnknownConnection);
        assert!(link.send(1, 3, Direction::Write, b"x").is_err());
        assert!(link.send(1, 3, Direction::Write, b"yz").is_ok());
        assert_eq!(link.sent_bytes(), 2);
        assert_eq!(link.take_sent().len(), 1);
        assert!(link.sent().is_empty());
    }

    #[test]
    fn test_mock_clock() {
        let clock = MockClock::at(Timestamp::from_secs(5));
        clock.advance(crate::time::Duration::from_millis(500));
        assert_eq!(clock.now().as_millis(), 5_500);
    }

    #[test]
    fn test_event_channel() {
        let channel = LinkEventChannel::new();
        assert!(channel.try_send(LinkEvent::Disconnected { handle: 4 }).is_ok());
        assert_eq!(channel.try_receive().ok(), Some(LinkEvent::Disconnected { handle: 4 }));
    }
}
