//! Relay - the event loop driving one repeater.
//!
//! The Relay owns a [`Tracker`] and reads link-layer events from a
//! [`LinkEventChannel`]. Between events it wakes every poll interval to run
//! the periodic duties: announcing, connecting to neighbours, draining the
//! send queues, RSSI polling, scanning and the eviction sweep.
//!
//! # Usage
//!
//! ```ignore
//! static EVENTS: LinkEventChannel = LinkEventChannel::new();
//!
//! let mut relay: Relay<_, _> = Relay::new(link, clock, &EVENTS);
//!
//! // BLE callbacks push into the channel
//! EVENTS.try_send(LinkEvent::Disconnected { handle }).ok();
//!
//! relay.run().await;
//! ```

use alloc::vec::Vec;

use crate::config::{DefaultConfig, RelayConfig};
use crate::connection::{is_characteristic_uuid, is_service_uuid, service_status, Role, ServiceStatus};
use crate::time::Timestamp;
use crate::tracker::Tracker;
use crate::traits::{Clock, LinkError, LinkEvent, LinkEventChannel, LinkLayer};
use crate::types::{Address, ConnHandle};
use crate::wire::Writer;

/// GATT query in flight on an initiated link.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Discovery {
    Services,
    Characteristics,
}

/// Deadlines of the periodic duties, all on the monotonic clock.
#[derive(Clone, Copy, Debug)]
struct Schedule {
    next_tick: Timestamp,
    next_announce: Timestamp,
    next_rssi_restart: Timestamp,
    rssi_in_progress: bool,
    next_scan: Timestamp,
    scan_until: Timestamp,
    next_cleanup: Timestamp,
    reconnect_after: Timestamp,
}

/// One repeater: tracker state plus the link and timer plumbing around it.
pub struct Relay<'a, L, C, Cfg = DefaultConfig> {
    tracker: Tracker<L, C, Cfg>,
    events: &'a LinkEventChannel,
    schedule: Schedule,
    connecting: Option<(Address, Timestamp)>,
    discovering: Option<(ConnHandle, Discovery, Timestamp)>,
    life_check: bool,
}

impl<'a, L, C, Cfg> Relay<'a, L, C, Cfg>
where
    L: LinkLayer,
    C: Clock,
    Cfg: RelayConfig,
{
    /// Create a relay. The first tick scans; the first sweep runs after
    /// `FIRST_CLEANUP`.
    pub fn new(link: L, clock: C, events: &'a LinkEventChannel) -> Self {
        let now = clock.now();
        Self {
            tracker: Tracker::new(link, clock),
            events,
            schedule: Schedule {
                next_tick: now,
                next_announce: now + Cfg::ANNOUNCE_INTERVAL,
                next_rssi_restart: now + Cfg::RSSI_RESTART_INTERVAL,
                rssi_in_progress: false,
                next_scan: now,
                scan_until: now,
                next_cleanup: now + Cfg::FIRST_CLEANUP,
                reconnect_after: now,
            },
            connecting: None,
            discovering: None,
            life_check: false,
        }
    }

    pub fn tracker(&self) -> &Tracker<L, C, Cfg> {
        &self.tracker
    }

    pub fn tracker_mut(&mut self) -> &mut Tracker<L, C, Cfg> {
        &mut self.tracker
    }

    /// Channel the BLE stack feeds.
    pub fn events(&self) -> &'a LinkEventChannel {
        self.events
    }

    /// An outgoing connect has been issued and not yet completed.
    pub fn is_connecting(&self) -> bool {
        self.connecting.is_some()
    }

    /// Send a "Still alive" message on the next tick.
    pub fn request_life_check(&mut self) {
        self.life_check = true;
    }

    /// When the next timer pass is due.
    pub fn next_wake(&self) -> Timestamp {
        self.schedule.next_tick
    }

    /// Run the relay forever.
    ///
    /// Waits for either a link event or the next timer deadline.
    pub async fn run(&mut self) -> ! {
        use embassy_futures::select::{select, Either};

        loop {
            let wake = self.next_wake();
            let result = select(self.events.receive(), self.tracker.clock().sleep_until(wake)).await;

            match result {
                Either::First(event) => self.handle_event(event),
                Either::Second(()) => {
                    let now = self.tracker.monotonic_now();
                    self.handle_timer(now);
                }
            }
        }
    }

    /// Count and log a failed link request. Returns true on success.
    fn check(&mut self, what: &str, result: Result<(), LinkError>) -> bool {
        match result {
            Ok(()) => true,
            Err(e) => {
                self.tracker.metrics.link_errors += 1;
                log::warn!("{} failed: {:?}", what, e);
                false
            }
        }
    }

    /// Apply one link-layer event and issue any follow-up request.
    pub fn handle_event(&mut self, event: LinkEvent) {
        let now = self.tracker.monotonic_now();
        match event {
            LinkEvent::Advertisement {
                address,
                address_type,
                data,
                rssi,
            } => {
                let status = service_status(&data);
                if status != ServiceStatus::NotFound {
                    self.tracker.add_neighbour(address, address_type, status, rssi);
                }
            }
            LinkEvent::Connected {
                handle,
                address,
                address_type,
                role,
            } => {
                self.tracker.report_connection(handle, address, address_type, role);
                if role == Role::Initiator {
                    if self.connecting.is_some_and(|(a, _)| a == address) {
                        self.connecting = None;
                    }
                    let result = self.tracker.link_mut().discover_services(handle);
                    if self.check("service discovery", result) {
                        self.discovering = Some((handle, Discovery::Services, now));
                    }
                }
            }
            LinkEvent::ConnectFailed { address } => {
                log::debug!("connect to {:02x?} failed", address);
                if self.connecting.is_some_and(|(a, _)| a == address) {
                    self.connecting = None;
                }
            }
            LinkEvent::Disconnected { handle } => {
                self.tracker.report_disconnection(handle);
                if self.discovering.is_some_and(|(h, _, _)| h == handle) {
                    self.discovering = None;
                }
            }
            LinkEvent::ServiceDiscovered {
                handle,
                uuid,
                start,
                end,
            } => {
                if is_service_uuid(&uuid) {
                    let c = self.tracker.connection_for_handle(handle);
                    c.service_start = start;
                    c.service_end = end;
                }
            }
            LinkEvent::CharacteristicDiscovered {
                handle,
                uuid,
                value_handle,
            } => {
                if is_characteristic_uuid(&uuid) {
                    self.tracker.connection_for_handle(handle).value_handle = value_handle;
                    let result = self.tracker.link_mut().enable_notifications(handle, value_handle);
                    self.check("notification subscribe", result);
                }
            }
            LinkEvent::DiscoveryComplete { handle } => {
                let phase = match self.discovering {
                    Some((h, phase, _)) if h == handle => Some(phase),
                    _ => None,
                };
                self.discovering = None;
                let needs_characteristics = self
                    .tracker
                    .connection(handle)
                    .filter(|c| c.needs_characteristic_discovery())
                    .map(|c| (c.service_start, c.service_end));
                if let (Some(Discovery::Services), Some((start, end))) = (phase, needs_characteristics) {
                    let result = self.tracker.link_mut().discover_characteristics(handle, start, end);
                    if self.check("characteristic discovery", result) {
                        self.discovering = Some((handle, Discovery::Characteristics, now));
                    }
                }
            }
            LinkEvent::NotificationsEnabled {
                handle,
                value_handle,
                enabled,
            } => {
                let c = self.tracker.connection_for_handle(handle);
                c.notifications_enabled = enabled;
                if enabled {
                    c.value_handle = value_handle;
                }
            }
            LinkEvent::MtuExchanged { handle, mtu } => {
                self.tracker.connection_for_handle(handle).mtu = mtu;
            }
            LinkEvent::Received { handle, data } => {
                self.tracker.process_write(handle, 0, &data);
            }
            LinkEvent::CanSendNow { handle, direction } => {
                self.tracker.on_can_send(handle, direction);
            }
            LinkEvent::Rssi { handle, rssi } => {
                self.tracker.set_rssi(handle, rssi);
            }
        }
    }

    /// Run every periodic duty that is due at `now`.
    pub fn handle_timer(&mut self, now: Timestamp) {
        self.schedule.next_tick = now + Cfg::POLL_INTERVAL;

        if self.life_check {
            self.life_check = false;
            self.send_life_check();
        }

        if now >= self.schedule.next_announce {
            self.tracker.announce_to_connections();
            self.schedule.next_announce = now + Cfg::ANNOUNCE_INTERVAL;
        }

        if now >= self.schedule.next_scan {
            let result = self.tracker.link_mut().start_scan();
            if self.check("scan", result) {
                self.schedule.scan_until = now + Cfg::SCAN_WINDOW;
            }
            self.schedule.next_scan = now + Cfg::SCAN_INTERVAL;
        }

        self.manage_links(now);
        self.tracker.drain();

        if now >= self.schedule.next_rssi_restart {
            self.schedule.rssi_in_progress = self.tracker.request_next_rssi(true);
            self.schedule.next_rssi_restart = now + Cfg::RSSI_RESTART_INTERVAL;
        } else if self.schedule.rssi_in_progress {
            self.schedule.rssi_in_progress = self.tracker.request_next_rssi(false);
        }

        if now >= self.schedule.next_cleanup {
            self.tracker.cleanup_stale();
            self.tracker.print_stats();
            self.schedule.next_cleanup = now + Cfg::CLEANUP_INTERVAL;
        }
    }

    /// Connect out to a neighbour, or drop a duplicate link.
    ///
    /// Nothing happens while a scan, connect or discovery is running, nor
    /// during the back-off after a duplicate was dropped.
    fn manage_links(&mut self, now: Timestamp) {
        if let Some((address, since)) = self.connecting {
            if now < since + Cfg::CONNECT_TIMEOUT {
                return;
            }
            log::debug!("connect to {:02x?} timed out", address);
            self.connecting = None;
        }
        if let Some((handle, _, since)) = self.discovering {
            if now < since + Cfg::CONNECT_TIMEOUT {
                return;
            }
            log::debug!("discovery on 0x{:x} timed out", handle);
            self.discovering = None;
        }
        if now < self.schedule.scan_until || now < self.schedule.reconnect_after {
            return;
        }

        if self.connect_to_first_neighbour(now) {
            return;
        }
        if let Some(handle) = self.tracker.any_duplicate_handle() {
            let result = self.tracker.link_mut().disconnect(handle);
            if self.check("disconnect", result) {
                log::info!("dropping duplicate link 0x{:x}", handle);
                self.schedule.reconnect_after = now + Cfg::RECONNECT_BACKOFF;
            }
        }
    }

    fn connect_to_first_neighbour(&mut self, now: Timestamp) -> bool {
        let target = self
            .tracker
            .connectable_neighbours()
            .into_iter()
            .find(|n| self.tracker.connection_for_address(&n.address).is_none())
            .map(|n| (n.address, n.address_type));
        let Some((address, address_type)) = target else {
            return false;
        };

        let result = self.tracker.link_mut().connect(address, address_type);
        if !self.check("connect", result) {
            return false;
        }
        log::debug!("connecting to {:02x?}", address);
        self.tracker.set_connection_started(&address);
        self.connecting = Some((address, now));
        true
    }

    /// "[<seconds as 4 hex digits>] Still alive".
    fn send_life_check(&mut self) {
        let secs = self.tracker.now().as_secs();
        let mut content = Writer::with_capacity(18);
        content.write_u8(b'[');
        content.write_u16_hex(secs as u16);
        content.write_u8(b']');
        content.write_bytes(b" Still alive");
        let content: Vec<u8> = content.finish();
        if self.tracker.originate_message(&content).is_some() {
            log::info!("life check queued");
        }
    }
}
