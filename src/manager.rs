//! Keeps every registered device connected over one shared radio.
//!
//! The host calls [`ConnectionManager::poll`] on every loop iteration. Each
//! poll first drains the radio's events, then connects a device found by the
//! last scan, clears a radio wait that has timed out, runs the periodic health
//! check and finally sends the next due command. Only one connect or
//! command/response exchange is outstanding at any time, across all devices.
//!
//! A device that cannot be reached is counted by the health check, whether it
//! was never found or was found but failed to connect. After
//! [`Timing::max_retries`] misses it is left alone for
//! [`Timing::backoff_duration`].

use anyhow::bail;
use heapless::Vec;
use log::{debug, error, info, warn};

use crate::config::{DeviceConfig, Timing};
use crate::device::Device;
use crate::radio::{Radio, RadioEvent};
use crate::semaphore::{Semaphore, SemaphoreState};

pub const MAX_DEVICES: usize = 10;

/// Overall link state, for an online/offline indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkSummary {
    Off,
    Scanning,
    Partial,
    AllConnected,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    pub attempts: u32,
    pub backoff_until: Option<u64>,
}

impl RetryState {
    pub fn in_backoff(&self, now: u64) -> bool {
        matches!(self.backoff_until, Some(until) if now < until)
    }

    fn backoff_expired(&self, now: u64) -> bool {
        matches!(self.backoff_until, Some(until) if now >= until)
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

#[derive(Debug)]
struct Slot<A> {
    device: Device,
    address: Option<A>,
    retry: RetryState,
    last_attempt: Option<u64>,
}

pub struct ConnectionManager<R: Radio> {
    radio: R,
    /// Indexed by registration order; the index is also the notification route
    slots: Vec<Slot<R::Address>, MAX_DEVICES>,
    semaphore: Semaphore,
    timing: Timing,
    powered: bool,
    pending_connect: Option<usize>,
    next_to_poll: usize,
    last_health_check: u64,
    last_scan_restart: u64,
}

impl<R: Radio> ConnectionManager<R> {
    pub fn new(radio: R, timing: Timing) -> Self {
        Self {
            radio,
            slots: Vec::new(),
            semaphore: Semaphore::new(timing.response_timeout),
            timing,
            powered: false,
            pending_connect: None,
            next_to_poll: 0,
            last_health_check: 0,
            last_scan_restart: 0,
        }
    }

    /// Add a device to look for. Returns its index.
    pub fn register(&mut self, config: &DeviceConfig) -> anyhow::Result<usize> {
        if self.slots.iter().any(|slot| slot.device.name() == config.name) {
            bail!("{:?} is already registered", config.name);
        }
        let index = self.slots.len();
        let slot = Slot {
            device: Device::new(config, self.timing.stale_after),
            address: None,
            retry: RetryState::default(),
            last_attempt: None,
        };
        if self.slots.push(slot).is_err() {
            bail!("Cannot register {:?}: at most {MAX_DEVICES} devices", config.name);
        }
        info!("{}: registered as device {index} ({:?})", config.name, config.family);
        Ok(index)
    }

    /// Start scanning and the health-check clock.
    pub fn turn_on(&mut self, now: u64) {
        info!("starting BLE and scanning");
        self.powered = true;
        self.last_health_check = now;
        self.last_scan_restart = now;
        self.start_scan();
    }

    /// Stop scanning and drop every link.
    pub fn turn_off(&mut self) {
        info!("turning off BLE");
        self.powered = false;
        self.pending_connect = None;
        self.stop_scan();
        for index in 0..self.slots.len() {
            if self.slots[index].device.is_connected() {
                self.disconnect(index);
            }
        }
    }

    /// Return to the state of a fresh start.
    pub fn reset_stack(&mut self, now: u64) {
        info!("resetting BLE stack");
        self.semaphore.release();
        for slot in self.slots.iter_mut() {
            slot.device.reset_stale(now);
        }
        self.turn_off();
        for slot in self.slots.iter_mut() {
            slot.device.mark_disconnected();
            slot.address = None;
            slot.retry.reset();
            slot.last_attempt = None;
        }
        self.next_to_poll = 0;
        self.turn_on(now);
    }

    pub fn poll(&mut self, now: u64) {
        while let Some(event) = self.radio.next_event() {
            self.handle_event(event, now);
        }
        if !self.powered {
            return;
        }

        self.process_pending_connect(now);

        if self.semaphore.is_timed_out(now) {
            self.clear_timed_out_wait();
        }

        if now.saturating_sub(self.last_health_check) >= self.timing.health_check_interval {
            self.last_health_check = now;
            self.check_devices(now);
        }

        if self.pending_connect.is_none() {
            self.send_next_command(now);
        }
    }

    fn handle_event(&mut self, event: RadioEvent<R::Address>, now: u64) {
        match event {
            RadioEvent::ScanResult { name, address } => self.on_scan_result(&name, address, now),
            RadioEvent::ScanEnded => self.on_scan_ended(now),
            RadioEvent::Connected { address } => self.on_connected(&address, now),
            RadioEvent::ConnectFailed { address } => self.on_connect_failed(&address, now),
            RadioEvent::Disconnected { address } => self.on_disconnected(&address),
            RadioEvent::Notification { route, data } => self.on_notification(route, &data, now),
        }
    }

    /// Connect the device the scanner found, once the radio is free.
    fn process_pending_connect(&mut self, now: u64) {
        let Some(index) = self.pending_connect else {
            return;
        };
        if self.semaphore.is_busy() {
            return;
        }
        self.pending_connect = None;

        let slot = &mut self.slots[index];
        slot.last_attempt = Some(now);
        if let Some(address) = slot.address.clone() {
            let profile = slot.device.profile();
            if self.semaphore.acquire_for_connect(index, now) {
                info!("{}: connecting to {address:?}", slot.device.name());
                if let Err(e) = self.radio.connect(&address, &profile) {
                    error!("{}: failed to start connecting: {e:#}", slot.device.name());
                    self.semaphore.release_connection(index);
                }
            }
        }

        if self.needs_connecting(now, Some(index)) && !self.radio.is_scanning() {
            self.start_scan();
        }
    }

    fn clear_timed_out_wait(&mut self) {
        match self.semaphore.state() {
            SemaphoreState::AwaitingConnection { device } => {
                error!("{}: timed out waiting for connection", self.slots[device].device.name());
            }
            SemaphoreState::AwaitingResponse { device, tag } => {
                warn!(
                    "{}: response {tag:#06x} timed out, clearing the radio and moving on",
                    self.slots[device].device.name()
                );
            }
            SemaphoreState::Idle => {}
        }
        self.semaphore.release();
    }

    /// The periodic health check.
    ///
    /// Connected and current devices have their retry count cleared. Stale
    /// ones are disconnected without penalty, since they were reachable. Every
    /// other device not backing off counts one miss here, and only here.
    pub fn check_devices(&mut self, now: u64) {
        let mut needs_connecting = false;
        let mut stale: Vec<usize, MAX_DEVICES> = Vec::new();

        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.device.is_connected() {
                if !slot.device.is_current(now) {
                    warn!(
                        "{}: stale (connected but no data for {} ms), disconnecting",
                        slot.device.name(),
                        now.saturating_sub(slot.device.last_heard())
                    );
                    // Capacity matches the slot table
                    let _ = stale.push(index);
                    needs_connecting = true;
                }
                slot.retry.attempts = 0;
                continue;
            }

            if slot.retry.in_backoff(now) {
                continue;
            }
            if slot.retry.backoff_expired(now) {
                info!("{}: backoff expired, will retry", slot.device.name());
                slot.retry.reset();
                slot.last_attempt = None;
            }

            slot.retry.attempts += 1;
            if slot.retry.attempts >= self.timing.max_retries {
                slot.retry.backoff_until = Some(now + self.timing.backoff_duration);
                error!(
                    "{}: not connected after {} checks, backing off for {} s",
                    slot.device.name(),
                    slot.retry.attempts,
                    self.timing.backoff_duration / 1000
                );
            } else {
                warn!(
                    "{}: not connected, check {}/{}",
                    slot.device.name(),
                    slot.retry.attempts,
                    self.timing.max_retries
                );
                needs_connecting = true;
            }
        }

        for index in stale {
            self.disconnect(index);
        }
        if needs_connecting {
            self.ensure_scanning(now);
        }
    }

    /// Scan if not scanning, and restart a scan that has run for the reconnect interval.
    fn ensure_scanning(&mut self, now: u64) {
        if self.pending_connect.is_some() {
            return;
        }
        if !self.radio.is_scanning() {
            info!("not all devices connected, starting scan");
            self.start_scan();
            self.last_scan_restart = now;
        } else if now.saturating_sub(self.last_scan_restart) >= self.timing.reconnect_interval {
            info!("not all devices connected, restarting scan");
            self.stop_scan();
            self.start_scan();
            self.last_scan_restart = now;
        }
    }

    fn on_scan_result(&mut self, name: &str, address: R::Address, now: u64) {
        let mut matched = None;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.device.is_connected() || slot.device.name() != name {
                continue;
            }
            if slot.retry.in_backoff(now) {
                debug!("{name}: in backoff, skipping");
                continue;
            }
            if slot.retry.backoff_expired(now) {
                info!("{name}: backoff expired, retrying");
                slot.retry.reset();
            }
            if self.semaphore.state() == (SemaphoreState::AwaitingConnection { device: index }) {
                continue;
            }
            if let Some(at) = slot.last_attempt {
                if now.saturating_sub(at) < self.timing.connect_throttle {
                    debug!("{name}: throttled, skipping");
                    continue;
                }
            }
            matched = Some(index);
            break;
        }

        let Some(index) = matched else {
            return;
        };
        if let Some(pending) = self.pending_connect {
            debug!("{name}: found, but {} is waiting to connect", self.slots[pending].device.name());
            return;
        }
        info!("{name}: found at {address:?}, stopping scan");
        self.stop_scan();
        self.slots[index].address = Some(address);
        self.pending_connect = Some(index);
    }

    /// Restart a scan that ended by itself.
    fn on_scan_ended(&mut self, now: u64) {
        debug!("scan ended");
        if self.powered && self.pending_connect.is_none() && self.needs_connecting(now, None) {
            self.start_scan();
        }
    }

    /// Check the peer has what the device family needs, then subscribe.
    fn on_connected(&mut self, address: &R::Address, now: u64) {
        let Some(index) = self.index_of(address) else {
            warn!("connected to unknown peer {address:?}, disconnecting");
            if let Err(e) = self.radio.disconnect(address) {
                warn!("{address:?}: disconnect failed: {e:#}");
            }
            return;
        };
        if !self.powered {
            warn!("{}: connected while BLE is off, disconnecting", self.slots[index].device.name());
            self.semaphore.release_connection(index);
            if let Err(e) = self.radio.disconnect(address) {
                warn!("{}: disconnect failed: {e:#}, forgetting the link", self.slots[index].device.name());
                self.forget_link(index);
            }
            return;
        }
        let profile = self.slots[index].device.profile();

        let subscribed = self
            .radio
            .discover(address, &profile)
            .and_then(|discovery| {
                if !discovery.tx_found {
                    bail!("command characteristic {:04x} not discovered", profile.tx_characteristic);
                }
                if !discovery.rx_found {
                    bail!("response characteristic {:04x} not discovered", profile.rx_characteristic);
                }
                if !discovery.cccd_found {
                    bail!("response characteristic has no notification descriptor");
                }
                match discovery.subscribe_mode() {
                    Some(mode) => Ok(mode),
                    None => bail!("response characteristic cannot notify"),
                }
            })
            .and_then(|mode| self.radio.subscribe(address, index, mode));

        let slot = &mut self.slots[index];
        if let Err(e) = subscribed {
            error!("{}: {e:#}, disconnecting", slot.device.name());
            self.semaphore.release_connection(index);
            if let Err(e) = self.radio.disconnect(address) {
                warn!("{}: disconnect failed: {e:#}", slot.device.name());
            }
            return;
        }

        slot.device.mark_connected(now);
        slot.retry.reset();
        self.semaphore.release_connection(index);
        info!("{}: connected and subscribed", slot.device.name());

        if self.all_devices_connected() {
            info!("all devices connected, stopping scan");
            self.stop_scan();
        } else if self.powered && !self.radio.is_scanning() {
            self.start_scan();
        }
    }

    fn on_connect_failed(&mut self, address: &R::Address, now: u64) {
        let Some(index) = self.index_of(address) else {
            return;
        };
        error!("{}: connection failed", self.slots[index].device.name());
        self.slots[index].address = None;
        self.semaphore.release_connection(index);
        if self.powered && self.needs_connecting(now, None) && !self.radio.is_scanning() {
            self.start_scan();
        }
    }

    fn on_disconnected(&mut self, address: &R::Address) {
        match self.index_of(address) {
            Some(index) => {
                info!("{}: disconnected", self.slots[index].device.name());
                self.forget_link(index);
            }
            None => debug!("disconnect from unknown peer {address:?}"),
        }
    }

    fn forget_link(&mut self, index: usize) {
        let slot = &mut self.slots[index];
        slot.device.mark_disconnected();
        slot.address = None;
        self.semaphore.release_if_held_by(index);
        if self.pending_connect == Some(index) {
            self.pending_connect = None;
        }
    }

    fn on_notification(&mut self, route: usize, data: &[u8], now: u64) {
        let Some(slot) = self.slots.get_mut(route) else {
            warn!("notification for unregistered route {route}");
            return;
        };
        if !slot.device.is_connected() {
            debug!("{}: ignoring notification while not connected", slot.device.name());
            return;
        }

        let outcome = slot.device.on_notification(data, now);

        if let Some(address) = slot.address.as_ref() {
            for ack in outcome.acks.iter() {
                if let Err(e) = self.radio.write(address, ack, true) {
                    warn!("{}: acknowledgement failed: {e:#}", slot.device.name());
                }
            }
        }
        if let Some(tag) = outcome.completed {
            if !self.semaphore.release_response(route, tag) {
                debug!("{}: response {tag:#06x} arrived after its wait was cleared", slot.device.name());
            }
        }
    }

    /// Send one command, starting the search after the device that sent last.
    fn send_next_command(&mut self, now: u64) {
        if self.semaphore.is_busy() || self.slots.is_empty() {
            return;
        }
        let count = self.slots.len();
        for step in 0..count {
            let index = (self.next_to_poll + step) % count;
            let slot = &mut self.slots[index];
            let Some(address) = slot.address.as_ref() else {
                continue;
            };
            let Some(command) = slot.device.next_command(now, self.timing.command_interval) else {
                continue;
            };
            self.next_to_poll = (index + 1) % count;
            if !self.semaphore.acquire_for_command(index, command.tag, now) {
                return;
            }
            if let Err(e) = self.radio.write(address, &command.bytes, command.with_response) {
                warn!("{}: command write failed: {e:#}", slot.device.name());
                self.semaphore.release();
            }
            return;
        }
    }

    fn needs_connecting(&self, now: u64, except: Option<usize>) -> bool {
        self.slots.iter().enumerate().any(|(index, slot)| {
            Some(index) != except && !slot.device.is_connected() && !slot.retry.in_backoff(now)
        })
    }

    fn index_of(&self, address: &R::Address) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.address.as_ref() == Some(address))
    }

    fn start_scan(&mut self) {
        if let Err(e) = self.radio.start_scan() {
            error!("failed to start scan: {e:#}");
        }
    }

    fn stop_scan(&mut self) {
        if let Err(e) = self.radio.stop_scan() {
            warn!("failed to stop scan: {e:#}");
        }
    }

    /// Ask the radio to drop the link. State is cleared when the disconnect is reported.
    pub fn disconnect(&mut self, index: usize) {
        let Some(address) = self.slots.get(index).and_then(|slot| slot.address.clone()) else {
            return;
        };
        info!("{}: disconnecting", self.slots[index].device.name());
        if let Err(e) = self.radio.disconnect(&address) {
            warn!("{}: disconnect failed: {e:#}, forgetting the link", self.slots[index].device.name());
            self.forget_link(index);
        }
    }

    pub fn reset_stale(&mut self, index: usize, now: u64) {
        if let Some(slot) = self.slots.get_mut(index) {
            slot.device.reset_stale(now);
        }
    }

    pub fn device(&self, index: usize) -> Option<&Device> {
        self.slots.get(index).map(|slot| &slot.device)
    }

    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.slots.iter().map(|slot| &slot.device)
    }

    pub fn device_count(&self) -> usize {
        self.slots.len()
    }

    pub fn is_connected(&self, index: usize) -> bool {
        self.device(index).is_some_and(Device::is_connected)
    }

    pub fn is_current(&self, index: usize, now: u64) -> bool {
        self.device(index).is_some_and(|device| device.is_current(now))
    }

    pub fn is_device_in_backoff(&self, index: usize, now: u64) -> bool {
        self.slots
            .get(index)
            .is_some_and(|slot| slot.retry.in_backoff(now))
    }

    pub fn retry_state(&self, index: usize) -> Option<RetryState> {
        self.slots.get(index).map(|slot| slot.retry)
    }

    pub fn all_devices_connected(&self) -> bool {
        self.slots.iter().all(|slot| slot.device.is_connected())
    }

    pub fn link_summary(&self) -> LinkSummary {
        if !self.powered {
            LinkSummary::Off
        } else if self.all_devices_connected() {
            LinkSummary::AllConnected
        } else if self.slots.iter().any(|slot| slot.device.is_connected()) {
            LinkSummary::Partial
        } else {
            LinkSummary::Scanning
        }
    }

    pub fn semaphore_state(&self) -> SemaphoreState {
        self.semaphore.state()
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    pub fn radio_mut(&mut self) -> &mut R {
        &mut self.radio
    }
}

#[cfg(test)]
use crate::config::{DEFAULT_RENOGY_NAME, DEFAULT_SOK_NAMES};
#[cfg(test)]
use crate::device::renogy_controller::response_frame;
#[cfg(test)]
use crate::test_radio::{Call, TestRadio};

#[cfg(test)]
const RENOGY: [u8; 6] = [0xc4, 0x5a, 0x00, 0x00, 0x00, 0x01];
#[cfg(test)]
const SOK_1: [u8; 6] = [0xc4, 0x5a, 0x00, 0x00, 0x00, 0x02];
#[cfg(test)]
const SOK_2: [u8; 6] = [0xc4, 0x5a, 0x00, 0x00, 0x00, 0x03];
#[cfg(test)]
const SOK_BASE: &str = "ccf0a0330018fcff000000409c0017002a";
#[cfg(test)]
const SOK_HEATING: &str = "ccf3000000000000010000";

#[cfg(test)]
fn manager_for(names: &[&str]) -> ConnectionManager<TestRadio> {
    let mut manager = ConnectionManager::new(TestRadio::new(), Timing::default());
    for name in names {
        manager.register(&DeviceConfig::new(name).unwrap()).unwrap();
    }
    manager.turn_on(0);
    manager
}

#[cfg(test)]
fn default_manager() -> ConnectionManager<TestRadio> {
    manager_for(&[DEFAULT_RENOGY_NAME, DEFAULT_SOK_NAMES[0], DEFAULT_SOK_NAMES[1]])
}

/// Connects all three defaults at t=0. Leaves the controller's startup read in flight.
#[cfg(test)]
fn connect_all(manager: &mut ConnectionManager<TestRadio>) {
    manager.radio_mut().advertise(DEFAULT_RENOGY_NAME, RENOGY);
    manager.poll(0);
    manager.radio_mut().advertise(DEFAULT_SOK_NAMES[0], SOK_1);
    manager.poll(0);
    manager.radio_mut().advertise(DEFAULT_SOK_NAMES[1], SOK_2);
    manager.poll(0);
    manager.poll(0);
}

#[test]
fn test_register_limits() {
    let mut manager = ConnectionManager::new(TestRadio::new(), Timing::default());
    for i in 0..MAX_DEVICES {
        let name = format!("SOK-AA{i:05}");
        assert_eq!(manager.register(&DeviceConfig::new(&name).unwrap()).unwrap(), i);
    }
    assert!(manager.register(&DeviceConfig::new("SOK-AA99999").unwrap()).is_err());

    let mut manager = ConnectionManager::new(TestRadio::new(), Timing::default());
    manager.register(&DeviceConfig::new("SOK-AA12487").unwrap()).unwrap();
    assert!(manager.register(&DeviceConfig::new("SOK-AA12487").unwrap()).is_err());
}

#[test]
fn test_scan_connect_subscribe() {
    let mut manager = default_manager();
    assert!(manager.radio().scanning);
    assert_eq!(manager.link_summary(), LinkSummary::Scanning);

    manager.radio_mut().advertise("Fridge", [9; 6]);
    manager.radio_mut().advertise(DEFAULT_RENOGY_NAME, RENOGY);
    manager.poll(0);
    assert_eq!(manager.radio().connects(), 1);
    assert_eq!(manager.semaphore_state(), SemaphoreState::AwaitingConnection { device: 0 });
    // Still two batteries to find
    assert!(manager.radio().scanning);

    manager.poll(10);
    assert!(manager.is_connected(0));
    assert_eq!(manager.link_summary(), LinkSummary::Partial);
    assert_eq!(
        manager.radio().count(&Call::Subscribe(RENOGY, 0, crate::radio::SubscribeMode::Notify)),
        1
    );
    // First command goes out once the connection is up
    assert_eq!(
        manager.semaphore_state(),
        SemaphoreState::AwaitingResponse { device: 0, tag: 0x000A }
    );
    assert_eq!(manager.radio().writes_to(RENOGY), vec![hex::decode("ff03000a0011b01a").unwrap()]);
}

#[test]
fn test_all_connected_stops_scanning() {
    let mut manager = default_manager();
    connect_all(&mut manager);
    assert!(manager.all_devices_connected());
    assert_eq!(manager.link_summary(), LinkSummary::AllConnected);
    assert!(!manager.radio().scanning);
    assert_eq!(manager.radio().connects(), 3);
}

#[test]
fn test_missing_descriptor_disconnects_without_penalty() {
    let mut manager = manager_for(&[DEFAULT_SOK_NAMES[0]]);
    manager.radio_mut().discoveries.insert(
        SOK_1,
        crate::radio::Discovery { tx_found: true, rx_found: true, can_notify: true, ..Default::default() },
    );
    manager.radio_mut().advertise(DEFAULT_SOK_NAMES[0], SOK_1);
    manager.poll(0);
    manager.poll(10);
    assert_eq!(manager.radio().count(&Call::Disconnect(SOK_1)), 1);
    assert!(!manager.is_connected(0));
    assert_eq!(manager.semaphore_state(), SemaphoreState::Idle);
    assert_eq!(manager.retry_state(0).unwrap().attempts, 0);

    manager.poll(20);
    assert_eq!(manager.index_of(&SOK_1), None);
}

#[test]
fn test_subscribe_failure_disconnects() {
    let mut manager = manager_for(&[DEFAULT_SOK_NAMES[0]]);
    manager.radio_mut().fail_subscribe = true;
    manager.radio_mut().advertise(DEFAULT_SOK_NAMES[0], SOK_1);
    manager.poll(0);
    manager.poll(10);
    assert!(!manager.is_connected(0));
    assert_eq!(manager.radio().count(&Call::Disconnect(SOK_1)), 1);
}

#[test]
fn test_never_advertising_device_backs_off() {
    let mut manager = manager_for(&[DEFAULT_SOK_NAMES[0]]);
    for check in 1..=4u64 {
        manager.poll(check * 30_000);
        assert_eq!(manager.retry_state(0).unwrap().attempts, check as u32);
        assert!(!manager.is_device_in_backoff(0, check * 30_000));
    }
    manager.poll(150_000);
    assert_eq!(manager.retry_state(0).unwrap().attempts, 5);
    assert!(manager.is_device_in_backoff(0, 150_000));

    // Ignored by the scanner and the health check while backing off
    manager.radio_mut().advertise(DEFAULT_SOK_NAMES[0], SOK_1);
    manager.poll(180_000);
    assert_eq!(manager.radio().connects(), 0);
    assert_eq!(manager.retry_state(0).unwrap().attempts, 5);
    manager.poll(1_949_999);
    assert!(manager.is_device_in_backoff(0, 1_949_999));
    assert!(!manager.is_device_in_backoff(0, 1_950_000));

    manager.radio_mut().scanning = false;
    manager.poll(1_980_000);
    let retry = manager.retry_state(0).unwrap();
    assert_eq!(retry.backoff_until, None);
    assert_eq!(retry.attempts, 1);
    assert!(manager.radio().scanning);
}

#[test]
fn test_scan_match_clears_expired_backoff() {
    let mut manager = manager_for(&[DEFAULT_SOK_NAMES[0]]);
    manager.slots[0].retry = RetryState { attempts: 5, backoff_until: Some(1_000) };
    manager.radio_mut().advertise(DEFAULT_SOK_NAMES[0], SOK_1);
    manager.poll(500);
    assert_eq!(manager.radio().connects(), 0);

    manager.radio_mut().advertise(DEFAULT_SOK_NAMES[0], SOK_1);
    manager.poll(1_000);
    assert_eq!(manager.radio().connects(), 1);
    manager.poll(1_010);
    assert!(manager.is_connected(0));
    assert_eq!(manager.retry_state(0).unwrap(), RetryState::default());
}

#[test]
fn test_stale_device_is_disconnected_without_penalty() {
    let mut manager = default_manager();
    connect_all(&mut manager);
    for t in [30_000, 60_000, 90_000] {
        manager.poll(t);
        assert!(manager.is_connected(0));
    }
    assert!(manager.is_current(0, 119_999));
    assert!(!manager.is_current(0, 120_000));
    assert!(manager.is_connected(0));

    manager.slots[0].retry.attempts = 3;
    manager.poll(120_000);
    assert_eq!(manager.retry_state(0).unwrap().attempts, 0);
    assert_eq!(manager.radio().count(&Call::Disconnect(RENOGY)), 1);
    assert!(manager.radio().scanning);

    manager.poll(120_010);
    assert!(!manager.is_connected(0));
    assert_eq!(manager.link_summary(), LinkSummary::Scanning);
}

#[test]
fn test_response_timeout_frees_radio_for_next_device() {
    let mut manager = default_manager();
    connect_all(&mut manager);
    assert_eq!(manager.semaphore_state(), SemaphoreState::AwaitingResponse { device: 0, tag: 0x000A });

    manager.poll(14_999);
    assert_eq!(manager.semaphore_state(), SemaphoreState::AwaitingResponse { device: 0, tag: 0x000A });

    manager.poll(15_000);
    assert_eq!(manager.semaphore_state(), SemaphoreState::AwaitingResponse { device: 1, tag: 0xF0CC });
    manager.poll(15_001);
    assert_eq!(manager.semaphore_state(), SemaphoreState::AwaitingResponse { device: 1, tag: 0xF0CC });
    assert!(manager.is_connected(0));
}

#[test]
fn test_commands_round_robin() {
    let mut manager = default_manager();
    connect_all(&mut manager);

    let startup = response_frame(&[0u16; 17]);
    manager.radio_mut().notify(0, &startup);
    manager.poll(100);
    // Two 20-byte fragments, two acknowledgements
    let renogy_writes = manager.radio().writes_to(RENOGY);
    assert_eq!(renogy_writes.len(), 3);
    assert_eq!(&renogy_writes[1][..], b"main recv data[ff] [");
    assert_eq!(manager.semaphore_state(), SemaphoreState::AwaitingResponse { device: 1, tag: 0xF0CC });

    let base = hex::decode(SOK_BASE).unwrap();
    let heating = hex::decode(SOK_HEATING).unwrap();
    manager.radio_mut().notify(1, &heating);
    manager.poll(150);
    assert_eq!(manager.semaphore_state(), SemaphoreState::AwaitingResponse { device: 1, tag: 0xF0CC });
    manager.radio_mut().notify(1, &base);
    manager.poll(200);
    assert_eq!(manager.semaphore_state(), SemaphoreState::AwaitingResponse { device: 2, tag: 0xF0CC });
    let battery = manager.device(1).unwrap().as_sok().unwrap();
    assert_eq!(battery.soc(), 42);
    assert!(battery.is_heating());

    manager.radio_mut().notify(2, &base);
    manager.radio_mut().notify(2, &heating);
    manager.poll(300);
    // Nobody is due again yet
    assert_eq!(manager.semaphore_state(), SemaphoreState::Idle);

    manager.poll(2_000);
    assert_eq!(manager.semaphore_state(), SemaphoreState::AwaitingResponse { device: 0, tag: 0xE002 });
    assert_eq!(manager.radio().writes_to(SOK_1), vec![hex::decode("eec200000046").unwrap()]);
}

#[test]
fn test_bad_frame_holds_radio_until_timeout() {
    let mut manager = default_manager();
    connect_all(&mut manager);
    let mut startup = response_frame(&[0u16; 17]);
    startup[10] ^= 0x01;
    manager.radio_mut().notify(0, &startup);
    manager.poll(100);
    assert_eq!(manager.semaphore_state(), SemaphoreState::AwaitingResponse { device: 0, tag: 0x000A });
    assert_eq!(manager.radio().writes_to(RENOGY).len(), 1);
    assert!(manager.is_connected(0));
}

#[test]
fn test_pending_connect_waits_for_radio() {
    let mut manager = manager_for(&[DEFAULT_RENOGY_NAME, DEFAULT_SOK_NAMES[0]]);
    manager.radio_mut().advertise(DEFAULT_RENOGY_NAME, RENOGY);
    manager.poll(0);
    manager.poll(0);
    assert_eq!(manager.semaphore_state(), SemaphoreState::AwaitingResponse { device: 0, tag: 0x000A });

    manager.radio_mut().advertise(DEFAULT_SOK_NAMES[0], SOK_1);
    manager.poll(100);
    assert_eq!(manager.radio().connects(), 1);
    assert_eq!(manager.pending_connect, Some(1));

    manager.radio_mut().notify(0, &response_frame(&[0u16; 17]));
    manager.poll(200);
    assert_eq!(manager.radio().connects(), 2);
    assert_eq!(manager.pending_connect, None);
    assert_eq!(manager.semaphore_state(), SemaphoreState::AwaitingConnection { device: 1 });
}

#[test]
fn test_connect_throttle() {
    let mut manager = manager_for(&[DEFAULT_SOK_NAMES[0]]);
    manager.radio_mut().complete_connects = false;
    manager.radio_mut().advertise(DEFAULT_SOK_NAMES[0], SOK_1);
    manager.poll(10_000);
    assert_eq!(manager.radio().connects(), 1);

    manager.radio_mut().events.push_back(RadioEvent::ConnectFailed { address: SOK_1 });
    manager.poll(10_500);
    assert_eq!(manager.semaphore_state(), SemaphoreState::Idle);
    assert!(manager.radio().scanning);
    // A failed connect is left for the health check to count
    assert_eq!(manager.retry_state(0).unwrap().attempts, 0);

    manager.radio_mut().advertise(DEFAULT_SOK_NAMES[0], SOK_1);
    manager.poll(11_999);
    assert_eq!(manager.radio().connects(), 1);

    manager.radio_mut().advertise(DEFAULT_SOK_NAMES[0], SOK_1);
    manager.poll(12_000);
    assert_eq!(manager.radio().connects(), 2);
}

#[test]
fn test_disconnect_releases_only_own_wait() {
    let mut manager = default_manager();
    connect_all(&mut manager);

    manager.radio_mut().drop_link(SOK_1);
    manager.poll(10);
    assert!(!manager.is_connected(1));
    assert_eq!(manager.semaphore_state(), SemaphoreState::AwaitingResponse { device: 0, tag: 0x000A });

    manager.radio_mut().drop_link(RENOGY);
    manager.poll(20);
    assert!(!manager.is_connected(0));
    assert_eq!(manager.semaphore_state(), SemaphoreState::AwaitingResponse { device: 2, tag: 0xF0CC });

    // The controller starts its command sequence over after reconnecting
    manager.radio_mut().advertise(DEFAULT_RENOGY_NAME, RENOGY);
    manager.poll(5_000);
    manager.radio_mut().notify(2, &hex::decode(SOK_BASE).unwrap());
    manager.radio_mut().notify(2, &hex::decode(SOK_HEATING).unwrap());
    manager.poll(5_010);
    manager.poll(5_020);
    assert!(manager.is_connected(0));
    assert_eq!(manager.semaphore_state(), SemaphoreState::AwaitingResponse { device: 0, tag: 0x000A });
}

#[test]
fn test_scan_end_restarts_scan() {
    let mut manager = manager_for(&[DEFAULT_SOK_NAMES[0]]);
    assert_eq!(manager.radio().count(&Call::StartScan), 1);
    manager.radio_mut().scanning = false;
    manager.radio_mut().events.push_back(RadioEvent::ScanEnded);
    manager.poll(10);
    assert_eq!(manager.radio().count(&Call::StartScan), 2);

    // Not while a connect is pending
    let mut manager = manager_for(&[DEFAULT_SOK_NAMES[0]]);
    manager.radio_mut().complete_connects = false;
    manager.radio_mut().advertise(DEFAULT_SOK_NAMES[0], SOK_1);
    manager.radio_mut().events.push_back(RadioEvent::ScanEnded);
    manager.poll(10);
    assert_eq!(manager.radio().count(&Call::StartScan), 1);
}

#[test]
fn test_turn_off_and_on() {
    let mut manager = default_manager();
    connect_all(&mut manager);
    manager.turn_off();
    for address in [RENOGY, SOK_1, SOK_2] {
        assert_eq!(manager.radio().count(&Call::Disconnect(address)), 1);
    }
    manager.poll(100);
    assert_eq!(manager.link_summary(), LinkSummary::Off);
    assert_eq!(manager.semaphore_state(), SemaphoreState::Idle);

    // No health check or scanning while off
    manager.poll(300_000);
    assert!(!manager.radio().scanning);
    assert_eq!(manager.retry_state(0).unwrap().attempts, 0);

    manager.turn_on(300_000);
    assert!(manager.radio().scanning);
    assert_eq!(manager.link_summary(), LinkSummary::Scanning);
}

#[test]
fn test_reset_stack() {
    let mut manager = default_manager();
    connect_all(&mut manager);
    manager.slots[2].retry.attempts = 2;

    manager.reset_stack(50_000);
    assert_eq!(manager.semaphore_state(), SemaphoreState::Idle);
    assert_eq!(manager.link_summary(), LinkSummary::Scanning);
    assert!(manager.radio().scanning);
    for index in 0..3 {
        assert!(!manager.is_connected(index));
        assert!(manager.is_current(index, 50_000));
        assert_eq!(manager.retry_state(index).unwrap(), RetryState::default());
    }

    manager.radio_mut().advertise(DEFAULT_RENOGY_NAME, RENOGY);
    manager.poll(50_010);
    manager.poll(50_020);
    assert!(manager.is_connected(0));
    assert_eq!(manager.semaphore_state(), SemaphoreState::AwaitingResponse { device: 0, tag: 0x000A });
}

#[test]
fn test_connect_completing_after_reset_is_dropped() {
    let mut manager = manager_for(&[DEFAULT_SOK_NAMES[0]]);
    manager.radio_mut().complete_connects = false;
    manager.radio_mut().advertise(DEFAULT_SOK_NAMES[0], SOK_1);
    manager.poll(10_000);
    assert_eq!(manager.semaphore_state(), SemaphoreState::AwaitingConnection { device: 0 });

    manager.reset_stack(10_100);
    manager.radio_mut().events.push_back(RadioEvent::Connected { address: SOK_1 });
    manager.poll(10_200);
    assert_eq!(manager.radio().count(&Call::Disconnect(SOK_1)), 1);
    assert!(!manager.is_connected(0));
    assert_eq!(manager.semaphore_state(), SemaphoreState::Idle);
}

#[test]
fn test_connect_completing_while_off_is_dropped() {
    let mut manager = manager_for(&[DEFAULT_SOK_NAMES[0]]);
    manager.radio_mut().complete_connects = false;
    manager.radio_mut().advertise(DEFAULT_SOK_NAMES[0], SOK_1);
    manager.poll(10_000);
    manager.turn_off();
    assert_eq!(manager.radio().count(&Call::Disconnect(SOK_1)), 0);

    manager.radio_mut().events.push_back(RadioEvent::Connected { address: SOK_1 });
    manager.poll(10_100);
    assert_eq!(manager.radio().count(&Call::Disconnect(SOK_1)), 1);
    assert!(!manager.radio().calls.iter().any(|call| matches!(call, Call::Subscribe(..))));
    assert!(!manager.is_connected(0));
    assert_eq!(manager.link_summary(), LinkSummary::Off);
    assert_eq!(manager.semaphore_state(), SemaphoreState::Idle);
}

#[test]
fn test_failed_command_write_frees_radio() {
    let mut manager = manager_for(&[DEFAULT_SOK_NAMES[0]]);
    manager.radio_mut().fail_writes = true;
    manager.radio_mut().advertise(DEFAULT_SOK_NAMES[0], SOK_1);
    manager.poll(0);
    manager.poll(10);
    assert!(manager.is_connected(0));
    assert_eq!(manager.radio().writes_to(SOK_1).len(), 1);
    assert_eq!(manager.semaphore_state(), SemaphoreState::Idle);

    // Tried again once the device is due
    manager.radio_mut().fail_writes = false;
    manager.poll(2_010);
    assert_eq!(manager.radio().writes_to(SOK_1).len(), 2);
    assert_eq!(manager.semaphore_state(), SemaphoreState::AwaitingResponse { device: 0, tag: 0xF0CC });
}

#[test]
fn test_failed_acknowledgement_still_completes_frame() {
    let mut manager = default_manager();
    connect_all(&mut manager);
    manager.radio_mut().fail_writes = true;
    manager.radio_mut().notify(0, &response_frame(&[0u16; 17]));
    manager.poll(100);

    let renogy_writes = manager.radio().writes_to(RENOGY);
    assert_eq!(renogy_writes.len(), 3);
    assert_eq!(&renogy_writes[2][..], b"main recv data[00] [");
    assert!(manager.is_connected(0));
    assert_eq!(manager.device(0).unwrap().last_heard(), 100);
    // The battery's command write failed as well, so nothing is held
    assert_eq!(manager.radio().writes_to(SOK_1).len(), 1);
    assert_eq!(manager.semaphore_state(), SemaphoreState::Idle);
}

#[test]
fn test_reset_stale_keeps_device_connected() {
    let mut manager = default_manager();
    connect_all(&mut manager);
    for t in [30_000, 60_000, 90_000] {
        manager.poll(t);
    }
    manager.reset_stale(0, 100_000);
    manager.reset_stale(7, 100_000);
    manager.poll(120_000);
    assert_eq!(manager.radio().count(&Call::Disconnect(RENOGY)), 0);
    assert_eq!(manager.radio().count(&Call::Disconnect(SOK_1)), 1);
    assert!(manager.is_current(0, 219_999));
    assert!(!manager.is_current(0, 220_000));
}

#[test]
fn test_operator_disconnect_then_reconnect() {
    let mut manager = manager_for(&[DEFAULT_SOK_NAMES[0]]);
    manager.radio_mut().advertise(DEFAULT_SOK_NAMES[0], SOK_1);
    manager.poll(0);
    manager.poll(10);
    assert!(manager.is_connected(0));
    assert!(!manager.radio().scanning);

    manager.disconnect(0);
    manager.poll(20);
    assert_eq!(manager.radio().count(&Call::Disconnect(SOK_1)), 1);
    assert!(!manager.is_connected(0));
    assert_eq!(manager.semaphore_state(), SemaphoreState::Idle);

    manager.poll(30_000);
    assert!(manager.radio().scanning);
    manager.radio_mut().advertise(DEFAULT_SOK_NAMES[0], SOK_1);
    manager.poll(30_010);
    manager.poll(30_020);
    assert!(manager.is_connected(0));
    assert_eq!(manager.radio().connects(), 2);
    assert_eq!(manager.retry_state(0).unwrap(), RetryState::default());
}
