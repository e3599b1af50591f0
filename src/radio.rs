//! The seam between the connection manager and a BLE stack.
//!
//! Every operation is fire-and-check-later: calls only start work, and the
//! outcome comes back as a [`RadioEvent`] that the manager drains at the top
//! of each poll. Handlers therefore never run inside the BLE stack's own
//! callback context.

use std::fmt::Debug;

use heapless::{String, Vec};

/// Largest notification payload we accept (ATT MTU 247 minus the 3-byte header).
pub const MAX_NOTIFICATION: usize = 244;
pub const MAX_NAME: usize = 32;

/// Client Characteristic Configuration Descriptor.
pub const CCCD_UUID: u16 = 0x2902;

/// The service/characteristic pair a device family is reached through, as
/// 16-bit Bluetooth SIG short UUIDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GattProfile {
    pub tx_service: u16,
    pub tx_characteristic: u16,
    pub rx_service: u16,
    pub rx_characteristic: u16,
}

/// What discovery found on a connected peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Discovery {
    pub tx_found: bool,
    pub rx_found: bool,
    pub cccd_found: bool,
    pub can_notify: bool,
    pub can_indicate: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeMode {
    Notify,
    Indicate,
}

impl Discovery {
    pub fn subscribe_mode(&self) -> Option<SubscribeMode> {
        if self.can_notify {
            Some(SubscribeMode::Notify)
        } else if self.can_indicate {
            Some(SubscribeMode::Indicate)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioEvent<A> {
    ScanResult { name: String<MAX_NAME>, address: A },
    ScanEnded,
    Connected { address: A },
    ConnectFailed { address: A },
    Disconnected { address: A },
    /// `route` is the value passed to [`Radio::subscribe`]
    Notification { route: usize, data: Vec<u8, MAX_NOTIFICATION> },
}

impl<A> RadioEvent<A> {
    /// Build a scan result, truncating over-long names.
    pub fn scan_result(name: &str, address: A) -> Self {
        let mut bounded = String::new();
        for c in name.chars() {
            if bounded.push(c).is_err() {
                break;
            }
        }
        RadioEvent::ScanResult { name: bounded, address }
    }

    /// Build a notification event, or `None` if `data` exceeds [`MAX_NOTIFICATION`].
    pub fn notification(route: usize, data: &[u8]) -> Option<Self> {
        Vec::from_slice(data)
            .ok()
            .map(|data| RadioEvent::Notification { route, data })
    }
}

pub trait Radio {
    /// Peer identity, a MAC address or a platform device id.
    type Address: Clone + PartialEq + Debug;

    fn start_scan(&mut self) -> anyhow::Result<()>;
    fn stop_scan(&mut self) -> anyhow::Result<()>;
    fn is_scanning(&self) -> bool;

    /// Start connecting; `profile` lets the stack discover attributes as part of the connection.
    fn connect(&mut self, address: &Self::Address, profile: &GattProfile) -> anyhow::Result<()>;
    fn discover(&mut self, address: &Self::Address, profile: &GattProfile) -> anyhow::Result<Discovery>;
    fn subscribe(&mut self, address: &Self::Address, route: usize, mode: SubscribeMode) -> anyhow::Result<()>;
    fn write(&mut self, address: &Self::Address, data: &[u8], with_response: bool) -> anyhow::Result<()>;
    fn disconnect(&mut self, address: &Self::Address) -> anyhow::Result<()>;

    fn next_event(&mut self) -> Option<RadioEvent<Self::Address>>;
}

#[test]
fn test_subscribe_mode_prefers_notify() {
    let mut discovery = Discovery { can_notify: true, can_indicate: true, ..Default::default() };
    assert_eq!(discovery.subscribe_mode(), Some(SubscribeMode::Notify));
    discovery.can_notify = false;
    assert_eq!(discovery.subscribe_mode(), Some(SubscribeMode::Indicate));
    discovery.can_indicate = false;
    assert_eq!(discovery.subscribe_mode(), None);
}

#[test]
fn test_notification_bounds() {
    assert!(RadioEvent::<u8>::notification(0, &[0u8; MAX_NOTIFICATION]).is_some());
    assert!(RadioEvent::<u8>::notification(0, &[0u8; MAX_NOTIFICATION + 1]).is_none());
    match RadioEvent::scan_result(&"x".repeat(40), 1u8) {
        RadioEvent::ScanResult { name, .. } => assert_eq!(name.len(), MAX_NAME),
        other => panic!("unexpected {other:?}"),
    }
}
