//! The two device families, behind one tagged enum so the connection manager
//! can stay family-agnostic.

pub mod renogy_controller;
pub mod sok_battery;

use heapless::Vec;

use crate::config::{DeviceConfig, DeviceFamily};
use crate::radio::GattProfile;

pub use renogy_controller::RenogyController;
pub use sok_battery::SokBattery;

pub const MAX_COMMAND: usize = 8;
/// Length of one acknowledgement written back to the Renogy BT-2 bridge.
pub const ACK_LEN: usize = 20;
pub const MAX_ACKS: usize = crate::accumulator::DEFAULT_CAPACITY.div_ceil(ACK_LEN);

/// A request ready to be written to the device's command characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub bytes: Vec<u8, MAX_COMMAND>,
    /// What the response must carry for the radio to be released
    pub tag: u16,
    pub with_response: bool,
}

/// What handling one notification fragment produced.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct NotifyOutcome {
    /// Set once the response tagged with this value is fully in
    pub completed: Option<u16>,
    /// Writes the device needs before it will accept another command
    pub acks: Vec<[u8; ACK_LEN], MAX_ACKS>,
}

/// Connection and freshness bookkeeping shared by both families.
#[derive(Debug)]
pub(crate) struct LinkState {
    pub name: String,
    pub connected: bool,
    pub last_heard: u64,
    pub last_command_at: Option<u64>,
    pub stale_after: u64,
}

impl LinkState {
    pub fn new(name: &str, stale_after: u64) -> Self {
        Self {
            name: name.to_string(),
            connected: false,
            last_heard: 0,
            last_command_at: None,
            stale_after,
        }
    }

    pub fn is_current(&self, now: u64) -> bool {
        now.saturating_sub(self.last_heard) < self.stale_after
    }

    /// True if a command may be sent now, given the minimum spacing.
    pub fn command_due(&self, now: u64, interval: u64) -> bool {
        self.connected
            && self
                .last_command_at
                .map_or(true, |at| now.saturating_sub(at) >= interval)
    }
}

#[derive(Debug)]
pub enum Device {
    Renogy(RenogyController),
    Sok(SokBattery),
}

impl Device {
    pub fn new(config: &DeviceConfig, stale_after: u64) -> Self {
        match config.family {
            DeviceFamily::RenogyController => Device::Renogy(RenogyController::new(&config.name, stale_after)),
            DeviceFamily::SokBattery => Device::Sok(SokBattery::new(&config.name, stale_after)),
        }
    }

    fn link(&self) -> &LinkState {
        match self {
            Device::Renogy(d) => &d.link,
            Device::Sok(d) => &d.link,
        }
    }

    fn link_mut(&mut self) -> &mut LinkState {
        match self {
            Device::Renogy(d) => &mut d.link,
            Device::Sok(d) => &mut d.link,
        }
    }

    pub fn name(&self) -> &str {
        &self.link().name
    }

    pub fn family(&self) -> DeviceFamily {
        match self {
            Device::Renogy(_) => DeviceFamily::RenogyController,
            Device::Sok(_) => DeviceFamily::SokBattery,
        }
    }

    pub fn profile(&self) -> GattProfile {
        match self {
            Device::Renogy(_) => RenogyController::PROFILE,
            Device::Sok(_) => SokBattery::PROFILE,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.link().connected
    }

    /// Subscribed and ready for commands. Starts the staleness window afresh.
    pub fn mark_connected(&mut self, now: u64) {
        let link = self.link_mut();
        link.connected = true;
        link.last_heard = now;
        link.last_command_at = None;
    }

    /// Forget the link and restart the family's command sequence.
    pub fn mark_disconnected(&mut self) {
        match self {
            Device::Renogy(d) => d.mark_disconnected(),
            Device::Sok(d) => d.mark_disconnected(),
        }
    }

    /// A valid frame arrived within the staleness window.
    pub fn is_current(&self, now: u64) -> bool {
        self.link().is_current(now)
    }

    pub fn last_heard(&self) -> u64 {
        self.link().last_heard
    }

    pub fn reset_stale(&mut self, now: u64) {
        self.link_mut().last_heard = now;
    }

    /// The next command if one is due, advancing the family's command sequence.
    pub fn next_command(&mut self, now: u64, interval: u64) -> Option<Command> {
        match self {
            Device::Renogy(d) => d.next_command(now, interval),
            Device::Sok(d) => d.next_command(now, interval),
        }
    }

    pub fn on_notification(&mut self, chunk: &[u8], now: u64) -> NotifyOutcome {
        match self {
            Device::Renogy(d) => d.on_notification(chunk, now),
            Device::Sok(d) => d.on_notification(chunk, now),
        }
    }

    pub fn as_renogy(&self) -> Option<&RenogyController> {
        match self {
            Device::Renogy(d) => Some(d),
            Device::Sok(_) => None,
        }
    }

    pub fn as_sok(&self) -> Option<&SokBattery> {
        match self {
            Device::Sok(d) => Some(d),
            Device::Renogy(_) => None,
        }
    }
}

#[test]
fn test_link_state_freshness() {
    let mut link = LinkState::new("SOK-AA12487", 120_000);
    link.last_heard = 1_000;
    assert!(link.is_current(120_999));
    assert!(!link.is_current(121_000));
}

#[test]
fn test_command_due() {
    let mut link = LinkState::new("SOK-AA12487", 120_000);
    assert!(!link.command_due(0, 2_000));
    link.connected = true;
    assert!(link.command_due(0, 2_000));
    link.last_command_at = Some(10_000);
    assert!(!link.command_due(11_999, 2_000));
    assert!(link.command_due(12_000, 2_000));
}

#[test]
fn test_device_dispatch_on_config() {
    let renogy = Device::new(&DeviceConfig::new("BT-TH-66F94E1C    ").unwrap(), 120_000);
    let sok = Device::new(&DeviceConfig::new("SOK-AA12487").unwrap(), 120_000);
    assert!(renogy.as_renogy().is_some());
    assert!(sok.as_sok().is_some());
    assert_eq!(renogy.profile().tx_service, 0xffd0);
    assert_eq!(sok.profile().rx_characteristic, 0xffe1);
    assert_eq!(sok.name(), "SOK-AA12487");
}
