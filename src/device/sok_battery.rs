//! SOK LiFePO4 batteries with the built-in Bluetooth BMS.
//!
//! The BMS speaks a small proprietary protocol: a 6-byte command selects
//! which packets come back, and each packet arrives as one notification
//! identified by its 2-byte marker. Multi-byte fields are little endian.
//!
//! Marker | Sent for | Contents
//! -------|----------|------------------------------------------------
//! CC F0  | C1, C2   | voltage, current, remaining capacity, cycles, SOC
//! CC F2  | C1       | charge/discharge MOSFET flags, temperatures
//! CC F3  | C2       | heater flag
//! CC F9  | C4       | protection flags

use heapless::Vec;
use log::{debug, warn};

use super::{Command, LinkState, NotifyOutcome};
use crate::radio::GattProfile;

const REQ_BASE_AND_MOSFETS: [u8; 6] = [0xee, 0xc1, 0x00, 0x00, 0x00, 0xce];
const REQ_BASE_AND_HEATING: [u8; 6] = [0xee, 0xc2, 0x00, 0x00, 0x00, 0x46];
const REQ_PROTECTION: [u8; 6] = [0xee, 0xc4, 0x00, 0x00, 0x00, 0x4f];

pub const BASE_MARKER: u16 = 0xF0CC;
pub const MOSFET_MARKER: u16 = 0xF2CC;
pub const HEATING_MARKER: u16 = 0xF3CC;
pub const PROTECTION_MARKER: u16 = 0xF9CC;

/// Every this many commands the protection flags are read instead.
pub const PROTECTION_EVERY: u32 = 50;

const BASE_PACKET_LEN: usize = 17;
const MOSFET_PACKET_LEN: usize = 9;
const HEATING_PACKET_LEN: usize = 9;
const PROTECTION_PACKET_LEN: usize = 17;

/// Assemble a little-endian integer from up to 4 bytes, sign-extending if asked.
pub fn bytes_to_int(bytes: &[u8], signed: bool) -> i32 {
    let len = bytes.len().min(4);
    let raw = bytes[..len]
        .iter()
        .enumerate()
        .fold(0u32, |acc, (i, &b)| acc | (b as u32) << (i * 8));
    if signed && len > 0 && len < 4 {
        let shift = 32 - len * 8;
        ((raw << shift) as i32) >> shift
    } else {
        raw as i32
    }
}

#[derive(Debug)]
pub struct SokBattery {
    pub(crate) link: LinkState,
    send_counter: u32,
    /// Markers still outstanding for the last command
    awaiting: Vec<u16, 2>,
    command_tag: u16,
    soc: u8,
    volts: f32,
    amps: f32,
    capacity: f32,
    cycles: u16,
    temperatures: [i16; 2],
    cmos: bool,
    dmos: bool,
    heating: bool,
    protected: bool,
}

impl SokBattery {
    pub const PROFILE: GattProfile = GattProfile {
        tx_service: 0xffe0,
        tx_characteristic: 0xffe2,
        rx_service: 0xffe0,
        rx_characteristic: 0xffe1,
    };

    pub fn new(name: &str, stale_after: u64) -> Self {
        Self {
            link: LinkState::new(name, stale_after),
            send_counter: 0,
            awaiting: Vec::new(),
            command_tag: 0,
            soc: 0,
            volts: 0.0,
            amps: 0.0,
            capacity: 0.0,
            cycles: 0,
            temperatures: [0; 2],
            cmos: false,
            dmos: false,
            heating: false,
            protected: false,
        }
    }

    pub(crate) fn mark_disconnected(&mut self) {
        self.link.connected = false;
        self.send_counter = 0;
        self.awaiting.clear();
    }

    /// C2 and C1 alternate, starting with C2, until the protection read replaces the 50th.
    pub(crate) fn next_command(&mut self, now: u64, interval: u64) -> Option<Command> {
        if !self.link.command_due(now, interval) {
            return None;
        }
        self.send_counter += 1;
        let (bytes, expected): (&[u8; 6], &[u16]) = if self.send_counter >= PROTECTION_EVERY {
            self.send_counter = 0;
            (&REQ_PROTECTION, &[PROTECTION_MARKER][..])
        } else if self.send_counter % 2 == 1 {
            (&REQ_BASE_AND_HEATING, &[BASE_MARKER, HEATING_MARKER][..])
        } else {
            (&REQ_BASE_AND_MOSFETS, &[BASE_MARKER, MOSFET_MARKER][..])
        };
        debug!("{}: TX: {}", self.link.name, hex::encode(bytes));

        self.awaiting = Vec::from_slice(expected).ok()?;
        self.command_tag = expected[0];
        self.link.last_command_at = Some(now);

        Some(Command {
            bytes: Vec::from_slice(bytes).ok()?,
            tag: self.command_tag,
            with_response: false,
        })
    }

    /// Decode one packet. The command completes once every packet it asked
    /// for has arrived, in whatever order.
    pub(crate) fn on_notification(&mut self, packet: &[u8], now: u64) -> NotifyOutcome {
        let mut outcome = NotifyOutcome::default();
        debug!("{}: RX notification: {}", self.link.name, hex::encode(packet));

        let marker = match packet {
            [lo, hi, ..] => u16::from_le_bytes([*lo, *hi]),
            _ => {
                warn!("{}: packet too short for a marker: {}", self.link.name, hex::encode(packet));
                return outcome;
            }
        };

        let decoded = match marker {
            BASE_MARKER => self.decode_base(packet),
            MOSFET_MARKER => self.decode_mosfets(packet),
            HEATING_MARKER => self.decode_heating(packet),
            PROTECTION_MARKER => self.decode_protection(packet),
            _ => {
                debug!("{}: ignoring packet with marker {marker:#06x}", self.link.name);
                return outcome;
            }
        };
        if !decoded {
            warn!(
                "{}: packet {marker:#06x} truncated at {} bytes: {}",
                self.link.name,
                packet.len(),
                hex::encode(packet)
            );
            return outcome;
        }
        // Only live telemetry counts towards freshness
        if marker == BASE_MARKER {
            self.link.last_heard = now;
        }

        if let Some(position) = self.awaiting.iter().position(|m| *m == marker) {
            self.awaiting.swap_remove(position);
            if self.awaiting.is_empty() {
                outcome.completed = Some(self.command_tag);
            }
        }
        outcome
    }

    fn decode_base(&mut self, packet: &[u8]) -> bool {
        if packet.len() < BASE_PACKET_LEN {
            return false;
        }
        self.volts = bytes_to_int(&packet[2..5], false) as f32 * 0.001;
        self.amps = bytes_to_int(&packet[5..8], true) as f32 * 0.001;
        self.capacity = bytes_to_int(&packet[11..14], true) as f32 * 0.001;
        self.cycles = bytes_to_int(&packet[14..16], false) as u16;
        self.soc = packet[16];
        true
    }

    fn decode_mosfets(&mut self, packet: &[u8]) -> bool {
        if packet.len() < MOSFET_PACKET_LEN {
            return false;
        }
        self.cmos = packet[2] != 0;
        self.dmos = packet[3] != 0;
        self.temperatures = [
            bytes_to_int(&packet[5..7], true) as i16,
            bytes_to_int(&packet[7..9], true) as i16,
        ];
        true
    }

    fn decode_heating(&mut self, packet: &[u8]) -> bool {
        if packet.len() < HEATING_PACKET_LEN {
            return false;
        }
        self.heating = packet[8] != 0;
        true
    }

    fn decode_protection(&mut self, packet: &[u8]) -> bool {
        if packet.len() < PROTECTION_PACKET_LEN {
            return false;
        }
        self.protected = packet[2..17].iter().any(|b| *b != 0);
        true
    }

    /// State of charge in %.
    pub fn soc(&self) -> u8 {
        self.soc
    }

    pub fn volts(&self) -> f32 {
        self.volts
    }

    /// Positive while charging.
    pub fn amps(&self) -> f32 {
        self.amps
    }

    /// Remaining capacity in Ah.
    pub fn capacity(&self) -> f32 {
        self.capacity
    }

    pub fn cycles(&self) -> u16 {
        self.cycles
    }

    /// First temperature probe, raw as the BMS reports it.
    pub fn temperature(&self) -> i16 {
        self.temperatures[0]
    }

    pub fn temperatures(&self) -> [i16; 2] {
        self.temperatures
    }

    /// Charge MOSFET on.
    pub fn is_cmos(&self) -> bool {
        self.cmos
    }

    /// Discharge MOSFET on.
    pub fn is_dmos(&self) -> bool {
        self.dmos
    }

    pub fn is_heating(&self) -> bool {
        self.heating
    }

    pub fn is_protected(&self) -> bool {
        self.protected
    }
}

#[cfg(test)]
fn connected_battery() -> SokBattery {
    let mut battery = SokBattery::new("SOK-AA12487", 120_000);
    battery.link.connected = true;
    battery
}

#[cfg(test)]
const BASE_PACKET: &str = "ccf0a0330018fcff000000409c0017002a";

#[test]
fn test_bytes_to_int() {
    assert_eq!(bytes_to_int(&[0x34, 0x12], false), 0x1234);
    assert_eq!(bytes_to_int(&[0x80, 0xff, 0xff], true), -128);
    assert_eq!(bytes_to_int(&[0x80, 0xff, 0xff], false), 0xffff80);
    assert_eq!(bytes_to_int(&[0xff, 0x7f], true), 32767);
    assert_eq!(bytes_to_int(&[0xff, 0xff, 0xff, 0xff], true), -1);
}

#[test]
fn test_command_rotation() {
    let mut battery = connected_battery();
    let mut sent = vec![];
    for i in 0..PROTECTION_EVERY as u64 + 2 {
        let command = battery.next_command(i * 2_000, 2_000).unwrap();
        assert!(!command.with_response);
        sent.push(command.bytes[1]);
    }
    assert_eq!(&sent[0..4], &[0xc2, 0xc1, 0xc2, 0xc1]);
    assert_eq!(sent[48], 0xc2);
    assert_eq!(sent[49], 0xc4);
    assert_eq!(&sent[50..52], &[0xc2, 0xc1]);
    assert_eq!(sent.iter().filter(|c| **c == 0xc4).count(), 1);
}

#[test]
fn test_command_bytes_and_tags() {
    let mut battery = connected_battery();
    let c2 = battery.next_command(0, 2_000).unwrap();
    assert_eq!(c2.bytes.as_slice(), &hex::decode("eec200000046").unwrap()[..]);
    assert_eq!(c2.tag, BASE_MARKER);
    let c1 = battery.next_command(2_000, 2_000).unwrap();
    assert_eq!(c1.bytes.as_slice(), &REQ_BASE_AND_MOSFETS);

    battery.send_counter = PROTECTION_EVERY - 1;
    let c4 = battery.next_command(4_000, 2_000).unwrap();
    assert_eq!(c4.bytes.as_slice(), &hex::decode("eec40000004f").unwrap()[..]);
    assert_eq!(c4.tag, PROTECTION_MARKER);
}

#[test]
fn test_base_packet_decode() {
    let mut battery = connected_battery();
    battery.on_notification(&hex::decode(BASE_PACKET).unwrap(), 500);
    assert_eq!(battery.volts(), 13216.0 * 0.001);
    assert_eq!(battery.amps(), -1000.0 * 0.001);
    assert_eq!(battery.capacity(), 40000.0 * 0.001);
    assert_eq!(battery.cycles(), 23);
    assert_eq!(battery.soc(), 42);
    assert_eq!(battery.link.last_heard, 500);
}

#[test]
fn test_secondary_packets_decode() {
    let mut battery = connected_battery();
    battery.on_notification(&hex::decode("ccf2010100e7ff1200").unwrap(), 1);
    assert!(battery.is_cmos());
    assert!(battery.is_dmos());
    assert_eq!(battery.temperatures(), [-25, 18]);
    assert_eq!(battery.temperature(), -25);

    battery.on_notification(&hex::decode("ccf3000000000000010000").unwrap(), 2);
    assert!(battery.is_heating());

    let mut protection = vec![0u8; 17];
    protection[0] = 0xcc;
    protection[1] = 0xf9;
    battery.on_notification(&protection, 3);
    assert!(!battery.is_protected());
    protection[9] = 0x04;
    battery.on_notification(&protection, 4);
    assert!(battery.is_protected());

    // Only base telemetry refreshes the link
    assert_eq!(battery.link.last_heard, 0);
    battery.on_notification(&hex::decode(BASE_PACKET).unwrap(), 5);
    assert_eq!(battery.link.last_heard, 5);
}

#[test]
fn test_two_packet_completion_either_order() {
    let base = hex::decode(BASE_PACKET).unwrap();
    let heating = hex::decode("ccf3000000000000000000").unwrap();

    let mut battery = connected_battery();
    let command = battery.next_command(0, 2_000).unwrap();
    assert_eq!(battery.on_notification(&base, 10).completed, None);
    assert_eq!(battery.on_notification(&heating, 20).completed, Some(command.tag));

    let mut battery = connected_battery();
    let command = battery.next_command(0, 2_000).unwrap();
    assert_eq!(battery.on_notification(&heating, 10).completed, None);
    assert_eq!(battery.on_notification(&base, 20).completed, Some(command.tag));

    // A repeat of the same packet does not complete the command
    let mut battery = connected_battery();
    battery.next_command(0, 2_000).unwrap();
    battery.on_notification(&base, 10);
    assert_eq!(battery.on_notification(&base, 20).completed, None);
}

#[test]
fn test_protection_completes_alone() {
    let mut battery = connected_battery();
    battery.send_counter = PROTECTION_EVERY - 1;
    let command = battery.next_command(0, 2_000).unwrap();
    let mut protection = vec![0u8; 17];
    protection[0] = 0xcc;
    protection[1] = 0xf9;
    assert_eq!(battery.on_notification(&protection, 10).completed, Some(command.tag));
}

#[test]
fn test_unknown_and_truncated_packets_ignored() {
    let mut battery = connected_battery();
    battery.next_command(0, 2_000).unwrap();
    assert_eq!(battery.on_notification(&[0xcc], 10), NotifyOutcome::default());
    assert_eq!(battery.on_notification(&[0xcc, 0xf5, 0x01], 10), NotifyOutcome::default());
    assert_eq!(battery.on_notification(&[0xcc, 0xf0, 0x01, 0x02], 10), NotifyOutcome::default());
    assert_eq!(battery.link.last_heard, 0);
    assert_eq!(battery.soc(), 0);
}

#[test]
fn test_disconnect_restarts_rotation() {
    let mut battery = connected_battery();
    battery.next_command(0, 2_000).unwrap();
    battery.next_command(2_000, 2_000).unwrap();
    battery.mark_disconnected();
    assert!(battery.next_command(4_000, 2_000).is_none());
    battery.link.connected = true;
    assert_eq!(battery.next_command(4_000, 2_000).unwrap().bytes[1], 0xc2);
}
