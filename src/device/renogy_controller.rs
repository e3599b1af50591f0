//! Renogy DCC series DC-DC / MPPT solar chargers reached through a BT-2 bridge.
//!
//! The bridge tunnels Modbus RTU over two GATT characteristics: commands are
//! written to `ffd1` and responses arrive as 20-byte notifications on `fff1`.
//! A response is only trusted once the length byte says it is complete and
//! the CRC matches. The bridge then wants a short ASCII acknowledgement per
//! notification before it will accept the next command.

use heapless::Vec;
use log::{debug, warn};

use super::{Command, LinkState, NotifyOutcome, ACK_LEN, MAX_ACKS};
use crate::accumulator::Accumulator;
use crate::checksum::{self, compute_checksum};
use crate::radio::GattProfile;
use crate::register_table::{self as registers, EngineeringValue, RegisterValue, RegisterValues};

const DEVICE_ADDRESS: u8 = 0xFF;
const READ_HOLDING_REGISTERS: u8 = 0x03;
/// Fragment size the bridge notifies in, and thus what each ack covers.
const NOTIFICATION_LEN: usize = 20;
const ACK_TEMPLATE: &[u8; ACK_LEN] = b"main recv data[00] [";
const HEX_LOWER: &[u8; 16] = b"0123456789abcdef";

/// Build an 8-byte Modbus "read holding registers" request.
pub fn build_read_command(start_register: u16, count: u16) -> [u8; 8] {
    let mut command = [0u8; 8];
    command[0] = DEVICE_ADDRESS;
    command[1] = READ_HOLDING_REGISTERS;
    command[2..4].copy_from_slice(&start_register.to_be_bytes());
    command[4..6].copy_from_slice(&count.to_be_bytes());
    let crc = compute_checksum(&command, 0, 6);
    command[6..8].copy_from_slice(&crc.to_le_bytes());
    command
}

/// The register ranges we poll, in the order they are first sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenogyCommand {
    /// Model, versions and serial number
    Startup,
    /// Battery type and charge set-points
    Settings,
    /// Aux battery and alternator input
    Alternator,
    /// Solar input, daily and lifetime counters, state and faults
    Solar,
}

impl RenogyCommand {
    pub fn start_register(self) -> u16 {
        match self {
            RenogyCommand::Startup => 0x000A,
            RenogyCommand::Settings => 0xE002,
            RenogyCommand::Alternator => 0x0100,
            RenogyCommand::Solar => 0x0106,
        }
    }

    pub fn register_count(self) -> u16 {
        match self {
            RenogyCommand::Startup => 17,
            RenogyCommand::Settings => 19,
            RenogyCommand::Alternator => 6,
            RenogyCommand::Solar => 29,
        }
    }

    /// Startup is always first, settings once, then alternator and solar alternate.
    pub fn after(last: Option<RenogyCommand>) -> RenogyCommand {
        match last {
            None => RenogyCommand::Startup,
            Some(RenogyCommand::Startup) => RenogyCommand::Settings,
            Some(RenogyCommand::Settings) | Some(RenogyCommand::Solar) => RenogyCommand::Alternator,
            Some(RenogyCommand::Alternator) => RenogyCommand::Solar,
        }
    }
}

#[derive(PartialEq, Eq, Debug)]
enum TryParseFrameResult {
    Complete,
    Incomplete,
    Invalid(&'static str),
}

#[derive(Debug)]
pub struct RenogyController {
    pub(crate) link: LinkState,
    accumulator: Accumulator,
    frame_error: bool,
    registers: RegisterValues,
    register_expected: u16,
    last_command: Option<RenogyCommand>,
}

impl RenogyController {
    pub const PROFILE: GattProfile = GattProfile {
        tx_service: 0xffd0,
        tx_characteristic: 0xffd1,
        rx_service: 0xfff0,
        rx_characteristic: 0xfff1,
    };

    pub fn new(name: &str, stale_after: u64) -> Self {
        Self {
            link: LinkState::new(name, stale_after),
            accumulator: Accumulator::new(),
            frame_error: false,
            registers: RegisterValues::from_descriptions(&registers::REGISTER_DESCRIPTIONS),
            register_expected: 0,
            last_command: None,
        }
    }

    pub fn last_command(&self) -> Option<RenogyCommand> {
        self.last_command
    }

    pub(crate) fn mark_disconnected(&mut self) {
        self.link.connected = false;
        self.last_command = None;
        self.accumulator.clear();
        self.frame_error = false;
    }

    pub(crate) fn next_command(&mut self, now: u64, interval: u64) -> Option<Command> {
        if !self.link.command_due(now, interval) {
            return None;
        }
        let next = RenogyCommand::after(self.last_command);
        let start = next.start_register();
        let bytes = build_read_command(start, next.register_count());
        debug!("{}: TX {:?}: {}", self.link.name, next, hex::encode(bytes));

        self.accumulator.clear();
        self.frame_error = false;
        self.register_expected = start;
        self.last_command = Some(next);
        self.link.last_command_at = Some(now);

        Some(Command {
            bytes: Vec::from_slice(&bytes).ok()?,
            tag: start,
            with_response: true,
        })
    }

    /// Append one notification to the frame in progress and act on the frame once complete.
    ///
    /// After an overrun or a bad checksum the rest of the response is ignored;
    /// the radio stays held until it times out so a noisy link is not flooded
    /// with retries.
    pub(crate) fn on_notification(&mut self, chunk: &[u8], now: u64) -> NotifyOutcome {
        let mut outcome = NotifyOutcome::default();
        if self.frame_error {
            return outcome;
        }
        debug!("{}: RX notification: {}", self.link.name, hex::encode(chunk));

        if let Err(overflow) = self.accumulator.append(chunk) {
            warn!(
                "{}: buffer overrun receiving data ({} of {} bytes)",
                self.link.name, overflow.attempted, overflow.capacity
            );
            self.frame_error = true;
            return outcome;
        }

        match Self::try_parse_frame(self.accumulator.as_slice()) {
            TryParseFrameResult::Incomplete => {}
            TryParseFrameResult::Invalid(reason) => {
                let frame = self.accumulator.as_slice();
                warn!(
                    "{}: {reason}: received checksum {:?}, calculated {:?}: {}",
                    self.link.name,
                    checksum::extract_provided_checksum(frame),
                    checksum::calculated_checksum(frame),
                    hex::encode(frame)
                );
                self.frame_error = true;
            }
            TryParseFrameResult::Complete => {
                self.decode_frame(now);
                self.link.last_heard = now;
                outcome.completed = Some(self.register_expected);
                outcome.acks = Self::acknowledgements(self.accumulator.as_slice());
            }
        }
        outcome
    }

    /// Check the accumulated bytes against the frame's own length byte and CRC.
    fn try_parse_frame(buffer: &[u8]) -> TryParseFrameResult {
        if buffer.len() >= 2 && buffer[1] != READ_HOLDING_REGISTERS {
            return TryParseFrameResult::Invalid("Unexpected function code");
        }
        let expected_len = match checksum::expected_length(buffer) {
            Some(len) => len,
            None => return TryParseFrameResult::Incomplete,
        };
        if buffer.len() < expected_len {
            return TryParseFrameResult::Incomplete;
        }
        if buffer.len() > expected_len {
            return TryParseFrameResult::Invalid("Unexpected data length");
        }
        if !checksum::is_frame_valid(buffer) {
            return TryParseFrameResult::Invalid("Checksum error");
        }
        TryParseFrameResult::Complete
    }

    /// Store each register present in the frame, counting from the start
    /// register of the command that was sent.
    fn decode_frame(&mut self, now: u64) {
        let frame = self.accumulator.as_slice();
        let registers_provided = frame[checksum::LENGTH_OFFSET] as usize / 2;
        for offset in 0..registers_provided {
            let msb = frame[offset * 2 + 3];
            let lsb = frame[offset * 2 + 4];
            let address = self.register_expected.wrapping_add(offset as u16);
            self.registers.set(address, u16::from_be_bytes([msb, lsb]), now);
        }
    }

    fn acknowledgements(frame: &[u8]) -> Vec<[u8; ACK_LEN], MAX_ACKS> {
        let mut acks = Vec::new();
        for fragment in frame.chunks(NOTIFICATION_LEN) {
            let mut ack = *ACK_TEMPLATE;
            ack[15] = HEX_LOWER[(fragment[0] >> 4) as usize];
            ack[16] = HEX_LOWER[(fragment[0] & 0x0F) as usize];
            if acks.push(ack).is_err() {
                break;
            }
        }
        acks
    }

    pub fn register(&self, address: u16) -> Option<&RegisterValue> {
        self.registers.get(address)
    }

    /// Decode any described register from its last received value.
    pub fn describe(&self, address: u16) -> Option<EngineeringValue> {
        let description = registers::lookup_description(address)?;
        let words = self.registers.words(address, description.register_count())?;
        Some(registers::decode(&words, description))
    }

    fn scaled(&self, address: u16) -> f32 {
        match self.describe(address) {
            Some(EngineeringValue::Volts(v))
            | Some(EngineeringValue::Amps(v))
            | Some(EngineeringValue::AmpHours(v))
            | Some(EngineeringValue::Coefficient(v)) => v,
            Some(EngineeringValue::Integer(v)) => v as f32,
            _ => 0.0,
        }
    }

    pub fn aux_battery_soc(&self) -> f32 {
        self.scaled(registers::AUX_BATTERY_SOC)
    }

    pub fn aux_battery_volts(&self) -> f32 {
        self.scaled(registers::AUX_BATTERY_VOLTAGE)
    }

    pub fn charging_amps(&self) -> f32 {
        self.scaled(registers::CHARGING_CURRENT)
    }

    pub fn alternator_volts(&self) -> f32 {
        self.scaled(registers::ALTERNATOR_VOLTAGE)
    }

    pub fn alternator_amps(&self) -> f32 {
        self.scaled(registers::ALTERNATOR_CURRENT)
    }

    pub fn solar_volts(&self) -> f32 {
        self.scaled(registers::SOLAR_VOLTAGE)
    }

    pub fn solar_amps(&self) -> f32 {
        self.scaled(registers::SOLAR_CURRENT)
    }

    /// Amp-hours charged since midnight.
    pub fn amp_hours(&self) -> f32 {
        self.scaled(registers::TODAY_AMP_HOURS)
    }

    /// Controller temperature in °C.
    pub fn temperature(&self) -> f32 {
        match self.describe(registers::TEMPERATURES) {
            Some(EngineeringValue::Temperatures { controller, .. }) => controller as f32,
            _ => 0.0,
        }
    }

    pub fn battery_temperature(&self) -> f32 {
        match self.describe(registers::TEMPERATURES) {
            Some(EngineeringValue::Temperatures { battery, .. }) => battery as f32,
            _ => 0.0,
        }
    }

    pub fn charging_state(&self) -> Option<&'static str> {
        match self.describe(registers::CHARGING_STATE) {
            Some(EngineeringValue::Option { name, .. }) => name,
            _ => None,
        }
    }
}

#[cfg(test)]
fn connected_controller() -> RenogyController {
    let mut controller = RenogyController::new("BT-TH-66F94E1C    ", 120_000);
    controller.link.connected = true;
    controller
}

/// A checksummed response carrying `registers`.
#[cfg(test)]
pub(crate) fn response_frame(registers: &[u16]) -> std::vec::Vec<u8> {
    let mut frame = vec![DEVICE_ADDRESS, READ_HOLDING_REGISTERS, (registers.len() * 2) as u8];
    for r in registers {
        frame.extend_from_slice(&r.to_be_bytes());
    }
    let crc = compute_checksum(&frame, 0, frame.len());
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

#[test]
fn test_build_read_command() {
    assert_eq!(build_read_command(0x0100, 6), [0xff, 0x03, 0x01, 0x00, 0x00, 0x06, 0xd1, 0xea]);
    assert_eq!(build_read_command(0x000A, 17).to_vec(), hex::decode("ff03000a0011b01a").unwrap());
    let command = build_read_command(0x0106, 29);
    assert_eq!(checksum::compute_checksum(&command, 0, 6), 0xE071);
}

#[test]
fn test_command_cycle() {
    let mut controller = connected_controller();
    let mut sent = vec![];
    for i in 0..6 {
        let command = controller.next_command(i * 2_000, 2_000).unwrap();
        sent.push(controller.last_command().unwrap());
        assert_eq!(command.tag, controller.last_command().unwrap().start_register());
    }
    assert_eq!(
        sent,
        vec![
            RenogyCommand::Startup,
            RenogyCommand::Settings,
            RenogyCommand::Alternator,
            RenogyCommand::Solar,
            RenogyCommand::Alternator,
            RenogyCommand::Solar,
        ]
    );
}

#[test]
fn test_command_spacing_and_disconnect_resets_sequence() {
    let mut controller = connected_controller();
    assert!(controller.next_command(0, 2_000).is_some());
    assert!(controller.next_command(1_999, 2_000).is_none());
    assert!(controller.next_command(2_000, 2_000).is_some());
    controller.mark_disconnected();
    assert!(controller.next_command(10_000, 2_000).is_none());
    controller.link.connected = true;
    controller.next_command(10_000, 2_000).unwrap();
    assert_eq!(controller.last_command(), Some(RenogyCommand::Startup));
}

#[test]
fn test_response_decodes_injected_registers() {
    let mut controller = connected_controller();
    controller.next_command(0, 2_000); // startup
    controller.next_command(2_000, 2_000); // settings
    let command = controller.next_command(4_000, 2_000).unwrap();
    assert_eq!(command.bytes.as_slice(), &build_read_command(0x0100, 6));

    let injected = [85, 132, 1234, 0x9A19, 140, 2510];
    let frame = response_frame(&injected);
    assert!(checksum::is_frame_valid(&frame));
    assert_eq!(frame, hex::decode("ff030c0055008404d29a19008c09ce1b12").unwrap());

    let outcome = controller.on_notification(&frame, 5_000);
    assert_eq!(outcome.completed, Some(0x0100));
    for (offset, value) in injected.iter().enumerate() {
        let register = controller.register(0x0100 + offset as u16).unwrap();
        assert_eq!(register.value, *value);
        assert_eq!(register.updated_at, 5_000);
    }
    assert_eq!(controller.aux_battery_soc(), 85.0);
    assert_eq!(controller.aux_battery_volts(), 132.0 * 0.1);
    assert_eq!(controller.alternator_amps(), 2510.0 * 0.01);
    assert_eq!(controller.temperature(), -26.0);
    assert_eq!(controller.battery_temperature(), 25.0);
    assert_eq!(controller.link.last_heard, 5_000);
}

#[test]
fn test_fragmented_response_and_acks() {
    let mut controller = connected_controller();
    controller.last_command = Some(RenogyCommand::Alternator);
    controller.next_command(0, 2_000).unwrap();
    assert_eq!(controller.last_command(), Some(RenogyCommand::Solar));

    let mut injected = [0u16; 29];
    injected[0x0108 - 0x0106] = 450; // solar current
    injected[0x0113 - 0x0106] = 37; // amp-hours today
    injected[0x0120 - 0x0106] = 2; // MPPT
    let frame = response_frame(&injected);
    assert_eq!(frame.len(), 63);

    let mut outcome = NotifyOutcome::default();
    for chunk in frame.chunks(20) {
        assert_eq!(outcome.completed, None);
        outcome = controller.on_notification(chunk, 1_000);
    }
    assert_eq!(outcome.completed, Some(0x0106));
    assert_eq!(controller.solar_amps(), 450.0 * 0.01);
    assert_eq!(controller.amp_hours(), 37.0);
    assert_eq!(controller.charging_state(), Some("MPPT charging"));

    assert_eq!(outcome.acks.len(), 4);
    assert_eq!(&outcome.acks[0], b"main recv data[ff] [");
    assert_eq!(&outcome.acks[1][15..17], hex::encode([frame[20]]).as_bytes());
    assert_eq!(&outcome.acks[3][15..17], hex::encode([frame[60]]).as_bytes());
}

#[test]
fn test_bad_checksum_discards_frame() {
    let mut controller = connected_controller();
    controller.last_command = Some(RenogyCommand::Settings);
    controller.next_command(0, 2_000).unwrap();

    let mut frame = response_frame(&[85, 132, 1234, 0x9A19, 140, 2510]);
    frame[4] ^= 0x40;
    let outcome = controller.on_notification(&frame, 1_000);
    assert_eq!(outcome, NotifyOutcome::default());
    assert_eq!(controller.register(0x0100).unwrap().updated_at, 0);
    assert_eq!(controller.link.last_heard, 0);

    // Nothing more is accepted until the next command
    let good = response_frame(&[85, 132, 1234, 0x9A19, 140, 2510]);
    assert_eq!(controller.on_notification(&good, 1_100).completed, None);
}

#[test]
fn test_overlong_frame_is_rejected() {
    let mut controller = connected_controller();
    controller.next_command(0, 2_000).unwrap();
    let mut frame = response_frame(&[1, 2]);
    frame.push(0x00);
    assert_eq!(controller.on_notification(&frame, 10).completed, None);
    assert!(controller.frame_error);
}

#[test]
fn test_buffer_overrun_aborts_frame_only() {
    let mut controller = connected_controller();
    controller.next_command(0, 2_000).unwrap();
    // Claims 0xF0 payload bytes, more than the buffer holds
    let mut outcome = NotifyOutcome::default();
    let chunk = [0xff, 0x03, 0xf0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
    controller.on_notification(&chunk, 10);
    for _ in 0..5 {
        outcome = controller.on_notification(&[0u8; 20], 10);
    }
    assert_eq!(outcome.completed, None);
    assert!(controller.frame_error);
    assert!(controller.link.connected);

    // The next command starts a clean frame
    controller.next_command(2_000, 2_000).unwrap();
    assert!(!controller.frame_error);
}

#[test]
fn test_parse_frame_states() {
    assert_eq!(RenogyController::try_parse_frame(&[0xff]), TryParseFrameResult::Incomplete);
    assert_eq!(RenogyController::try_parse_frame(&[0xff, 0x03, 0x02, 0x00]), TryParseFrameResult::Incomplete);
    assert_eq!(
        RenogyController::try_parse_frame(&[0xff, 0x83, 0x02, 0x00, 0x00]),
        TryParseFrameResult::Invalid("Unexpected function code")
    );
    assert_eq!(
        RenogyController::try_parse_frame(&response_frame(&[7])),
        TryParseFrameResult::Complete
    );
}
