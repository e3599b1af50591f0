//! CRC16 (Modbus) helpers for Modbus-over-BLE frames.
//!
//! A response frame looks like:
//!
//! Start Byte | End Byte | Meaning
//! 0          | 0        | Device address (0xFF for the BT-2 bridge)
//! 1          | 1        | Function code (0x03, read holding registers)
//! 2          | 2        | The number of payload bytes that follow (N)
//! 3          | N+2      | The payload, big-endian 16-bit registers
//! N+3        | N+4      | A MODBUS CRC over bytes 0..N+2, little-endian

use crc16::{State, MODBUS};

/// Offset of the self-declared payload length byte.
pub const LENGTH_OFFSET: usize = 2;
/// Bytes in a frame that are not payload: address, function, length and the CRC.
pub const FRAME_OVERHEAD: usize = 5;

/// Compute the Modbus CRC over `bytes[start..end]`.
///
/// Out of range bounds are clamped to the slice rather than panicking, so a
/// malformed frame yields a checksum mismatch.
pub fn compute_checksum(bytes: &[u8], start: usize, end: usize) -> u16 {
    let end = end.min(bytes.len());
    let start = start.min(end);
    State::<MODBUS>::calculate(&bytes[start..end])
}

/// The total frame length implied by the length byte, if it has arrived yet.
pub fn expected_length(frame: &[u8]) -> Option<usize> {
    frame
        .get(LENGTH_OFFSET)
        .map(|&len| len as usize + FRAME_OVERHEAD)
}

/// Read the CRC trailer at the offset the length byte points to.
pub fn extract_provided_checksum(frame: &[u8]) -> Option<u16> {
    let index = *frame.get(LENGTH_OFFSET)? as usize + 3;
    let lo = *frame.get(index)?;
    let hi = *frame.get(index + 1)?;
    Some(u16::from_le_bytes([lo, hi]))
}

/// The CRC the frame should carry given its declared length.
pub fn calculated_checksum(frame: &[u8]) -> Option<u16> {
    let end = *frame.get(LENGTH_OFFSET)? as usize + 3;
    if end > frame.len() {
        return None;
    }
    Some(compute_checksum(frame, 0, end))
}

/// True if the provided and computed checksums agree.
pub fn is_frame_valid(frame: &[u8]) -> bool {
    match (extract_provided_checksum(frame), calculated_checksum(frame)) {
        (Some(provided), Some(calculated)) => provided == calculated,
        _ => false,
    }
}

#[test]
fn test_checksum_read_command_vector() {
    let command = hex::decode("ff0301000006").unwrap();
    assert_eq!(compute_checksum(&command, 0, 6), 0xEAD1);
    // Same input, same answer
    assert_eq!(compute_checksum(&command, 0, 6), compute_checksum(&command, 0, 6));
}

#[test]
fn test_checksum_subrange() {
    let bytes = hex::decode("aaaaff0301000006bb").unwrap();
    assert_eq!(compute_checksum(&bytes, 2, 8), 0xEAD1);
}

#[test]
fn test_checksum_bounds_are_clamped() {
    let bytes = hex::decode("ff0301000006").unwrap();
    assert_eq!(compute_checksum(&bytes, 0, 200), 0xEAD1);
    assert_eq!(compute_checksum(&bytes, 9, 3), State::<MODBUS>::calculate(&[]));
}

#[test]
fn test_frame_valid() {
    let frame = hex::decode("ff030c0055008404d29a19008c09ce1b12").unwrap();
    assert_eq!(expected_length(&frame), Some(frame.len()));
    assert_eq!(extract_provided_checksum(&frame), Some(0x121B));
    assert!(is_frame_valid(&frame));
}

#[test]
fn test_frame_corrupted_payload_byte() {
    let frame = hex::decode("ff030c0055008404d29a19008c09ce1b12").unwrap();
    for i in 0..frame.len() - 2 {
        // Corrupting the length byte moves the trailer, which also fails
        let mut corrupted = frame.clone();
        corrupted[i] ^= 0x01;
        assert!(!is_frame_valid(&corrupted), "byte {i} corruption not detected");
    }
}

#[test]
fn test_frame_truncated_or_lying_about_length() {
    let frame = hex::decode("ff030c0055008404d29a19008c09ce1b").unwrap();
    assert!(!is_frame_valid(&frame));

    let frame = hex::decode("ff03ff00").unwrap();
    assert!(!is_frame_valid(&frame));

    assert!(!is_frame_valid(&[]));
    assert_eq!(expected_length(&[0xff, 0x03]), None);
}
