//! Modbus RTU CRC16 (poly 0xA001 reflected, init 0xFFFF), transmitted low byte first.

use crc::{Crc, CRC_16_MODBUS};

pub const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// CRC of `data` as it appears on the wire: `[lo, hi]`.
#[inline]
pub fn crc16(data: &[u8]) -> [u8; 2] {
    CRC_MODBUS.checksum(data).to_le_bytes()
}

/// CRC of `data` as a number.
#[inline]
pub fn crc16_value(data: &[u8]) -> u16 {
    CRC_MODBUS.checksum(data)
}

/// Append the CRC of the current contents.
pub fn append_crc16(frame: &mut Vec<u8>) {
    let crc = crc16(frame);
    frame.extend_from_slice(&crc);
}

/// CRC carried by the last two bytes of `frame`, if it has any.
pub fn trailing_crc(frame: &[u8]) -> Option<u16> {
    if frame.len() < 2 {
        return None;
    }
    let n = frame.len();
    Some(u16::from_le_bytes([frame[n - 2], frame[n - 1]]))
}

/// Recompute over all but the last two bytes and compare.
pub fn check_crc16(frame: &[u8]) -> bool {
    match trailing_crc(frame) {
        Some(received) => crc16_value(&frame[..frame.len() - 2]) == received,
        None => false,
    }
}
