//! # Frame Codec
//!
//! Wire framing for the two transports and validation of device responses.
//!
//! | Transport | Request layout                                                 |
//! |-----------|----------------------------------------------------------------|
//! | TCP       | `chk0 chk1 00 00 lenHi lenLo unit func ..pdu`                  |
//! | RTU       | `unit func ..pdu crcLo crcHi`                                  |
//!
//! The TCP transaction-id field carries a 2-byte *check-head*. It is not an
//! MBAP transaction counter: its only job is to detect a response that does
//! not belong to the request just sent (a stale frame left in the socket
//! buffer, or a reply from a different master). [`TransactionIdGenerator`]
//! makes the strategy pluggable; [`SequentialCheckHead`] gives strict MBAP
//! behaviour for peers that require it.
//!
//! All functions here are pure. Reading bytes off a transport is driven by the
//! engine using [`tcp_body_len`] and [`RtuTail`] to request exact byte counts.

use std::fmt;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{BufMut, Bytes, BytesMut};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::constants::{
    is_read_function, EXCEPTION_ACKNOWLEDGE, EXCEPTION_FLAG, EXCEPTION_GATEWAY_PATH_UNAVAILABLE,
    EXCEPTION_GATEWAY_TARGET_FAILED, EXCEPTION_ILLEGAL_DATA_ADDRESS,
    EXCEPTION_ILLEGAL_DATA_VALUE, EXCEPTION_ILLEGAL_FUNCTION, EXCEPTION_MEMORY_PARITY_ERROR,
    EXCEPTION_SERVER_DEVICE_BUSY, EXCEPTION_SERVER_DEVICE_FAILURE, MAX_TCP_LENGTH,
    RTU_CRC_LEN, RTU_EXCEPTION_FRAME_LEN, RTU_READ_PAYLOAD_OFFSET, RTU_WRITE_ECHO_LEN,
    TCP_HEADER_PROBE_LEN, TCP_LENGTH_OFFSET, TCP_READ_PAYLOAD_OFFSET,
};
use crate::crc::{crc16_value, trailing_crc};
use crate::error::{ModbusError, ModbusResult};
use crate::pdu::ModbusPdu;

// ============================================================================
// Framing
// ============================================================================

/// Which wire framing a transport speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Framing {
    Tcp,
    Rtu,
}

impl fmt::Display for Framing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Framing::Tcp => write!(f, "TCP"),
            Framing::Rtu => write!(f, "RTU"),
        }
    }
}

/// TCP frame. `pdu` is the payload after the function code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpFrame {
    pub check_head: [u8; 2],
    pub unit_id: u8,
    pub function_code: u8,
    pub pdu: Bytes,
}

/// RTU frame. `pdu` is the payload after the function code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtuFrame {
    pub unit_id: u8,
    pub function_code: u8,
    pub pdu: Bytes,
    pub crc: u16,
}

/// One frame on the wire, built fresh per transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Tcp(TcpFrame),
    Rtu(RtuFrame),
}

impl Frame {
    /// Wrap a request PDU in a TCP header.
    pub fn tcp(check_head: [u8; 2], unit_id: u8, pdu: &ModbusPdu) -> ModbusResult<Self> {
        let function_code = pdu
            .function_code()
            .ok_or_else(|| ModbusError::frame("cannot frame an empty PDU"))?;
        Ok(Frame::Tcp(TcpFrame {
            check_head,
            unit_id,
            function_code,
            pdu: Bytes::copy_from_slice(pdu.body()),
        }))
    }

    /// Wrap a request PDU with unit id and CRC16.
    pub fn rtu(unit_id: u8, pdu: &ModbusPdu) -> ModbusResult<Self> {
        let function_code = pdu
            .function_code()
            .ok_or_else(|| ModbusError::frame("cannot frame an empty PDU"))?;
        let mut covered = Vec::with_capacity(pdu.len() + 1);
        covered.push(unit_id);
        covered.extend_from_slice(pdu.as_slice());
        Ok(Frame::Rtu(RtuFrame {
            unit_id,
            function_code,
            pdu: Bytes::copy_from_slice(pdu.body()),
            crc: crc16_value(&covered),
        }))
    }

    /// Build the request frame for `framing`.
    pub fn request(
        framing: Framing,
        unit_id: u8,
        pdu: &ModbusPdu,
        check_head: [u8; 2],
    ) -> ModbusResult<Self> {
        match framing {
            Framing::Tcp => Self::tcp(check_head, unit_id, pdu),
            Framing::Rtu => Self::rtu(unit_id, pdu),
        }
    }

    pub fn framing(&self) -> Framing {
        match self {
            Frame::Tcp(_) => Framing::Tcp,
            Frame::Rtu(_) => Framing::Rtu,
        }
    }

    pub fn unit_id(&self) -> u8 {
        match self {
            Frame::Tcp(f) => f.unit_id,
            Frame::Rtu(f) => f.unit_id,
        }
    }

    pub fn function_code(&self) -> u8 {
        match self {
            Frame::Tcp(f) => f.function_code,
            Frame::Rtu(f) => f.function_code,
        }
    }

    pub fn pdu(&self) -> &Bytes {
        match self {
            Frame::Tcp(f) => &f.pdu,
            Frame::Rtu(f) => &f.pdu,
        }
    }

    pub fn check_head(&self) -> Option<[u8; 2]> {
        match self {
            Frame::Tcp(f) => Some(f.check_head),
            Frame::Rtu(_) => None,
        }
    }

    /// Serialize to wire bytes.
    pub fn to_bytes(&self) -> Bytes {
        match self {
            Frame::Tcp(f) => {
                let length = (2 + f.pdu.len()) as u16;
                let mut buf = BytesMut::with_capacity(8 + f.pdu.len());
                buf.put_slice(&f.check_head);
                buf.put_u16(0x0000);
                buf.put_u16(length);
                buf.put_u8(f.unit_id);
                buf.put_u8(f.function_code);
                buf.put_slice(&f.pdu);
                buf.freeze()
            }
            Frame::Rtu(f) => {
                let mut buf = BytesMut::with_capacity(4 + f.pdu.len());
                buf.put_u8(f.unit_id);
                buf.put_u8(f.function_code);
                buf.put_slice(&f.pdu);
                buf.put_u16_le(f.crc);
                buf.freeze()
            }
        }
    }

    /// Parse a complete frame without interpreting its payload.
    ///
    /// The RTU CRC is carried as received; use [`crate::crc::check_crc16`]
    /// to verify it.
    pub fn decode(framing: Framing, raw: &[u8]) -> ModbusResult<Self> {
        if raw.is_empty() {
            return Err(ModbusError::EmptyResponse);
        }
        match framing {
            Framing::Tcp => {
                if raw.len() < TCP_HEADER_PROBE_LEN {
                    return Err(ModbusError::frame(format!(
                        "TCP frame too short: {} bytes",
                        raw.len()
                    )));
                }
                let body = tcp_body_len(&raw[..TCP_HEADER_PROBE_LEN])?;
                if raw.len() != TCP_HEADER_PROBE_LEN + body {
                    return Err(ModbusError::frame(format!(
                        "TCP length field says {} bytes, frame has {}",
                        TCP_HEADER_PROBE_LEN + body,
                        raw.len()
                    )));
                }
                Ok(Frame::Tcp(TcpFrame {
                    check_head: [raw[0], raw[1]],
                    unit_id: raw[6],
                    function_code: raw[7],
                    pdu: Bytes::copy_from_slice(&raw[TCP_HEADER_PROBE_LEN..]),
                }))
            }
            Framing::Rtu => {
                if raw.len() < 4 {
                    return Err(ModbusError::frame(format!(
                        "RTU frame too short: {} bytes",
                        raw.len()
                    )));
                }
                let crc = trailing_crc(raw).unwrap_or_default();
                Ok(Frame::Rtu(RtuFrame {
                    unit_id: raw[0],
                    function_code: raw[1],
                    pdu: Bytes::copy_from_slice(&raw[2..raw.len() - RTU_CRC_LEN]),
                    crc,
                }))
            }
        }
    }
}

// ============================================================================
// Check-head generation
// ============================================================================

/// Source of the 2-byte TCP check-head.
pub trait TransactionIdGenerator: Send + Sync + fmt::Debug {
    fn next_check_head(&self, function: u8) -> [u8; 2];
}

/// Pseudo-random check-head: a `SmallRng` draw mixed with the function code
/// and wall-clock milliseconds.
#[derive(Debug)]
pub struct RandomCheckHead {
    rng: Mutex<SmallRng>,
}

impl RandomCheckHead {
    pub fn new() -> Self {
        let now = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default() as u64;
        Self::with_seed(now)
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(SmallRng::seed_from_u64(seed)),
        }
    }
}

impl Default for RandomCheckHead {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionIdGenerator for RandomCheckHead {
    fn next_check_head(&self, function: u8) -> [u8; 2] {
        let millis = chrono::Utc::now().timestamp_millis() as u16;
        let drawn: u16 = self
            .rng
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .gen();
        (drawn ^ millis ^ (u16::from(function) << 8)).to_be_bytes()
    }
}

/// Strict MBAP transaction ids: 0, 1, 2, ... wrapping at 65535.
#[derive(Debug, Default)]
pub struct SequentialCheckHead {
    next: AtomicU16,
}

impl SequentialCheckHead {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(id: u16) -> Self {
        Self {
            next: AtomicU16::new(id),
        }
    }
}

impl TransactionIdGenerator for SequentialCheckHead {
    fn next_check_head(&self, _function: u8) -> [u8; 2] {
        self.next.fetch_add(1, Ordering::Relaxed).to_be_bytes()
    }
}

/// Configurable choice of generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CheckHeadStrategy {
    #[default]
    Random,
    Sequential,
}

impl CheckHeadStrategy {
    pub fn generator(self) -> Arc<dyn TransactionIdGenerator> {
        match self {
            CheckHeadStrategy::Random => Arc::new(RandomCheckHead::new()),
            CheckHeadStrategy::Sequential => Arc::new(SequentialCheckHead::new()),
        }
    }
}

// ============================================================================
// Response length planning
// ============================================================================

/// Bytes still to read after the 8-byte TCP header probe.
pub fn tcp_body_len(header: &[u8]) -> ModbusResult<usize> {
    if header.len() < TCP_HEADER_PROBE_LEN {
        return Err(ModbusError::frame(format!(
            "TCP header needs {} bytes, got {}",
            TCP_HEADER_PROBE_LEN,
            header.len()
        )));
    }
    let length =
        u16::from_be_bytes([header[TCP_LENGTH_OFFSET], header[TCP_LENGTH_OFFSET + 1]]) as usize;
    if !(2..=MAX_TCP_LENGTH).contains(&length) {
        return Err(ModbusError::frame(format!(
            "TCP length field {} out of range 2-{}",
            length, MAX_TCP_LENGTH
        )));
    }
    // unit id and function code are already part of the probe
    Ok(length - 2)
}

/// How the rest of an RTU response is sized, given the echoed function code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtuTail {
    /// Exception code + CRC.
    Exception,
    /// One byte-count byte, then that many bytes + CRC.
    ByteCounted,
    /// Fixed number of remaining bytes.
    Fixed(usize),
}

impl RtuTail {
    pub fn for_function(echoed: u8) -> Self {
        if echoed & EXCEPTION_FLAG != 0 {
            RtuTail::Exception
        } else if is_read_function(echoed) {
            RtuTail::ByteCounted
        } else {
            RtuTail::Fixed(RTU_WRITE_ECHO_LEN - 2)
        }
    }

    /// Remaining length after `unit func`, given the byte count when known.
    pub fn remaining(self, byte_count: Option<u8>) -> usize {
        match self {
            RtuTail::Exception => RTU_EXCEPTION_FRAME_LEN - 2,
            RtuTail::ByteCounted => 1 + byte_count.map(usize::from).unwrap_or(0) + RTU_CRC_LEN,
            RtuTail::Fixed(n) => n,
        }
    }
}

// ============================================================================
// Response validation
// ============================================================================

/// Human-readable message for a Modbus exception code.
pub fn exception_message(code: u8) -> &'static str {
    match code {
        EXCEPTION_ILLEGAL_FUNCTION => "Illegal function",
        EXCEPTION_ILLEGAL_DATA_ADDRESS => "Illegal data address",
        EXCEPTION_ILLEGAL_DATA_VALUE => "Illegal data value",
        EXCEPTION_SERVER_DEVICE_FAILURE => "Server device failure",
        EXCEPTION_ACKNOWLEDGE => "Acknowledge (request accepted, processing)",
        EXCEPTION_SERVER_DEVICE_BUSY => "Server device busy",
        EXCEPTION_MEMORY_PARITY_ERROR => "Memory parity error",
        EXCEPTION_GATEWAY_PATH_UNAVAILABLE => "Gateway path unavailable",
        EXCEPTION_GATEWAY_TARGET_FAILED => "Gateway target device failed to respond",
        _ => "Unknown exception",
    }
}

fn exception_error(function: u8, code: u8) -> ModbusError {
    ModbusError::Exception {
        function: function & !EXCEPTION_FLAG,
        code,
        message: exception_message(code).to_string(),
    }
}

fn check_echo(expected: u8, echoed: u8, exception_code: Option<u8>) -> ModbusResult<()> {
    if echoed & EXCEPTION_FLAG != 0 {
        let code = exception_code
            .ok_or_else(|| ModbusError::frame("exception response without exception code"))?;
        return Err(exception_error(echoed, code));
    }
    if echoed != expected {
        return Err(ModbusError::UnexpectedFunction {
            expected,
            actual: echoed,
        });
    }
    Ok(())
}

/// Validate a complete TCP response and return its data payload.
///
/// Reads yield the register/coil bytes after the byte count; writes yield the
/// echoed `address, value|quantity` body.
pub fn validate_tcp_response<'a>(
    check_head: [u8; 2],
    function: u8,
    frame: &'a [u8],
) -> ModbusResult<&'a [u8]> {
    if frame.is_empty() {
        return Err(ModbusError::EmptyResponse);
    }
    if frame.len() < TCP_HEADER_PROBE_LEN {
        return Err(ModbusError::frame(format!(
            "TCP response too short: {} bytes",
            frame.len()
        )));
    }
    let actual = [frame[0], frame[1]];
    if actual != check_head {
        return Err(ModbusError::CheckHeadMismatch {
            expected: check_head,
            actual,
        });
    }
    let body = tcp_body_len(frame)?;
    if frame.len() < TCP_HEADER_PROBE_LEN + body {
        return Err(ModbusError::frame(format!(
            "TCP response truncated: expected {} bytes, got {}",
            TCP_HEADER_PROBE_LEN + body,
            frame.len()
        )));
    }
    let frame = &frame[..TCP_HEADER_PROBE_LEN + body];

    check_echo(function, frame[7], frame.get(8).copied())?;

    if is_read_function(function) {
        if frame.len() < TCP_READ_PAYLOAD_OFFSET {
            return Err(ModbusError::frame("read response missing byte count"));
        }
        let byte_count = frame[TCP_READ_PAYLOAD_OFFSET - 1] as usize;
        let payload = &frame[TCP_READ_PAYLOAD_OFFSET..];
        if payload.len() != byte_count {
            return Err(ModbusError::frame(format!(
                "byte count {} does not match payload length {}",
                byte_count,
                payload.len()
            )));
        }
        Ok(payload)
    } else {
        Ok(&frame[TCP_HEADER_PROBE_LEN..])
    }
}

/// Validate a complete RTU response and return its data payload.
///
/// With `strict_crc == false` a CRC mismatch is ignored here; reporting it is
/// left to the caller.
pub fn validate_rtu_response(function: u8, frame: &[u8], strict_crc: bool) -> ModbusResult<&[u8]> {
    if frame.is_empty() {
        return Err(ModbusError::EmptyResponse);
    }
    if frame.len() < RTU_EXCEPTION_FRAME_LEN {
        return Err(ModbusError::frame(format!(
            "RTU response too short: {} bytes",
            frame.len()
        )));
    }

    let covered = &frame[..frame.len() - RTU_CRC_LEN];
    let computed = crc16_value(covered);
    let received = trailing_crc(frame).unwrap_or_default();
    if computed != received && strict_crc {
        return Err(ModbusError::CrcMismatch { computed, received });
    }

    check_echo(function, frame[1], frame.get(2).copied())?;

    if is_read_function(function) {
        let byte_count = frame[2] as usize;
        let payload = &covered[RTU_READ_PAYLOAD_OFFSET..];
        if payload.len() != byte_count {
            return Err(ModbusError::frame(format!(
                "byte count {} does not match payload length {}",
                byte_count,
                payload.len()
            )));
        }
        Ok(payload)
    } else {
        Ok(&covered[2..])
    }
}
