//! Protocol constants shared by the frame codec, marshaler and coalescer.
//!
//! Limits follow the Modbus application protocol: a PDU is at most 253 bytes
//! (256-byte serial ADU minus unit id and CRC).

// ============================================================================
// Frame layout
// ============================================================================

/// Maximum PDU size (function code + payload).
pub const MAX_PDU_SIZE: usize = 253;

/// TCP header bytes read before the length is known:
/// check-head(2) + protocol(2) + length(2) + unit(1) + function(1).
pub const TCP_HEADER_PROBE_LEN: usize = 8;

/// Bytes stripped from a TCP read response to reach the data payload:
/// MBAP(6) + unit(1) + function(1) + byte count(1).
pub const TCP_READ_PAYLOAD_OFFSET: usize = 9;

/// Offset of the big-endian length field inside the TCP header.
pub const TCP_LENGTH_OFFSET: usize = 4;

/// Largest legal value of the TCP length field (unit + max PDU).
pub const MAX_TCP_LENGTH: usize = 1 + MAX_PDU_SIZE;

/// RTU bytes before the data payload of a read response: unit + function + byte count.
pub const RTU_READ_PAYLOAD_OFFSET: usize = 3;

/// Trailing CRC bytes on every RTU frame.
pub const RTU_CRC_LEN: usize = 2;

/// RTU exception response: unit + function|0x80 + code + CRC.
pub const RTU_EXCEPTION_FRAME_LEN: usize = 5;

/// RTU write echo: unit + function + address(2) + value/quantity(2) + CRC.
pub const RTU_WRITE_ECHO_LEN: usize = 8;

/// Bit set on the echoed function code when the device answers with an exception.
pub const EXCEPTION_FLAG: u8 = 0x80;

// ============================================================================
// Quantity limits
// ============================================================================

/// FC03/FC04: 1 + 1 + 2N <= 253
pub const MAX_READ_REGISTERS: usize = 125;

/// FC16: 1 + 2 + 2 + 1 + 2N <= 253
pub const MAX_WRITE_REGISTERS: usize = 123;

/// FC01/FC02
pub const MAX_READ_COILS: usize = 2000;

/// FC15
pub const MAX_WRITE_COILS: usize = 1968;

/// Registers kept in reserve below [`MAX_READ_REGISTERS`] when coalescing.
pub const BATCH_SAFETY_MARGIN: usize = 4;

/// Default coalescing window span (125 - 4).
pub const BATCH_WINDOW_REGISTERS: usize = MAX_READ_REGISTERS - BATCH_SAFETY_MARGIN;

// ============================================================================
// Function codes
// ============================================================================

pub const FC_READ_COILS: u8 = 0x01;
pub const FC_READ_DISCRETE_INPUTS: u8 = 0x02;
pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;
pub const FC_READ_INPUT_REGISTERS: u8 = 0x04;
pub const FC_WRITE_SINGLE_COIL: u8 = 0x05;
pub const FC_WRITE_SINGLE_REGISTER: u8 = 0x06;
pub const FC_WRITE_MULTIPLE_COILS: u8 = 0x0F;
pub const FC_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

/// Coil ON value for FC05.
pub const COIL_ON: u16 = 0xFF00;

/// Coil OFF value for FC05.
pub const COIL_OFF: u16 = 0x0000;

/// Whether `function` reads bit-packed data (coils or discrete inputs).
#[inline]
pub fn is_bit_function(function: u8) -> bool {
    matches!(
        function,
        FC_READ_COILS | FC_READ_DISCRETE_INPUTS | FC_WRITE_SINGLE_COIL | FC_WRITE_MULTIPLE_COILS
    )
}

/// Whether `function` is one of the supported read codes (1-4).
#[inline]
pub fn is_read_function(function: u8) -> bool {
    matches!(
        function,
        FC_READ_COILS | FC_READ_DISCRETE_INPUTS | FC_READ_HOLDING_REGISTERS | FC_READ_INPUT_REGISTERS
    )
}

/// Whether `function` is one of the supported write codes (5, 6, 15, 16).
#[inline]
pub fn is_write_function(function: u8) -> bool {
    matches!(
        function,
        FC_WRITE_SINGLE_COIL
            | FC_WRITE_SINGLE_REGISTER
            | FC_WRITE_MULTIPLE_COILS
            | FC_WRITE_MULTIPLE_REGISTERS
    )
}

// ============================================================================
// Exception codes
// ============================================================================

pub const EXCEPTION_ILLEGAL_FUNCTION: u8 = 0x01;
pub const EXCEPTION_ILLEGAL_DATA_ADDRESS: u8 = 0x02;
pub const EXCEPTION_ILLEGAL_DATA_VALUE: u8 = 0x03;
pub const EXCEPTION_SERVER_DEVICE_FAILURE: u8 = 0x04;
pub const EXCEPTION_ACKNOWLEDGE: u8 = 0x05;
pub const EXCEPTION_SERVER_DEVICE_BUSY: u8 = 0x06;
pub const EXCEPTION_MEMORY_PARITY_ERROR: u8 = 0x08;
pub const EXCEPTION_GATEWAY_PATH_UNAVAILABLE: u8 = 0x0A;
pub const EXCEPTION_GATEWAY_TARGET_FAILED: u8 = 0x0B;
