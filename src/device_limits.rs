//! # Device Limits
//!
//! Per-device request limits. The protocol allows 125 registers / 2000 coils
//! per read, but plenty of field devices reject requests well below that, and
//! some need a pause between requests.
//!
//! The batch coalescer keeps `batch_safety_margin` registers in reserve below
//! `max_read_registers`, so the default window spans 121 registers.

use crate::constants::{
    is_bit_function, BATCH_SAFETY_MARGIN, MAX_READ_COILS, MAX_READ_REGISTERS, MAX_WRITE_COILS,
    MAX_WRITE_REGISTERS,
};
use crate::error::{ModbusError, ModbusResult};

pub const DEFAULT_MAX_READ_REGISTERS: u16 = MAX_READ_REGISTERS as u16;
pub const DEFAULT_MAX_WRITE_REGISTERS: u16 = MAX_WRITE_REGISTERS as u16;
pub const DEFAULT_MAX_READ_COILS: u16 = MAX_READ_COILS as u16;
pub const DEFAULT_MAX_WRITE_COILS: u16 = MAX_WRITE_COILS as u16;
pub const DEFAULT_INTER_REQUEST_DELAY_MS: u64 = 0;
pub const DEFAULT_BATCH_SAFETY_MARGIN: u16 = BATCH_SAFETY_MARGIN as u16;

/// Request limits for one device.
///
/// ```rust
/// use modbus_engine::DeviceLimits;
///
/// let limits = DeviceLimits::new()
///     .with_max_read_registers(50)
///     .with_inter_request_delay_ms(10);
///
/// assert_eq!(limits.batch_window(), 46);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLimits {
    pub max_read_registers: u16,
    pub max_write_registers: u16,
    pub max_read_coils: u16,
    pub max_write_coils: u16,
    /// Pause between consecutive requests of one chunked read (milliseconds).
    pub inter_request_delay_ms: u64,
    /// Registers held back from `max_read_registers` when coalescing.
    pub batch_safety_margin: u16,
}

impl DeviceLimits {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lower limits for older or slow devices.
    pub fn conservative() -> Self {
        Self {
            max_read_registers: 50,
            max_write_registers: 50,
            max_read_coils: 500,
            max_write_coils: 500,
            inter_request_delay_ms: 10,
            batch_safety_margin: DEFAULT_BATCH_SAFETY_MARGIN,
        }
    }

    pub fn with_max_read_registers(mut self, count: u16) -> Self {
        self.max_read_registers = count;
        self
    }

    pub fn with_max_write_registers(mut self, count: u16) -> Self {
        self.max_write_registers = count;
        self
    }

    pub fn with_max_read_coils(mut self, count: u16) -> Self {
        self.max_read_coils = count;
        self
    }

    pub fn with_max_write_coils(mut self, count: u16) -> Self {
        self.max_write_coils = count;
        self
    }

    pub fn with_inter_request_delay_ms(mut self, delay_ms: u64) -> Self {
        self.inter_request_delay_ms = delay_ms;
        self
    }

    pub fn with_batch_safety_margin(mut self, margin: u16) -> Self {
        self.batch_safety_margin = margin;
        self
    }

    /// Address span of one coalesced register window.
    pub fn batch_window(&self) -> u16 {
        self.max_read_registers
            .saturating_sub(self.batch_safety_margin)
            .max(1)
    }

    /// Largest quantity one read request of `function` may ask for.
    pub fn max_read_quantity(&self, function: u8) -> u16 {
        if is_bit_function(function) {
            self.max_read_coils
        } else {
            self.max_read_registers
        }
    }

    /// Number of requests a chunked read of `quantity` items takes.
    pub fn read_request_count(&self, function: u8, quantity: u16) -> u16 {
        if quantity == 0 {
            return 0;
        }
        quantity.div_ceil(self.max_read_quantity(function).max(1))
    }

    pub fn is_write_within_limits(&self, register_count: usize) -> bool {
        register_count <= usize::from(self.max_write_registers)
    }

    pub fn is_coil_write_within_limits(&self, coil_count: usize) -> bool {
        coil_count <= usize::from(self.max_write_coils)
    }

    /// Reject limits no request could satisfy.
    pub fn validate(&self) -> ModbusResult<()> {
        let checks = [
            ("max_read_registers", self.max_read_registers, DEFAULT_MAX_READ_REGISTERS),
            ("max_write_registers", self.max_write_registers, DEFAULT_MAX_WRITE_REGISTERS),
            ("max_read_coils", self.max_read_coils, DEFAULT_MAX_READ_COILS),
            ("max_write_coils", self.max_write_coils, DEFAULT_MAX_WRITE_COILS),
        ];
        for (name, value, protocol_max) in checks {
            if value == 0 || value > protocol_max {
                return Err(ModbusError::configuration(format!(
                    "{} = {} outside 1-{}",
                    name, value, protocol_max
                )));
            }
        }
        if self.batch_safety_margin >= self.max_read_registers {
            return Err(ModbusError::configuration(format!(
                "batch_safety_margin {} leaves no room under max_read_registers {}",
                self.batch_safety_margin, self.max_read_registers
            )));
        }
        Ok(())
    }
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            max_read_registers: DEFAULT_MAX_READ_REGISTERS,
            max_write_registers: DEFAULT_MAX_WRITE_REGISTERS,
            max_read_coils: DEFAULT_MAX_READ_COILS,
            max_write_coils: DEFAULT_MAX_WRITE_COILS,
            inter_request_delay_ms: DEFAULT_INTER_REQUEST_DELAY_MS,
            batch_safety_margin: DEFAULT_BATCH_SAFETY_MARGIN,
        }
    }
}
