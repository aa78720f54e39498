//! # Scalar Marshaler
//!
//! Conversion between flat register-byte buffers and typed values, honouring
//! the connection's [`DataFormat`] and reverse flag.
//!
//! ## Widths
//!
//! | Rust type           | Bytes | Registers |
//! |---------------------|-------|-----------|
//! | `i16`, `u16`        | 2     | 1         |
//! | `i32`, `u32`, `f32` | 4     | 2         |
//! | `i64`, `u64`, `f64` | 8     | 4         |
//!
//! ## Bits
//!
//! Three bit orders are in play and are kept apart on purpose:
//!
//! - [`ModbusCodec::decode_bools`] packs flags MSB-first within each byte.
//! - [`unpack_coils`]/[`pack_coils`] use the Modbus coil order (LSB-first).
//! - [`ModbusCodec::decode_bit`] numbers the 16 bits of one register from
//!   either end (`from_left`).

use crate::bytes::{big_endian_to_wire, wire_to_big_endian, DataFormat};
use crate::error::{ModbusError, ModbusResult};
use crate::value::{DataType, ModbusValue};

// ============================================================================
// Scalar trait
// ============================================================================

/// A fixed-width scalar that can live in consecutive registers.
pub trait RegisterScalar: Copy + Sized + Send + 'static {
    /// Bytes on the wire (2, 4 or 8).
    const WIDTH: usize;

    /// Build from exactly `WIDTH` big-endian bytes.
    fn from_be_slice(bytes: &[u8]) -> Self;

    /// Write exactly `WIDTH` big-endian bytes.
    fn write_be(self, out: &mut [u8]);

    fn into_value(self) -> ModbusValue;
}

macro_rules! impl_register_scalar {
    ($($ty:ty => $variant:ident, $width:expr);* $(;)?) => {
        $(
            impl RegisterScalar for $ty {
                const WIDTH: usize = $width;

                #[inline]
                fn from_be_slice(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; $width];
                    raw.copy_from_slice(&bytes[..$width]);
                    <$ty>::from_be_bytes(raw)
                }

                #[inline]
                fn write_be(self, out: &mut [u8]) {
                    out[..$width].copy_from_slice(&self.to_be_bytes());
                }

                fn into_value(self) -> ModbusValue {
                    ModbusValue::$variant(self)
                }
            }
        )*
    };
}

impl_register_scalar! {
    i16 => Int16, 2;
    u16 => UInt16, 2;
    i32 => Int32, 4;
    u32 => UInt32, 4;
    f32 => Float, 4;
    i64 => Int64, 8;
    u64 => UInt64, 8;
    f64 => Double, 8;
}

// ============================================================================
// Codec
// ============================================================================

/// Endian-aware marshaler bound to one connection's configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModbusCodec {
    pub data_format: DataFormat,
    pub reverse: bool,
}

impl ModbusCodec {
    pub fn new(data_format: DataFormat, reverse: bool) -> Self {
        Self {
            data_format,
            reverse,
        }
    }

    fn check_span(buffer: &[u8], offset: usize, needed: usize) -> ModbusResult<()> {
        let end = offset
            .checked_add(needed)
            .ok_or_else(|| ModbusError::invalid_data("decode span overflows"))?;
        if end > buffer.len() {
            return Err(ModbusError::invalid_data(format!(
                "need {} bytes at offset {}, buffer has {}",
                needed,
                offset,
                buffer.len()
            )));
        }
        Ok(())
    }

    /// Decode `count` consecutive values of `T` starting at byte `offset`.
    pub fn decode<T: RegisterScalar>(
        &self,
        buffer: &[u8],
        offset: usize,
        count: usize,
    ) -> ModbusResult<Vec<T>> {
        Self::check_span(buffer, offset, T::WIDTH * count)?;
        let mut scratch = [0u8; 8];
        let values = buffer[offset..offset + T::WIDTH * count]
            .chunks_exact(T::WIDTH)
            .map(|chunk| {
                let raw = &mut scratch[..T::WIDTH];
                raw.copy_from_slice(chunk);
                wire_to_big_endian(raw, self.data_format, self.reverse);
                T::from_be_slice(raw)
            })
            .collect();
        Ok(values)
    }

    /// Decode a single value of `T` at byte `offset`.
    pub fn decode_one<T: RegisterScalar>(&self, buffer: &[u8], offset: usize) -> ModbusResult<T> {
        Self::check_span(buffer, offset, T::WIDTH)?;
        let mut raw = [0u8; 8];
        raw[..T::WIDTH].copy_from_slice(&buffer[offset..offset + T::WIDTH]);
        wire_to_big_endian(&mut raw[..T::WIDTH], self.data_format, self.reverse);
        Ok(T::from_be_slice(&raw[..T::WIDTH]))
    }

    /// Encode values to register bytes ready for a write request.
    pub fn encode<T: RegisterScalar>(&self, values: &[T]) -> Vec<u8> {
        let mut out = vec![0u8; T::WIDTH * values.len()];
        for (value, chunk) in values.iter().zip(out.chunks_exact_mut(T::WIDTH)) {
            value.write_be(chunk);
            big_endian_to_wire(chunk, self.data_format, self.reverse);
        }
        out
    }

    /// Unpack `count` flags, MSB-first within each byte.
    pub fn decode_bools(&self, buffer: &[u8], offset: usize, count: usize) -> ModbusResult<Vec<bool>> {
        Self::check_span(buffer, offset, count.div_ceil(8))?;
        Ok((0..count)
            .map(|i| buffer[offset + i / 8] & (0x80 >> (i % 8)) != 0)
            .collect())
    }

    /// One of the 16 bits of register `register_index`.
    ///
    /// `from_left` counts from the most significant bit of the decoded word.
    pub fn decode_bit(
        &self,
        buffer: &[u8],
        register_index: usize,
        bit_index: u8,
        from_left: bool,
    ) -> ModbusResult<bool> {
        if bit_index > 15 {
            return Err(ModbusError::invalid_data(format!(
                "bit index {} out of range 0-15",
                bit_index
            )));
        }
        let word: u16 = self.decode_one(buffer, register_index * 2)?;
        let shift = if from_left { 15 - bit_index } else { bit_index };
        Ok((word >> shift) & 1 == 1)
    }

    /// `count` consecutive bits starting at `start_bit` of the first register,
    /// continuing into following registers.
    pub fn decode_register_bits(
        &self,
        buffer: &[u8],
        start_bit: u8,
        count: usize,
        from_left: bool,
    ) -> ModbusResult<Vec<bool>> {
        (0..count)
            .map(|i| {
                let absolute = usize::from(start_bit) + i;
                self.decode_bit(buffer, absolute / 16, (absolute % 16) as u8, from_left)
            })
            .collect()
    }

    /// Decode one point of `data_type` from a register buffer.
    ///
    /// `Bool` reads as "register non-zero"; `Byte` is the low byte of the word.
    pub fn decode_value(
        &self,
        buffer: &[u8],
        offset: usize,
        data_type: DataType,
    ) -> ModbusResult<ModbusValue> {
        Ok(match data_type {
            DataType::Bool => ModbusValue::Bool(self.decode_one::<u16>(buffer, offset)? != 0),
            DataType::Byte => ModbusValue::Byte((self.decode_one::<u16>(buffer, offset)? & 0xFF) as u8),
            DataType::Int16 => self.decode_one::<i16>(buffer, offset)?.into_value(),
            DataType::UInt16 => self.decode_one::<u16>(buffer, offset)?.into_value(),
            DataType::Int32 => self.decode_one::<i32>(buffer, offset)?.into_value(),
            DataType::UInt32 => self.decode_one::<u32>(buffer, offset)?.into_value(),
            DataType::Int64 => self.decode_one::<i64>(buffer, offset)?.into_value(),
            DataType::UInt64 => self.decode_one::<u64>(buffer, offset)?.into_value(),
            DataType::Float => self.decode_one::<f32>(buffer, offset)?.into_value(),
            DataType::Double => self.decode_one::<f64>(buffer, offset)?.into_value(),
        })
    }

    /// Register bytes for one point value.
    pub fn encode_value(&self, value: &ModbusValue) -> Vec<u8> {
        match *value {
            ModbusValue::Bool(b) => self.encode(&[u16::from(b)]),
            ModbusValue::Byte(v) => self.encode(&[u16::from(v)]),
            ModbusValue::Int16(v) => self.encode(&[v]),
            ModbusValue::UInt16(v) => self.encode(&[v]),
            ModbusValue::Int32(v) => self.encode(&[v]),
            ModbusValue::UInt32(v) => self.encode(&[v]),
            ModbusValue::Int64(v) => self.encode(&[v]),
            ModbusValue::UInt64(v) => self.encode(&[v]),
            ModbusValue::Float(v) => self.encode(&[v]),
            ModbusValue::Double(v) => self.encode(&[v]),
        }
    }

    /// Pull the value at `target` out of a buffer read for a whole window
    /// starting at `window_start`.
    ///
    /// Register windows use byte offset `(target - start) * 2`. Coil windows
    /// (`bit_packed`) walk the LSB-first coil bytes: byte `interval / 8`,
    /// bit `interval % 8`.
    pub fn extract_from_batch(
        &self,
        window_start: u16,
        target: u16,
        buffer: &[u8],
        data_type: DataType,
        bit_packed: bool,
    ) -> ModbusResult<ModbusValue> {
        let interval = target.checked_sub(window_start).ok_or_else(|| {
            ModbusError::invalid_data(format!(
                "address {} precedes window start {}",
                target, window_start
            ))
        })? as usize;

        if bit_packed {
            if data_type != DataType::Bool {
                return Err(ModbusError::configuration(format!(
                    "{} is not readable from a coil/discrete table",
                    data_type
                )));
            }
            let byte = buffer.get(interval / 8).ok_or_else(|| {
                ModbusError::invalid_data(format!(
                    "coil {} beyond {}-byte window buffer",
                    target,
                    buffer.len()
                ))
            })?;
            return Ok(ModbusValue::Bool(byte & (1 << (interval % 8)) != 0));
        }

        self.decode_value(buffer, interval * 2, data_type)
    }
}

// ============================================================================
// Coil packing (wire order)
// ============================================================================

/// Pack coil states LSB-first, as carried by FC01/02 responses and FC15 requests.
pub fn pack_coils(values: &[bool]) -> Vec<u8> {
    let mut packed = vec![0u8; values.len().div_ceil(8)];
    for (i, _) in values.iter().enumerate().filter(|(_, v)| **v) {
        packed[i / 8] |= 1 << (i % 8);
    }
    packed
}

/// Unpack `count` coil states from LSB-first bytes.
pub fn unpack_coils(bytes: &[u8], count: usize) -> ModbusResult<Vec<bool>> {
    if count.div_ceil(8) > bytes.len() {
        return Err(ModbusError::invalid_data(format!(
            "{} coils need {} bytes, got {}",
            count,
            count.div_ceil(8),
            bytes.len()
        )));
    }
    Ok((0..count).map(|i| bytes[i / 8] & (1 << (i % 8)) != 0).collect())
}

/// Registers needed to cover `count` bits starting at `start_bit`.
pub fn registers_for_bits(start_bit: u8, count: usize) -> usize {
    (usize::from(start_bit) + count).div_ceil(16).max(1)
}
