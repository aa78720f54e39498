//! # Address Header
//!
//! Textual addressing of a Modbus data point:
//!
//! ```text
//! <station>;<function>;<address>[.<bit>]
//! ```
//!
//! | Text          | Station | Function | Address | Bit  |
//! |---------------|---------|----------|---------|------|
//! | `1;3;100`     | 1       | 3        | 100     | -    |
//! | `1;1;10.15`   | 1       | 1        | 10      | 15   |
//! | `247;4;65535` | 247     | 4        | 65535   | -    |
//!
//! Parsing is all-or-nothing: a malformed string never yields a partial header.

use std::fmt;
use std::str::FromStr;

use crate::error::{ModbusError, ModbusResult};

/// Highest bit index inside one 16-bit register.
const MAX_BIT_INDEX: u8 = 15;

/// Parsed Modbus point address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressHeader {
    pub station: u8,
    pub function: u8,
    pub address: u16,
    /// Bit within the register, when the address carries a `.bit` suffix.
    pub bit_index: Option<u8>,
    /// Count `bit_index` from the most significant bit instead of the least.
    pub bit_from_left: bool,
}

impl AddressHeader {
    pub fn new(station: u8, function: u8, address: u16) -> Self {
        Self {
            station,
            function,
            address,
            bit_index: None,
            bit_from_left: false,
        }
    }

    /// Attach a bit index (0-15).
    pub fn with_bit(mut self, bit: u8) -> Self {
        self.bit_index = Some(bit);
        self
    }

    /// Select MSB-first bit numbering.
    pub fn with_bit_from_left(mut self, from_left: bool) -> Self {
        self.bit_from_left = from_left;
        self
    }

    /// Same station/function, different register address.
    ///
    /// Used when a window start is synthesized from a base header.
    pub fn at(&self, address: u16) -> Self {
        Self {
            address,
            bit_index: None,
            ..*self
        }
    }

    /// Parse `station;function;address[.bit]`.
    pub fn parse(text: &str) -> ModbusResult<Self> {
        let fields: Vec<&str> = text.split(';').map(str::trim).collect();
        if fields.len() != 3 {
            return Err(ModbusError::parse(
                text,
                format!("expected 3 ';'-separated fields, found {}", fields.len()),
            ));
        }

        let station = parse_field::<u8>(text, "station", fields[0])?;
        let function = parse_field::<u8>(text, "function", fields[1])?;

        let (address, bit_index) = match fields[2].split_once('.') {
            Some((addr, bit)) => {
                let address = parse_field::<u16>(text, "address", addr.trim())?;
                let bit = parse_field::<u8>(text, "bit", bit.trim())?;
                if bit > MAX_BIT_INDEX {
                    return Err(ModbusError::parse(
                        text,
                        format!("bit index {} out of range 0-{}", bit, MAX_BIT_INDEX),
                    ));
                }
                (address, Some(bit))
            }
            None => (parse_field::<u16>(text, "address", fields[2])?, None),
        };

        Ok(Self {
            station,
            function,
            address,
            bit_index,
            bit_from_left: false,
        })
    }
}

fn parse_field<T: FromStr>(input: &str, name: &str, field: &str) -> ModbusResult<T> {
    if field.is_empty() || !field.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ModbusError::parse(
            input,
            format!("{} '{}' is not an unsigned integer", name, field),
        ));
    }
    field
        .parse::<T>()
        .map_err(|_| ModbusError::parse(input, format!("{} '{}' out of range", name, field)))
}

/// Anything the engine accepts as a point address: header text or a parsed header.
pub trait IntoAddress {
    fn into_address(self) -> ModbusResult<AddressHeader>;
}

impl IntoAddress for AddressHeader {
    fn into_address(self) -> ModbusResult<AddressHeader> {
        Ok(self)
    }
}

impl IntoAddress for &AddressHeader {
    fn into_address(self) -> ModbusResult<AddressHeader> {
        Ok(*self)
    }
}

impl IntoAddress for &str {
    fn into_address(self) -> ModbusResult<AddressHeader> {
        AddressHeader::parse(self)
    }
}

impl IntoAddress for String {
    fn into_address(self) -> ModbusResult<AddressHeader> {
        AddressHeader::parse(&self)
    }
}

impl IntoAddress for &String {
    fn into_address(self) -> ModbusResult<AddressHeader> {
        AddressHeader::parse(self)
    }
}

impl FromStr for AddressHeader {
    type Err = ModbusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for AddressHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{};{};{}", self.station, self.function, self.address)?;
        if let Some(bit) = self.bit_index {
            write!(f, ".{}", bit)?;
        }
        Ok(())
    }
}
