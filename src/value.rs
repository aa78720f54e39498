//! # Modbus Value Types
//!
//! [`DataType`] names the shape of a point; [`ModbusValue`] carries a decoded
//! point. Both know how many registers they span:
//!
//! | Type                   | Registers | Bytes |
//! |------------------------|-----------|-------|
//! | Bool / Byte            | 1         | 2     |
//! | Int16 / UInt16         | 1         | 2     |
//! | Int32 / UInt32 / Float | 2         | 4     |
//! | Int64 / UInt64 / Double| 4         | 8     |
//!
//! Bool occupies one bit when read through a coil function and one register
//! (non-zero test) when read through a register function.

use std::fmt;
use std::str::FromStr;

use crate::error::ModbusError;

/// Point data type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DataType {
    Bool,
    Byte,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float,
    Double,
}

impl DataType {
    /// Registers spanned when read from a register table.
    #[inline]
    pub fn register_count(&self) -> u16 {
        match self {
            DataType::Bool | DataType::Byte | DataType::Int16 | DataType::UInt16 => 1,
            DataType::Int32 | DataType::UInt32 | DataType::Float => 2,
            DataType::Int64 | DataType::UInt64 | DataType::Double => 4,
        }
    }

    /// Wire bytes occupied in a register buffer.
    #[inline]
    pub fn byte_width(&self) -> usize {
        usize::from(self.register_count()) * 2
    }

    pub fn name(&self) -> &'static str {
        match self {
            DataType::Bool => "bool",
            DataType::Byte => "byte",
            DataType::Int16 => "int16",
            DataType::UInt16 => "uint16",
            DataType::Int32 => "int32",
            DataType::UInt32 => "uint32",
            DataType::Int64 => "int64",
            DataType::UInt64 => "uint64",
            DataType::Float => "float",
            DataType::Double => "double",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DataType {
    type Err = ModbusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bool" | "boolean" | "bit" => Ok(DataType::Bool),
            "byte" | "u8" => Ok(DataType::Byte),
            "int16" | "i16" | "short" => Ok(DataType::Int16),
            "uint16" | "u16" | "ushort" => Ok(DataType::UInt16),
            "int32" | "i32" | "int" => Ok(DataType::Int32),
            "uint32" | "u32" | "uint" => Ok(DataType::UInt32),
            "int64" | "i64" | "long" => Ok(DataType::Int64),
            "uint64" | "u64" | "ulong" => Ok(DataType::UInt64),
            "float" | "f32" | "float32" => Ok(DataType::Float),
            "double" | "f64" | "float64" => Ok(DataType::Double),
            _ => Err(ModbusError::configuration(format!(
                "unknown data type '{}'",
                s
            ))),
        }
    }
}

/// A decoded point value.
///
/// ```rust
/// use modbus_engine::{DataType, ModbusValue};
///
/// let temp = ModbusValue::Float(25.5);
/// assert_eq!(temp.data_type(), DataType::Float);
/// assert!((temp.as_f64() - 25.5).abs() < 0.001);
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ModbusValue {
    Bool(bool),
    Byte(u8),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Float(f32),
    Double(f64),
}

impl ModbusValue {
    pub fn data_type(&self) -> DataType {
        match self {
            ModbusValue::Bool(_) => DataType::Bool,
            ModbusValue::Byte(_) => DataType::Byte,
            ModbusValue::Int16(_) => DataType::Int16,
            ModbusValue::UInt16(_) => DataType::UInt16,
            ModbusValue::Int32(_) => DataType::Int32,
            ModbusValue::UInt32(_) => DataType::UInt32,
            ModbusValue::Int64(_) => DataType::Int64,
            ModbusValue::UInt64(_) => DataType::UInt64,
            ModbusValue::Float(_) => DataType::Float,
            ModbusValue::Double(_) => DataType::Double,
        }
    }

    #[inline]
    pub fn register_count(&self) -> u16 {
        self.data_type().register_count()
    }

    /// Uniform numeric view for comparisons and scaling.
    pub fn as_f64(&self) -> f64 {
        match self {
            ModbusValue::Bool(b) => f64::from(u8::from(*b)),
            ModbusValue::Byte(v) => f64::from(*v),
            ModbusValue::Int16(v) => f64::from(*v),
            ModbusValue::UInt16(v) => f64::from(*v),
            ModbusValue::Int32(v) => f64::from(*v),
            ModbusValue::UInt32(v) => f64::from(*v),
            ModbusValue::Int64(v) => *v as f64,
            ModbusValue::UInt64(v) => *v as f64,
            ModbusValue::Float(v) => f64::from(*v),
            ModbusValue::Double(v) => *v,
        }
    }

    pub fn as_bool(&self) -> bool {
        match self {
            ModbusValue::Bool(b) => *b,
            other => other.as_f64() != 0.0,
        }
    }
}

impl fmt::Display for ModbusValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModbusValue::Bool(v) => write!(f, "{}", v),
            ModbusValue::Byte(v) => write!(f, "{}", v),
            ModbusValue::Int16(v) => write!(f, "{}", v),
            ModbusValue::UInt16(v) => write!(f, "{}", v),
            ModbusValue::Int32(v) => write!(f, "{}", v),
            ModbusValue::UInt32(v) => write!(f, "{}", v),
            ModbusValue::Int64(v) => write!(f, "{}", v),
            ModbusValue::UInt64(v) => write!(f, "{}", v),
            ModbusValue::Float(v) => write!(f, "{}", v),
            ModbusValue::Double(v) => write!(f, "{}", v),
        }
    }
}

macro_rules! impl_from_scalar {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for ModbusValue {
                fn from(v: $ty) -> Self {
                    ModbusValue::$variant(v)
                }
            }
        )*
    };
}

impl_from_scalar! {
    bool => Bool,
    u8 => Byte,
    i16 => Int16,
    u16 => UInt16,
    i32 => Int32,
    u32 => UInt32,
    i64 => Int64,
    u64 => UInt64,
    f32 => Float,
    f64 => Double,
}
