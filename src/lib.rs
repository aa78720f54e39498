//! # Modbus Engine - Async Modbus Master for TCP and RTU
//!
//! A Modbus master that turns textual point addresses into framed requests,
//! serializes exchanges over one shared connection, decodes multi-register
//! values in any of the four common byte layouts and coalesces point reads
//! into as few transactions as the device limits allow.
//!
//! ## Features
//!
//! - **Two framings**: Modbus TCP (MBAP-style header) and Modbus RTU (CRC16)
//! - **Serialized exchanges**: one request/response in flight per connection,
//!   shared safely between tasks
//! - **Typed access**: `i16`..`f64` over `ABCD`/`BADC`/`CDAB`/`DCBA` with an
//!   optional full reversal
//! - **Batch reads**: points grouped by station and function, packed into
//!   windows under the device read limit
//! - **Traces**: every result carries hex dumps of the frames exchanged
//!
//! ## Supported Function Codes
//!
//! | Code | Function | Engine |
//! |------|----------|--------|
//! | 0x01 | Read Coils | ✅ |
//! | 0x02 | Read Discrete Inputs | ✅ |
//! | 0x03 | Read Holding Registers | ✅ |
//! | 0x04 | Read Input Registers | ✅ |
//! | 0x05 | Write Single Coil | ✅ |
//! | 0x06 | Write Single Register | ✅ |
//! | 0x0F | Write Multiple Coils | ✅ |
//! | 0x10 | Write Multiple Registers | ✅ |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use modbus_engine::{DataType, EngineConfig, ModbusEngine, TcpTransport, DEFAULT_TIMEOUT};
//!
//! #[tokio::main]
//! async fn main() {
//!     let transport = TcpTransport::new("127.0.0.1:502", DEFAULT_TIMEOUT);
//!     let engine = ModbusEngine::new(transport, EngineConfig::default()).expect("valid limits");
//!
//!     // Station 1, holding registers, address 100
//!     let temperature = engine.read_one::<f32>("1;3;100").await;
//!     println!("{:?} via {:?}", temperature.value, temperature.request_trace);
//!
//!     let batch = engine
//!         .read_batch(&[("1;3;0", DataType::Int16), ("1;3;5", DataType::Float)])
//!         .await;
//!     println!("{:?}", batch.value);
//! }
//! ```

// ============================================================================
// Protocol modules
// ============================================================================

/// Core error types and result handling
pub mod error;

/// Modbus protocol constants
pub mod constants;

/// `station;function;address[.bit]` point addresses
pub mod address;

/// CRC16/MODBUS checksum
pub mod crc;

/// Stack-allocated PDU and request builders
pub mod pdu;

/// TCP/RTU framing, check-heads and response validation
pub mod frame;

/// Byte transports for TCP and RTU
pub mod transport;

/// Serialized request/response engine
pub mod engine;

/// Logging system for the library
pub mod logging;

// ============================================================================
// Data modules
// ============================================================================

/// Point data types and values
pub mod value;

/// Register byte layouts
pub mod bytes;

/// Scalar marshaling over register buffers
pub mod codec;

/// Read coalescing for batch reads
pub mod batcher;

/// Device-specific protocol limits configuration
pub mod device_limits;

// ============================================================================
// Re-exports for convenience
// ============================================================================

// === Async runtime (users can use modbus_engine::tokio) ===
pub use tokio;

// === Engine API ===
pub use engine::{BlockingEngine, EngineConfig, ExchangeResult, ModbusEngine};

// === Error handling ===
pub use error::{ModbusError, ModbusResult, TransportErrorKind};

// === Addressing and data ===
pub use address::{AddressHeader, IntoAddress};
pub use bytes::DataFormat;
pub use codec::{ModbusCodec, RegisterScalar};
pub use value::{DataType, ModbusValue};

// === Batch reads ===
pub use batcher::{BatchItem, BatchKey, BatchValues, ReadCoalescer, ReadGroup, ReadWindow, WindowPlan};
pub use device_limits::DeviceLimits;

// === Framing ===
pub use frame::{
    CheckHeadStrategy, Frame, Framing, RandomCheckHead, SequentialCheckHead,
    TransactionIdGenerator,
};

// === Transport ===
pub use transport::{FrameTransport, TcpTransport, TransportStats, DEFAULT_TIMEOUT};

#[cfg(feature = "rtu")]
pub use transport::RtuTransport;

// === Protocol limits (commonly needed constants) ===
pub use constants::{
    MAX_PDU_SIZE, MAX_READ_COILS, MAX_READ_REGISTERS, MAX_WRITE_COILS, MAX_WRITE_REGISTERS,
};

// === Logging ===
pub use logging::{CallbackLogger, LogCallback, LogLevel};

// === PDU (advanced usage) ===
pub use pdu::{ModbusPdu, PduBuilder};

/// Modbus TCP default port
pub const DEFAULT_TCP_PORT: u16 = 502;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
