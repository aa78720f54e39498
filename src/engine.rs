//! # Exchange Engine
//!
//! [`ModbusEngine`] composes one [`FrameTransport`] with the frame codec, the
//! scalar marshaler and the batch coalescer.
//!
//! ## Exchange lifecycle
//!
//! ```text
//! Idle -> Connect (if not connected) -> Send -> AwaitHeader -> AwaitFrame
//!      -> Validate -> Complete -> Disconnect (unless persistent)
//! ```
//!
//! Each physical exchange runs entirely inside one async mutex owned by the
//! engine, so request/response pairs never interleave on the wire even when
//! many tasks share the engine. Connects and disconnects take the same lock.
//!
//! ## Retries
//!
//! | Transport | Exchange level                          | Batch level          |
//! |-----------|-----------------------------------------|----------------------|
//! | TCP       | none                                    | `retry_count` times  |
//! | RTU       | one retry on transport/frame failures   | `retry_count` times  |
//!
//! Device exceptions, parse errors and configuration errors are never retried
//! at the exchange level.
//!
//! ## Results
//!
//! Public operations never return `Err`; they return an [`ExchangeResult`]
//! carrying the value or the error together with hex traces of every
//! request/response pair issued on the caller's behalf.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, trace, warn};

use crate::address::{AddressHeader, IntoAddress};
use crate::batcher::{BatchValues, ReadCoalescer, ReadGroup};
use crate::bytes::DataFormat;
use crate::codec::{pack_coils, registers_for_bits, unpack_coils, ModbusCodec, RegisterScalar};
use crate::constants::{
    is_bit_function, is_read_function, FC_READ_COILS, FC_READ_DISCRETE_INPUTS,
    FC_READ_HOLDING_REGISTERS, FC_READ_INPUT_REGISTERS, FC_WRITE_MULTIPLE_COILS,
    FC_WRITE_MULTIPLE_REGISTERS, FC_WRITE_SINGLE_COIL, FC_WRITE_SINGLE_REGISTER, RTU_CRC_LEN,
    TCP_HEADER_PROBE_LEN,
};
use crate::crc::check_crc16;
use crate::device_limits::DeviceLimits;
use crate::error::{ModbusError, ModbusResult};
use crate::frame::{
    tcp_body_len, validate_rtu_response, validate_tcp_response, CheckHeadStrategy, Frame,
    Framing, RtuTail, TransactionIdGenerator,
};
use crate::logging::{format_hex_packet, CallbackLogger, LogCallback};
use crate::pdu::{ModbusPdu, PduBuilder};
use crate::transport::{FrameTransport, TransportStats};
use crate::value::{DataType, ModbusValue};

// ============================================================================
// Configuration
// ============================================================================

/// Connection-level configuration, fixed for the engine's lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub data_format: DataFormat,
    pub reverse: bool,
    /// Keep the transport open between exchanges.
    pub persistent_connection: bool,
    /// Fail RTU frames with a bad CRC instead of logging and decoding them.
    pub strict_crc: bool,
    /// Extra attempts for a failed batch read.
    pub retry_count: u32,
    pub limits: DeviceLimits,
    pub check_head: CheckHeadStrategy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_format: DataFormat::ABCD,
            reverse: false,
            persistent_connection: true,
            strict_crc: true,
            retry_count: 0,
            limits: DeviceLimits::default(),
            check_head: CheckHeadStrategy::Random,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_data_format(mut self, format: DataFormat) -> Self {
        self.data_format = format;
        self
    }

    pub fn with_reverse(mut self, reverse: bool) -> Self {
        self.reverse = reverse;
        self
    }

    pub fn with_persistent_connection(mut self, persistent: bool) -> Self {
        self.persistent_connection = persistent;
        self
    }

    pub fn with_strict_crc(mut self, strict: bool) -> Self {
        self.strict_crc = strict;
        self
    }

    pub fn with_retry_count(mut self, retries: u32) -> Self {
        self.retry_count = retries;
        self
    }

    pub fn with_limits(mut self, limits: DeviceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_check_head(mut self, strategy: CheckHeadStrategy) -> Self {
        self.check_head = strategy;
        self
    }

    pub fn codec(&self) -> ModbusCodec {
        ModbusCodec::new(self.data_format, self.reverse)
    }
}

// ============================================================================
// Results
// ============================================================================

/// Outcome of a public engine operation.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeResult<T> {
    pub success: bool,
    pub value: Option<T>,
    pub error: Option<ModbusError>,
    /// Hex dump of every request frame sent, in order, across retries.
    pub request_trace: Vec<String>,
    /// Hex dump of every complete response frame received.
    pub response_trace: Vec<String>,
}

impl<T> ExchangeResult<T> {
    fn from_result(result: ModbusResult<T>, traces: Traces) -> Self {
        match result {
            Ok(value) => Self {
                success: true,
                value: Some(value),
                error: None,
                request_trace: traces.request,
                response_trace: traces.response,
            },
            Err(error) => Self {
                success: false,
                value: None,
                error: Some(error),
                request_trace: traces.request,
                response_trace: traces.response,
            },
        }
    }

    fn rejected(error: ModbusError) -> Self {
        Self::from_result(Err(error), Traces::default())
    }

    /// Human-readable failure message.
    pub fn message(&self) -> Option<String> {
        self.error.as_ref().map(ToString::to_string)
    }

    /// 408 for timeouts, the exception code for device exceptions.
    pub fn error_code(&self) -> Option<u16> {
        self.error.as_ref().and_then(ModbusError::error_code)
    }

    /// Modbus exception code, when the device answered with one.
    pub fn exception(&self) -> Option<u8> {
        match &self.error {
            Some(ModbusError::Exception { code, .. }) => Some(*code),
            _ => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ExchangeResult<U> {
        ExchangeResult {
            success: self.success,
            value: self.value.map(f),
            error: self.error,
            request_trace: self.request_trace,
            response_trace: self.response_trace,
        }
    }

    pub fn into_result(self) -> ModbusResult<T> {
        match (self.value, self.error) {
            (Some(value), None) => Ok(value),
            (_, Some(error)) => Err(error),
            (None, None) => Err(ModbusError::protocol("exchange produced no value")),
        }
    }
}

#[derive(Debug, Default)]
struct Traces {
    request: Vec<String>,
    response: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExchangeState {
    Connect,
    Send,
    AwaitHeader,
    AwaitFrame,
    Validate,
    Complete,
    Disconnect,
}

struct Channel<T> {
    transport: T,
    stats: TransportStats,
}

// ============================================================================
// Engine
// ============================================================================

/// Modbus master bound to one transport.
pub struct ModbusEngine<T: FrameTransport> {
    channel: Mutex<Channel<T>>,
    framing: Framing,
    config: EngineConfig,
    codec: ModbusCodec,
    check_heads: Arc<dyn TransactionIdGenerator>,
    logger: CallbackLogger,
}

impl<T: FrameTransport> std::fmt::Debug for ModbusEngine<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModbusEngine")
            .field("framing", &self.framing)
            .field("config", &self.config)
            .finish()
    }
}

impl<T: FrameTransport> ModbusEngine<T> {
    pub fn new(transport: T, config: EngineConfig) -> ModbusResult<Self> {
        config.limits.validate()?;
        Ok(Self {
            framing: transport.framing(),
            channel: Mutex::new(Channel {
                transport,
                stats: TransportStats::default(),
            }),
            codec: config.codec(),
            check_heads: config.check_head.generator(),
            logger: CallbackLogger::default(),
            config,
        })
    }

    /// Route library warnings (batch retries, lenient CRC) to `callback`.
    pub fn with_log_callback(mut self, callback: LogCallback) -> Self {
        self.logger = CallbackLogger::new(Some(callback));
        self
    }

    /// Replace the configured check-head strategy.
    pub fn with_check_head_generator(mut self, generator: Arc<dyn TransactionIdGenerator>) -> Self {
        self.check_heads = generator;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn codec(&self) -> &ModbusCodec {
        &self.codec
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    // ------------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------------

    /// Open the transport now instead of on first use.
    pub async fn connect(&self) -> ExchangeResult<()> {
        let mut channel = self.channel.lock().await;
        let result = if channel.transport.is_connected() {
            Ok(())
        } else {
            self.step(ExchangeState::Connect, 0, 0);
            channel.transport.connect().await
        };
        if let Err(e) = &result {
            channel.stats.record_error(e);
        }
        ExchangeResult::from_result(result, Traces::default())
    }

    pub async fn close(&self) -> ExchangeResult<()> {
        let mut channel = self.channel.lock().await;
        self.step(ExchangeState::Disconnect, 0, 0);
        ExchangeResult::from_result(channel.transport.close().await, Traces::default())
    }

    pub async fn is_connected(&self) -> bool {
        self.channel.lock().await.transport.is_connected()
    }

    pub async fn stats(&self) -> TransportStats {
        self.channel.lock().await.stats.clone()
    }

    // ------------------------------------------------------------------------
    // Physical exchange
    // ------------------------------------------------------------------------

    fn step(&self, state: ExchangeState, station: u8, function: u8) {
        trace!(state = ?state, station, function, "exchange step");
    }

    /// One request/response under the exclusive section. Returns the
    /// validated data payload.
    async fn exchange(
        &self,
        station: u8,
        pdu: &ModbusPdu,
        traces: &mut Traces,
    ) -> ModbusResult<Vec<u8>> {
        let function = pdu
            .function_code()
            .ok_or_else(|| ModbusError::protocol("empty request PDU"))?;
        let mut channel = self.channel.lock().await;

        let attempts = match self.framing {
            Framing::Rtu => 2,
            Framing::Tcp => 1,
        };
        let mut attempt = 1;
        let result = loop {
            let outcome = self
                .exchange_once(&mut channel, station, function, pdu, traces)
                .await;
            let err = match outcome {
                Ok(payload) => break Ok(payload),
                Err(err) => err,
            };

            channel.stats.record_error(&err);
            if err.needs_reconnect() {
                self.recover(&mut channel).await;
            }
            if attempt < attempts && err.needs_reconnect() {
                warn!(
                    "RTU exchange with station {} failed ({}), retrying",
                    station, err
                );
                attempt += 1;
                continue;
            }
            break Err(err);
        };

        if !self.config.persistent_connection {
            self.step(ExchangeState::Disconnect, station, function);
            if let Err(e) = channel.transport.close().await {
                debug!("Close after exchange failed: {}", e);
            }
        }
        result
    }

    /// Discard whatever state a failed exchange left in the byte stream.
    async fn recover(&self, channel: &mut MutexGuard<'_, Channel<T>>) {
        match self.framing {
            Framing::Tcp => {
                if let Err(e) = channel.transport.close().await {
                    debug!("Close after failed exchange reported: {}", e);
                }
            }
            Framing::Rtu => channel.transport.clear_input().await,
        }
    }

    async fn exchange_once(
        &self,
        channel: &mut MutexGuard<'_, Channel<T>>,
        station: u8,
        function: u8,
        pdu: &ModbusPdu,
        traces: &mut Traces,
    ) -> ModbusResult<Vec<u8>> {
        if !channel.transport.is_connected() {
            self.step(ExchangeState::Connect, station, function);
            channel.transport.connect().await?;
        }

        let check_head = self.check_heads.next_check_head(function);
        let request = Frame::request(self.framing, station, pdu, check_head)?.to_bytes();
        traces.request.push(format_hex_packet(&request));

        self.step(ExchangeState::Send, station, function);
        channel.transport.send(&request).await?;
        channel.stats.requests_sent += 1;
        channel.stats.bytes_sent += request.len() as u64;

        let raw = match self.framing {
            Framing::Tcp => self.receive_tcp(channel, station, function).await?,
            Framing::Rtu => self.receive_rtu(channel, station, function).await?,
        };
        channel.stats.bytes_received += raw.len() as u64;
        channel.stats.responses_received += 1;
        traces.response.push(format_hex_packet(&raw));

        self.step(ExchangeState::Validate, station, function);
        let payload = match self.framing {
            Framing::Tcp => validate_tcp_response(check_head, function, &raw)?,
            Framing::Rtu => {
                if !self.config.strict_crc && !check_crc16(&raw) {
                    self.logger.warn(&format!(
                        "CRC mismatch from station {} accepted (lenient mode)",
                        station
                    ));
                }
                validate_rtu_response(function, &raw, self.config.strict_crc)?
            }
        };

        self.step(ExchangeState::Complete, station, function);
        Ok(payload.to_vec())
    }

    async fn receive_tcp(
        &self,
        channel: &mut MutexGuard<'_, Channel<T>>,
        station: u8,
        function: u8,
    ) -> ModbusResult<Vec<u8>> {
        self.step(ExchangeState::AwaitHeader, station, function);
        let mut raw = channel.transport.receive_exact(TCP_HEADER_PROBE_LEN).await?;
        let body = tcp_body_len(&raw)?;
        if body > 0 {
            self.step(ExchangeState::AwaitFrame, station, function);
            raw.extend(channel.transport.receive_exact(body).await?);
        }
        Ok(raw)
    }

    async fn receive_rtu(
        &self,
        channel: &mut MutexGuard<'_, Channel<T>>,
        station: u8,
        function: u8,
    ) -> ModbusResult<Vec<u8>> {
        self.step(ExchangeState::AwaitHeader, station, function);
        let mut raw = channel.transport.receive_exact(2).await?;

        self.step(ExchangeState::AwaitFrame, station, function);
        match RtuTail::for_function(raw[1]) {
            RtuTail::ByteCounted => {
                let count = channel.transport.receive_exact(1).await?;
                let remaining = usize::from(count[0]) + RTU_CRC_LEN;
                raw.extend(count);
                raw.extend(channel.transport.receive_exact(remaining).await?);
            }
            tail => {
                raw.extend(channel.transport.receive_exact(tail.remaining(None)).await?);
            }
        }
        Ok(raw)
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    /// Read `quantity` registers (or coils) starting at `header`, split into
    /// requests no larger than the device limits. Register reads return the
    /// raw register bytes; coil reads return LSB-first packed bits.
    async fn read_raw_inner(
        &self,
        header: &AddressHeader,
        quantity: u16,
        traces: &mut Traces,
    ) -> ModbusResult<Vec<u8>> {
        let function = header.function;
        if !is_read_function(function) {
            return Err(ModbusError::invalid_function(function));
        }
        if quantity == 0 {
            return Err(ModbusError::invalid_data("read quantity must be at least 1"));
        }
        if u32::from(header.address) + u32::from(quantity) > 0x1_0000 {
            return Err(ModbusError::invalid_data(format!(
                "reading {} items from {} runs past address 65535",
                quantity, header.address
            )));
        }

        let bit_packed = is_bit_function(function);
        let chunk = self.config.limits.max_read_quantity(function);
        let delay = self.config.limits.inter_request_delay_ms;

        let mut registers = Vec::new();
        let mut bits = Vec::new();
        let mut done: u16 = 0;
        while done < quantity {
            if done > 0 && delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            let count = chunk.min(quantity - done);
            let start = header.address + done;
            let pdu = PduBuilder::read_request(function, start, count)?;
            let payload = self.exchange(header.station, &pdu, traces).await?;

            if bit_packed {
                bits.extend(unpack_coils(&payload, usize::from(count))?);
            } else {
                let expected = usize::from(count) * 2;
                if payload.len() != expected {
                    return Err(ModbusError::frame(format!(
                        "expected {} register bytes, got {}",
                        expected,
                        payload.len()
                    )));
                }
                registers.extend(payload);
            }
            done += count;
        }

        Ok(if bit_packed {
            pack_coils(&bits)
        } else {
            registers
        })
    }

    /// Raw read; see [`ModbusEngine::read`] for typed access.
    pub async fn read_raw(&self, address: impl IntoAddress, quantity: u16) -> ExchangeResult<Vec<u8>> {
        let header = match address.into_address() {
            Ok(header) => header,
            Err(e) => return ExchangeResult::rejected(e),
        };
        let mut traces = Traces::default();
        let result = self.read_raw_inner(&header, quantity, &mut traces).await;
        ExchangeResult::from_result(result, traces)
    }

    fn require_register_read(header: &AddressHeader) -> ModbusResult<()> {
        match header.function {
            FC_READ_HOLDING_REGISTERS | FC_READ_INPUT_REGISTERS => Ok(()),
            FC_READ_COILS | FC_READ_DISCRETE_INPUTS => Err(ModbusError::configuration(format!(
                "function {} reads bits; use read_bool",
                header.function
            ))),
            other => Err(ModbusError::invalid_function(other)),
        }
    }

    /// Typed reads decode whole registers; a `.bit` header only reads as bool.
    fn require_whole_register(header: &AddressHeader) -> ModbusResult<()> {
        match header.bit_index {
            Some(bit) => Err(ModbusError::configuration(format!(
                "{} addresses bit {}; use read_bool",
                header, bit
            ))),
            None => Ok(()),
        }
    }

    /// Read `count` consecutive values of `S` from a register table.
    pub async fn read<S: RegisterScalar>(
        &self,
        address: impl IntoAddress,
        count: usize,
    ) -> ExchangeResult<Vec<S>> {
        let header = match address.into_address() {
            Ok(header) => header,
            Err(e) => return ExchangeResult::rejected(e),
        };
        let mut traces = Traces::default();
        let result: ModbusResult<Vec<S>> = async {
            Self::require_register_read(&header)?;
            Self::require_whole_register(&header)?;
            let registers = u16::try_from(count * S::WIDTH / 2).map_err(|_| {
                ModbusError::invalid_data(format!("{} values do not fit one read", count))
            })?;
            let bytes = self.read_raw_inner(&header, registers, &mut traces).await?;
            self.codec.decode::<S>(&bytes, 0, count)
        }
        .await;
        ExchangeResult::from_result(result, traces)
    }

    /// Read one value of `S`.
    pub async fn read_one<S: RegisterScalar>(&self, address: impl IntoAddress) -> ExchangeResult<S> {
        self.read::<S>(address, 1)
            .await
            .map(|values| values.into_iter().next())
            .flatten_value()
    }

    /// Read `count` flags.
    ///
    /// Coil/discrete functions read bits directly. Register functions read the
    /// bits of consecutive registers starting at the header's `.bit` index
    /// (ordering per `bit_from_left`); without a bit index each register
    /// reads as "non-zero".
    pub async fn read_bool(&self, address: impl IntoAddress, count: usize) -> ExchangeResult<Vec<bool>> {
        let header = match address.into_address() {
            Ok(header) => header,
            Err(e) => return ExchangeResult::rejected(e),
        };
        let mut traces = Traces::default();
        let result: ModbusResult<Vec<bool>> = async {
            let quantity = |n: usize| {
                u16::try_from(n)
                    .map_err(|_| ModbusError::invalid_data(format!("{} items do not fit one read", n)))
            };
            if is_bit_function(header.function) {
                let packed = self
                    .read_raw_inner(&header, quantity(count)?, &mut traces)
                    .await?;
                return unpack_coils(&packed, count);
            }
            Self::require_register_read(&header)?;
            match header.bit_index {
                Some(bit) => {
                    let registers = quantity(registers_for_bits(bit, count))?;
                    let bytes = self.read_raw_inner(&header, registers, &mut traces).await?;
                    self.codec
                        .decode_register_bits(&bytes, bit, count, header.bit_from_left)
                }
                None => {
                    let bytes = self
                        .read_raw_inner(&header, quantity(count)?, &mut traces)
                        .await?;
                    Ok(self
                        .codec
                        .decode::<u16>(&bytes, 0, count)?
                        .into_iter()
                        .map(|word| word != 0)
                        .collect())
                }
            }
        }
        .await;
        ExchangeResult::from_result(result, traces)
    }

    /// Read one point of a runtime-selected type.
    pub async fn read_value(
        &self,
        address: impl IntoAddress,
        data_type: DataType,
    ) -> ExchangeResult<ModbusValue> {
        let header = match address.into_address() {
            Ok(header) => header,
            Err(e) => return ExchangeResult::rejected(e),
        };
        if data_type == DataType::Bool {
            return self
                .read_bool(header, 1)
                .await
                .map(|flags| flags.first().copied().map(ModbusValue::Bool))
                .flatten_value();
        }
        let mut traces = Traces::default();
        let result: ModbusResult<ModbusValue> = async {
            Self::require_register_read(&header)?;
            Self::require_whole_register(&header)?;
            let bytes = self
                .read_raw_inner(&header, data_type.register_count(), &mut traces)
                .await?;
            self.codec.decode_value(&bytes, 0, data_type)
        }
        .await;
        ExchangeResult::from_result(result, traces)
    }

    // ------------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------------

    async fn write_register_bytes(
        &self,
        header: &AddressHeader,
        payload: &[u8],
        traces: &mut Traces,
    ) -> ModbusResult<()> {
        match header.function {
            FC_WRITE_SINGLE_REGISTER | FC_WRITE_MULTIPLE_REGISTERS => {}
            FC_WRITE_SINGLE_COIL | FC_WRITE_MULTIPLE_COILS => {
                return Err(ModbusError::configuration(format!(
                    "function {} writes coils; use write_bool",
                    header.function
                )))
            }
            other => return Err(ModbusError::invalid_function(other)),
        }
        if header.bit_index.is_some() {
            return Err(ModbusError::configuration(
                "bit-addressed register writes are not supported",
            ));
        }
        if !self.config.limits.is_write_within_limits(payload.len() / 2) {
            return Err(ModbusError::invalid_data(format!(
                "{} registers exceeds device write limit {}",
                payload.len() / 2,
                self.config.limits.max_write_registers
            )));
        }
        let pdu = PduBuilder::write_registers(
            header.address,
            payload,
            header.function == FC_WRITE_MULTIPLE_REGISTERS,
        )?;
        let echo = self.exchange(header.station, &pdu, traces).await?;
        check_write_echo(header.address, &echo)
    }

    async fn write_coil_bits(
        &self,
        header: &AddressHeader,
        values: &[bool],
        traces: &mut Traces,
    ) -> ModbusResult<()> {
        if !self.config.limits.is_coil_write_within_limits(values.len()) {
            return Err(ModbusError::invalid_data(format!(
                "{} coils exceeds device write limit {}",
                values.len(),
                self.config.limits.max_write_coils
            )));
        }
        let pdu = PduBuilder::write_coils(
            header.address,
            values,
            header.function == FC_WRITE_MULTIPLE_COILS,
        )?;
        let echo = self.exchange(header.station, &pdu, traces).await?;
        check_write_echo(header.address, &echo)
    }

    /// Write values of `S` to consecutive registers.
    ///
    /// A single 16-bit value goes out as FC06; anything wider, or any header
    /// naming function 16, uses FC16.
    pub async fn write<S: RegisterScalar>(
        &self,
        address: impl IntoAddress,
        values: &[S],
    ) -> ExchangeResult<()> {
        let header = match address.into_address() {
            Ok(header) => header,
            Err(e) => return ExchangeResult::rejected(e),
        };
        let mut traces = Traces::default();
        let payload = self.codec.encode(values);
        let result = self.write_register_bytes(&header, &payload, &mut traces).await;
        ExchangeResult::from_result(result, traces)
    }

    /// Write flags.
    ///
    /// Coil functions (5/15) write coils; register functions (6/16) write
    /// each flag as a 0/1 register.
    pub async fn write_bool(&self, address: impl IntoAddress, values: &[bool]) -> ExchangeResult<()> {
        let header = match address.into_address() {
            Ok(header) => header,
            Err(e) => return ExchangeResult::rejected(e),
        };
        let mut traces = Traces::default();
        let result = match header.function {
            FC_WRITE_SINGLE_COIL | FC_WRITE_MULTIPLE_COILS => {
                self.write_coil_bits(&header, values, &mut traces).await
            }
            _ => {
                let words: Vec<u16> = values.iter().map(|&b| u16::from(b)).collect();
                let payload = self.codec.encode(&words);
                self.write_register_bytes(&header, &payload, &mut traces).await
            }
        };
        ExchangeResult::from_result(result, traces)
    }

    /// Write one point of a runtime-selected type.
    pub async fn write_value(&self, address: impl IntoAddress, value: &ModbusValue) -> ExchangeResult<()> {
        let header = match address.into_address() {
            Ok(header) => header,
            Err(e) => return ExchangeResult::rejected(e),
        };
        if let ModbusValue::Bool(flag) = value {
            return self.write_bool(header, &[*flag]).await;
        }
        let mut traces = Traces::default();
        let payload = self.codec.encode_value(value);
        let result = self.write_register_bytes(&header, &payload, &mut traces).await;
        ExchangeResult::from_result(result, traces)
    }

    // ------------------------------------------------------------------------
    // Batch reads
    // ------------------------------------------------------------------------

    async fn run_batch(&self, groups: &[ReadGroup], traces: &mut Traces) -> ModbusResult<BatchValues> {
        let mut values = BatchValues::new();
        for group in groups {
            for plan in &group.windows {
                let header = group.header_for(&plan.window);
                let buffer = self
                    .read_raw_inner(&header, plan.window.length, traces)
                    .await?;
                plan.extract(&self.codec, group.station, group.function, &buffer, &mut values)?;
            }
        }
        Ok(values)
    }

    /// Read many points with the fewest transactions.
    ///
    /// Any failing window fails the whole batch (no partial results). The
    /// whole batch is retried up to `retry_count` times, with a warning
    /// logged between attempts; traces accumulate across attempts.
    pub async fn read_batch_items(&self, points: &[(AddressHeader, DataType)]) -> ExchangeResult<BatchValues> {
        let mut coalescer = ReadCoalescer::with_limits(&self.config.limits);
        for (header, data_type) in points {
            coalescer.add(header, *data_type);
        }
        let groups = match coalescer.plan() {
            Ok(groups) => groups,
            Err(e) => return ExchangeResult::rejected(e),
        };
        debug!(
            "Batch of {} points planned into {} windows",
            coalescer.len(),
            groups.iter().map(|g| g.windows.len()).sum::<usize>()
        );

        let attempts = self.config.retry_count.saturating_add(1);
        let mut traces = Traces::default();
        let mut attempt = 1;
        let result = loop {
            match self.run_batch(&groups, &mut traces).await {
                Ok(values) => break Ok(values),
                Err(e @ ModbusError::Configuration { .. }) => break Err(e),
                Err(e) if attempt < attempts => {
                    self.logger.warn(&format!(
                        "Batch read attempt {}/{} failed: {}; retrying",
                        attempt, attempts, e
                    ));
                    attempt += 1;
                }
                Err(e) => break Err(e),
            }
        };
        ExchangeResult::from_result(result, traces)
    }

    /// [`read_batch_items`](Self::read_batch_items) over address text.
    pub async fn read_batch<S: AsRef<str>>(&self, points: &[(S, DataType)]) -> ExchangeResult<BatchValues> {
        let parsed: ModbusResult<Vec<(AddressHeader, DataType)>> = points
            .iter()
            .map(|(text, ty)| AddressHeader::parse(text.as_ref()).map(|h| (h, *ty)))
            .collect();
        match parsed {
            Ok(items) => self.read_batch_items(&items).await,
            Err(e) => ExchangeResult::rejected(e),
        }
    }

    // ------------------------------------------------------------------------
    // Function-code aliases
    // ------------------------------------------------------------------------

    pub async fn read_holding_registers(&self, station: u8, address: u16, count: u16) -> ExchangeResult<Vec<u16>> {
        self.read::<u16>(
            AddressHeader::new(station, FC_READ_HOLDING_REGISTERS, address),
            usize::from(count),
        )
        .await
    }

    pub async fn read_input_registers(&self, station: u8, address: u16, count: u16) -> ExchangeResult<Vec<u16>> {
        self.read::<u16>(
            AddressHeader::new(station, FC_READ_INPUT_REGISTERS, address),
            usize::from(count),
        )
        .await
    }

    pub async fn read_coils(&self, station: u8, address: u16, count: u16) -> ExchangeResult<Vec<bool>> {
        self.read_bool(
            AddressHeader::new(station, FC_READ_COILS, address),
            usize::from(count),
        )
        .await
    }

    pub async fn read_discrete_inputs(&self, station: u8, address: u16, count: u16) -> ExchangeResult<Vec<bool>> {
        self.read_bool(
            AddressHeader::new(station, FC_READ_DISCRETE_INPUTS, address),
            usize::from(count),
        )
        .await
    }

    pub async fn write_single_coil(&self, station: u8, address: u16, value: bool) -> ExchangeResult<()> {
        self.write_bool(AddressHeader::new(station, FC_WRITE_SINGLE_COIL, address), &[value])
            .await
    }

    pub async fn write_single_register(&self, station: u8, address: u16, value: u16) -> ExchangeResult<()> {
        self.write::<u16>(
            AddressHeader::new(station, FC_WRITE_SINGLE_REGISTER, address),
            &[value],
        )
        .await
    }

    pub async fn write_multiple_coils(&self, station: u8, address: u16, values: &[bool]) -> ExchangeResult<()> {
        self.write_bool(
            AddressHeader::new(station, FC_WRITE_MULTIPLE_COILS, address),
            values,
        )
        .await
    }

    pub async fn write_multiple_registers(&self, station: u8, address: u16, values: &[u16]) -> ExchangeResult<()> {
        self.write::<u16>(
            AddressHeader::new(station, FC_WRITE_MULTIPLE_REGISTERS, address),
            values,
        )
        .await
    }
}

impl<T> ExchangeResult<Option<T>> {
    /// Collapse a result whose value may be missing into a plain one.
    fn flatten_value(self) -> ExchangeResult<T> {
        match self.value {
            Some(Some(value)) => ExchangeResult {
                success: self.success,
                value: Some(value),
                error: self.error,
                request_trace: self.request_trace,
                response_trace: self.response_trace,
            },
            _ => ExchangeResult {
                success: false,
                value: None,
                error: Some(
                    self.error
                        .unwrap_or_else(|| ModbusError::invalid_data("response carried no value")),
                ),
                request_trace: self.request_trace,
                response_trace: self.response_trace,
            },
        }
    }
}

fn check_write_echo(address: u16, echo: &[u8]) -> ModbusResult<()> {
    if echo.len() < 4 {
        return Err(ModbusError::frame(format!(
            "write echo too short: {} bytes",
            echo.len()
        )));
    }
    let echoed = u16::from_be_bytes([echo[0], echo[1]]);
    if echoed != address {
        return Err(ModbusError::protocol(format!(
            "write echo names address {}, request used {}",
            echoed, address
        )));
    }
    Ok(())
}

// ============================================================================
// Blocking facade
// ============================================================================

/// Synchronous wrapper driving a [`ModbusEngine`] on its own current-thread
/// runtime.
///
/// Must not be used from inside another tokio runtime.
pub struct BlockingEngine<T: FrameTransport> {
    runtime: tokio::runtime::Runtime,
    engine: ModbusEngine<T>,
}

impl<T: FrameTransport> BlockingEngine<T> {
    pub fn new(engine: ModbusEngine<T>) -> ModbusResult<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| ModbusError::configuration(format!("failed to build runtime: {}", e)))?;
        Ok(Self { runtime, engine })
    }

    pub fn engine(&self) -> &ModbusEngine<T> {
        &self.engine
    }

    pub fn into_inner(self) -> ModbusEngine<T> {
        self.engine
    }

    pub fn connect(&self) -> ExchangeResult<()> {
        self.runtime.block_on(self.engine.connect())
    }

    pub fn close(&self) -> ExchangeResult<()> {
        self.runtime.block_on(self.engine.close())
    }

    pub fn stats(&self) -> TransportStats {
        self.runtime.block_on(self.engine.stats())
    }

    pub fn read_raw(&self, address: impl IntoAddress, quantity: u16) -> ExchangeResult<Vec<u8>> {
        self.runtime.block_on(self.engine.read_raw(address, quantity))
    }

    pub fn read<S: RegisterScalar>(&self, address: impl IntoAddress, count: usize) -> ExchangeResult<Vec<S>> {
        self.runtime.block_on(self.engine.read::<S>(address, count))
    }

    pub fn read_one<S: RegisterScalar>(&self, address: impl IntoAddress) -> ExchangeResult<S> {
        self.runtime.block_on(self.engine.read_one::<S>(address))
    }

    pub fn read_bool(&self, address: impl IntoAddress, count: usize) -> ExchangeResult<Vec<bool>> {
        self.runtime.block_on(self.engine.read_bool(address, count))
    }

    pub fn read_value(&self, address: impl IntoAddress, data_type: DataType) -> ExchangeResult<ModbusValue> {
        self.runtime.block_on(self.engine.read_value(address, data_type))
    }

    pub fn write<S: RegisterScalar>(&self, address: impl IntoAddress, values: &[S]) -> ExchangeResult<()> {
        self.runtime.block_on(self.engine.write::<S>(address, values))
    }

    pub fn write_bool(&self, address: impl IntoAddress, values: &[bool]) -> ExchangeResult<()> {
        self.runtime.block_on(self.engine.write_bool(address, values))
    }

    pub fn write_value(&self, address: impl IntoAddress, value: &ModbusValue) -> ExchangeResult<()> {
        self.runtime.block_on(self.engine.write_value(address, value))
    }

    pub fn read_batch<S: AsRef<str>>(&self, points: &[(S, DataType)]) -> ExchangeResult<BatchValues> {
        self.runtime.block_on(self.engine.read_batch(points))
    }
}
