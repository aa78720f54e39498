//! # Transports
//!
//! Byte-stream collaborators for the engine. A transport only moves bytes:
//! framing, validation and retry policy live in [`crate::frame`] and
//! [`crate::engine`].
//!
//! | Transport        | Framing | Feature |
//! |------------------|---------|---------|
//! | [`TcpTransport`] | TCP     | default |
//! | `RtuTransport`   | RTU     | `rtu`   |
//!
//! Every call is bounded by the transport's timeout. Timeouts surface as
//! [`TransportErrorKind::Timeout`](crate::error::TransportErrorKind::Timeout),
//! peer closes as `Reset`. A failed transport drops its handle so the next
//! exchange reconnects.

use std::future::Future;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::error::{ModbusError, ModbusResult};
use crate::frame::Framing;
use crate::logging::{log_packet, PacketDirection};

/// Default per-call timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1500);

/// Byte-level transport used by [`crate::engine::ModbusEngine`].
///
/// `receive_exact(n)` must return exactly `n` bytes or fail.
pub trait FrameTransport: Send {
    /// Framing this transport carries.
    fn framing(&self) -> Framing;

    fn connect(&mut self) -> impl Future<Output = ModbusResult<()>> + Send;

    fn send(&mut self, frame: &[u8]) -> impl Future<Output = ModbusResult<()>> + Send;

    fn receive_exact(&mut self, len: usize) -> impl Future<Output = ModbusResult<Vec<u8>>> + Send;

    fn close(&mut self) -> impl Future<Output = ModbusResult<()>> + Send;

    fn is_connected(&self) -> bool;

    /// Drop any bytes already buffered on the input side.
    fn clear_input(&mut self) -> impl Future<Output = ()> + Send {
        async {}
    }
}

/// Counters for one connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub requests_sent: u64,
    pub responses_received: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl TransportStats {
    /// Fraction of sent requests that produced a valid response.
    pub fn success_rate(&self) -> f64 {
        if self.requests_sent == 0 {
            return 0.0;
        }
        self.responses_received as f64 / self.requests_sent as f64
    }

    pub(crate) fn record_error(&mut self, err: &ModbusError) {
        self.errors += 1;
        if err.is_timeout() {
            self.timeouts += 1;
        }
    }
}

fn timeout_ms(d: Duration) -> u64 {
    d.as_millis().min(u128::from(u64::MAX)) as u64
}

async fn write_all_within<W>(writer: &mut W, data: &[u8], limit: Duration) -> ModbusResult<()>
where
    W: AsyncWrite + Unpin + Send,
{
    match timeout(limit, async {
        writer.write_all(data).await?;
        writer.flush().await
    })
    .await
    {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ModbusError::from_io("send", &e)),
        Err(_) => Err(ModbusError::timeout("send", timeout_ms(limit))),
    }
}

async fn read_exact_within<R>(reader: &mut R, len: usize, limit: Duration) -> ModbusResult<Vec<u8>>
where
    R: AsyncRead + Unpin + Send,
{
    let mut buf = vec![0u8; len];
    let mut filled = 0;
    let outcome = timeout(limit, async {
        while filled < len {
            let n = reader.read(&mut buf[filled..]).await?;
            if n == 0 {
                return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof));
            }
            filled += n;
        }
        Ok::<_, std::io::Error>(())
    })
    .await;

    match outcome {
        Ok(Ok(())) => Ok(buf),
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof && filled == 0 => {
            Err(ModbusError::EmptyResponse)
        }
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(ModbusError::reset(
            format!("peer closed after {} of {} bytes", filled, len),
        )),
        Ok(Err(e)) => Err(ModbusError::from_io("receive", &e)),
        Err(_) => Err(ModbusError::timeout(
            format_args!("receive ({} of {} bytes)", filled, len),
            timeout_ms(limit),
        )),
    }
}

// ============================================================================
// TCP
// ============================================================================

/// Modbus TCP socket.
#[derive(Debug)]
pub struct TcpTransport {
    address: String,
    timeout: Duration,
    stream: Option<TcpStream>,
    packet_logging: bool,
}

impl TcpTransport {
    /// Unconnected transport for `host:port`. The engine connects on first use.
    pub fn new(address: impl Into<String>, timeout: Duration) -> Self {
        Self {
            address: address.into(),
            timeout,
            stream: None,
            packet_logging: false,
        }
    }

    pub fn with_packet_logging(mut self, enabled: bool) -> Self {
        self.packet_logging = enabled;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn stream(&mut self) -> ModbusResult<&mut TcpStream> {
        self.stream.as_mut().ok_or(ModbusError::NotConnected)
    }
}

impl FrameTransport for TcpTransport {
    fn framing(&self) -> Framing {
        Framing::Tcp
    }

    async fn connect(&mut self) -> ModbusResult<()> {
        self.stream = None;
        let stream = match timeout(self.timeout, TcpStream::connect(&self.address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(ModbusError::connection(format!(
                    "Failed to connect to {}: {}",
                    self.address, e
                )))
            }
            Err(_) => {
                return Err(ModbusError::connect_timeout(format!(
                    "Connecting to {} timed out after {}ms",
                    self.address,
                    timeout_ms(self.timeout)
                )))
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!("TCP_NODELAY not set on {}: {}", self.address, e);
        }
        debug!("Connected to {}", self.address);
        self.stream = Some(stream);
        Ok(())
    }

    async fn send(&mut self, frame: &[u8]) -> ModbusResult<()> {
        if self.packet_logging {
            log_packet("TCP", PacketDirection::Send, frame);
        }
        let limit = self.timeout;
        let result = write_all_within(self.stream()?, frame, limit).await;
        if result.is_err() {
            self.stream = None;
        }
        result
    }

    async fn receive_exact(&mut self, len: usize) -> ModbusResult<Vec<u8>> {
        let limit = self.timeout;
        let result = read_exact_within(self.stream()?, len, limit).await;
        match &result {
            Ok(bytes) if self.packet_logging => {
                log_packet("TCP", PacketDirection::Receive, bytes);
            }
            Ok(_) => {}
            Err(_) => self.stream = None,
        }
        result
    }

    async fn close(&mut self) -> ModbusResult<()> {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                debug!("Shutdown of {} reported: {}", self.address, e);
            }
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}

// ============================================================================
// RTU
// ============================================================================

#[cfg(feature = "rtu")]
pub use rtu::RtuTransport;

#[cfg(feature = "rtu")]
mod rtu {
    use super::*;
    use tokio_serial::{ClearBuffer, DataBits, Parity, SerialPort, SerialStream, StopBits};

    /// Serial line (RS-232/RS-485).
    pub struct RtuTransport {
        port_name: String,
        baud_rate: u32,
        data_bits: DataBits,
        stop_bits: StopBits,
        parity: Parity,
        timeout: Duration,
        frame_gap: Duration,
        port: Option<SerialStream>,
        packet_logging: bool,
    }

    impl RtuTransport {
        /// 8N1 at `baud_rate`.
        pub fn new(port_name: impl Into<String>, baud_rate: u32, timeout: Duration) -> Self {
            Self::with_config(
                port_name,
                baud_rate,
                DataBits::Eight,
                StopBits::One,
                Parity::None,
                timeout,
            )
        }

        pub fn with_config(
            port_name: impl Into<String>,
            baud_rate: u32,
            data_bits: DataBits,
            stop_bits: StopBits,
            parity: Parity,
            timeout: Duration,
        ) -> Self {
            Self {
                port_name: port_name.into(),
                baud_rate,
                data_bits,
                stop_bits,
                parity,
                timeout,
                frame_gap: frame_gap(baud_rate),
                port: None,
                packet_logging: false,
            }
        }

        pub fn with_packet_logging(mut self, enabled: bool) -> Self {
            self.packet_logging = enabled;
            self
        }

        pub fn baud_rate(&self) -> u32 {
            self.baud_rate
        }

        fn port(&mut self) -> ModbusResult<&mut SerialStream> {
            self.port.as_mut().ok_or(ModbusError::NotConnected)
        }
    }

    /// Silent interval of 3.5 character times; fixed 1.75ms above 19200 baud.
    pub(super) fn frame_gap(baud_rate: u32) -> Duration {
        if baud_rate == 0 || baud_rate > 19_200 {
            Duration::from_micros(1750)
        } else {
            // 11 bits per character
            Duration::from_micros(38_500_000 / u64::from(baud_rate))
        }
    }

    impl FrameTransport for RtuTransport {
        fn framing(&self) -> Framing {
            Framing::Rtu
        }

        async fn connect(&mut self) -> ModbusResult<()> {
            self.port = None;
            let builder = tokio_serial::new(&self.port_name, self.baud_rate)
                .data_bits(self.data_bits)
                .stop_bits(self.stop_bits)
                .parity(self.parity)
                .timeout(self.timeout);
            let port = SerialStream::open(&builder).map_err(|e| {
                ModbusError::connection(format!(
                    "Failed to open serial port {}: {}",
                    self.port_name, e
                ))
            })?;
            debug!("Opened {} at {} baud", self.port_name, self.baud_rate);
            self.port = Some(port);
            Ok(())
        }

        async fn send(&mut self, frame: &[u8]) -> ModbusResult<()> {
            tokio::time::sleep(self.frame_gap).await;
            if self.packet_logging {
                log_packet("RTU", PacketDirection::Send, frame);
            }
            let limit = self.timeout;
            let result = write_all_within(self.port()?, frame, limit).await;
            if result.is_err() {
                self.port = None;
            }
            result
        }

        async fn receive_exact(&mut self, len: usize) -> ModbusResult<Vec<u8>> {
            let limit = self.timeout;
            let result = read_exact_within(self.port()?, len, limit).await;
            if let Ok(bytes) = &result {
                if self.packet_logging {
                    log_packet("RTU", PacketDirection::Receive, bytes);
                }
            }
            // A serial line stays open across timeouts; the engine clears input before retrying.
            result
        }

        async fn close(&mut self) -> ModbusResult<()> {
            self.port = None;
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.port.is_some()
        }

        async fn clear_input(&mut self) {
            if let Some(port) = &self.port {
                if let Err(e) = port.clear(ClearBuffer::Input) {
                    debug!("Clearing input on {} failed: {}", self.port_name, e);
                }
            }
        }
    }
}
