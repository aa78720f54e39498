//! # Logging
//!
//! The library logs through `tracing`. Applications that do not run a
//! `tracing` subscriber, or that want library messages routed into their own
//! log sink, can install a [`LogCallback`] on the engine; every message sent
//! through a [`CallbackLogger`] goes to both.
//!
//! Packet traces are rendered with [`format_hex_packet`] as uppercase,
//! space-separated bytes (`"01 03 00 00 00 0A C5 CD"`).

use std::fmt;
use std::sync::Arc;

use tracing::{debug, error, info, trace, warn};

/// Severity passed to a [`LogCallback`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Application hook receiving library log lines.
pub type LogCallback = Arc<dyn Fn(LogLevel, &str) + Send + Sync>;

/// Forwards messages to `tracing` and, when installed, to a callback.
#[derive(Clone, Default)]
pub struct CallbackLogger {
    callback: Option<LogCallback>,
    min_level: Option<LogLevel>,
}

impl fmt::Debug for CallbackLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackLogger")
            .field("callback", &self.callback.is_some())
            .field("min_level", &self.min_level)
            .finish()
    }
}

impl CallbackLogger {
    pub fn new(callback: Option<LogCallback>) -> Self {
        Self {
            callback,
            min_level: None,
        }
    }

    /// Drop callback messages below `level`. `tracing` output is unaffected.
    pub fn with_min_level(mut self, level: LogLevel) -> Self {
        self.min_level = Some(level);
        self
    }

    pub fn has_callback(&self) -> bool {
        self.callback.is_some()
    }

    pub fn log(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Trace => trace!("{}", message),
            LogLevel::Debug => debug!("{}", message),
            LogLevel::Info => info!("{}", message),
            LogLevel::Warn => warn!("{}", message),
            LogLevel::Error => error!("{}", message),
        }
        if let Some(callback) = &self.callback {
            if self.min_level.map_or(true, |min| level >= min) {
                callback(level, message);
            }
        }
    }

    pub fn debug(&self, message: &str) {
        self.log(LogLevel::Debug, message);
    }

    pub fn info(&self, message: &str) {
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: &str) {
        self.log(LogLevel::Warn, message);
    }

    pub fn error(&self, message: &str) {
        self.log(LogLevel::Error, message);
    }
}

/// Uppercase hex bytes separated by spaces.
pub fn format_hex_packet(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Packet direction for [`log_packet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    Send,
    Receive,
}

impl fmt::Display for PacketDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketDirection::Send => f.write_str("TX"),
            PacketDirection::Receive => f.write_str("RX"),
        }
    }
}

/// Emit one packet line at info level.
pub fn log_packet(protocol: &str, direction: PacketDirection, data: &[u8]) {
    info!("[MODBUS-{}] {} {}", protocol, direction, format_hex_packet(data));
}
