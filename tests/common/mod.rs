//! Test Common Utilities
//!
//! In-memory Modbus slave implementing `FrameTransport`, shared by the
//! integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use modbus_engine::crc::append_crc16;
use modbus_engine::{
    EngineConfig, Frame, FrameTransport, Framing, LogCallback, LogLevel,
    ModbusEngine, ModbusError, ModbusResult,
};

/// Addresses at or above this answer with "illegal data address".
pub const MEMORY_SIZE: usize = 10_000;

/// One-shot misbehaviour applied to the next request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Swallow the request, answer nothing.
    Drop,
    /// Answer with a damaged RTU CRC.
    CorruptCrc,
    /// Answer with a check-head that does not match the request.
    StaleCheckHead,
    /// Answer with this exception code.
    Exception(u8),
}

/// Register and coil tables of the simulated slave.
#[derive(Debug)]
pub struct Memory {
    pub holding: Vec<u16>,
    pub input: Vec<u16>,
    pub coils: Vec<bool>,
    pub discrete: Vec<bool>,
}

impl Default for Memory {
    fn default() -> Self {
        Self {
            holding: vec![0; MEMORY_SIZE],
            input: vec![0; MEMORY_SIZE],
            coils: vec![false; MEMORY_SIZE],
            discrete: vec![false; MEMORY_SIZE],
        }
    }
}

/// State shared between a [`SimDevice`] and the test body.
#[derive(Debug, Default)]
pub struct DeviceState {
    pub memory: Mutex<Memory>,
    pub faults: Mutex<VecDeque<Fault>>,
    /// Every request frame received, in order.
    pub requests: Mutex<Vec<Vec<u8>>>,
    pub connects: AtomicU32,
    in_flight: AtomicBool,
    /// Set when a request arrived while another was still unanswered.
    pub interleaved: AtomicBool,
}

impl DeviceState {
    pub fn set_holding(&self, address: u16, words: &[u16]) {
        let mut memory = self.memory.lock().unwrap();
        let start = usize::from(address);
        memory.holding[start..start + words.len()].copy_from_slice(words);
    }

    pub fn holding(&self, address: u16, count: usize) -> Vec<u16> {
        let memory = self.memory.lock().unwrap();
        let start = usize::from(address);
        memory.holding[start..start + count].to_vec()
    }

    pub fn set_input(&self, address: u16, words: &[u16]) {
        let mut memory = self.memory.lock().unwrap();
        let start = usize::from(address);
        memory.input[start..start + words.len()].copy_from_slice(words);
    }

    pub fn set_coils(&self, address: u16, bits: &[bool]) {
        let mut memory = self.memory.lock().unwrap();
        let start = usize::from(address);
        memory.coils[start..start + bits.len()].copy_from_slice(bits);
    }

    pub fn coils(&self, address: u16, count: usize) -> Vec<bool> {
        let memory = self.memory.lock().unwrap();
        let start = usize::from(address);
        memory.coils[start..start + count].to_vec()
    }

    pub fn inject(&self, fault: Fault) {
        self.faults.lock().unwrap().push_back(fault);
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn was_interleaved(&self) -> bool {
        self.interleaved.load(Ordering::SeqCst)
    }
}

/// Simulated slave speaking TCP or RTU framing.
#[derive(Debug)]
pub struct SimDevice {
    framing: Framing,
    connected: bool,
    inbox: VecDeque<u8>,
    state: Arc<DeviceState>,
}

impl SimDevice {
    pub fn new(framing: Framing) -> (Self, Arc<DeviceState>) {
        let state = Arc::new(DeviceState::default());
        (
            Self {
                framing,
                connected: false,
                inbox: VecDeque::new(),
                state: Arc::clone(&state),
            },
            state,
        )
    }

    fn respond(&self, request: &[u8]) -> Option<Vec<u8>> {
        let frame = Frame::decode(self.framing, request).ok()?;
        let fault = self.state.faults.lock().unwrap().pop_front();
        if fault == Some(Fault::Drop) {
            return None;
        }

        let function = frame.function_code();
        let pdu = match fault {
            Some(Fault::Exception(code)) => vec![function | 0x80, code],
            _ => match self.execute(function, frame.pdu()) {
                Ok(body) => {
                    let mut pdu = vec![function];
                    pdu.extend(body);
                    pdu
                }
                Err(code) => vec![function | 0x80, code],
            },
        };

        let reply = match self.framing {
            Framing::Tcp => {
                let mut check_head = frame.check_head().unwrap_or_default();
                if fault == Some(Fault::StaleCheckHead) {
                    check_head[0] ^= 0xFF;
                }
                let mut out = vec![check_head[0], check_head[1], 0x00, 0x00];
                out.extend(((pdu.len() + 1) as u16).to_be_bytes());
                out.push(frame.unit_id());
                out.extend(pdu);
                out
            }
            Framing::Rtu => {
                let mut out = vec![frame.unit_id()];
                out.extend(pdu);
                append_crc16(&mut out);
                if fault == Some(Fault::CorruptCrc) {
                    let last = out.len() - 1;
                    out[last] ^= 0x01;
                }
                out
            }
        };
        Some(reply)
    }

    /// Run one request body against memory. `Err` carries an exception code.
    fn execute(&self, function: u8, body: &[u8]) -> Result<Vec<u8>, u8> {
        if body.len() < 4 {
            return Err(0x03);
        }
        let address = usize::from(u16::from_be_bytes([body[0], body[1]]));
        let word = u16::from_be_bytes([body[2], body[3]]);
        let mut memory = self.state.memory.lock().unwrap();

        let in_range = |count: usize| address + count <= MEMORY_SIZE;
        match function {
            0x01 | 0x02 => {
                let count = usize::from(word);
                if !in_range(count) {
                    return Err(0x02);
                }
                let table = if function == 0x01 {
                    &memory.coils
                } else {
                    &memory.discrete
                };
                let mut packed = vec![0u8; count.div_ceil(8)];
                for (i, on) in table[address..address + count].iter().enumerate() {
                    if *on {
                        packed[i / 8] |= 1 << (i % 8);
                    }
                }
                let mut out = vec![packed.len() as u8];
                out.extend(packed);
                Ok(out)
            }
            0x03 | 0x04 => {
                let count = usize::from(word);
                if !in_range(count) {
                    return Err(0x02);
                }
                let table = if function == 0x03 {
                    &memory.holding
                } else {
                    &memory.input
                };
                let mut out = vec![(count * 2) as u8];
                for value in &table[address..address + count] {
                    out.extend(value.to_be_bytes());
                }
                Ok(out)
            }
            0x05 => {
                if !in_range(1) {
                    return Err(0x02);
                }
                memory.coils[address] = word == 0xFF00;
                Ok(body[..4].to_vec())
            }
            0x06 => {
                if !in_range(1) {
                    return Err(0x02);
                }
                memory.holding[address] = word;
                Ok(body[..4].to_vec())
            }
            0x0F => {
                let count = usize::from(word);
                if !in_range(count) {
                    return Err(0x02);
                }
                let data = &body[5..];
                for i in 0..count {
                    memory.coils[address + i] = data[i / 8] & (1 << (i % 8)) != 0;
                }
                Ok(body[..4].to_vec())
            }
            0x10 => {
                let count = usize::from(word);
                if !in_range(count) {
                    return Err(0x02);
                }
                for (i, pair) in body[5..].chunks_exact(2).enumerate() {
                    memory.holding[address + i] = u16::from_be_bytes([pair[0], pair[1]]);
                }
                Ok(body[..4].to_vec())
            }
            _ => Err(0x01),
        }
    }
}

impl FrameTransport for SimDevice {
    fn framing(&self) -> Framing {
        self.framing
    }

    async fn connect(&mut self) -> ModbusResult<()> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        self.connected = true;
        Ok(())
    }

    async fn send(&mut self, frame: &[u8]) -> ModbusResult<()> {
        if !self.connected {
            return Err(ModbusError::NotConnected);
        }
        if self.state.in_flight.swap(true, Ordering::SeqCst) {
            self.state.interleaved.store(true, Ordering::SeqCst);
        }
        tokio::task::yield_now().await;

        self.state.requests.lock().unwrap().push(frame.to_vec());
        if let Some(reply) = self.respond(frame) {
            self.inbox.extend(reply);
        }
        Ok(())
    }

    async fn receive_exact(&mut self, len: usize) -> ModbusResult<Vec<u8>> {
        tokio::task::yield_now().await;
        if self.inbox.len() < len {
            self.inbox.clear();
            self.state.in_flight.store(false, Ordering::SeqCst);
            return Err(ModbusError::timeout("receive", 50));
        }
        let chunk: Vec<u8> = self.inbox.drain(..len).collect();
        if self.inbox.is_empty() {
            self.state.in_flight.store(false, Ordering::SeqCst);
        }
        Ok(chunk)
    }

    async fn close(&mut self) -> ModbusResult<()> {
        self.connected = false;
        self.inbox.clear();
        self.state.in_flight.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn clear_input(&mut self) {
        self.inbox.clear();
        self.state.in_flight.store(false, Ordering::SeqCst);
    }
}

/// Engine over a fresh simulated device.
pub fn engine(framing: Framing, config: EngineConfig) -> (ModbusEngine<SimDevice>, Arc<DeviceState>) {
    let (device, state) = SimDevice::new(framing);
    let engine = ModbusEngine::new(device, config).expect("valid config");
    (engine, state)
}

/// Log callback that collects every warning.
pub fn warning_sink() -> (LogCallback, Arc<Mutex<Vec<String>>>) {
    let lines = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&lines);
    let callback: LogCallback = Arc::new(move |level: LogLevel, message: &str| {
        if level == LogLevel::Warn {
            sink.lock().unwrap().push(message.to_string());
        }
    });
    (callback, lines)
}
