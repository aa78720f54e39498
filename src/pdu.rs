//! Request PDU construction.
//!
//! A PDU lives in a fixed stack buffer sized to the protocol maximum; the
//! frame layer wraps it in a TCP header or an RTU unit id + CRC.

use tracing::trace;

use crate::codec::pack_coils;
use crate::constants::{
    is_read_function, COIL_OFF, COIL_ON, FC_WRITE_MULTIPLE_COILS, FC_WRITE_MULTIPLE_REGISTERS,
    FC_WRITE_SINGLE_COIL, FC_WRITE_SINGLE_REGISTER, MAX_PDU_SIZE, MAX_WRITE_COILS,
    MAX_WRITE_REGISTERS,
};
use crate::error::{ModbusError, ModbusResult};

/// Function code + payload, without any transport framing.
#[derive(Debug, Clone)]
pub struct ModbusPdu {
    data: [u8; MAX_PDU_SIZE],
    len: usize,
}

impl ModbusPdu {
    #[inline]
    pub fn new() -> Self {
        Self {
            data: [0; MAX_PDU_SIZE],
            len: 0,
        }
    }

    pub fn from_slice(data: &[u8]) -> ModbusResult<Self> {
        let mut pdu = Self::new();
        pdu.extend(data)?;
        Ok(pdu)
    }

    #[inline]
    pub fn push(&mut self, byte: u8) -> ModbusResult<()> {
        if self.len >= MAX_PDU_SIZE {
            return Err(ModbusError::protocol("PDU buffer full"));
        }
        self.data[self.len] = byte;
        self.len += 1;
        Ok(())
    }

    /// Big-endian u16.
    #[inline]
    pub fn push_u16(&mut self, value: u16) -> ModbusResult<()> {
        self.extend(&value.to_be_bytes())
    }

    pub fn extend(&mut self, data: &[u8]) -> ModbusResult<()> {
        if self.len + data.len() > MAX_PDU_SIZE {
            return Err(ModbusError::protocol(format!(
                "PDU would exceed {} bytes ({} + {})",
                MAX_PDU_SIZE,
                self.len,
                data.len()
            )));
        }
        self.data[self.len..self.len + data.len()].copy_from_slice(data);
        self.len += data.len();
        Ok(())
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn function_code(&self) -> Option<u8> {
        self.as_slice().first().copied()
    }

    /// Payload after the function code.
    #[inline]
    pub fn body(&self) -> &[u8] {
        self.as_slice().get(1..).unwrap_or(&[])
    }
}

impl Default for ModbusPdu {
    fn default() -> Self {
        Self::new()
    }
}

/// Human-readable name of a function code (exception bit ignored).
pub fn function_name(function: u8) -> &'static str {
    match function & 0x7F {
        0x01 => "Read Coils",
        0x02 => "Read Discrete Inputs",
        0x03 => "Read Holding Registers",
        0x04 => "Read Input Registers",
        0x05 => "Write Single Coil",
        0x06 => "Write Single Register",
        0x0F => "Write Multiple Coils",
        0x10 => "Write Multiple Registers",
        _ => "Unknown Function",
    }
}

/// Fluent PDU builder.
pub struct PduBuilder {
    pdu: ModbusPdu,
}

impl Default for PduBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PduBuilder {
    #[inline]
    pub fn new() -> Self {
        Self {
            pdu: ModbusPdu::new(),
        }
    }

    #[inline]
    pub fn function_code(mut self, fc: u8) -> ModbusResult<Self> {
        self.pdu.push(fc)?;
        Ok(self)
    }

    #[inline]
    pub fn word(mut self, value: u16) -> ModbusResult<Self> {
        self.pdu.push_u16(value)?;
        Ok(self)
    }

    #[inline]
    pub fn byte(mut self, b: u8) -> ModbusResult<Self> {
        self.pdu.push(b)?;
        Ok(self)
    }

    #[inline]
    pub fn data(mut self, data: &[u8]) -> ModbusResult<Self> {
        self.pdu.extend(data)?;
        Ok(self)
    }

    pub fn build(self) -> ModbusPdu {
        if let Some(fc) = self.pdu.function_code() {
            trace!(
                "PDU built: FC={:02X} ({}), len={}",
                fc,
                function_name(fc),
                self.pdu.len()
            );
        }
        self.pdu
    }

    /// FC01-04: `{address, quantity}`.
    pub fn read_request(function: u8, address: u16, quantity: u16) -> ModbusResult<ModbusPdu> {
        if !is_read_function(function) {
            return Err(ModbusError::invalid_function(function));
        }
        if quantity == 0 {
            return Err(ModbusError::invalid_data("read quantity must be at least 1"));
        }
        Ok(PduBuilder::new()
            .function_code(function)?
            .word(address)?
            .word(quantity)?
            .build())
    }

    /// Coil write. One coil uses FC05 unless `force_multiple`; otherwise FC15
    /// with LSB-first packed bits.
    pub fn write_coils(
        address: u16,
        values: &[bool],
        force_multiple: bool,
    ) -> ModbusResult<ModbusPdu> {
        match values {
            [] => Err(ModbusError::invalid_data("no coil values to write")),
            [single] if !force_multiple => Ok(PduBuilder::new()
                .function_code(FC_WRITE_SINGLE_COIL)?
                .word(address)?
                .word(if *single { COIL_ON } else { COIL_OFF })?
                .build()),
            _ => {
                if values.len() > MAX_WRITE_COILS {
                    return Err(ModbusError::invalid_data(format!(
                        "{} coils exceeds write limit {}",
                        values.len(),
                        MAX_WRITE_COILS
                    )));
                }
                let packed = pack_coils(values);
                Ok(PduBuilder::new()
                    .function_code(FC_WRITE_MULTIPLE_COILS)?
                    .word(address)?
                    .word(values.len() as u16)?
                    .byte(packed.len() as u8)?
                    .data(&packed)?
                    .build())
            }
        }
    }

    /// Register write from already-marshaled big-endian register bytes.
    ///
    /// Payloads of exactly 2 bytes use FC06 unless `force_multiple`;
    /// anything wider always uses FC16.
    pub fn write_registers(
        address: u16,
        payload: &[u8],
        force_multiple: bool,
    ) -> ModbusResult<ModbusPdu> {
        if payload.is_empty() || payload.len() % 2 != 0 {
            return Err(ModbusError::invalid_data(format!(
                "register payload must be a non-empty even byte count, got {}",
                payload.len()
            )));
        }
        let registers = payload.len() / 2;
        if registers > MAX_WRITE_REGISTERS {
            return Err(ModbusError::invalid_data(format!(
                "{} registers exceeds write limit {}",
                registers, MAX_WRITE_REGISTERS
            )));
        }

        if registers == 1 && !force_multiple {
            return Ok(PduBuilder::new()
                .function_code(FC_WRITE_SINGLE_REGISTER)?
                .word(address)?
                .data(payload)?
                .build());
        }

        Ok(PduBuilder::new()
            .function_code(FC_WRITE_MULTIPLE_REGISTERS)?
            .word(address)?
            .word(registers as u16)?
            .byte(payload.len() as u8)?
            .data(payload)?
            .build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_and_body() {
        let mut pdu = ModbusPdu::new();
        assert!(pdu.is_empty());
        pdu.push(0x03).unwrap();
        pdu.push_u16(0x0100).unwrap();
        pdu.push_u16(0x000A).unwrap();
        assert_eq!(pdu.as_slice(), &[0x03, 0x01, 0x00, 0x00, 0x0A]);
        assert_eq!(pdu.body(), &[0x01, 0x00, 0x00, 0x0A]);
        assert_eq!(pdu.function_code(), Some(0x03));
    }

    #[test]
    fn test_overflow_rejected() {
        let mut pdu = ModbusPdu::from_slice(&[0u8; MAX_PDU_SIZE]).unwrap();
        assert!(pdu.push(1).is_err());
        assert!(ModbusPdu::from_slice(&[0u8; MAX_PDU_SIZE + 1]).is_err());
    }

    #[test]
    fn test_read_request() {
        let pdu = PduBuilder::read_request(0x03, 0x006B, 3).unwrap();
        assert_eq!(pdu.as_slice(), &[0x03, 0x00, 0x6B, 0x00, 0x03]);

        assert!(matches!(
            PduBuilder::read_request(0x06, 0, 1),
            Err(ModbusError::InvalidFunction { code: 0x06 })
        ));
        assert!(PduBuilder::read_request(0x03, 0, 0).is_err());
    }

    #[test]
    fn test_single_coil() {
        let on = PduBuilder::write_coils(0x00AC, &[true], false).unwrap();
        assert_eq!(on.as_slice(), &[0x05, 0x00, 0xAC, 0xFF, 0x00]);
        let off = PduBuilder::write_coils(0x00AC, &[false], false).unwrap();
        assert_eq!(off.as_slice(), &[0x05, 0x00, 0xAC, 0x00, 0x00]);
    }

    #[test]
    fn test_multiple_coils() {
        // 10 coils starting at 19: 1,0,1,1,0,0,1,1 | 1,0
        let values = [
            true, false, true, true, false, false, true, true, true, false,
        ];
        let pdu = PduBuilder::write_coils(0x0013, &values, false).unwrap();
        assert_eq!(
            pdu.as_slice(),
            &[0x0F, 0x00, 0x13, 0x00, 0x0A, 0x02, 0xCD, 0x01]
        );

        let forced = PduBuilder::write_coils(0x0000, &[true], true).unwrap();
        assert_eq!(forced.as_slice(), &[0x0F, 0x00, 0x00, 0x00, 0x01, 0x01, 0x01]);
    }

    #[test]
    fn test_single_register() {
        let pdu = PduBuilder::write_registers(0x0001, &[0x00, 0x03], false).unwrap();
        assert_eq!(pdu.as_slice(), &[0x06, 0x00, 0x01, 0x00, 0x03]);
    }

    #[test]
    fn test_wide_value_uses_multiple() {
        let pdu = PduBuilder::write_registers(0x0001, &[0x00, 0x0A, 0x01, 0x02], false).unwrap();
        assert_eq!(
            pdu.as_slice(),
            &[0x10, 0x00, 0x01, 0x00, 0x02, 0x04, 0x00, 0x0A, 0x01, 0x02]
        );

        let forced = PduBuilder::write_registers(0x0064, &[0x12, 0x34], true).unwrap();
        assert_eq!(
            forced.as_slice(),
            &[0x10, 0x00, 0x64, 0x00, 0x01, 0x02, 0x12, 0x34]
        );
    }

    #[test]
    fn test_bad_register_payloads() {
        assert!(PduBuilder::write_registers(0, &[], false).is_err());
        assert!(PduBuilder::write_registers(0, &[1, 2, 3], false).is_err());
        assert!(PduBuilder::write_registers(0, &[0u8; 248], false).is_err());
        assert!(PduBuilder::write_coils(0, &[], false).is_err());
    }

    #[test]
    fn test_function_names() {
        assert_eq!(function_name(0x03), "Read Holding Registers");
        assert_eq!(function_name(0x83), "Read Holding Registers");
        assert_eq!(function_name(0x2B), "Unknown Function");
    }
}
