use bytes::BytesMut;
use serde::Serialize;
use std::fmt;
use std::ops::Range;

use super::crc::{crc16_update, crc_bytes, verify_crc, CRC_INIT};
use crate::utils::error::ModbusError;

pub const FUNCTION_READ_HOLDING_REGISTERS: u8 = 0x03;
/// Address + function + byte count + two data bytes + CRC.
pub const MIN_RESPONSE_LEN: usize = 7;
pub const REQUEST_LEN: usize = 8;
/// Reply size for exactly one 16-bit register.
pub const SINGLE_REGISTER_BYTE_COUNT: u8 = 2;
pub const MIN_SLAVE_ADDRESS: u8 = 1;
pub const MAX_SLAVE_ADDRESS: u8 = 247;

/// Read of a single holding register. Immutable once built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReadRequest {
    slave_address: u8,
    register_address: u16,
}

impl ReadRequest {
    pub fn new(slave_address: u8, register_address: u16) -> Result<Self, ModbusError> {
        validate_slave_address(slave_address)?;
        Ok(Self {
            slave_address,
            register_address,
        })
    }

    pub fn slave_address(&self) -> u8 {
        self.slave_address
    }

    pub fn register_address(&self) -> u16 {
        self.register_address
    }

    pub fn function_code(&self) -> u8 {
        FUNCTION_READ_HOLDING_REGISTERS
    }

    pub fn quantity(&self) -> u16 {
        1
    }

    pub fn encode(&self) -> Vec<u8> {
        encode_read_request(self.slave_address, self.register_address)
    }
}

pub fn validate_slave_address(slave_address: u8) -> Result<(), ModbusError> {
    if !(MIN_SLAVE_ADDRESS..=MAX_SLAVE_ADDRESS).contains(&slave_address) {
        return Err(ModbusError::ConfigError(format!(
            "Invalid slave address: {}. Must be {}-{}",
            slave_address, MIN_SLAVE_ADDRESS, MAX_SLAVE_ADDRESS
        )));
    }
    Ok(())
}

/// `[slave, 0x03, reg_hi, reg_lo, 0x00, 0x01, crc_lo, crc_hi]`.
///
/// The slave address is expected to be validated by the caller.
pub fn encode_read_request(slave: u8, register: u16) -> Vec<u8> {
    let mut frame = Vec::with_capacity(REQUEST_LEN);
    frame.push(slave);
    frame.push(FUNCTION_READ_HOLDING_REGISTERS);
    frame.extend_from_slice(&register.to_be_bytes());
    frame.extend_from_slice(&1u16.to_be_bytes());

    let crc = crc_bytes(&frame);
    frame.extend_from_slice(&crc);
    frame
}

/// Finds the earliest-starting, then shortest, CRC-valid window of at least
/// [`MIN_RESPONSE_LEN`] bytes. Returns the frame and the bytes after it.
///
/// Serial reads carry no framing, so noise or a partial frame may precede the real
/// one. The search is greedy and can lock onto a window inside noise that happens to
/// checksum correctly.
pub fn extract_frame(buffer: &[u8]) -> Option<(&[u8], &[u8])> {
    let mut scanner = FrameScanner::new();
    scanner
        .push(buffer)
        .map(|window| (&buffer[window.clone()], &buffer[window.end..]))
}

/// Incremental form of [`extract_frame`] for a receive buffer that only grows.
///
/// Windows ending in bytes already scanned were rejected before and stay rejected,
/// so each push only tests windows that end inside the new chunk. A running CRC is
/// kept per candidate start, which makes the work per received byte linear in the
/// buffer length. Discard the scanner once it has returned a frame.
#[derive(Debug, Clone)]
pub struct FrameScanner {
    buffer: BytesMut,
    /// `crcs[start]` is the CRC of `buffer[start..folded]`.
    crcs: Vec<u16>,
    folded: usize,
}

impl Default for FrameScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameScanner {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(2 * MIN_RESPONSE_LEN),
            crcs: vec![CRC_INIT],
            folded: 0,
        }
    }

    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Appends `chunk` and returns the range of the earliest-starting, then shortest,
    /// CRC-valid window in the whole buffer, if one now exists.
    pub fn push(&mut self, chunk: &[u8]) -> Option<Range<usize>> {
        let scanned = self.buffer.len();
        self.buffer.extend_from_slice(chunk);

        let mut best: Option<Range<usize>> = None;
        for end in (scanned + 1).max(MIN_RESPONSE_LEN)..=self.buffer.len() {
            self.fold_until(end - 2);

            let expected = u16::from_le_bytes([self.buffer[end - 2], self.buffer[end - 1]]);
            let mut limit = end - MIN_RESPONSE_LEN + 1;
            if let Some(found) = &best {
                limit = limit.min(found.start);
            }
            if let Some(start) = self.crcs[..limit].iter().position(|&crc| crc == expected) {
                best = Some(start..end);
            }
        }
        best
    }

    fn fold_until(&mut self, data_end: usize) {
        while self.folded < data_end {
            let byte = self.buffer[self.folded];
            for crc in self.crcs.iter_mut() {
                *crc = crc16_update(*crc, byte);
            }
            self.crcs.push(CRC_INIT);
            self.folded += 1;
        }
    }
}

pub fn validate_frame(frame: &[u8]) -> bool {
    frame.len() >= MIN_RESPONSE_LEN && verify_crc(frame)
}

/// Decoded single-register value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum RegisterValue {
    Unsigned(u16),
    Signed(i16),
}

impl RegisterValue {
    pub fn from_raw(raw: u16, signed: bool) -> Self {
        if signed {
            RegisterValue::Signed(raw as i16)
        } else {
            RegisterValue::Unsigned(raw)
        }
    }

    pub fn as_i32(&self) -> i32 {
        match self {
            RegisterValue::Unsigned(v) => *v as i32,
            RegisterValue::Signed(v) => *v as i32,
        }
    }
}

impl fmt::Display for RegisterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_i32())
    }
}

/// Structural check of a CRC-valid response against the request it answers, then
/// big-endian decode of its payload.
pub fn decode_register(frame: &[u8], request: &ReadRequest, signed: bool) -> Result<RegisterValue, ModbusError> {
    if frame.len() < MIN_RESPONSE_LEN {
        return Err(ModbusError::ProtocolError(format!(
            "Response too short: {} bytes",
            frame.len()
        )));
    }

    if frame[0] != request.slave_address() {
        return Err(ModbusError::ProtocolError(format!(
            "Slave address mismatch: expected {}, got {}",
            request.slave_address(),
            frame[0]
        )));
    }

    if frame[1] != request.function_code() {
        return Err(ModbusError::ProtocolError(format!(
            "Function code mismatch: expected 0x{:02X}, got 0x{:02X}",
            request.function_code(),
            frame[1]
        )));
    }

    let byte_count = frame[2];
    if byte_count != SINGLE_REGISTER_BYTE_COUNT {
        return Err(ModbusError::ProtocolError(format!(
            "Bad byte count: expected {}, got {}",
            SINGLE_REGISTER_BYTE_COUNT, byte_count
        )));
    }

    if frame.len() != MIN_RESPONSE_LEN {
        return Err(ModbusError::ProtocolError(format!(
            "Bad frame length: expected {}, got {}",
            MIN_RESPONSE_LEN,
            frame.len()
        )));
    }

    let raw = u16::from_be_bytes([frame[3], frame[4]]);
    Ok(RegisterValue::from_raw(raw, signed))
}
