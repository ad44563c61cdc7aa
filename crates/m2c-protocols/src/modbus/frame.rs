//! ---
//! m2c_section: "05-networking-external-interfaces"
//! m2c_subsection: "module"
//! m2c_type: "source"
//! m2c_scope: "code"
//! m2c_description: "Modbus-TCP MBAP framing for read function codes 1-4."
//! m2c_version: "v0.1.0"
//! m2c_owner: "tbd"
//! ---
use bytes::{Buf, BufMut, BytesMut};
use m2c_model::ModbusCommand;

use crate::{ProtocolError, Result};

pub const MBAP_LEN: usize = 7;
const PROTOCOL_ID: u16 = 0;

/// One read request: MBAP header plus function code, start address and count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRequest {
    pub transaction: u16,
    pub unit: u8,
    pub command: ModbusCommand,
    pub address: u16,
    pub count: u16,
}

impl ReadRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(MBAP_LEN + 5);
        buf.put_u16(self.transaction);
        buf.put_u16(PROTOCOL_ID);
        buf.put_u16(6);
        buf.put_u8(self.unit);
        buf.put_u8(self.command.function_code());
        buf.put_u16(self.address);
        buf.put_u16(self.count);
        buf.to_vec()
    }

    pub fn decode(frame: &[u8]) -> Result<Self> {
        let (transaction, unit, mut pdu) = split_adu(frame)?;
        if pdu.remaining() != 5 {
            return Err(ProtocolError::frame("read request pdu must be 5 bytes"));
        }
        let command = command_for(pdu.get_u8())?;
        Ok(Self {
            transaction,
            unit,
            command,
            address: pdu.get_u16(),
            count: pdu.get_u16(),
        })
    }
}

fn command_for(function: u8) -> Result<ModbusCommand> {
    match function {
        0x01 => Ok(ModbusCommand::ReadCoils),
        0x02 => Ok(ModbusCommand::ReadDiscreteInputs),
        0x03 => Ok(ModbusCommand::ReadHoldingRegisters),
        0x04 => Ok(ModbusCommand::ReadInputRegisters),
        other => Err(ProtocolError::frame(format!("unsupported function {other:#04x}"))),
    }
}

/// Length of the whole ADU announced by an MBAP header.
pub fn adu_len(header: &[u8]) -> Result<usize> {
    if header.len() < MBAP_LEN {
        return Err(ProtocolError::frame("mbap header too short"));
    }
    let length = usize::from(u16::from_be_bytes([header[4], header[5]]));
    if length < 2 {
        return Err(ProtocolError::frame("mbap length too small"));
    }
    Ok(6 + length)
}

fn split_adu(frame: &[u8]) -> Result<(u16, u8, &[u8])> {
    let total = adu_len(frame)?;
    if frame.len() != total {
        return Err(ProtocolError::frame(format!(
            "mbap announces {total} bytes, frame has {}",
            frame.len()
        )));
    }
    let mut header = &frame[..MBAP_LEN];
    let transaction = header.get_u16();
    if header.get_u16() != PROTOCOL_ID {
        return Err(ProtocolError::frame("protocol id is not modbus"));
    }
    let _length = header.get_u16();
    let unit = header.get_u8();
    Ok((transaction, unit, &frame[MBAP_LEN..]))
}

/// Decoded read payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadResponse {
    Bits(Vec<bool>),
    Registers(Vec<u16>),
}

impl ReadResponse {
    pub fn len(&self) -> usize {
        match self {
            ReadResponse::Bits(bits) => bits.len(),
            ReadResponse::Registers(registers) => registers.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Response frame for `request`, as a server would send it.
    pub fn encode(&self, request: &ReadRequest) -> Vec<u8> {
        let mut data = BytesMut::new();
        match self {
            ReadResponse::Bits(bits) => {
                let mut packed = vec![0u8; bits.len().div_ceil(8)];
                for (index, bit) in bits.iter().enumerate() {
                    if *bit {
                        packed[index / 8] |= 1 << (index % 8);
                    }
                }
                data.put_slice(&packed);
            }
            ReadResponse::Registers(registers) => {
                for register in registers {
                    data.put_u16(*register);
                }
            }
        }
        let mut buf = BytesMut::with_capacity(MBAP_LEN + 2 + data.len());
        buf.put_u16(request.transaction);
        buf.put_u16(PROTOCOL_ID);
        buf.put_u16((3 + data.len()) as u16);
        buf.put_u8(request.unit);
        buf.put_u8(request.command.function_code());
        buf.put_u8(data.len() as u8);
        buf.put_slice(&data);
        buf.to_vec()
    }
}

/// Exception response frame for `request`.
pub fn encode_exception(request: &ReadRequest, code: u8) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(MBAP_LEN + 2);
    buf.put_u16(request.transaction);
    buf.put_u16(PROTOCOL_ID);
    buf.put_u16(3);
    buf.put_u8(request.unit);
    buf.put_u8(request.command.function_code() | 0x80);
    buf.put_u8(code);
    buf.to_vec()
}

/// Decode the response to `request`, checking transaction, unit and function.
pub fn decode_response(request: &ReadRequest, frame: &[u8]) -> Result<ReadResponse> {
    let (transaction, unit, mut pdu) = split_adu(frame)?;
    if transaction != request.transaction || unit != request.unit {
        return Err(ProtocolError::frame(format!(
            "response for transaction {transaction} unit {unit}, expected {} unit {}",
            request.transaction, request.unit
        )));
    }
    if !pdu.has_remaining() {
        return Err(ProtocolError::frame("empty pdu"));
    }
    let function = pdu.get_u8();
    let expected = request.command.function_code();
    if function == expected | 0x80 {
        let code = if pdu.has_remaining() { pdu.get_u8() } else { 0 };
        return Err(ProtocolError::ModbusException {
            function: expected,
            code,
        });
    }
    if function != expected {
        return Err(ProtocolError::frame(format!(
            "function {function:#04x} does not answer {expected:#04x}"
        )));
    }
    if !pdu.has_remaining() {
        return Err(ProtocolError::frame("missing byte count"));
    }
    let byte_count = usize::from(pdu.get_u8());
    if pdu.remaining() != byte_count {
        return Err(ProtocolError::frame(format!(
            "byte count {byte_count} but {} bytes follow",
            pdu.remaining()
        )));
    }
    let count = usize::from(request.count);
    if request.command.is_bit_access() {
        if byte_count < count.div_ceil(8) {
            return Err(ProtocolError::frame("too few coil bytes"));
        }
        Ok(ReadResponse::Bits(
            (0..count)
                .map(|index| pdu[index / 8] >> (index % 8) & 1 == 1)
                .collect(),
        ))
    } else {
        if byte_count != count * 2 {
            return Err(ProtocolError::frame(format!(
                "expected {} register bytes, got {byte_count}",
                count * 2
            )));
        }
        Ok(ReadResponse::Registers(
            (0..count).map(|_| pdu.get_u16()).collect(),
        ))
    }
}
