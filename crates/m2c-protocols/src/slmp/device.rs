//! ---
//! m2c_section: "05-networking-external-interfaces"
//! m2c_subsection: "module"
//! m2c_type: "source"
//! m2c_scope: "code"
//! m2c_description: "SLMP device code table (Q/L series)."
//! m2c_version: "v0.1.0"
//! m2c_owner: "tbd"
//! ---
use m2c_model::CommunicationCode;

use super::codec::{FrameReader, FrameWriter};
use crate::{ProtocolError, Result};

/// One PLC device type.
#[derive(Debug, PartialEq, Eq)]
pub struct DeviceCode {
    pub name: &'static str,
    pub binary: u8,
    /// Two-character code used in ASCII frames.
    pub ascii: &'static str,
    /// Radix of device numbers in ASCII frames and tag names.
    pub radix: u32,
    pub bit: bool,
}

macro_rules! device {
    ($name:literal, $binary:literal, $ascii:literal, $radix:literal, $bit:literal) => {
        DeviceCode {
            name: $name,
            binary: $binary,
            ascii: $ascii,
            radix: $radix,
            bit: $bit,
        }
    };
}

pub static DEVICES: &[DeviceCode] = &[
    device!("SM", 0x91, "SM", 10, true),
    device!("SD", 0xA9, "SD", 10, false),
    device!("X", 0x9C, "X*", 16, true),
    device!("Y", 0x9D, "Y*", 16, true),
    device!("M", 0x90, "M*", 10, true),
    device!("L", 0x92, "L*", 10, true),
    device!("F", 0x93, "F*", 10, true),
    device!("V", 0x94, "V*", 10, true),
    device!("B", 0xA0, "B*", 16, true),
    device!("D", 0xA8, "D*", 10, false),
    device!("W", 0xB4, "W*", 16, false),
    device!("TS", 0xC1, "TS", 10, true),
    device!("TC", 0xC0, "TC", 10, true),
    device!("TN", 0xC2, "TN", 10, false),
    device!("STS", 0xC7, "SS", 10, true),
    device!("STC", 0xC6, "SC", 10, true),
    device!("STN", 0xC8, "SN", 10, false),
    device!("CS", 0xC4, "CS", 10, true),
    device!("CC", 0xC3, "CC", 10, true),
    device!("CN", 0xC5, "CN", 10, false),
    device!("SB", 0xA1, "SB", 16, true),
    device!("SW", 0xB5, "SW", 16, false),
    device!("DX", 0xA2, "DX", 16, true),
    device!("DY", 0xA3, "DY", 16, true),
    device!("Z", 0xCC, "Z*", 10, false),
    device!("R", 0xAF, "R*", 10, false),
    device!("ZR", 0xB0, "ZR", 16, false),
];

/// Look a device up by its configured name (`D`, `d`, `D*`, `0xA8`, ...).
pub fn lookup(name: &str) -> Result<&'static DeviceCode> {
    let trimmed = name.trim();
    if let Some(hex) = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        let code = u8::from_str_radix(hex, 16)
            .map_err(|_| ProtocolError::UnknownDevice(name.to_owned()))?;
        return from_binary(code);
    }
    let upper = trimmed.trim_end_matches('*').to_ascii_uppercase();
    DEVICES
        .iter()
        .find(|device| device.name == upper || device.ascii.trim_end_matches('*') == upper)
        .ok_or_else(|| ProtocolError::UnknownDevice(name.to_owned()))
}

pub fn from_binary(code: u8) -> Result<&'static DeviceCode> {
    DEVICES
        .iter()
        .find(|device| device.binary == code)
        .ok_or_else(|| ProtocolError::UnknownDevice(format!("{code:#04x}")))
}

pub fn from_ascii(code: &str) -> Result<&'static DeviceCode> {
    DEVICES
        .iter()
        .find(|device| device.ascii == code)
        .ok_or_else(|| ProtocolError::UnknownDevice(code.to_owned()))
}

/// A device plus its number, e.g. `D100` or `X1F`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceRef {
    pub device: &'static DeviceCode,
    pub number: u32,
}

impl DeviceRef {
    pub fn new(device: &'static DeviceCode, number: u32) -> Self {
        Self { device, number }
    }

    pub fn parse(name: &str, number: u32) -> Result<Self> {
        Ok(Self::new(lookup(name)?, number))
    }

    /// Shifted by `offset` points.
    pub fn offset(self, offset: u32) -> Self {
        Self::new(self.device, self.number + offset)
    }

    /// Tag name in the device's own radix.
    pub fn tag(&self) -> String {
        if self.device.radix == 16 {
            format!("{}{:X}", self.device.name, self.number)
        } else {
            format!("{}{}", self.device.name, self.number)
        }
    }

    /// Binary: number (3 bytes) then code. ASCII: code then six digits.
    pub fn write(&self, writer: &mut FrameWriter) {
        match writer.code() {
            CommunicationCode::Binary => {
                writer.u24(self.number);
                writer.u8(self.device.binary);
            }
            CommunicationCode::Ascii => {
                writer.text(self.device.ascii);
                let digits = if self.device.radix == 16 {
                    format!("{:06X}", self.number)
                } else {
                    format!("{:06}", self.number)
                };
                writer.text(&digits);
            }
        }
    }

    pub fn read(reader: &mut FrameReader<'_>) -> Result<Self> {
        match reader.code() {
            CommunicationCode::Binary => {
                let number = reader.u24()?;
                let device = from_binary(reader.u8()?)?;
                Ok(Self::new(device, number))
            }
            CommunicationCode::Ascii => {
                let device = from_ascii(reader.text(2)?)?;
                let digits = reader.text(6)?;
                let number = u32::from_str_radix(digits, device.radix)
                    .map_err(|_| ProtocolError::frame(format!("bad device number `{digits}`")))?;
                Ok(Self::new(device, number))
            }
        }
    }
}
