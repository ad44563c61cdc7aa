//! ---
//! m2c_section: "05-networking-external-interfaces"
//! m2c_subsection: "module"
//! m2c_type: "source"
//! m2c_scope: "code"
//! m2c_description: "SLMP field encoding for the ASCII and binary communication codes."
//! m2c_version: "v0.1.0"
//! m2c_owner: "tbd"
//! ---
use bytes::{Buf, BufMut, BytesMut};
use m2c_model::CommunicationCode;

use crate::{ProtocolError, Result};

/// Uppercase hex of `value` in exactly `width` digits (lowest digits kept).
pub fn to_hex(value: u64, width: usize) -> String {
    let full = format!("{value:0width$X}");
    full[full.len() - width..].to_owned()
}

/// Parse hex digits produced by [`to_hex`].
pub fn from_hex(text: &str) -> Result<u64> {
    if text.is_empty() || text.len() > 16 {
        return Err(ProtocolError::frame(format!("`{text}` is not a hex field")));
    }
    u64::from_str_radix(text, 16)
        .map_err(|_| ProtocolError::frame(format!("`{text}` is not a hex field")))
}

/// 16-bit request serial for 4E frames; wraps from 65535 to 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialCounter {
    last: u16,
}

impl Default for SerialCounter {
    fn default() -> Self {
        Self { last: u16::MAX }
    }
}

impl SerialCounter {
    /// Counter whose next serial follows `last`.
    pub fn starting_after(last: u16) -> Self {
        Self { last }
    }

    pub fn next_serial(&mut self) -> u16 {
        self.last = self.last.wrapping_add(1);
        self.last
    }

    pub fn last(&self) -> u16 {
        self.last
    }
}

/// Appends frame fields: little-endian octets in binary, big-endian hex text
/// in ASCII.
#[derive(Debug)]
pub struct FrameWriter {
    code: CommunicationCode,
    buf: BytesMut,
}

impl FrameWriter {
    pub fn new(code: CommunicationCode) -> Self {
        Self {
            code,
            buf: BytesMut::with_capacity(64),
        }
    }

    pub fn code(&self) -> CommunicationCode {
        self.code
    }

    /// Frame length in transmission units (bytes or characters).
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Subheaders are the one field sent high byte first in binary.
    pub fn subheader(&mut self, value: u16) {
        match self.code {
            CommunicationCode::Binary => self.buf.put_u16(value),
            CommunicationCode::Ascii => self.hex(u64::from(value), 4),
        }
    }

    pub fn u8(&mut self, value: u8) {
        match self.code {
            CommunicationCode::Binary => self.buf.put_u8(value),
            CommunicationCode::Ascii => self.hex(u64::from(value), 2),
        }
    }

    pub fn u16(&mut self, value: u16) {
        match self.code {
            CommunicationCode::Binary => self.buf.put_u16_le(value),
            CommunicationCode::Ascii => self.hex(u64::from(value), 4),
        }
    }

    pub fn u24(&mut self, value: u32) {
        match self.code {
            CommunicationCode::Binary => self.buf.put_slice(&value.to_le_bytes()[..3]),
            CommunicationCode::Ascii => self.hex(u64::from(value), 6),
        }
    }

    pub fn u32(&mut self, value: u32) {
        match self.code {
            CommunicationCode::Binary => self.buf.put_u32_le(value),
            CommunicationCode::Ascii => self.hex(u64::from(value), 8),
        }
    }

    /// Raw octets; two hex characters each in ASCII.
    pub fn bytes(&mut self, data: &[u8]) {
        match self.code {
            CommunicationCode::Binary => self.buf.put_slice(data),
            CommunicationCode::Ascii => self.buf.put_slice(hex::encode_upper(data).as_bytes()),
        }
    }

    /// Text written verbatim (ASCII device codes and numbers).
    pub fn text(&mut self, text: &str) {
        self.buf.put_slice(text.as_bytes());
    }

    /// Units already in this frame's encoding.
    pub fn raw(&mut self, data: &[u8]) {
        self.buf.put_slice(data);
    }

    /// Label name: character count then UTF-16 code units.
    pub fn label(&mut self, name: &str) {
        let units: Vec<u16> = name.encode_utf16().collect();
        self.u16(units.len() as u16);
        for unit in units {
            self.u16(unit);
        }
    }

    pub fn append(&mut self, other: FrameWriter) {
        self.buf.put_slice(&other.buf);
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf.to_vec()
    }

    fn hex(&mut self, value: u64, width: usize) {
        self.buf.put_slice(to_hex(value, width).as_bytes());
    }
}

/// Reads fields written by [`FrameWriter`].
#[derive(Debug)]
pub struct FrameReader<'a> {
    code: CommunicationCode,
    buf: &'a [u8],
}

impl<'a> FrameReader<'a> {
    pub fn new(code: CommunicationCode, buf: &'a [u8]) -> Self {
        Self { code, buf }
    }

    pub fn code(&self) -> CommunicationCode {
        self.code
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn subheader(&mut self) -> Result<u16> {
        match self.code {
            CommunicationCode::Binary => {
                self.need(2)?;
                Ok(self.buf.get_u16())
            }
            CommunicationCode::Ascii => Ok(self.hex(4)? as u16),
        }
    }

    pub fn u8(&mut self) -> Result<u8> {
        match self.code {
            CommunicationCode::Binary => {
                self.need(1)?;
                Ok(self.buf.get_u8())
            }
            CommunicationCode::Ascii => Ok(self.hex(2)? as u8),
        }
    }

    pub fn u16(&mut self) -> Result<u16> {
        match self.code {
            CommunicationCode::Binary => {
                self.need(2)?;
                Ok(self.buf.get_u16_le())
            }
            CommunicationCode::Ascii => Ok(self.hex(4)? as u16),
        }
    }

    pub fn u24(&mut self) -> Result<u32> {
        match self.code {
            CommunicationCode::Binary => {
                self.need(3)?;
                let mut raw = [0u8; 4];
                raw[..3].copy_from_slice(&self.buf[..3]);
                self.buf.advance(3);
                Ok(u32::from_le_bytes(raw))
            }
            CommunicationCode::Ascii => Ok(self.hex(6)? as u32),
        }
    }

    pub fn u32(&mut self) -> Result<u32> {
        match self.code {
            CommunicationCode::Binary => {
                self.need(4)?;
                Ok(self.buf.get_u32_le())
            }
            CommunicationCode::Ascii => Ok(self.hex(8)? as u32),
        }
    }

    /// `count` raw octets.
    pub fn bytes(&mut self, count: usize) -> Result<Vec<u8>> {
        match self.code {
            CommunicationCode::Binary => {
                self.need(count)?;
                let out = self.buf[..count].to_vec();
                self.buf.advance(count);
                Ok(out)
            }
            CommunicationCode::Ascii => {
                let text = self.text(count * 2)?;
                hex::decode(text).map_err(|err| ProtocolError::frame(err.to_string()))
            }
        }
    }

    /// `count` characters of verbatim text.
    pub fn text(&mut self, count: usize) -> Result<&'a str> {
        self.need(count)?;
        let (head, tail) = self.buf.split_at(count);
        self.buf = tail;
        std::str::from_utf8(head).map_err(|_| ProtocolError::frame("field is not ascii"))
    }

    pub fn label(&mut self) -> Result<String> {
        let len = usize::from(self.u16()?);
        let mut units = Vec::with_capacity(len);
        for _ in 0..len {
            units.push(self.u16()?);
        }
        String::from_utf16(&units).map_err(|_| ProtocolError::frame("label is not utf-16"))
    }

    pub fn rest(&mut self) -> &'a [u8] {
        let rest = self.buf;
        self.buf = &[];
        rest
    }

    fn hex(&mut self, width: usize) -> Result<u64> {
        let text = self.text(width)?;
        from_hex(text)
    }

    fn need(&self, count: usize) -> Result<()> {
        if self.buf.len() < count {
            return Err(ProtocolError::frame(format!(
                "needed {count} more units, {} left",
                self.buf.len()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_helpers_are_inverse() {
        for (value, width) in [(0u64, 4), (0x03FF, 4), (255, 2), (0xABCDEF, 6), (1, 8)] {
            let text = to_hex(value, width);
            assert_eq!(text.len(), width);
            assert_eq!(from_hex(&text).unwrap(), value);
        }
        assert_eq!(to_hex(0x12345, 4), "2345");
        assert!(from_hex("XYZ").is_err());
    }

    #[test]
    fn serial_wraps_after_65535() {
        let mut serial = SerialCounter::starting_after(65535);
        assert_eq!(serial.next_serial(), 0);
        assert_eq!(serial.next_serial(), 1);
        assert_eq!(SerialCounter::default().next_serial(), 0);
    }

    #[test]
    fn binary_fields_are_little_endian() {
        let mut writer = FrameWriter::new(CommunicationCode::Binary);
        writer.subheader(0x5000);
        writer.u16(0x03FF);
        writer.u24(100);
        assert_eq!(writer.into_bytes(), vec![0x50, 0x00, 0xFF, 0x03, 0x64, 0x00, 0x00]);
    }

    #[test]
    fn ascii_fields_are_hex_text() {
        let mut writer = FrameWriter::new(CommunicationCode::Ascii);
        writer.subheader(0x5000);
        writer.u8(0xFF);
        writer.u16(0x03FF);
        writer.label("Ab");
        let bytes = writer.into_bytes();
        assert_eq!(std::str::from_utf8(&bytes).unwrap(), "5000FF03FF000200410062");

        let mut reader = FrameReader::new(CommunicationCode::Ascii, &bytes);
        assert_eq!(reader.subheader().unwrap(), 0x5000);
        assert_eq!(reader.u8().unwrap(), 0xFF);
        assert_eq!(reader.u16().unwrap(), 0x03FF);
        assert_eq!(reader.label().unwrap(), "Ab");
        assert!(reader.is_empty());
    }

    #[test]
    fn short_buffers_are_frame_errors() {
        let mut reader = FrameReader::new(CommunicationCode::Binary, &[0x01]);
        assert!(matches!(reader.u16(), Err(ProtocolError::Frame(_))));
    }
}
