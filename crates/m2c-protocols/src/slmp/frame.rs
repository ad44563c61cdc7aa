//! ---
//! m2c_section: "05-networking-external-interfaces"
//! m2c_subsection: "module"
//! m2c_type: "source"
//! m2c_scope: "code"
//! m2c_description: "SLMP 3E/4E request and response frames."
//! m2c_version: "v0.1.0"
//! m2c_owner: "tbd"
//! ---
use m2c_model::{CommunicationCode, LabelUnit, SlmpAttribute, SlmpConfig};

use super::codec::{FrameReader, FrameWriter};
use super::device::DeviceRef;
use crate::{ProtocolError, Result};

pub const REQUEST_3E: u16 = 0x5000;
pub const REQUEST_4E: u16 = 0x5400;
pub const RESPONSE_3E: u16 = 0xD000;
pub const RESPONSE_4E: u16 = 0xD400;

/// Destination of a request: network, station, module I/O and multidrop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub network: u8,
    pub station: u8,
    pub module_io: u16,
    pub multidrop: u8,
}

impl Route {
    pub fn from_config(config: &SlmpConfig) -> Result<Self> {
        let narrow = |field: &str, value: u16| {
            u8::try_from(value).map_err(|_| ProtocolError::frame(format!("{field} {value} does not fit in one byte")))
        };
        Ok(Self {
            network: narrow("network", config.network)?,
            station: narrow("station", config.station)?,
            module_io: config.module_io()?,
            multidrop: narrow("multidrop", config.multidrop)?,
        })
    }

    fn write(&self, writer: &mut FrameWriter) {
        writer.u8(self.network);
        writer.u8(self.station);
        writer.u16(self.module_io);
        writer.u8(self.multidrop);
    }

    fn read(reader: &mut FrameReader<'_>) -> Result<Self> {
        Ok(Self {
            network: reader.u8()?,
            station: reader.u8()?,
            module_io: reader.u16()?,
            multidrop: reader.u8()?,
        })
    }
}

/// Fixed part of every request on one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub code: CommunicationCode,
    pub route: Route,
    /// Monitoring timer in 250 ms units.
    pub timer: u16,
}

impl FrameHeader {
    pub fn from_config(config: &SlmpConfig) -> Result<Self> {
        Ok(Self {
            code: config.communication_code,
            route: Route::from_config(config)?,
            timer: config.timer_units(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    DeviceRead,
    DeviceReadRandom,
    ArrayLabelRead,
    LabelReadRandom,
}

impl Command {
    pub fn code(self) -> u16 {
        match self {
            Command::DeviceRead => 0x0401,
            Command::DeviceReadRandom => 0x0403,
            Command::ArrayLabelRead => 0x041A,
            Command::LabelReadRandom => 0x041C,
        }
    }

    pub fn from_code(code: u16) -> Result<Self> {
        match code {
            0x0401 => Ok(Command::DeviceRead),
            0x0403 => Ok(Command::DeviceReadRandom),
            0x041A => Ok(Command::ArrayLabelRead),
            0x041C => Ok(Command::LabelReadRandom),
            other => Err(ProtocolError::frame(format!("unsupported command {other:#06x}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelSpec {
    pub name: String,
    pub unit: LabelUnit,
    pub length: u16,
}

/// Command-specific request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestBody {
    DeviceRead {
        head: DeviceRef,
        points: u16,
    },
    DeviceReadRandom {
        words: Vec<DeviceRef>,
        dwords: Vec<DeviceRef>,
    },
    ArrayLabelRead {
        abbreviations: Vec<String>,
        labels: Vec<LabelSpec>,
    },
    LabelReadRandom {
        abbreviations: Vec<String>,
        labels: Vec<String>,
    },
}

/// Command, subcommand and addresses of one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlmpRequest {
    pub command: Command,
    pub subcommand: u16,
    pub body: RequestBody,
}

const SUBCOMMAND_WORD: u16 = 0x0000;
const SUBCOMMAND_BIT: u16 = 0x0001;

impl SlmpRequest {
    pub fn from_attribute(attribute: &SlmpAttribute) -> Result<Self> {
        Ok(match attribute {
            SlmpAttribute::DeviceRead(list) => SlmpRequest {
                command: Command::DeviceRead,
                subcommand: match list.unit {
                    m2c_model::DeviceUnit::Word => SUBCOMMAND_WORD,
                    m2c_model::DeviceUnit::Bit => SUBCOMMAND_BIT,
                },
                body: RequestBody::DeviceRead {
                    head: DeviceRef::parse(&list.device_code, list.head_device)?,
                    points: list.number_of_points,
                },
            },
            SlmpAttribute::DeviceReadRandom(list) => SlmpRequest {
                command: Command::DeviceReadRandom,
                subcommand: SUBCOMMAND_WORD,
                body: RequestBody::DeviceReadRandom {
                    words: list
                        .word_devices
                        .iter()
                        .map(|device| DeviceRef::parse(&device.device_code, device.device_number))
                        .collect::<Result<_>>()?,
                    dwords: list
                        .dword_devices
                        .iter()
                        .map(|device| DeviceRef::parse(&device.device_code, device.device_number))
                        .collect::<Result<_>>()?,
                },
            },
            SlmpAttribute::ArrayLabelRead(list) => SlmpRequest {
                command: Command::ArrayLabelRead,
                subcommand: SUBCOMMAND_WORD,
                body: RequestBody::ArrayLabelRead {
                    abbreviations: list.abbreviations.clone(),
                    labels: list
                        .labels
                        .iter()
                        .map(|label| LabelSpec {
                            name: label.name.clone(),
                            unit: label.unit,
                            length: label.array_length,
                        })
                        .collect(),
                },
            },
            SlmpAttribute::LabelReadRandom(list) => SlmpRequest {
                command: Command::LabelReadRandom,
                subcommand: SUBCOMMAND_WORD,
                body: RequestBody::LabelReadRandom {
                    abbreviations: list.abbreviations.clone(),
                    labels: list.labels.clone(),
                },
            },
        })
    }

    fn write_body(&self, writer: &mut FrameWriter) {
        match &self.body {
            RequestBody::DeviceRead { head, points } => {
                head.write(writer);
                writer.u16(*points);
            }
            RequestBody::DeviceReadRandom { words, dwords } => {
                writer.u8(words.len() as u8);
                writer.u8(dwords.len() as u8);
                for device in words.iter().chain(dwords) {
                    device.write(writer);
                }
            }
            RequestBody::ArrayLabelRead {
                abbreviations,
                labels,
            } => {
                writer.u16(labels.len() as u16);
                writer.u16(abbreviations.len() as u16);
                for abbreviation in abbreviations {
                    writer.label(abbreviation);
                }
                for label in labels {
                    writer.label(&label.name);
                    writer.u8(label_unit_code(label.unit));
                    writer.u8(0);
                    writer.u16(label.length);
                }
            }
            RequestBody::LabelReadRandom {
                abbreviations,
                labels,
            } => {
                writer.u16(labels.len() as u16);
                writer.u16(abbreviations.len() as u16);
                for name in abbreviations.iter().chain(labels) {
                    writer.label(name);
                }
            }
        }
    }

    fn read_body(command: Command, subcommand: u16, reader: &mut FrameReader<'_>) -> Result<Self> {
        let body = match command {
            Command::DeviceRead => RequestBody::DeviceRead {
                head: DeviceRef::read(reader)?,
                points: reader.u16()?,
            },
            Command::DeviceReadRandom => {
                let word_count = reader.u8()?;
                let dword_count = reader.u8()?;
                let words = (0..word_count)
                    .map(|_| DeviceRef::read(reader))
                    .collect::<Result<_>>()?;
                let dwords = (0..dword_count)
                    .map(|_| DeviceRef::read(reader))
                    .collect::<Result<_>>()?;
                RequestBody::DeviceReadRandom { words, dwords }
            }
            Command::ArrayLabelRead => {
                let label_count = reader.u16()?;
                let abbreviation_count = reader.u16()?;
                let abbreviations = (0..abbreviation_count)
                    .map(|_| reader.label())
                    .collect::<Result<_>>()?;
                let mut labels = Vec::with_capacity(usize::from(label_count));
                for _ in 0..label_count {
                    let name = reader.label()?;
                    let unit = label_unit_from_code(reader.u8()?)?;
                    let _fixed = reader.u8()?;
                    labels.push(LabelSpec {
                        name,
                        unit,
                        length: reader.u16()?,
                    });
                }
                RequestBody::ArrayLabelRead {
                    abbreviations,
                    labels,
                }
            }
            Command::LabelReadRandom => {
                let label_count = reader.u16()?;
                let abbreviation_count = reader.u16()?;
                let abbreviations = (0..abbreviation_count)
                    .map(|_| reader.label())
                    .collect::<Result<_>>()?;
                let labels = (0..label_count)
                    .map(|_| reader.label())
                    .collect::<Result<_>>()?;
                RequestBody::LabelReadRandom {
                    abbreviations,
                    labels,
                }
            }
        };
        Ok(Self {
            command,
            subcommand,
            body,
        })
    }
}

pub(crate) fn label_unit_code(unit: LabelUnit) -> u8 {
    match unit {
        LabelUnit::Bit => 0,
        LabelUnit::Byte => 1,
    }
}

fn label_unit_from_code(code: u8) -> Result<LabelUnit> {
    match code {
        0 => Ok(LabelUnit::Bit),
        1 => Ok(LabelUnit::Byte),
        other => Err(ProtocolError::frame(format!("unknown label unit {other}"))),
    }
}

/// Encode a request; `serial` selects the 4E frame.
pub fn encode_request(header: &FrameHeader, serial: Option<u16>, request: &SlmpRequest) -> Vec<u8> {
    let mut body = FrameWriter::new(header.code);
    body.u16(header.timer);
    body.u16(request.command.code());
    body.u16(request.subcommand);
    request.write_body(&mut body);

    let mut frame = FrameWriter::new(header.code);
    match serial {
        Some(serial) => {
            frame.subheader(REQUEST_4E);
            frame.u16(serial);
            frame.u16(0);
        }
        None => frame.subheader(REQUEST_3E),
    }
    header.route.write(&mut frame);
    frame.u16(body.len() as u16);
    frame.append(body);
    frame.into_bytes()
}

/// Request as decoded from the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedRequest {
    pub header: FrameHeader,
    pub serial: Option<u16>,
    pub request: SlmpRequest,
}

/// Inverse of [`encode_request`]; used by device simulators and tests.
pub fn decode_request(code: CommunicationCode, bytes: &[u8]) -> Result<DecodedRequest> {
    let mut reader = FrameReader::new(code, bytes);
    let serial = match reader.subheader()? {
        REQUEST_3E => None,
        REQUEST_4E => {
            let serial = reader.u16()?;
            let _reserved = reader.u16()?;
            Some(serial)
        }
        other => return Err(ProtocolError::frame(format!("bad request subheader {other:#06x}"))),
    };
    let route = Route::read(&mut reader)?;
    let length = usize::from(reader.u16()?);
    if length != reader.remaining() {
        return Err(ProtocolError::frame(format!(
            "request length field {length} but {} units follow",
            reader.remaining()
        )));
    }
    let timer = reader.u16()?;
    let command = Command::from_code(reader.u16()?)?;
    let subcommand = reader.u16()?;
    let request = SlmpRequest::read_body(command, subcommand, &mut reader)?;
    if !reader.is_empty() {
        return Err(ProtocolError::frame("trailing bytes after request body"));
    }
    Ok(DecodedRequest {
        header: FrameHeader { code, route, timer },
        serial,
        request,
    })
}

/// Response with the end code checked; `data` is still in the frame's encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlmpResponse {
    pub serial: Option<u16>,
    pub route: Route,
    pub data: Vec<u8>,
}

/// Units before the response length field, and the width of that field.
pub fn response_prefix_len(code: CommunicationCode, with_serial: bool) -> usize {
    let binary = if with_serial { 13 } else { 9 };
    match code {
        CommunicationCode::Binary => binary,
        CommunicationCode::Ascii => binary * 2,
    }
}

/// Length announced in a response prefix of [`response_prefix_len`] units.
pub fn response_length(code: CommunicationCode, prefix: &[u8]) -> Result<usize> {
    let width = match code {
        CommunicationCode::Binary => 2,
        CommunicationCode::Ascii => 4,
    };
    if prefix.len() < width {
        return Err(ProtocolError::frame("response prefix too short"));
    }
    let mut reader = FrameReader::new(code, &prefix[prefix.len() - width..]);
    Ok(usize::from(reader.u16()?))
}

/// Parse a full response frame. A length mismatch or non-zero end code is an error.
pub fn parse_response(code: CommunicationCode, bytes: &[u8]) -> Result<SlmpResponse> {
    let mut reader = FrameReader::new(code, bytes);
    let serial = match reader.subheader()? {
        RESPONSE_3E => None,
        RESPONSE_4E => {
            let serial = reader.u16()?;
            let _reserved = reader.u16()?;
            Some(serial)
        }
        other => return Err(ProtocolError::frame(format!("bad response subheader {other:#06x}"))),
    };
    let route = Route::read(&mut reader)?;
    let length = usize::from(reader.u16()?);
    if length != reader.remaining() {
        return Err(ProtocolError::frame(format!(
            "response length field {length} but {} units follow",
            reader.remaining()
        )));
    }
    let end_code = reader.u16()?;
    if end_code != 0 {
        return Err(ProtocolError::EndCode(end_code));
    }
    Ok(SlmpResponse {
        serial,
        route,
        data: reader.rest().to_vec(),
    })
}

/// Build a response frame around already-encoded `data`.
pub fn encode_response(
    code: CommunicationCode,
    serial: Option<u16>,
    route: Route,
    end_code: u16,
    data: &[u8],
) -> Vec<u8> {
    let mut frame = FrameWriter::new(code);
    match serial {
        Some(serial) => {
            frame.subheader(RESPONSE_4E);
            frame.u16(serial);
            frame.u16(0);
        }
        None => frame.subheader(RESPONSE_3E),
    }
    route.write(&mut frame);
    let end_code_units = match code {
        CommunicationCode::Binary => 2,
        CommunicationCode::Ascii => 4,
    };
    frame.u16((end_code_units + data.len()) as u16);
    frame.u16(end_code);
    frame.raw(data);
    frame.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use m2c_model::{ArrayLabel, ArrayLabelList, DeviceReadList, DeviceUnit, LabelReadRandomList};

    fn header(code: CommunicationCode) -> FrameHeader {
        FrameHeader {
            code,
            route: Route {
                network: 0,
                station: 0xFF,
                module_io: 0x03FF,
                multidrop: 0,
            },
            timer: 4,
        }
    }

    fn device_read() -> SlmpRequest {
        SlmpRequest::from_attribute(&SlmpAttribute::DeviceRead(DeviceReadList {
            device_code: "D".into(),
            head_device: 100,
            number_of_points: 3,
            unit: DeviceUnit::Word,
            tag: None,
        }))
        .unwrap()
    }

    #[test]
    fn binary_3e_device_read_matches_reference_bytes() {
        let bytes = encode_request(&header(CommunicationCode::Binary), None, &device_read());
        assert_eq!(
            bytes,
            vec![
                0x50, 0x00, 0x00, 0xFF, 0xFF, 0x03, 0x00, 0x0C, 0x00, 0x04, 0x00, 0x01, 0x04,
                0x00, 0x00, 0x64, 0x00, 0x00, 0xA8, 0x03, 0x00
            ]
        );
    }

    #[test]
    fn ascii_4e_device_read_carries_serial() {
        let bytes = encode_request(&header(CommunicationCode::Ascii), Some(0xFFFF), &device_read());
        let expected = [
            "5400", "FFFF", "0000", "00", "FF", "03FF", "00", "0018", "0004", "0401", "0000",
            "D*", "000100", "0003",
        ]
        .concat();
        assert_eq!(std::str::from_utf8(&bytes).unwrap(), expected);
    }

    #[test]
    fn requests_round_trip_for_every_command() {
        let requests = vec![
            device_read(),
            SlmpRequest::from_attribute(&SlmpAttribute::ArrayLabelRead(ArrayLabelList {
                labels: vec![ArrayLabel {
                    name: "Temps".into(),
                    unit: LabelUnit::Byte,
                    array_length: 8,
                }],
                abbreviations: vec!["Line1".into()],
            }))
            .unwrap(),
            SlmpRequest::from_attribute(&SlmpAttribute::LabelReadRandom(LabelReadRandomList {
                labels: vec!["Speed".into(), "Ärger".into()],
                abbreviations: vec![],
            }))
            .unwrap(),
        ];
        for code in [CommunicationCode::Binary, CommunicationCode::Ascii] {
            for (index, request) in requests.iter().enumerate() {
                let serial = (index % 2 == 0).then_some(index as u16);
                let bytes = encode_request(&header(code), serial, request);
                let decoded = decode_request(code, &bytes).unwrap();
                assert_eq!(&decoded.request, request);
                assert_eq!(decoded.serial, serial);
                assert_eq!(decoded.header, header(code));
            }
        }
    }

    #[test]
    fn responses_check_length_and_end_code() {
        let route = header(CommunicationCode::Binary).route;
        let ok = encode_response(CommunicationCode::Binary, Some(7), route, 0, &[0x34, 0x12]);
        let parsed = parse_response(CommunicationCode::Binary, &ok).unwrap();
        assert_eq!(parsed.serial, Some(7));
        assert_eq!(parsed.data, vec![0x34, 0x12]);

        let failed = encode_response(CommunicationCode::Binary, None, route, 0xC059, &[]);
        assert!(matches!(
            parse_response(CommunicationCode::Binary, &failed),
            Err(ProtocolError::EndCode(0xC059))
        ));

        let mut short = ok.clone();
        short.pop();
        assert!(matches!(
            parse_response(CommunicationCode::Binary, &short),
            Err(ProtocolError::Frame(_))
        ));
    }

    #[test]
    fn ascii_response_prefix_exposes_length() {
        let route = header(CommunicationCode::Ascii).route;
        let frame = encode_response(CommunicationCode::Ascii, None, route, 0, b"1234");
        let prefix_len = response_prefix_len(CommunicationCode::Ascii, false);
        let length = response_length(CommunicationCode::Ascii, &frame[..prefix_len]).unwrap();
        assert_eq!(prefix_len + length, frame.len());
    }
}
