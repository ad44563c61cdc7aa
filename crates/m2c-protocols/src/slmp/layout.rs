//! ---
//! m2c_section: "05-networking-external-interfaces"
//! m2c_subsection: "module"
//! m2c_type: "source"
//! m2c_scope: "code"
//! m2c_description: "Per-tag layout tables for decoding SLMP response data."
//! m2c_version: "v0.1.0"
//! m2c_owner: "tbd"
//! ---
use m2c_model::{CommunicationCode, DeviceUnit, LabelUnit, SlmpAttribute};
use serde_json::{json, Value};

use super::codec::FrameReader;
use super::device::DeviceRef;
use crate::{ProtocolError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Shape {
    Words(Vec<String>),
    Bits(Vec<String>),
    Random {
        words: Vec<String>,
        dwords: Vec<String>,
    },
    ArrayLabels(Vec<(String, LabelUnit, u16)>),
    Labels(Vec<String>),
}

/// Which tag each field of a response belongs to, computed once when the
/// connection starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseLayout {
    shape: Shape,
}

impl ResponseLayout {
    pub fn for_attribute(attribute: &SlmpAttribute) -> Result<Self> {
        let shape = match attribute {
            SlmpAttribute::DeviceRead(list) => {
                let head = DeviceRef::parse(&list.device_code, list.head_device)?;
                let tags = (0..u32::from(list.number_of_points))
                    .map(|offset| match (&list.tag, list.number_of_points) {
                        (Some(tag), 1) => tag.clone(),
                        (Some(tag), _) => format!("{tag}.{offset}"),
                        (None, _) => head.offset(offset).tag(),
                    })
                    .collect();
                match list.unit {
                    DeviceUnit::Word => Shape::Words(tags),
                    DeviceUnit::Bit => Shape::Bits(tags),
                }
            }
            SlmpAttribute::DeviceReadRandom(list) => {
                let name = |device: &m2c_model::DeviceAddress| -> Result<String> {
                    match &device.tag {
                        Some(tag) => Ok(tag.clone()),
                        None => Ok(DeviceRef::parse(&device.device_code, device.device_number)?.tag()),
                    }
                };
                Shape::Random {
                    words: list.word_devices.iter().map(name).collect::<Result<_>>()?,
                    dwords: list.dword_devices.iter().map(name).collect::<Result<_>>()?,
                }
            }
            SlmpAttribute::ArrayLabelRead(list) => Shape::ArrayLabels(
                list.labels
                    .iter()
                    .map(|label| (label.name.clone(), label.unit, label.array_length))
                    .collect(),
            ),
            SlmpAttribute::LabelReadRandom(list) => Shape::Labels(list.labels.clone()),
        };
        Ok(Self { shape })
    }

    /// Tags in response order.
    pub fn tags(&self) -> Vec<&str> {
        match &self.shape {
            Shape::Words(tags) | Shape::Bits(tags) | Shape::Labels(tags) => {
                tags.iter().map(String::as_str).collect()
            }
            Shape::Random { words, dwords } => {
                words.iter().chain(dwords).map(String::as_str).collect()
            }
            Shape::ArrayLabels(labels) => labels.iter().map(|(name, _, _)| name.as_str()).collect(),
        }
    }

    /// Split response data into `(tag, value)` pairs.
    pub fn decode(&self, code: CommunicationCode, data: &[u8]) -> Result<Vec<(String, Value)>> {
        let mut reader = FrameReader::new(code, data);
        let values = match &self.shape {
            Shape::Words(tags) => tags
                .iter()
                .map(|tag| Ok((tag.clone(), json!(reader.u16()?))))
                .collect::<Result<Vec<_>>>()?,
            Shape::Bits(tags) => {
                let bits = read_bit_points(&mut reader, tags.len())?;
                tags.iter().cloned().zip(bits.into_iter().map(Value::Bool)).collect()
            }
            Shape::Random { words, dwords } => {
                let mut out = Vec::with_capacity(words.len() + dwords.len());
                for tag in words {
                    out.push((tag.clone(), json!(reader.u16()?)));
                }
                for tag in dwords {
                    out.push((tag.clone(), json!(reader.u32()?)));
                }
                out
            }
            Shape::ArrayLabels(labels) => {
                expect_count(&mut reader, labels.len())?;
                let mut out = Vec::with_capacity(labels.len());
                for (name, unit, length) in labels {
                    let type_id = reader.u8()?;
                    let _unit = reader.u8()?;
                    let announced = reader.u16()?;
                    let value = match unit {
                        LabelUnit::Bit => {
                            let bytes = reader.bytes(usize::from(announced).div_ceil(16) * 2)?;
                            bit_array(&bytes, usize::from(*length))
                        }
                        LabelUnit::Byte => typed_value(type_id, &reader.bytes(usize::from(announced))?),
                    };
                    out.push((name.clone(), value));
                }
                out
            }
            Shape::Labels(labels) => {
                expect_count(&mut reader, labels.len())?;
                let mut out = Vec::with_capacity(labels.len());
                for name in labels {
                    let type_id = reader.u8()?;
                    let _spare = reader.u8()?;
                    let length = usize::from(reader.u16()?);
                    out.push((name.clone(), typed_value(type_id, &reader.bytes(length)?)));
                }
                out
            }
        };
        if !reader.is_empty() {
            return Err(ProtocolError::frame(format!(
                "{} units left after decoding the response",
                reader.remaining()
            )));
        }
        Ok(values)
    }
}

fn expect_count(reader: &mut FrameReader<'_>, expected: usize) -> Result<()> {
    let count = usize::from(reader.u16()?);
    if count != expected {
        return Err(ProtocolError::frame(format!(
            "response holds {count} labels, {expected} requested"
        )));
    }
    Ok(())
}

/// Binary packs two points per byte, high nibble first; ASCII sends one
/// character per point.
fn read_bit_points(reader: &mut FrameReader<'_>, points: usize) -> Result<Vec<bool>> {
    match reader.code() {
        CommunicationCode::Binary => {
            let bytes = reader.bytes(points.div_ceil(2))?;
            Ok((0..points)
                .map(|index| {
                    let byte = bytes[index / 2];
                    let nibble = if index % 2 == 0 { byte >> 4 } else { byte & 0x0F };
                    nibble != 0
                })
                .collect())
        }
        CommunicationCode::Ascii => reader
            .text(points)?
            .chars()
            .map(|c| match c {
                '0' => Ok(false),
                '1' => Ok(true),
                other => Err(ProtocolError::frame(format!("bad bit character `{other}`"))),
            })
            .collect(),
    }
}

fn bit_array(bytes: &[u8], bits: usize) -> Value {
    let values: Vec<Value> = (0..bits)
        .map(|index| {
            let byte = bytes.get(index / 8).copied().unwrap_or(0);
            Value::Bool(byte >> (index % 8) & 1 == 1)
        })
        .collect();
    if values.len() == 1 {
        values.into_iter().next().unwrap_or(Value::Null)
    } else {
        Value::Array(values)
    }
}

/// Decode label data by its data type id; unknown types are returned as hex.
fn typed_value(type_id: u8, bytes: &[u8]) -> Value {
    let size = match type_id {
        1 | 2 | 4 => 2,
        3 | 5 | 6 => 4,
        7 => 8,
        _ => 0,
    };
    if size == 0 || bytes.is_empty() || bytes.len() % size != 0 {
        return Value::String(hex::encode_upper(bytes));
    }
    let mut values: Vec<Value> = bytes
        .chunks_exact(size)
        .map(|chunk| match type_id {
            1 => json!(chunk[0] & 1 == 1),
            2 => json!(u16::from_le_bytes([chunk[0], chunk[1]])),
            3 => json!(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])),
            4 => json!(i16::from_le_bytes([chunk[0], chunk[1]])),
            5 => json!(i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])),
            6 => json!(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])),
            _ => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(chunk);
                json!(f64::from_le_bytes(raw))
            }
        })
        .collect();
    if values.len() == 1 {
        values.remove(0)
    } else {
        Value::Array(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slmp::codec::FrameWriter;
    use m2c_model::{DeviceAddress, DeviceReadList, DeviceReadRandomList, LabelReadRandomList};

    #[test]
    fn word_reads_name_points_by_device_number() {
        let layout = ResponseLayout::for_attribute(&SlmpAttribute::DeviceRead(DeviceReadList {
            device_code: "D".into(),
            head_device: 100,
            number_of_points: 2,
            unit: DeviceUnit::Word,
            tag: None,
        }))
        .unwrap();
        assert_eq!(layout.tags(), vec!["D100", "D101"]);
        let values = layout
            .decode(CommunicationCode::Binary, &[0x34, 0x12, 0x02, 0x00])
            .unwrap();
        assert_eq!(values[0], ("D100".to_owned(), json!(0x1234)));
        assert_eq!(values[1], ("D101".to_owned(), json!(2)));
    }

    #[test]
    fn bit_reads_unpack_nibbles_and_characters() {
        let layout = ResponseLayout::for_attribute(&SlmpAttribute::DeviceRead(DeviceReadList {
            device_code: "M".into(),
            head_device: 0,
            number_of_points: 3,
            unit: DeviceUnit::Bit,
            tag: Some("Alarm".into()),
        }))
        .unwrap();
        let binary = layout.decode(CommunicationCode::Binary, &[0x10, 0x10]).unwrap();
        let ascii = layout.decode(CommunicationCode::Ascii, b"101").unwrap();
        assert_eq!(binary, ascii);
        assert_eq!(ascii[2], ("Alarm.2".to_owned(), json!(true)));
        assert_eq!(ascii[1].1, json!(false));
    }

    #[test]
    fn random_reads_split_words_and_dwords() {
        let layout =
            ResponseLayout::for_attribute(&SlmpAttribute::DeviceReadRandom(DeviceReadRandomList {
                word_devices: vec![DeviceAddress {
                    device_code: "D".into(),
                    device_number: 0,
                    tag: Some("Speed".into()),
                }],
                dword_devices: vec![DeviceAddress {
                    device_code: "W".into(),
                    device_number: 0x1A,
                    tag: None,
                }],
            }))
            .unwrap();
        let mut data = FrameWriter::new(CommunicationCode::Ascii);
        data.u16(7);
        data.u32(70_000);
        let values = layout
            .decode(CommunicationCode::Ascii, &data.into_bytes())
            .unwrap();
        assert_eq!(values[0], ("Speed".to_owned(), json!(7)));
        assert_eq!(values[1], ("W1A".to_owned(), json!(70_000)));
    }

    #[test]
    fn label_reads_decode_typed_values_and_reject_count_mismatch() {
        let layout =
            ResponseLayout::for_attribute(&SlmpAttribute::LabelReadRandom(LabelReadRandomList {
                labels: vec!["Temp".into(), "Count".into()],
                abbreviations: vec![],
            }))
            .unwrap();
        let mut data = FrameWriter::new(CommunicationCode::Binary);
        data.u16(2);
        data.u8(6);
        data.u8(0);
        data.u16(4);
        data.bytes(&1.5f32.to_le_bytes());
        data.u8(4);
        data.u8(0);
        data.u16(2);
        data.bytes(&(-3i16).to_le_bytes());
        let values = layout
            .decode(CommunicationCode::Binary, &data.into_bytes())
            .unwrap();
        assert_eq!(values[0].1, json!(1.5));
        assert_eq!(values[1].1, json!(-3));

        let mut wrong = FrameWriter::new(CommunicationCode::Binary);
        wrong.u16(1);
        assert!(layout
            .decode(CommunicationCode::Binary, &wrong.into_bytes())
            .is_err());
    }
}
