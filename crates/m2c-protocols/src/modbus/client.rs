//! ---
//! m2c_section: "05-networking-external-interfaces"
//! m2c_subsection: "module"
//! m2c_type: "source"
//! m2c_scope: "code"
//! m2c_description: "Modbus-TCP client session."
//! m2c_version: "v0.1.0"
//! m2c_owner: "tbd"
//! ---
use std::time::Duration;

use m2c_model::{ModbusCommand, ModbusReadSpec};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use super::frame::{adu_len, decode_response, ReadRequest, ReadResponse, MBAP_LEN};
use crate::{with_timeout, ProtocolError, Result};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

/// `{hostTag}.{secondary}.{command}.{address}`.
pub fn tag_name(host_tag: &str, secondary: u8, command: ModbusCommand, address: u16) -> String {
    format!("{host_tag}.{secondary}.{command}.{address}")
}

/// A single coil or register reads as a scalar, anything longer as an array.
pub fn response_value(response: &ReadResponse) -> Value {
    match response {
        ReadResponse::Bits(bits) if bits.len() == 1 => json!(bits[0]),
        ReadResponse::Bits(bits) => json!(bits),
        ReadResponse::Registers(registers) if registers.len() == 1 => json!(registers[0]),
        ReadResponse::Registers(registers) => json!(registers),
    }
}

/// One TCP connection to a Modbus gateway; secondaries are addressed by unit id.
#[derive(Debug)]
pub struct ModbusClient {
    address: String,
    timeout: Duration,
    transaction: u16,
    stream: Option<TcpStream>,
}

impl ModbusClient {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            address: format!("{host}:{port}"),
            timeout: DEFAULT_TIMEOUT,
            transaction: 0,
            stream: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub async fn connect(&mut self) -> Result<()> {
        let stream = with_timeout("modbus connect", self.timeout, async {
            Ok(TcpStream::connect(&self.address).await?)
        })
        .await?;
        stream.set_nodelay(true)?;
        debug!(address = %self.address, "modbus session open");
        self.stream = Some(stream);
        Ok(())
    }

    pub fn close(&mut self) {
        if self.stream.take().is_some() {
            debug!(address = %self.address, "modbus session closed");
        }
    }

    /// Issue one read. I/O failures drop the connection so the next call
    /// reconnects.
    pub async fn read(
        &mut self,
        unit: u8,
        command: ModbusCommand,
        spec: ModbusReadSpec,
    ) -> Result<ReadResponse> {
        self.transaction = self.transaction.wrapping_add(1);
        let request = ReadRequest {
            transaction: self.transaction,
            unit,
            command,
            address: spec.address,
            count: spec.count(),
        };
        let timeout = self.timeout;
        let stream = self.stream.as_mut().ok_or(ProtocolError::NotConnected)?;
        let outcome = with_timeout("modbus read", timeout, async move {
            stream.write_all(&request.encode()).await?;
            let mut frame = vec![0u8; MBAP_LEN];
            stream.read_exact(&mut frame).await?;
            let total = adu_len(&frame)?;
            frame.resize(total, 0);
            stream.read_exact(&mut frame[MBAP_LEN..]).await?;
            Ok(frame)
        })
        .await;
        let frame = match outcome {
            Ok(frame) => frame,
            Err(err) => {
                self.close();
                return Err(err);
            }
        };
        decode_response(&request, &frame)
    }
}
