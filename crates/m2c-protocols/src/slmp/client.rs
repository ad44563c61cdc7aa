//! ---
//! m2c_section: "05-networking-external-interfaces"
//! m2c_subsection: "module"
//! m2c_type: "source"
//! m2c_scope: "code"
//! m2c_description: "SLMP device session over TCP or UDP."
//! m2c_version: "v0.1.0"
//! m2c_owner: "tbd"
//! ---
use std::time::Duration;

use chrono::Utc;
use m2c_common::time::format_millis;
use m2c_model::{CommunicationCode, Ethernet, Quality, SlmpConfig, Subheader};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, warn};

use super::codec::SerialCounter;
use super::frame::{
    encode_request, parse_response, response_length, response_prefix_len, FrameHeader, SlmpRequest,
};
use super::layout::ResponseLayout;
use crate::{with_timeout, DeviceSample, ProtocolError, Result};

/// Socket timeout for every SLMP exchange.
pub const SOCKET_TIMEOUT: Duration = Duration::from_secs(3);
const MAX_DATAGRAM: usize = 8192;

#[derive(Debug)]
enum Transport {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

/// A configured request and the layout used to decode its answer.
#[derive(Debug, Clone)]
pub struct PlannedRead {
    pub function: &'static str,
    pub request: SlmpRequest,
    pub layout: ResponseLayout,
}

/// Session with one PLC. Requests and layouts are computed at construction.
#[derive(Debug)]
pub struct SlmpClient {
    address: String,
    ethernet: Ethernet,
    header: FrameHeader,
    with_serial: bool,
    serial: SerialCounter,
    timeout: Duration,
    reads: Vec<PlannedRead>,
    transport: Option<Transport>,
}

impl SlmpClient {
    pub fn new(config: &SlmpConfig) -> Result<Self> {
        let reads = config
            .attributes
            .iter()
            .map(|attribute| {
                Ok(PlannedRead {
                    function: attribute.function_name(),
                    request: SlmpRequest::from_attribute(attribute)?,
                    layout: ResponseLayout::for_attribute(attribute)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            address: format!("{}:{}", config.machine_ip, config.port_number),
            ethernet: config.ethernet,
            header: FrameHeader::from_config(config)?,
            with_serial: config.subheader == Subheader::WithSerial,
            serial: SerialCounter::default(),
            timeout: SOCKET_TIMEOUT,
            reads,
            transport: None,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Continue numbering after `last` (4E frames only).
    pub fn resume_serial_after(mut self, last: u16) -> Self {
        self.serial = SerialCounter::starting_after(last);
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn reads(&self) -> &[PlannedRead] {
        &self.reads
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    pub async fn connect(&mut self) -> Result<()> {
        let transport = match self.ethernet {
            Ethernet::Tcp => {
                let stream = with_timeout("slmp connect", self.timeout, async {
                    Ok(TcpStream::connect(&self.address).await?)
                })
                .await?;
                stream.set_nodelay(true)?;
                Transport::Tcp(stream)
            }
            Ethernet::Udp => {
                let socket = UdpSocket::bind("0.0.0.0:0").await?;
                socket.connect(&self.address).await?;
                Transport::Udp(socket)
            }
        };
        debug!(address = %self.address, ethernet = ?self.ethernet, "slmp session open");
        self.transport = Some(transport);
        Ok(())
    }

    pub fn close(&mut self) {
        if self.transport.take().is_some() {
            debug!(address = %self.address, "slmp session closed");
        }
    }

    /// Run every configured read once. A failed read is logged and skipped;
    /// the call fails only when no read succeeded.
    pub async fn poll(&mut self) -> Result<Vec<DeviceSample>> {
        let mut samples = Vec::new();
        let mut last_error = None;
        let mut succeeded = 0usize;
        for index in 0..self.reads.len() {
            match self.read(index).await {
                Ok(mut values) => {
                    succeeded += 1;
                    samples.append(&mut values);
                }
                Err(err) => {
                    warn!(
                        address = %self.address,
                        function = self.reads[index].function,
                        error = %err,
                        "slmp response dropped"
                    );
                    if matches!(err, ProtocolError::Io(_) | ProtocolError::Timeout { .. }) {
                        self.close();
                    }
                    last_error = Some(err);
                }
            }
        }
        match (succeeded, last_error) {
            (0, Some(err)) => Err(err),
            _ => Ok(samples),
        }
    }

    /// Send read `index` and decode its response.
    pub async fn read(&mut self, index: usize) -> Result<Vec<DeviceSample>> {
        let planned = self
            .reads
            .get(index)
            .ok_or_else(|| ProtocolError::frame(format!("no configured read #{index}")))?;
        let serial = self.with_serial.then(|| self.serial.next_serial());
        let frame = encode_request(&self.header, serial, &planned.request);
        let code = self.header.code;
        let response = self.exchange(&frame).await?;
        let response = parse_response(code, &response)?;
        if response.serial != serial {
            return Err(ProtocolError::frame(format!(
                "response serial {:?} does not match request {serial:?}",
                response.serial
            )));
        }
        let timestamp = format_millis(Utc::now());
        let planned = &self.reads[index];
        Ok(planned
            .layout
            .decode(code, &response.data)?
            .into_iter()
            .map(|(tag, value)| DeviceSample::new(tag, value, Quality::Good, timestamp.clone()))
            .collect())
    }

    async fn exchange(&mut self, frame: &[u8]) -> Result<Vec<u8>> {
        let timeout = self.timeout;
        let code = self.header.code;
        let prefix_len = response_prefix_len(code, self.with_serial);
        let transport = self.transport.as_mut().ok_or(ProtocolError::NotConnected)?;
        with_timeout("slmp exchange", timeout, async move {
            match transport {
                Transport::Tcp(stream) => {
                    stream.write_all(frame).await?;
                    let mut response = vec![0u8; prefix_len];
                    stream.read_exact(&mut response).await?;
                    let length = response_length(code, &response)?;
                    response.resize(prefix_len + length, 0);
                    stream.read_exact(&mut response[prefix_len..]).await?;
                    Ok(response)
                }
                Transport::Udp(socket) => {
                    socket.send(frame).await?;
                    let mut buf = vec![0u8; MAX_DATAGRAM];
                    let read = socket.recv(&mut buf).await?;
                    buf.truncate(read);
                    Ok(buf)
                }
            }
        })
        .await
    }

    /// Last serial used, for diagnostics.
    pub fn last_serial(&self) -> Option<u16> {
        self.with_serial.then(|| self.serial.last())
    }

    pub fn communication_code(&self) -> CommunicationCode {
        self.header.code
    }
}
