//! ---
//! m2c_section: "05-networking-external-interfaces"
//! m2c_subsection: "module"
//! m2c_type: "source"
//! m2c_scope: "code"
//! m2c_description: "SLMP (Mitsubishi) protocol support."
//! m2c_version: "v0.1.0"
//! m2c_owner: "tbd"
//! ---
//! SLMP over Ethernet, Q/L-series subcommands. Requests without a serial use
//! the 3E frame, requests with one the 4E frame.

pub mod client;
pub mod codec;
pub mod device;
pub mod frame;
pub mod layout;

pub use client::{PlannedRead, SlmpClient, SOCKET_TIMEOUT};
pub use codec::{from_hex, to_hex, FrameReader, FrameWriter, SerialCounter};
pub use device::{DeviceCode, DeviceRef};
pub use frame::{
    decode_request, encode_request, encode_response, parse_response, Command, DecodedRequest,
    FrameHeader, LabelSpec, RequestBody, Route, SlmpRequest, SlmpResponse,
};
pub use layout::ResponseLayout;
