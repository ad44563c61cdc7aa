//! ---
//! m2c_section: "05-networking-external-interfaces"
//! m2c_subsection: "module"
//! m2c_type: "source"
//! m2c_scope: "code"
//! m2c_description: "Modbus-TCP protocol support."
//! m2c_version: "v0.1.0"
//! m2c_owner: "tbd"
//! ---
pub mod client;
pub mod frame;

pub use client::{response_value, tag_name, ModbusClient};
pub use frame::{decode_response, encode_exception, ReadRequest, ReadResponse};
