//! ---
//! m2c_section: "05-networking-external-interfaces"
//! m2c_subsection: "module"
//! m2c_type: "source"
//! m2c_scope: "code"
//! m2c_description: "Per-protocol device drivers."
//! m2c_version: "v0.1.0"
//! m2c_owner: "tbd"
//! ---
pub mod modbus;
pub mod opcda;
pub mod osipi;
pub mod slmp;

pub use modbus::ModbusDriver;
pub use opcda::OpcDaDriver;
pub use osipi::OsiPiDriver;
pub use slmp::SlmpDriver;
