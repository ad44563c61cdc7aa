//! ---
//! m2c_section: "05-networking-external-interfaces"
//! m2c_subsection: "module"
//! m2c_type: "source"
//! m2c_scope: "code"
//! m2c_description: "OSI PI Web API support."
//! m2c_version: "v0.1.0"
//! m2c_owner: "tbd"
//! ---
pub mod client;
pub mod window;

pub use client::{PiAuth, PiWebClient, ResolvedPoint, NEGOTIATE_TOKEN_ENV};
pub use window::ReadWindow;
