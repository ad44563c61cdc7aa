//! ---
//! m2c_section: "01-core-functionality"
//! m2c_subsection: "module"
//! m2c_type: "source"
//! m2c_scope: "code"
//! m2c_description: "Runtime helpers supporting the connector and publisher loops."
//! m2c_version: "v0.1.0"
//! m2c_owner: "tbd"
//! ---
pub mod latch;
pub mod scheduling;

pub use latch::{LatchGuard, ReentrancyLatch};
pub use scheduling::{IterationTimer, LinearBackoff, TaskSet};
