//! Logging setup shared by the taskloom binaries and tests.
//!
//! Every crate logs through `tracing` macros with structured fields
//! (`task_id`, `step`, `gate`); this crate only decides where those records go.

pub mod logging;
