//! Pipeline execution for taskloom tasks.
//!
//! The [`executor::PipelineExecutor`] walks a task's step template, calling a
//! [`adapter::WorkerAdapter`] per step, pausing at human approval gates
//! ([`approval::GateKeeper`]), looping through review and fix
//! ([`review::ReviewLoop`]), spawning child tasks and committing through
//! [`vcs::SessionVcs`].

pub mod adapter;
pub mod approval;
pub mod children;
pub mod command_adapter;
pub mod dependency;
pub mod executor;
pub mod registry;
pub mod review;
pub mod vcs;
