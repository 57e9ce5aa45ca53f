pub mod daemon;
pub mod orchestrator;
pub mod scheduler;
pub mod shutdown;
