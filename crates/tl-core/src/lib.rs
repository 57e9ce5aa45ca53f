pub mod config;
pub mod fsm;
pub mod gates;
pub mod persistence;
pub mod pipeline;
pub mod store;
pub mod types;
