pub mod config;
pub mod gates;
pub mod plan;
pub mod queue;
pub mod store;
pub mod types;
