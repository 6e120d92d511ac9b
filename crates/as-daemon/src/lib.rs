//! Coordination logic over the shared state store: the task pipeline,
//! convoy allocation, feature rollup and worker health. Every operation is
//! a single-shot call; [`daemon::Daemon`] is the one place that loops.

pub mod allocator;
pub mod daemon;
pub mod feature;
pub mod health;
pub mod process;
pub mod shutdown;
pub mod state_machine;
