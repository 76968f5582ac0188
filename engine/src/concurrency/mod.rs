//! Shutdown signalling and periodic scheduling of push and pull pipelines.

pub mod scheduler;
pub mod shutdown;
