mod base;
pub mod memory;
pub mod postgres;
pub mod remote;

pub use base::*;
