mod base;
pub mod jiandaoyun;
pub mod memory;

pub use base::*;
