mod base;
mod batch;
mod entity;
mod pull;
mod replicator;
mod retry;
mod schedule;
mod sink;
mod source;

pub use base::*;
pub use batch::*;
pub use entity::*;
pub use pull::*;
pub use replicator::*;
pub use retry::*;
pub use schedule::*;
pub use sink::*;
pub use source::*;
