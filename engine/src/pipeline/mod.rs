//! The sync pass: extract, dedupe, transform, reconcile, deliver and advance the watermark.

pub mod dedup;
pub mod deliver;
mod driver;
pub mod extract;
pub mod reconcile;
mod summary;
pub mod transform;

pub use driver::{PipelineSettings, SyncPipeline};
pub use summary::PassSummary;
