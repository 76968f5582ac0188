//! Mirrors changed rows of an external database into local tables.
//!
//! A pull runs before the push passes so that mirrored rows are synced like any other source
//! row.

mod driver;
mod summary;

pub use driver::PullPipeline;
pub use summary::PullSummary;
