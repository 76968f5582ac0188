//! Incremental reconciliation engine syncing relational rows into a REST form API.
//!
//! One [`pipeline::SyncPipeline`] per entity type runs passes of
//! extract, dedupe, transform, reconcile, deliver and advance watermark. Progress is tracked by
//! a [`types::Watermark`] so passes resume where the previous one stopped.

mod macros;

pub mod attributes;
pub mod concurrency;
pub mod conversions;
pub mod error;
pub mod mapping;
pub mod pipeline;
pub mod pull;
pub mod retry;
pub mod sink;
pub mod store;
pub mod types;
