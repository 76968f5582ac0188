//! Postgres access for the sync replicator.
//!
//! Holds the SQL for the `sync` state schema (watermarks, pull cursors and the delivery
//! ledger), the batch reads against source tables and the writes mirroring external rows into
//! local tables. Callers own the [`sqlx::PgPool`].

pub mod db;
pub mod ledger;
pub mod mirror;
pub mod source;
pub mod state;
#[cfg(feature = "test-utils")]
pub mod test_utils;
