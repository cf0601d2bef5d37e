//! The ringwide storage engine: many independent time series, each with a
//! few round-robin aggregations, persisted into a small number of wide
//! Postgres rows where one row holds one time slot across many series.
//!
//! Slots carry a small lap counter next to each value; the read view
//! recomputes the expected lap from the latest write and reports any slot
//! whose counter disagrees as missing, so long ingestion gaps never need
//! backfill writes.

#![deny(rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod chunks;
pub mod interface;
pub mod mem;
pub mod postgres;
