//! Traits and error taxonomy for the ringwide store API.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use data_types::{
    BundleId, DataSource, DsId, DsSpec, Ident, SearchHit, SearchQuery, Series,
};
use snafu::Snafu;
use std::{
    collections::BTreeMap,
    fmt::{Debug, Display},
};

#[derive(Debug, Snafu)]
#[allow(missing_docs)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("database error in {operation}: {source}"))]
    Database {
        operation: &'static str,
        source: sqlx::Error,
    },

    #[snafu(display("schema setup failed: {source}"))]
    Setup { source: sqlx::Error },

    #[snafu(display("data source upsert returned no row for ident {ident}"))]
    UpsertReturnedNothing { ident: String },

    #[snafu(display("position allocator returned no row for bundle {bundle_id}"))]
    AllocatorStall { bundle_id: BundleId },

    #[snafu(display("bundle {bundle_id} missing from the catalog"))]
    BundleMissing { bundle_id: BundleId },

    #[snafu(display("wide row ({bundle_id}, {seg}, {i}) still missing after insert retry"))]
    WideRowMissing {
        bundle_id: BundleId,
        seg: i32,
        i: i32,
    },

    #[snafu(display("latest row ({bundle_id}, {seg}) still missing after insert retry"))]
    LatestRowMissing { bundle_id: BundleId, seg: i32 },

    #[snafu(display("vertical flush failed after {sql_ops} statement(s): {source}"))]
    VerticalFlush {
        sql_ops: usize,
        source: sqlx::Error,
    },

    #[snafu(display("no archive of data source {ds_id} can serve {from}..{to}"))]
    NoAdequateRra {
        ds_id: DsId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    },

    #[snafu(display("invalid search pattern {pattern:?}: {source}"))]
    InvalidSearchPattern {
        pattern: String,
        source: regex::Error,
    },
}

/// A specialized `Error` for store operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Catalog reads: look up or create data sources and produce aligned series
/// from their archives.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Return the data source with this ident, creating it (and its
    /// archives) from `spec` when absent. `None` spec means lookup only.
    /// The protocol is conflict-safe against concurrent creators: a plain
    /// select runs first, then `INSERT .. ON CONFLICT DO UPDATE ..
    /// RETURNING` picks up whichever row won.
    async fn fetch_or_create_data_source(
        &self,
        ident: &Ident,
        spec: Option<&DsSpec>,
    ) -> Result<Option<DataSource>>;

    /// Load every data source with its archives in one pass. A source's
    /// `last_update` is lifted to the maximum latest across its archives
    /// when the stored value is older; the archive latests are the
    /// authoritative write watermark after a crash.
    async fn fetch_data_sources(&self) -> Result<Vec<DataSource>>;

    /// Read an aligned, bucketed series for `ds` over `[from, to]`,
    /// emitting at most `max_points` buckets of `(bucket_end, avg)`.
    /// Slots never written this lap surface as `None` values.
    async fn fetch_series(
        &self,
        ds: &DataSource,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        max_points: i64,
    ) -> Result<Series>;
}

/// Catalog writes for the per-source bookkeeping rows.
#[async_trait]
pub trait Flusher: Send + Sync {
    /// Persist `last_update`, `value` and `duration` of the source row and
    /// of each of its archive rows. A source deleted underneath us makes
    /// this a silent no-op.
    async fn flush_data_source(&self, ds: &DataSource) -> Result<()>;
}

/// Batched writes against the wide rows: one array-slice assignment per
/// contiguous run of touched archives.
#[async_trait]
pub trait VerticalFlusher: Send + Sync {
    /// Apply slot values and their lap counters to the wide row
    /// `(bundle_id, seg, i)`. Map keys are 0-based archive indexes within
    /// the segment. Returns the number of UPDATE statements executed; a
    /// missing wide row is inserted and the update retried once.
    async fn flush_dps(
        &self,
        bundle_id: BundleId,
        seg: i32,
        i: i32,
        dps: &BTreeMap<i32, f64>,
        vers: &BTreeMap<i32, i16>,
    ) -> Result<usize>;

    /// Apply latest-write timestamps to the latest row `(bundle_id, seg)`.
    /// Same keying and retry policy as [`VerticalFlusher::flush_dps`].
    /// Latests must never move backward for an archive; the store does not
    /// check this.
    async fn flush_latests(
        &self,
        bundle_id: BundleId,
        seg: i32,
        latests: &BTreeMap<i32, DateTime<Utc>>,
    ) -> Result<usize>;
}

/// Search over data source identifiers.
#[async_trait]
pub trait Searcher: Send + Sync {
    /// Return every source whose ident satisfies all of the query's
    /// key-to-regex constraints. Results are fully drained before the call
    /// returns.
    async fn search(&self, query: &SearchQuery) -> Result<Vec<SearchHit>>;
}

/// Introspection over the backing database. Only the Postgres backend
/// implements this.
#[async_trait]
pub trait DbAddresser: Send + Sync {
    /// Total relation size in bytes and estimated row count of the wide
    /// row table.
    async fn ts_table_size(&self) -> Result<(i64, i64)>;

    /// Distinct client addresses currently connected to the database.
    async fn list_db_client_ips(&self) -> Result<Vec<String>>;

    /// This process's address as the database sees it, if discoverable.
    async fn my_db_addr(&self) -> Result<Option<String>>;
}

/// The full storage engine surface.
#[async_trait]
pub trait Store: Fetcher + Flusher + VerticalFlusher + Searcher + Debug + Display {
    /// Create tables, indexes and views if they do not exist. Idempotent;
    /// any failure other than "already exists" is fatal to startup.
    async fn setup(&self) -> Result<()>;
}
