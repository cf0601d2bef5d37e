//! A Postgres backed implementation of the vertical archive store.
//!
//! One wide `ts` row holds one time slot for every archive in a segment:
//! `dp` and `ver` are fixed-width arrays indexed by the archive's position
//! within its segment. Flushes collapse contiguous runs of per-archive
//! updates into single array-slice assignments; reads go through the `tv`
//! view, which reconstructs slot timestamps from the latest write and
//! filters out slots whose stored lap counter disagrees with the expected
//! one.

use crate::{
    chunks::{chunk_runs, slice_set_clause, Chunk},
    interface::{
        AllocatorStallSnafu, BundleMissingSnafu, DatabaseSnafu, DbAddresser, Fetcher, Flusher,
        LatestRowMissingSnafu, NoAdequateRraSnafu, Result, Searcher, SetupSnafu, Store,
        UpsertReturnedNothingSnafu, VerticalFlushSnafu, VerticalFlusher, WideRowMissingSnafu,
    },
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use data_types::{
    addressing, epoch_ms, from_epoch_ms, BundleId, ConsolidationFn, DataSource, DsId, DsSpec,
    Ident, RoundRobinArchive, RraBundle, RraId, SearchHit, SearchQuery, Series, SeriesPoint,
};
use rand::Rng;
use snafu::{ensure, OptionExt, ResultExt};
use sqlx::{
    postgres::{PgArguments, PgPoolOptions},
    Executor, Pool, Postgres, Row,
};
use std::{
    collections::{BTreeMap, HashMap},
    fmt::{Display, Formatter},
    time::Duration,
};
use tracing::{info, warn};

const MAX_CONNECTIONS: u32 = 5;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const IDLE_TIMEOUT: Duration = Duration::from_secs(500);

/// Connect to the archive store, create the schema if needed and return a
/// ready [`PgStore`].
pub async fn connect_store(
    app_name: &'static str,
    dsn: &str,
    prefix: impl Into<String>,
) -> Result<PgStore> {
    let pool = PgPoolOptions::new()
        .min_connections(1)
        .max_connections(MAX_CONNECTIONS)
        .acquire_timeout(CONNECT_TIMEOUT)
        .idle_timeout(IDLE_TIMEOUT)
        .test_before_acquire(true)
        .after_connect(move |c, _meta| {
            Box::pin(async move {
                // Tag the connection with the provided application name for
                // cross-correlation between server logs and connections.
                let set_app_name = format!("SET application_name = '{app_name}';");
                c.execute(set_app_name.as_str()).await?;
                Ok(())
            })
        })
        .connect(dsn)
        .await
        .context(SetupSnafu)?;

    let store = PgStore::new(pool, prefix);
    store.setup().await?;

    info!(application_name = %app_name, "connected to archive store");

    Ok(store)
}

/// Postgres implementation of [`Store`].
pub struct PgStore {
    pool: Pool<Postgres>,
    prefix: String,
    sql: Statements,
}

impl PgStore {
    /// Wrap an existing pool. [`Store::setup`] must run before first use.
    pub fn new(pool: Pool<Postgres>, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        let sql = Statements::new(&prefix);
        Self { pool, prefix, sql }
    }
}

impl std::fmt::Debug for PgStore {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgStore")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl Display for PgStore {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Postgres(prefix={})", self.prefix)
    }
}

/// Statement text templated once with the table prefix. sqlx's statement
/// cache keeps each of these prepared per connection.
#[derive(Debug)]
struct Statements {
    select_ds_by_ident: String,
    insert_ds: String,
    update_ds: String,
    select_rras_by_ds: String,
    insert_rra: String,
    update_rra: String,
    select_bundle_by_spec: String,
    insert_bundle: String,
    select_bundle: String,
    incr_bundle_pos: String,
    select_latest_cell: String,
    insert_latest: String,
    insert_ts: String,
    update_ts: String,
    fetch_all: String,
    series: String,
    ts_table_size: String,
}

impl Statements {
    fn new(p: &str) -> Self {
        Self {
            select_ds_by_ident: format!(
                "SELECT id, ident, step_ms, heartbeat_ms, lastupdate AS last_update, value, \
                 duration_ms, false AS created FROM {p}ds WHERE ident = $1"
            ),
            // `created` defaults to true in the table, so a fresh insert
            // reports true and the conflict path forces false: that is how
            // the caller tells an insert from an update.
            insert_ds: format!(
                "INSERT INTO {p}ds AS ds (ident, step_ms, heartbeat_ms) VALUES ($1, $2, $3) \
                 ON CONFLICT (ident) DO UPDATE SET created = false \
                 RETURNING id, ident, step_ms, heartbeat_ms, lastupdate AS last_update, value, \
                 duration_ms, created"
            ),
            update_ds: format!(
                "UPDATE {p}ds SET lastupdate = $1, value = $2, duration_ms = $3 WHERE id = $4"
            ),
            select_rras_by_ds: format!(
                "SELECT id, ds_id, rra_bundle_id, pos, seg, idx, cf, xff, value, duration_ms \
                 FROM {p}rra WHERE ds_id = $1 ORDER BY id"
            ),
            // The self-assignment exists purely to force RETURNING to fire
            // on conflict; DO NOTHING would return no row.
            insert_rra: format!(
                "INSERT INTO {p}rra AS rra (ds_id, rra_bundle_id, pos, seg, idx, cf, xff) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7) \
                 ON CONFLICT (ds_id, rra_bundle_id, cf) DO UPDATE SET ds_id = rra.ds_id \
                 RETURNING id, ds_id, rra_bundle_id, pos, seg, idx, cf, xff, value, duration_ms"
            ),
            update_rra: format!("UPDATE {p}rra SET value = $1, duration_ms = $2 WHERE id = $3"),
            select_bundle_by_spec: format!(
                "SELECT id, step_ms, size, width FROM {p}rra_bundle \
                 WHERE step_ms = $1 AND size = $2"
            ),
            insert_bundle: format!(
                "INSERT INTO {p}rra_bundle AS rra_bundle (step_ms, size) VALUES ($1, $2) \
                 ON CONFLICT (step_ms, size) DO UPDATE SET size = rra_bundle.size \
                 RETURNING id, step_ms, size, width"
            ),
            select_bundle: format!(
                "SELECT id, step_ms, size, width FROM {p}rra_bundle WHERE id = $1"
            ),
            incr_bundle_pos: format!(
                "UPDATE {p}rra_bundle SET last_pos = last_pos + 1 WHERE id = $1 \
                 RETURNING last_pos"
            ),
            select_latest_cell: format!(
                "SELECT latest[$3] AS latest FROM {p}rra_latest \
                 WHERE rra_bundle_id = $1 AND seg = $2"
            ),
            insert_latest: format!(
                "INSERT INTO {p}rra_latest AS rra_latest (rra_bundle_id, seg) VALUES ($1, $2) \
                 ON CONFLICT (rra_bundle_id, seg) DO NOTHING"
            ),
            insert_ts: format!(
                "INSERT INTO {p}ts AS ts (rra_bundle_id, seg, i) VALUES ($1, $2, $3) \
                 ON CONFLICT (rra_bundle_id, seg, i) DO NOTHING"
            ),
            update_ts: format!(
                "UPDATE {p}ts AS ts SET dp[$4:$5] = $6, ver[$7:$8] = $9 \
                 WHERE rra_bundle_id = $1 AND seg = $2 AND i = $3"
            ),
            fetch_all: format!(
                "SELECT ds.id AS ds_id, ds.ident AS ident, ds.step_ms AS ds_step_ms, \
                        ds.heartbeat_ms AS heartbeat_ms, ds.lastupdate AS last_update, \
                        ds.value AS ds_value, ds.duration_ms AS ds_duration_ms, \
                        rra.id AS rra_id, rra.rra_bundle_id AS rra_bundle_id, rra.pos AS pos, \
                        rra.seg AS seg, rra.idx AS idx, rra.cf AS cf, rra.xff AS xff, \
                        rra.value AS rra_value, rra.duration_ms AS rra_duration_ms, \
                        b.step_ms AS step_ms, b.size AS size, b.width AS width, \
                        rl.latest[rra.idx + 1] AS latest \
                 FROM {p}ds ds \
                 JOIN {p}rra rra ON rra.ds_id = ds.id \
                 JOIN {p}rra_bundle b ON b.id = rra.rra_bundle_id \
                 JOIN {p}rra_latest rl ON rl.rra_bundle_id = b.id AND rl.seg = rra.seg \
                 ORDER BY ds.id, rra.id"
            ),
            series: format!(
                "SELECT max(tg) AS mt, avg(r) AS ar \
                 FROM generate_series($1, $2, '00:00:00.001'::interval * $3) AS tg \
                 LEFT OUTER JOIN (SELECT t, r FROM {p}tv tv \
                     WHERE ds_id = $4 AND rra_id = $5 AND t >= $6 AND t <= $7) s ON tg = s.t \
                 GROUP BY trunc((extract(epoch FROM tg) * 1000 - 1))::bigint / $8 \
                 ORDER BY mt"
            ),
            ts_table_size: "SELECT pg_total_relation_size(c.oid) AS total_bytes, \
                            c.reltuples::double precision AS row_estimate \
                            FROM pg_class c \
                            LEFT JOIN pg_namespace n ON n.oid = c.relnamespace \
                            WHERE relname = $1"
                .to_string(),
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct DsRow {
    id: DsId,
    ident: Ident,
    step_ms: i64,
    heartbeat_ms: i64,
    last_update: Option<DateTime<Utc>>,
    value: f64,
    duration_ms: i64,
    created: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct RraRow {
    id: RraId,
    ds_id: DsId,
    rra_bundle_id: BundleId,
    pos: i64,
    seg: i32,
    idx: i32,
    cf: ConsolidationFn,
    xff: f32,
    value: f64,
    duration_ms: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct FetchAllRow {
    ds_id: DsId,
    ident: Ident,
    ds_step_ms: i64,
    heartbeat_ms: i64,
    last_update: Option<DateTime<Utc>>,
    ds_value: f64,
    ds_duration_ms: i64,
    rra_id: RraId,
    rra_bundle_id: BundleId,
    pos: i64,
    seg: i32,
    idx: i32,
    cf: ConsolidationFn,
    xff: f32,
    rra_value: f64,
    rra_duration_ms: i64,
    step_ms: i64,
    size: i32,
    width: i32,
    latest: Option<DateTime<Utc>>,
}

#[derive(Debug, sqlx::FromRow)]
struct SearchRow {
    ds_id: DsId,
    ident: Ident,
}

fn assemble_rra(row: RraRow, bundle: &RraBundle, latest: Option<DateTime<Utc>>) -> RoundRobinArchive {
    RoundRobinArchive {
        id: row.id,
        ds_id: row.ds_id,
        bundle_id: row.rra_bundle_id,
        pos: row.pos,
        seg: row.seg,
        idx: row.idx,
        cf: row.cf,
        xff: row.xff,
        value: row.value,
        duration_ms: row.duration_ms,
        step_ms: bundle.step_ms,
        size: bundle.size,
        width: bundle.width,
        latest,
    }
}

fn ds_from_row(row: DsRow, rras: Vec<RoundRobinArchive>) -> DataSource {
    DataSource {
        id: row.id,
        ident: row.ident,
        step_ms: row.step_ms,
        heartbeat_ms: row.heartbeat_ms,
        last_update: row.last_update,
        value: row.value,
        duration_ms: row.duration_ms,
        created: row.created,
        rras,
    }
}

/// Lift a source's `last_update` to the maximum archive latest seen while
/// grouping its bulk rows. A crash between flushing latests and flushing
/// the source row leaves `lastupdate` stale; the latests win.
fn finish_ds(mut ds: DataSource, max_latest: Option<DateTime<Utc>>) -> DataSource {
    if let Some(m) = max_latest {
        if ds.last_update.map(|l| l < m).unwrap_or(true) {
            ds.last_update = Some(m);
        }
    }
    ds
}

fn bind_wide_update<'q>(
    stmt: &'q str,
    bundle_id: BundleId,
    seg: i32,
    i: i32,
    chunks: &'q [Chunk<f64>],
    vchunks: &'q [Chunk<i16>],
) -> sqlx::query::Query<'q, Postgres, PgArguments> {
    let mut q = sqlx::query(stmt).bind(bundle_id).bind(seg).bind(i);
    for c in chunks {
        q = q.bind(c.lo + 1).bind(c.hi() + 1).bind(&c.values);
    }
    for c in vchunks {
        q = q.bind(c.lo + 1).bind(c.hi() + 1).bind(&c.values);
    }
    q
}

fn bind_latest_update<'q>(
    stmt: &'q str,
    bundle_id: BundleId,
    seg: i32,
    chunks: &'q [Chunk<DateTime<Utc>>],
) -> sqlx::query::Query<'q, Postgres, PgArguments> {
    let mut q = sqlx::query(stmt).bind(bundle_id).bind(seg);
    for c in chunks {
        q = q.bind(c.lo + 1).bind(c.hi() + 1).bind(&c.values);
    }
    q
}

impl PgStore {
    async fn fetch_data_source(&self, ident: &Ident) -> Result<Option<DataSource>> {
        let row = sqlx::query_as::<_, DsRow>(&self.sql.select_ds_by_ident)
            .bind(ident)
            .fetch_optional(&self.pool)
            .await
            .context(DatabaseSnafu {
                operation: "fetch_data_source",
            })?;

        match row {
            Some(row) => {
                let rras = self.fetch_rras(row.id).await?;
                Ok(Some(ds_from_row(row, rras)))
            }
            None => Ok(None),
        }
    }

    async fn fetch_rras(&self, ds_id: DsId) -> Result<Vec<RoundRobinArchive>> {
        let rows = sqlx::query_as::<_, RraRow>(&self.sql.select_rras_by_ds)
            .bind(ds_id)
            .fetch_all(&self.pool)
            .await
            .context(DatabaseSnafu {
                operation: "fetch_rras",
            })?;

        // bundles repeat across a source's archives, cache per load
        let mut bundles: HashMap<BundleId, RraBundle> = HashMap::new();
        let mut rras = Vec::with_capacity(rows.len());
        for row in rows {
            let bundle = match bundles.get(&row.rra_bundle_id) {
                Some(bundle) => *bundle,
                None => {
                    let bundle = self
                        .fetch_bundle(row.rra_bundle_id)
                        .await?
                        .context(BundleMissingSnafu {
                            bundle_id: row.rra_bundle_id,
                        })?;
                    bundles.insert(bundle.id, bundle);
                    bundle
                }
            };
            let latest = self
                .fetch_latest_cell(bundle.id, row.seg, row.idx)
                .await?;
            rras.push(assemble_rra(row, &bundle, latest));
        }
        Ok(rras)
    }

    async fn fetch_bundle(&self, id: BundleId) -> Result<Option<RraBundle>> {
        sqlx::query_as::<_, RraBundle>(&self.sql.select_bundle)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context(DatabaseSnafu {
                operation: "fetch_bundle",
            })
    }

    async fn fetch_or_create_bundle(&self, step_ms: i64, size: i32) -> Result<RraBundle> {
        let found = sqlx::query_as::<_, RraBundle>(&self.sql.select_bundle_by_spec)
            .bind(step_ms)
            .bind(size)
            .fetch_optional(&self.pool)
            .await
            .context(DatabaseSnafu {
                operation: "fetch_or_create_bundle",
            })?;
        if let Some(bundle) = found {
            return Ok(bundle);
        }

        sqlx::query_as::<_, RraBundle>(&self.sql.insert_bundle)
            .bind(step_ms)
            .bind(size)
            .fetch_one(&self.pool)
            .await
            .context(DatabaseSnafu {
                operation: "fetch_or_create_bundle",
            })
    }

    /// Reserve the next position in a bundle. Monotonic; positions burnt
    /// by an archive upsert that turns out to be a no-op are never reused.
    async fn allocate_position(&self, bundle_id: BundleId) -> Result<i64> {
        let row = sqlx::query(&self.sql.incr_bundle_pos)
            .bind(bundle_id)
            .fetch_optional(&self.pool)
            .await
            .context(DatabaseSnafu {
                operation: "allocate_position",
            })?;
        let row = row.context(AllocatorStallSnafu { bundle_id })?;
        row.try_get("last_pos").context(DatabaseSnafu {
            operation: "allocate_position",
        })
    }

    async fn fetch_latest_cell(
        &self,
        bundle_id: BundleId,
        seg: i32,
        idx: i32,
    ) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query(&self.sql.select_latest_cell)
            .bind(bundle_id)
            .bind(seg)
            .bind(idx + 1)
            .fetch_optional(&self.pool)
            .await
            .context(DatabaseSnafu {
                operation: "fetch_latest_cell",
            })?;
        match row {
            Some(row) => row.try_get("latest").context(DatabaseSnafu {
                operation: "fetch_latest_cell",
            }),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl Fetcher for PgStore {
    async fn fetch_or_create_data_source(
        &self,
        ident: &Ident,
        spec: Option<&DsSpec>,
    ) -> Result<Option<DataSource>> {
        // Select first: the conflict path of the insert burns an identity
        // sequence value on every attempt, which heavy read traffic would
        // turn into id churn.
        if let Some(ds) = self.fetch_data_source(ident).await? {
            return Ok(Some(ds));
        }
        let Some(spec) = spec else {
            return Ok(None);
        };

        let row = sqlx::query_as::<_, DsRow>(&self.sql.insert_ds)
            .bind(ident)
            .bind(spec.step.as_millis() as i64)
            .bind(spec.heartbeat.as_millis() as i64)
            .fetch_optional(&self.pool)
            .await
            .context(DatabaseSnafu {
                operation: "fetch_or_create_data_source",
            })?
            .context(UpsertReturnedNothingSnafu {
                ident: ident.to_string(),
            })?;

        let mut rras = Vec::with_capacity(spec.rras.len());
        for rra_spec in &spec.rras {
            let bundle = self
                .fetch_or_create_bundle(rra_spec.step_ms(), rra_spec.size())
                .await?;
            let pos = self.allocate_position(bundle.id).await?;
            let seg = addressing::seg_of(pos, bundle.width);
            let idx = addressing::idx_of(pos, bundle.width);

            let rra_row = sqlx::query_as::<_, RraRow>(&self.sql.insert_rra)
                .bind(row.id)
                .bind(bundle.id)
                .bind(pos)
                .bind(seg)
                .bind(idx)
                .bind(rra_spec.function)
                .bind(rra_spec.xff)
                .fetch_one(&self.pool)
                .await
                .context(DatabaseSnafu {
                    operation: "fetch_or_create_data_source",
                })?;

            rras.push(assemble_rra(rra_row, &bundle, rra_spec.latest));
        }

        Ok(Some(ds_from_row(row, rras)))
    }

    async fn fetch_data_sources(&self) -> Result<Vec<DataSource>> {
        let rows = sqlx::query_as::<_, FetchAllRow>(&self.sql.fetch_all)
            .fetch_all(&self.pool)
            .await
            .context(DatabaseSnafu {
                operation: "fetch_data_sources",
            })?;

        let mut out = Vec::new();
        let mut cur: Option<DataSource> = None;
        let mut max_latest: Option<DateTime<Utc>> = None;

        for row in rows {
            if cur.as_ref().map(|c| c.id != row.ds_id).unwrap_or(true) {
                if let Some(ds) = cur.take() {
                    out.push(finish_ds(ds, max_latest));
                }
                max_latest = None;
                cur = Some(DataSource {
                    id: row.ds_id,
                    ident: row.ident.clone(),
                    step_ms: row.ds_step_ms,
                    heartbeat_ms: row.heartbeat_ms,
                    last_update: row.last_update,
                    value: row.ds_value,
                    duration_ms: row.ds_duration_ms,
                    created: false,
                    rras: Vec::new(),
                });
            }

            if let Some(latest) = row.latest {
                max_latest = Some(max_latest.map_or(latest, |m| m.max(latest)));
            }

            if let Some(ds) = cur.as_mut() {
                let bundle = RraBundle {
                    id: row.rra_bundle_id,
                    step_ms: row.step_ms,
                    size: row.size,
                    width: row.width,
                };
                ds.rras.push(assemble_rra(
                    RraRow {
                        id: row.rra_id,
                        ds_id: row.ds_id,
                        rra_bundle_id: row.rra_bundle_id,
                        pos: row.pos,
                        seg: row.seg,
                        idx: row.idx,
                        cf: row.cf,
                        xff: row.xff,
                        value: row.rra_value,
                        duration_ms: row.rra_duration_ms,
                    },
                    &bundle,
                    row.latest,
                ));
            }
        }
        if let Some(ds) = cur {
            out.push(finish_ds(ds, max_latest));
        }

        Ok(out)
    }

    async fn fetch_series(
        &self,
        ds: &DataSource,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        max_points: i64,
    ) -> Result<Series> {
        let rra = ds
            .best_rra(from, to, max_points)
            .context(NoAdequateRraSnafu {
                ds_id: ds.id,
                from,
                to,
            })?;

        // an archive that has never been written yields no rows
        let Some(latest) = rra.latest else {
            return Ok(Series {
                ds_id: ds.id,
                rra_id: rra.id,
                bucket_ms: rra.step_ms,
                points: Vec::new(),
            });
        };

        let latest_ms = epoch_ms(latest);
        let earliest = addressing::earliest_ms(latest_ms, rra.step_ms, rra.size);
        let from_ms =
            addressing::align_from_ms(latest_ms, rra.step_ms, epoch_ms(from).max(earliest));
        let mut to_ms = epoch_ms(to);
        if let Some(last_update) = ds.last_update {
            to_ms = to_ms.min(epoch_ms(last_update));
        }

        if from_ms > to_ms {
            return Ok(Series {
                ds_id: ds.id,
                rra_id: rra.id,
                bucket_ms: rra.step_ms,
                points: Vec::new(),
            });
        }

        let bucket_ms = addressing::bucket_ms(from_ms, to_ms, rra.step_ms, max_points);
        let rows = sqlx::query(&self.sql.series)
            .bind(from_epoch_ms(from_ms))
            .bind(from_epoch_ms(to_ms))
            .bind(rra.step_ms as f64)
            .bind(ds.id)
            .bind(rra.id)
            .bind(from_epoch_ms(from_ms))
            .bind(from_epoch_ms(to_ms))
            .bind(bucket_ms)
            .fetch_all(&self.pool)
            .await
            .context(DatabaseSnafu {
                operation: "fetch_series",
            })?;

        let mut points = Vec::with_capacity(rows.len());
        for row in rows {
            let t: DateTime<Utc> = row.try_get("mt").context(DatabaseSnafu {
                operation: "fetch_series",
            })?;
            let value: Option<f64> = row.try_get("ar").context(DatabaseSnafu {
                operation: "fetch_series",
            })?;
            points.push(SeriesPoint { t, value });
        }

        Ok(Series {
            ds_id: ds.id,
            rra_id: rra.id,
            bucket_ms,
            points,
        })
    }
}

#[async_trait]
impl Flusher for PgStore {
    async fn flush_data_source(&self, ds: &DataSource) -> Result<()> {
        // rows-affected is deliberately not checked: flushing a source
        // deleted underneath us is a silent no-op
        sqlx::query(&self.sql.update_ds)
            .bind(ds.last_update)
            .bind(ds.value)
            .bind(ds.duration_ms)
            .bind(ds.id)
            .execute(&self.pool)
            .await
            .context(DatabaseSnafu {
                operation: "flush_data_source",
            })?;

        for rra in &ds.rras {
            sqlx::query(&self.sql.update_rra)
                .bind(rra.value)
                .bind(rra.duration_ms)
                .bind(rra.id)
                .execute(&self.pool)
                .await
                .context(DatabaseSnafu {
                    operation: "flush_data_source",
                })?;
        }

        Ok(())
    }
}

#[async_trait]
impl VerticalFlusher for PgStore {
    async fn flush_dps(
        &self,
        bundle_id: BundleId,
        seg: i32,
        i: i32,
        dps: &BTreeMap<i32, f64>,
        vers: &BTreeMap<i32, i16>,
    ) -> Result<usize> {
        // Two forms of the same update coexist. A single contiguous run
        // uses the fixed-placeholder statement, which stays prepared. Two
        // or more runs synthesize one statement with every slice
        // assignment in its SET clause; that text is unpreparable but
        // keeps the flush to a single round trip. Single runs are the
        // overwhelming majority in practice, so preparation pays there.
        let chunks = chunk_runs(dps);
        let vchunks = chunk_runs(vers);
        let mut sql_ops = 0usize;

        if chunks.is_empty() {
            return Ok(sql_ops);
        }

        if chunks.len() > 1 {
            let set_dp = slice_set_clause("dp", chunks.len(), 4);
            let set_ver = slice_set_clause("ver", vchunks.len(), 4 + 3 * chunks.len());
            let stmt = format!(
                "UPDATE {}ts AS ts SET {set_dp}, {set_ver} \
                 WHERE rra_bundle_id = $1 AND seg = $2 AND i = $3",
                self.prefix
            );

            let res = bind_wide_update(&stmt, bundle_id, seg, i, &chunks, &vchunks)
                .execute(&self.pool)
                .await
                .context(VerticalFlushSnafu { sql_ops })?;
            sql_ops += 1;

            if res.rows_affected() == 0 {
                warn!(%bundle_id, seg, i, "wide row missing, inserting and retrying");
                sqlx::query(&self.sql.insert_ts)
                    .bind(bundle_id)
                    .bind(seg)
                    .bind(i)
                    .execute(&self.pool)
                    .await
                    .context(VerticalFlushSnafu { sql_ops })?;
                let res = bind_wide_update(&stmt, bundle_id, seg, i, &chunks, &vchunks)
                    .execute(&self.pool)
                    .await
                    .context(VerticalFlushSnafu { sql_ops })?;
                sql_ops += 1;
                ensure!(
                    res.rows_affected() > 0,
                    WideRowMissingSnafu { bundle_id, seg, i }
                );
            }

            return Ok(sql_ops);
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .context(VerticalFlushSnafu { sql_ops })?;

        let res = bind_wide_update(&self.sql.update_ts, bundle_id, seg, i, &chunks, &vchunks)
            .execute(&mut *tx)
            .await
            .context(VerticalFlushSnafu { sql_ops })?;
        sql_ops += 1;

        if res.rows_affected() == 0 {
            warn!(%bundle_id, seg, i, "wide row missing, inserting and retrying");
            sqlx::query(&self.sql.insert_ts)
                .bind(bundle_id)
                .bind(seg)
                .bind(i)
                .execute(&mut *tx)
                .await
                .context(VerticalFlushSnafu { sql_ops })?;
            let res = bind_wide_update(&self.sql.update_ts, bundle_id, seg, i, &chunks, &vchunks)
                .execute(&mut *tx)
                .await
                .context(VerticalFlushSnafu { sql_ops })?;
            sql_ops += 1;
            ensure!(
                res.rows_affected() > 0,
                WideRowMissingSnafu { bundle_id, seg, i }
            );
        }

        if let Err(source) = tx.commit().await {
            warn!(%bundle_id, seg, i, error = %source, "wide row flush commit failed");
        }

        Ok(sql_ops)
    }

    async fn flush_latests(
        &self,
        bundle_id: BundleId,
        seg: i32,
        latests: &BTreeMap<i32, DateTime<Utc>>,
    ) -> Result<usize> {
        let chunks = chunk_runs(latests);
        let mut sql_ops = 0usize;
        if chunks.is_empty() {
            return Ok(sql_ops);
        }

        let set = slice_set_clause("latest", chunks.len(), 3);
        let stmt = format!(
            "UPDATE {}rra_latest AS rra_latest SET {set} \
             WHERE rra_bundle_id = $1 AND seg = $2",
            self.prefix
        );

        let res = bind_latest_update(&stmt, bundle_id, seg, &chunks)
            .execute(&self.pool)
            .await
            .context(VerticalFlushSnafu { sql_ops })?;
        sql_ops += 1;

        if res.rows_affected() == 0 {
            warn!(%bundle_id, seg, "latest row missing, inserting and retrying");
            sqlx::query(&self.sql.insert_latest)
                .bind(bundle_id)
                .bind(seg)
                .execute(&self.pool)
                .await
                .context(VerticalFlushSnafu { sql_ops })?;
            let res = bind_latest_update(&stmt, bundle_id, seg, &chunks)
                .execute(&self.pool)
                .await
                .context(VerticalFlushSnafu { sql_ops })?;
            sql_ops += 1;
            ensure!(
                res.rows_affected() > 0,
                LatestRowMissingSnafu { bundle_id, seg }
            );
        }

        Ok(sql_ops)
    }
}

#[async_trait]
impl Searcher for PgStore {
    async fn search(&self, query: &SearchQuery) -> Result<Vec<SearchHit>> {
        let mut sql = format!("SELECT id AS ds_id, ident FROM {}ds ds", self.prefix);
        let mut clauses = Vec::new();
        let mut p = 1;
        for _ in query.iter() {
            clauses.push(format!("ident->>${} ~ ${}", p, p + 1));
            p += 2;
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }

        let mut q = sqlx::query_as::<_, SearchRow>(&sql);
        for (key, pattern) in query.iter() {
            q = q.bind(key).bind(pattern);
        }
        let rows = q
            .fetch_all(&self.pool)
            .await
            .context(DatabaseSnafu { operation: "search" })?;

        Ok(rows
            .into_iter()
            .map(|r| SearchHit {
                ds_id: r.ds_id,
                ident: r.ident,
            })
            .collect())
    }
}

#[async_trait]
impl DbAddresser for PgStore {
    async fn ts_table_size(&self) -> Result<(i64, i64)> {
        let row = sqlx::query(&self.sql.ts_table_size)
            .bind(format!("{}ts", self.prefix))
            .fetch_optional(&self.pool)
            .await
            .context(DatabaseSnafu {
                operation: "ts_table_size",
            })?;

        match row {
            Some(row) => {
                let bytes: i64 = row.try_get("total_bytes").context(DatabaseSnafu {
                    operation: "ts_table_size",
                })?;
                let rows_estimate: f64 = row.try_get("row_estimate").context(DatabaseSnafu {
                    operation: "ts_table_size",
                })?;
                Ok((bytes, rows_estimate as i64))
            }
            None => Ok((0, 0)),
        }
    }

    async fn list_db_client_ips(&self) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT DISTINCT host(client_addr) AS addr FROM pg_stat_activity \
             WHERE client_addr IS NOT NULL",
        )
        .fetch_all(&self.pool)
        .await
        .context(DatabaseSnafu {
            operation: "list_db_client_ips",
        })?;

        let mut addrs = Vec::with_capacity(rows.len());
        for row in rows {
            let addr: Option<String> = row.try_get("addr").context(DatabaseSnafu {
                operation: "list_db_client_ips",
            })?;
            if let Some(addr) = addr {
                addrs.push(addr);
            }
        }
        Ok(addrs)
    }

    async fn my_db_addr(&self) -> Result<Option<String>> {
        // The token has to live in the statement text itself: with bound
        // parameters pg_stat_activity would only ever show the template.
        let token: u64 = rand::thread_rng().gen();
        let sql = format!(
            "SELECT host(client_addr) AS addr FROM pg_stat_activity \
             WHERE query LIKE '%ringwide{token}%'"
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .context(DatabaseSnafu {
                operation: "my_db_addr",
            })?;

        for row in rows {
            let addr: Option<String> = row.try_get("addr").context(DatabaseSnafu {
                operation: "my_db_addr",
            })?;
            if addr.is_some() {
                return Ok(addr);
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl Store for PgStore {
    async fn setup(&self) -> Result<()> {
        for stmt in schema_statements(&self.prefix) {
            sqlx::query(&stmt)
                .execute(&self.pool)
                .await
                .context(SetupSnafu)?;
        }
        info!(prefix = %self.prefix, "archive store schema ready");
        Ok(())
    }
}

fn schema_statements(p: &str) -> Vec<String> {
    vec![
        format!(
            "CREATE TABLE IF NOT EXISTS {p}ds (
             id BIGSERIAL NOT NULL PRIMARY KEY,
             ident JSONB NOT NULL DEFAULT '{{}}' CONSTRAINT nonempty_ident CHECK (ident <> '{{}}'),
             step_ms BIGINT NOT NULL,
             heartbeat_ms BIGINT NOT NULL,
             lastupdate TIMESTAMPTZ,
             value DOUBLE PRECISION NOT NULL DEFAULT 'NaN',
             duration_ms BIGINT NOT NULL DEFAULT 0,
             created BOOL NOT NULL DEFAULT true)"
        ),
        format!("CREATE UNIQUE INDEX IF NOT EXISTS {p}idx_ds_ident_uniq ON {p}ds (ident)"),
        format!("CREATE INDEX IF NOT EXISTS {p}idx_ds_ident ON {p}ds USING gin(ident)"),
        format!(
            "CREATE TABLE IF NOT EXISTS {p}rra_bundle (
             id BIGSERIAL NOT NULL PRIMARY KEY,
             step_ms BIGINT NOT NULL,
             size INT NOT NULL,
             last_pos BIGINT NOT NULL DEFAULT -1,
             width INT NOT NULL DEFAULT {width})",
            width = addressing::DEFAULT_SEGMENT_WIDTH
        ),
        format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS {p}idx_rra_bundle_spec \
             ON {p}rra_bundle (step_ms, size)"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {p}rra_latest (
             rra_bundle_id BIGINT NOT NULL REFERENCES {p}rra_bundle(id) ON DELETE CASCADE,
             seg INT NOT NULL,
             latest TIMESTAMPTZ[] NOT NULL DEFAULT '{{}}')"
        ),
        format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS {p}idx_rra_latest_bundle_id_seg \
             ON {p}rra_latest (rra_bundle_id, seg)"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {p}rra (
             id BIGSERIAL NOT NULL PRIMARY KEY,
             ds_id BIGINT NOT NULL REFERENCES {p}ds(id) ON DELETE CASCADE,
             rra_bundle_id BIGINT NOT NULL REFERENCES {p}rra_bundle(id) ON DELETE RESTRICT,
             cf TEXT NOT NULL,
             pos BIGINT NOT NULL,
             seg INT NOT NULL,
             idx INT NOT NULL,
             xff REAL NOT NULL DEFAULT 0,
             value DOUBLE PRECISION NOT NULL DEFAULT 'NaN',
             duration_ms BIGINT NOT NULL DEFAULT 0)"
        ),
        format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS {p}idx_rra_ds_bundle_cf \
             ON {p}rra (ds_id, rra_bundle_id, cf)"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {p}ts (
             rra_bundle_id BIGINT NOT NULL REFERENCES {p}rra_bundle(id) ON DELETE CASCADE,
             seg INT NOT NULL,
             i INT NOT NULL,
             dp DOUBLE PRECISION[] NOT NULL DEFAULT '{{}}',
             ver SMALLINT[] NOT NULL DEFAULT '{{}}')"
        ),
        format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS {p}idx_ts_bundle_seg_i \
             ON {p}ts (rra_bundle_id, seg, i)"
        ),
        // The read view. A slot is live when its stored lap counter equals
        // the lap expected from the archive's latest write; slots past the
        // latest slot expect the previous lap, wrapping symmetrically at
        // the counter boundary. A NULL counter counts as a match so fresh
        // wide rows surface as soon as dp is populated.
        format!(
            "CREATE OR REPLACE VIEW {p}tv AS
             SELECT ds_id, rra_id, step_ms, t, r
               FROM (
               SELECT ds_id, rra_id, step_ms, r
                    , latest - '00:00:00.001'::interval * step_ms * mod(size + latest_i - i, size) AS t
                    , ver
                    , mod(latest_ver - (i > latest_i)::int + 32767, 32767) AS expected_version
                 FROM (
                 SELECT ds_id, rra_id, step_ms, r
                      , size, i, latest, ver
                      , mod(latest_ms / step_ms, size) AS latest_i
                      , mod(latest_ms / (step_ms::bigint * size), 32767)::int AS latest_ver
                   FROM (
                   SELECT rra.ds_id AS ds_id
                        , rra.id AS rra_id
                        , rra_bundle.step_ms AS step_ms
                        , (date_part('epoch'::text, rra_latest.latest[rra.idx + 1]) * 1000)::bigint AS latest_ms
                        , rra_latest.latest[rra.idx + 1] AS latest
                        , rra_bundle.size AS size
                        , ts.i AS i
                        , dp[rra.idx + 1] AS r
                        , ver[rra.idx + 1] AS ver
                     FROM {p}rra AS rra
                     JOIN {p}rra_bundle AS rra_bundle ON rra_bundle.id = rra.rra_bundle_id
                     JOIN {p}rra_latest AS rra_latest ON rra_latest.rra_bundle_id = rra_bundle.id AND rra_latest.seg = rra.seg
                     JOIN {p}ts AS ts ON ts.rra_bundle_id = rra_bundle.id AND ts.seg = rra.seg
                   ) a
                 ) b
               ) c
             WHERE expected_version = coalesce(ver, expected_version)"
        ),
        // Debug view: same derivation without version filtering, so stale
        // slot values stay visible alongside their raw addressing.
        format!(
            "CREATE OR REPLACE VIEW {p}tvd AS
             SELECT ds_id, rra_id
                  , tstzrange(lag(t, 1) OVER (PARTITION BY ds_id, rra_id ORDER BY t), t, '(]') AS tr
                  , r, step, i, last_i, last_t, slot_distance, seg, idx, pos
               FROM (
               SELECT rra.ds_id AS ds_id
                    , rra.id AS rra_id
                    , rra_latest.latest[rra.idx + 1] - '00:00:00.001'::interval * rra_bundle.step_ms::double precision *
                        mod(rra_bundle.size + mod((date_part('epoch'::text, rra_latest.latest[rra.idx + 1]) * 1000)::bigint / rra_bundle.step_ms, rra_bundle.size::bigint) -
                        ts.i, rra_bundle.size::bigint)::double precision AS t
                    , ts.dp[rra.idx + 1] AS r
                    , '00:00:00.001'::interval * rra_bundle.step_ms::double precision AS step
                    , ts.i AS i
                    , mod((date_part('epoch'::text, rra_latest.latest[rra.idx + 1]) * 1000)::bigint / rra_bundle.step_ms, rra_bundle.size::bigint) AS last_i
                    , (date_part('epoch'::text, rra_latest.latest[rra.idx + 1]) * 1000)::bigint AS last_t
                    , mod(rra_bundle.size + mod((date_part('epoch'::text, rra_latest.latest[rra.idx + 1]) * 1000)::bigint / rra_bundle.step_ms, rra_bundle.size::bigint) -
                        ts.i, rra_bundle.size::bigint)::double precision AS slot_distance
                    , rra.seg AS seg
                    , rra.idx AS idx
                    , rra.pos AS pos
                 FROM {p}rra rra
                 JOIN {p}rra_bundle rra_bundle ON rra_bundle.id = rra.rra_bundle_id
                 JOIN {p}rra_latest rra_latest ON rra_latest.rra_bundle_id = rra_bundle.id AND rra_latest.seg = rra.seg
                 JOIN {p}ts ts ON ts.rra_bundle_id = rra_bundle.id AND ts.seg = rra.seg
               ) raw"
        ),
    ]
}
