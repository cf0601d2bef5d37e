//! In-memory implementation of the store interface. It can be used for
//! testing or for an embedder running without persistence; it mirrors the
//! Postgres backend's semantics, including the read view's lap-counter
//! filtering and the insert-then-retry behavior of the vertical flushers.

use crate::{
    chunks::{chunk_runs, Chunk},
    interface::{
        Fetcher, Flusher, InvalidSearchPatternSnafu, LatestRowMissingSnafu, NoAdequateRraSnafu,
        Result, Searcher, Store, VerticalFlusher, WideRowMissingSnafu,
    },
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use data_types::{
    addressing, epoch_ms, from_epoch_ms, BundleId, ConsolidationFn, DataSource, DsId, DsSpec,
    Ident, RoundRobinArchive, RraId, SearchHit, SearchQuery, Series, SeriesPoint,
};
use regex::Regex;
use snafu::{ensure, OptionExt, ResultExt};
use std::{
    collections::BTreeMap,
    fmt::{Display, Formatter},
    sync::Arc,
};
use tokio::sync::Mutex;
use tracing::warn;

/// In-memory implementation of [`Store`].
pub struct MemStore {
    collections: Arc<Mutex<MemCollections>>,
}

impl MemStore {
    /// Return a new, empty store.
    pub fn new() -> Self {
        Self {
            collections: Default::default(),
        }
    }

    /// Remove a wide row directly, for testing purposes only: simulates
    /// external interference between a flush's statements.
    pub async fn delete_wide_row(&self, bundle_id: BundleId, seg: i32, i: i32) {
        let mut c = self.collections.lock().await;
        c.wide_rows
            .retain(|w| !(w.bundle_id == bundle_id && w.seg == seg && w.i == i));
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemStore {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemStore").finish_non_exhaustive()
    }
}

impl Display for MemStore {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Memory")
    }
}

#[derive(Debug, Default, Clone)]
struct MemCollections {
    data_sources: Vec<MemDs>,
    bundles: Vec<MemBundle>,
    rras: Vec<MemRra>,
    latests: Vec<MemLatest>,
    wide_rows: Vec<MemWideRow>,
}

#[derive(Debug, Clone)]
struct MemDs {
    id: DsId,
    ident: Ident,
    step_ms: i64,
    heartbeat_ms: i64,
    last_update: Option<DateTime<Utc>>,
    value: f64,
    duration_ms: i64,
}

#[derive(Debug, Clone)]
struct MemBundle {
    id: BundleId,
    step_ms: i64,
    size: i32,
    width: i32,
    last_pos: i64,
}

#[derive(Debug, Clone)]
struct MemRra {
    id: RraId,
    ds_id: DsId,
    bundle_id: BundleId,
    pos: i64,
    seg: i32,
    idx: i32,
    cf: ConsolidationFn,
    xff: f32,
    value: f64,
    duration_ms: i64,
}

#[derive(Debug, Clone)]
struct MemLatest {
    bundle_id: BundleId,
    seg: i32,
    latest: Vec<Option<DateTime<Utc>>>,
}

#[derive(Debug, Clone)]
struct MemWideRow {
    bundle_id: BundleId,
    seg: i32,
    i: i32,
    dp: Vec<Option<f64>>,
    ver: Vec<Option<i16>>,
}

impl MemCollections {
    fn bundle(&self, id: BundleId) -> Option<&MemBundle> {
        self.bundles.iter().find(|b| b.id == id)
    }

    fn latest_cell(&self, bundle_id: BundleId, seg: i32, idx: i32) -> Option<DateTime<Utc>> {
        self.latests
            .iter()
            .find(|l| l.bundle_id == bundle_id && l.seg == seg)
            .and_then(|l| l.latest.get(idx as usize).copied().flatten())
    }

    fn has_latest_row(&self, bundle_id: BundleId, seg: i32) -> bool {
        self.latests
            .iter()
            .any(|l| l.bundle_id == bundle_id && l.seg == seg)
    }

    fn assemble_rra(&self, rra: &MemRra) -> Option<RoundRobinArchive> {
        let bundle = self.bundle(rra.bundle_id)?;
        Some(RoundRobinArchive {
            id: rra.id,
            ds_id: rra.ds_id,
            bundle_id: rra.bundle_id,
            pos: rra.pos,
            seg: rra.seg,
            idx: rra.idx,
            cf: rra.cf,
            xff: rra.xff,
            value: rra.value,
            duration_ms: rra.duration_ms,
            step_ms: bundle.step_ms,
            size: bundle.size,
            width: bundle.width,
            latest: self.latest_cell(rra.bundle_id, rra.seg, rra.idx),
        })
    }

    fn attach(&self, ds: &MemDs, created: bool) -> DataSource {
        let mut rras: Vec<RoundRobinArchive> = self
            .rras
            .iter()
            .filter(|r| r.ds_id == ds.id)
            .filter_map(|r| self.assemble_rra(r))
            .collect();
        rras.sort_by_key(|r| r.id);
        DataSource {
            id: ds.id,
            ident: ds.ident.clone(),
            step_ms: ds.step_ms,
            heartbeat_ms: ds.heartbeat_ms,
            last_update: ds.last_update,
            value: ds.value,
            duration_ms: ds.duration_ms,
            created,
            rras,
        }
    }
}

/// Assign one run of values into a nullable array, extending it with nulls
/// the way a Postgres slice assignment extends a shorter array.
fn set_slice<T: Copy>(arr: &mut Vec<Option<T>>, chunk: &Chunk<T>) {
    let hi = chunk.hi() as usize;
    if arr.len() <= hi {
        arr.resize(hi + 1, None);
    }
    for (off, v) in chunk.values.iter().enumerate() {
        arr[chunk.lo as usize + off] = Some(*v);
    }
}

#[async_trait]
impl Fetcher for MemStore {
    async fn fetch_or_create_data_source(
        &self,
        ident: &Ident,
        spec: Option<&DsSpec>,
    ) -> Result<Option<DataSource>> {
        let mut c = self.collections.lock().await;

        if let Some(ds) = c.data_sources.iter().find(|d| d.ident == *ident) {
            // the lookup path always reports created = false
            return Ok(Some(c.attach(ds, false)));
        }
        let Some(spec) = spec else {
            return Ok(None);
        };

        let ds = MemDs {
            id: DsId::new(c.data_sources.len() as i64 + 1),
            ident: ident.clone(),
            step_ms: spec.step.as_millis() as i64,
            heartbeat_ms: spec.heartbeat.as_millis() as i64,
            last_update: None,
            value: f64::NAN,
            duration_ms: 0,
        };
        c.data_sources.push(ds.clone());

        let mut rras = Vec::with_capacity(spec.rras.len());
        for rra_spec in &spec.rras {
            let (step_ms, size) = (rra_spec.step_ms(), rra_spec.size());
            let bundle_idx = match c
                .bundles
                .iter()
                .position(|b| b.step_ms == step_ms && b.size == size)
            {
                Some(i) => i,
                None => {
                    let bundle = MemBundle {
                        id: BundleId::new(c.bundles.len() as i64 + 1),
                        step_ms,
                        size,
                        width: addressing::DEFAULT_SEGMENT_WIDTH,
                        last_pos: -1,
                    };
                    c.bundles.push(bundle);
                    c.bundles.len() - 1
                }
            };

            // the position is reserved before the archive upsert and
            // leaks if the upsert turns out to be a no-op
            c.bundles[bundle_idx].last_pos += 1;
            let pos = c.bundles[bundle_idx].last_pos;
            let bundle_id = c.bundles[bundle_idx].id;
            let width = c.bundles[bundle_idx].width;

            let row = match c.rras.iter().position(|r| {
                r.ds_id == ds.id && r.bundle_id == bundle_id && r.cf == rra_spec.function
            }) {
                Some(existing) => c.rras[existing].clone(),
                None => {
                    let row = MemRra {
                        id: RraId::new(c.rras.len() as i64 + 1),
                        ds_id: ds.id,
                        bundle_id,
                        pos,
                        seg: addressing::seg_of(pos, width),
                        idx: addressing::idx_of(pos, width),
                        cf: rra_spec.function,
                        xff: rra_spec.xff,
                        value: f64::NAN,
                        duration_ms: 0,
                    };
                    c.rras.push(row.clone());
                    row
                }
            };

            let mut rra = c
                .assemble_rra(&row)
                .expect("bundle created above is present");
            rra.latest = rra_spec.latest;
            rras.push(rra);
        }

        Ok(Some(DataSource {
            id: ds.id,
            ident: ds.ident,
            step_ms: ds.step_ms,
            heartbeat_ms: ds.heartbeat_ms,
            last_update: ds.last_update,
            value: ds.value,
            duration_ms: ds.duration_ms,
            created: true,
            rras,
        }))
    }

    async fn fetch_data_sources(&self) -> Result<Vec<DataSource>> {
        let c = self.collections.lock().await;

        let mut out = Vec::new();
        for ds in &c.data_sources {
            // mirror the bulk join: an archive only appears once its
            // segment has a latest row, and a source with no joined
            // archives disappears entirely
            let mut rras: Vec<RoundRobinArchive> = c
                .rras
                .iter()
                .filter(|r| r.ds_id == ds.id && c.has_latest_row(r.bundle_id, r.seg))
                .filter_map(|r| c.assemble_rra(r))
                .collect();
            if rras.is_empty() {
                continue;
            }
            rras.sort_by_key(|r| r.id);

            let max_latest = rras.iter().filter_map(|r| r.latest).max();
            let mut ds = c.attach(ds, false);
            ds.rras = rras;
            if let Some(m) = max_latest {
                if ds.last_update.map(|l| l < m).unwrap_or(true) {
                    ds.last_update = Some(m);
                }
            }
            out.push(ds);
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

        let c = self.collections.lock().await;

        // Evaluate the read view for this archive: slot timestamps come
        // from the stored latest, and a slot is live only when its stored
        // lap counter equals the expected one (absent counters match).
        let mut by_t: BTreeMap<i64, Option<f64>> = BTreeMap::new();
        if let Some(view_latest) = c.latest_cell(rra.bundle_id, rra.seg, rra.idx) {
            let view_latest_ms = epoch_ms(view_latest);
            for row in c
                .wide_rows
                .iter()
                .filter(|w| w.bundle_id == rra.bundle_id && w.seg == rra.seg)
            {
                let t = addressing::slot_time_ms(view_latest_ms, rra.step_ms, rra.size, row.i);
                let expected =
                    addressing::expected_version(view_latest_ms, rra.step_ms, rra.size, row.i);
                let dp = row.dp.get(rra.idx as usize).copied().flatten();
                let ver = row.ver.get(rra.idx as usize).copied().flatten();
                let live = ver.map(|v| v == expected).unwrap_or(true);
                let r = if live { dp } else { None };
                if t >= from_ms && t <= to_ms {
                    by_t.insert(t, r);
                }
            }
        }

        // left-join a regular timeline against the view and reduce to
        // buckets of avg(live readings), keyed like the SQL bucketing
        let mut buckets: BTreeMap<i64, (i64, Vec<f64>)> = BTreeMap::new();
        let mut tg = from_ms;
        while tg <= to_ms {
            let key = (tg - 1).div_euclid(bucket_ms);
            let entry = buckets.entry(key).or_insert((tg, Vec::new()));
            entry.0 = entry.0.max(tg);
            if let Some(Some(v)) = by_t.get(&tg) {
                entry.1.push(*v);
            }
            tg += rra.step_ms;
        }

        let points = buckets
            .into_values()
            .map(|(t, vs)| SeriesPoint {
                t: from_epoch_ms(t),
                value: if vs.is_empty() {
                    None
                } else {
                    Some(vs.iter().sum::<f64>() / vs.len() as f64)
                },
            })
            .collect();

        Ok(Series {
            ds_id: ds.id,
            rra_id: rra.id,
            bucket_ms,
            points,
        })
    }
}

#[async_trait]
impl Flusher for MemStore {
    async fn flush_data_source(&self, ds: &DataSource) -> Result<()> {
        let mut c = self.collections.lock().await;

        // a source deleted underneath us is a silent no-op
        if let Some(row) = c.data_sources.iter_mut().find(|d| d.id == ds.id) {
            row.last_update = ds.last_update;
            row.value = ds.value;
            row.duration_ms = ds.duration_ms;
        }

        for rra in &ds.rras {
            if let Some(row) = c.rras.iter_mut().find(|r| r.id == rra.id) {
                row.value = rra.value;
                row.duration_ms = rra.duration_ms;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl VerticalFlusher for MemStore {
    async fn flush_dps(
        &self,
        bundle_id: BundleId,
        seg: i32,
        i: i32,
        dps: &BTreeMap<i32, f64>,
        vers: &BTreeMap<i32, i16>,
    ) -> Result<usize> {
        let chunks = chunk_runs(dps);
        let vchunks = chunk_runs(vers);
        let mut sql_ops = 0usize;
        if chunks.is_empty() {
            return Ok(sql_ops);
        }

        let mut c = self.collections.lock().await;

        let apply = |c: &mut MemCollections| -> bool {
            match c
                .wide_rows
                .iter_mut()
                .find(|w| w.bundle_id == bundle_id && w.seg == seg && w.i == i)
            {
                Some(row) => {
                    for chunk in &chunks {
                        set_slice(&mut row.dp, chunk);
                    }
                    for chunk in &vchunks {
                        set_slice(&mut row.ver, chunk);
                    }
                    true
                }
                None => false,
            }
        };

        let applied = apply(&mut c);
        sql_ops += 1;
        if !applied {
            warn!(%bundle_id, seg, i, "wide row missing, inserting and retrying");
            c.wide_rows.push(MemWideRow {
                bundle_id,
                seg,
                i,
                dp: Vec::new(),
                ver: Vec::new(),
            });
            let applied = apply(&mut c);
            sql_ops += 1;
            ensure!(applied, WideRowMissingSnafu { bundle_id, seg, i });
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

        let mut c = self.collections.lock().await;

        let apply = |c: &mut MemCollections| -> bool {
            match c
                .latests
                .iter_mut()
                .find(|l| l.bundle_id == bundle_id && l.seg == seg)
            {
                Some(row) => {
                    for chunk in &chunks {
                        set_slice(&mut row.latest, chunk);
                    }
                    true
                }
                None => false,
            }
        };

        let applied = apply(&mut c);
        sql_ops += 1;
        if !applied {
            warn!(%bundle_id, seg, "latest row missing, inserting and retrying");
            c.latests.push(MemLatest {
                bundle_id,
                seg,
                latest: Vec::new(),
            });
            let applied = apply(&mut c);
            sql_ops += 1;
            ensure!(applied, LatestRowMissingSnafu { bundle_id, seg });
        }
        Ok(sql_ops)
    }
}

#[async_trait]
impl Searcher for MemStore {
    async fn search(&self, query: &SearchQuery) -> Result<Vec<SearchHit>> {
        let mut constraints = Vec::new();
        for (key, pattern) in query.iter() {
            let re = Regex::new(pattern).context(InvalidSearchPatternSnafu { pattern })?;
            constraints.push((key, re));
        }

        let c = self.collections.lock().await;
        Ok(c.data_sources
            .iter()
            .filter(|ds| {
                constraints.iter().all(|(key, re)| {
                    ds.ident.get(key).map(|v| re.is_match(v)).unwrap_or(false)
                })
            })
            .map(|ds| SearchHit {
                ds_id: ds.id,
                ident: ds.ident.clone(),
            })
            .collect())
    }
}

#[async_trait]
impl Store for MemStore {
    async fn setup(&self) -> Result<()> {
        // nothing to do
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{interface::Error, interface_tests};
    use assert_matches::assert_matches;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn test_store() {
        interface_tests::test_store(|| async {
            let store: Arc<dyn Store> = Arc::new(MemStore::new());
            store
        })
        .await;
    }

    #[tokio::test]
    async fn test_upsert_retry_after_external_delete() {
        let store = Arc::new(MemStore::new());
        let (_ds, rra) =
            interface_tests::single_archive_ds(store.as_ref() as &dyn Store).await;

        let dps: BTreeMap<i32, f64> = [(rra.idx, 1.0)].into_iter().collect();
        let vers: BTreeMap<i32, i16> = [(rra.idx, 1)].into_iter().collect();

        // first flush creates the row: update misses, insert, retry
        let ops = store
            .flush_dps(rra.bundle_id, rra.seg, 0, &dps, &vers)
            .await
            .unwrap();
        assert_eq!(ops, 2);

        // row exists now, a flush is one statement
        let ops = store
            .flush_dps(rra.bundle_id, rra.seg, 0, &dps, &vers)
            .await
            .unwrap();
        assert_eq!(ops, 1);

        // external interference: the row vanishes between flushes and the
        // flusher recovers with one extra statement
        store.delete_wide_row(rra.bundle_id, rra.seg, 0).await;
        let ops = store
            .flush_dps(rra.bundle_id, rra.seg, 0, &dps, &vers)
            .await
            .unwrap();
        assert_eq!(ops, 2);
    }

    #[tokio::test]
    async fn test_invalid_search_pattern() {
        let store = MemStore::new();
        let err = store
            .search(&SearchQuery::new().matching("name", "("))
            .await
            .unwrap_err();
        assert_matches!(err, Error::InvalidSearchPattern { .. });
    }

    #[tokio::test]
    async fn test_no_adequate_archive() {
        let store = MemStore::new();
        let ds = store
            .fetch_or_create_data_source(
                &Ident::new().with("name", "bare"),
                Some(&DsSpec {
                    step: std::time::Duration::from_secs(1),
                    heartbeat: std::time::Duration::from_secs(60),
                    rras: Vec::new(),
                }),
            )
            .await
            .unwrap()
            .unwrap();

        let err = store
            .fetch_series(&ds, from_epoch_ms(0), from_epoch_ms(1000), 10)
            .await
            .unwrap_err();
        assert_matches!(err, Error::NoAdequateRra { .. });
    }
}
