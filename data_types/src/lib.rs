//! This crate contains the data types shared between the ringwide store
//! backends: typed ids, data source identifiers, consolidation functions,
//! catalog records and the creation specs handed to the store.

#![deny(rust_2018_idioms)]
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self
)]

pub mod addressing;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt::Display, time::Duration};

/// Unique ID for a `DataSource`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, sqlx::Type)]
#[sqlx(transparent)]
pub struct DsId(i64);

#[allow(missing_docs)]
impl DsId {
    pub const fn new(v: i64) -> Self {
        Self(v)
    }
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl Display for DsId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique ID for a `RoundRobinArchive`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, sqlx::Type)]
#[sqlx(transparent)]
pub struct RraId(i64);

#[allow(missing_docs)]
impl RraId {
    pub const fn new(v: i64) -> Self {
        Self(v)
    }
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl Display for RraId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique ID for a `RraBundle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, sqlx::Type)]
#[sqlx(transparent)]
pub struct BundleId(i64);

#[allow(missing_docs)]
impl BundleId {
    pub const fn new(v: i64) -> Self {
        Self(v)
    }
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl Display for BundleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque structured identifier of a data source: a set of key/value tags
/// serialised to canonical (sorted-key) JSON, stored as JSONB. The whole
/// ident is unique per data source; individual keys are searchable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ident(BTreeMap<String, String>);

impl Ident {
    /// An empty ident. The store rejects persisting these; build tags up
    /// with [`Ident::with`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tag, builder style.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Look up a single tag value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Iterate tags in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// True if no tags are set.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<BTreeMap<String, String>> for Ident {
    fn from(tags: BTreeMap<String, String>) -> Self {
        Self(tags)
    }
}

impl Display for Ident {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // BTreeMap keeps keys sorted, so this is already canonical.
        match serde_json::to_string(&self.0) {
            Ok(s) => f.write_str(&s),
            Err(_) => Err(std::fmt::Error),
        }
    }
}

impl<DB> sqlx::Type<DB> for Ident
where
    sqlx::types::Json<Self>: sqlx::Type<DB>,
    DB: sqlx::Database,
{
    fn type_info() -> DB::TypeInfo {
        <sqlx::types::Json<Self> as sqlx::Type<DB>>::type_info()
    }
}

impl<'q, DB> sqlx::Encode<'q, DB> for Ident
where
    DB: sqlx::Database,
    for<'b> sqlx::types::Json<&'b BTreeMap<String, String>>: sqlx::Encode<'q, DB>,
{
    fn encode_by_ref(
        &self,
        buf: &mut <DB as sqlx::database::HasArguments<'q>>::ArgumentBuffer,
    ) -> sqlx::encode::IsNull {
        <sqlx::types::Json<&BTreeMap<String, String>> as sqlx::Encode<'_, DB>>::encode_by_ref(
            &sqlx::types::Json(&self.0),
            buf,
        )
    }
}

impl<'q, DB> sqlx::Decode<'q, DB> for Ident
where
    DB: sqlx::Database,
    sqlx::types::Json<BTreeMap<String, String>>: sqlx::Decode<'q, DB>,
{
    fn decode(
        value: <DB as sqlx::database::HasValueRef<'q>>::ValueRef,
    ) -> Result<Self, Box<dyn std::error::Error + 'static + Send + Sync>> {
        Ok(Self(
            <sqlx::types::Json<BTreeMap<String, String>> as sqlx::Decode<'_, DB>>::decode(value)?.0,
        ))
    }
}

/// Consolidation function of an archive. The consolidation itself happens
/// upstream; the store only tags archives with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConsolidationFn {
    /// Weighted mean of the samples in a step.
    Wmean,
    /// Minimum sample in a step.
    Min,
    /// Maximum sample in a step.
    Max,
    /// Last sample in a step.
    Last,
}

impl ConsolidationFn {
    /// The canonical TEXT form stored in the catalog.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Wmean => "WMEAN",
            Self::Min => "MIN",
            Self::Max => "MAX",
            Self::Last => "LAST",
        }
    }
}

impl Display for ConsolidationFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown consolidation function tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidConsolidationFn(pub String);

impl Display for InvalidConsolidationFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid consolidation function: {:?} (valid: WMEAN, MIN, MAX, LAST)",
            self.0
        )
    }
}

impl std::error::Error for InvalidConsolidationFn {}

impl std::str::FromStr for ConsolidationFn {
    type Err = InvalidConsolidationFn;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "WMEAN" => Ok(Self::Wmean),
            "MIN" => Ok(Self::Min),
            "MAX" => Ok(Self::Max),
            "LAST" => Ok(Self::Last),
            _ => Err(InvalidConsolidationFn(s.to_string())),
        }
    }
}

impl sqlx::Type<sqlx::Postgres> for ConsolidationFn {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        // Stored as TEXT, not a Postgres enum type.
        sqlx::postgres::PgTypeInfo::with_name("TEXT")
    }
}

impl sqlx::Encode<'_, sqlx::Postgres> for ConsolidationFn {
    fn encode_by_ref(
        &self,
        buf: &mut <sqlx::Postgres as sqlx::database::HasArguments<'_>>::ArgumentBuffer,
    ) -> sqlx::encode::IsNull {
        <&str as sqlx::Encode<'_, sqlx::Postgres>>::encode(self.as_str(), buf)
    }
}

impl sqlx::Decode<'_, sqlx::Postgres> for ConsolidationFn {
    fn decode(
        value: <sqlx::Postgres as sqlx::database::HasValueRef<'_>>::ValueRef,
    ) -> Result<Self, Box<dyn std::error::Error + 'static + Send + Sync>> {
        let s = <String as sqlx::Decode<'_, sqlx::Postgres>>::decode(value)?;
        Ok(s.parse::<Self>()?)
    }
}

/// An archive bundle: the group of archives sharing `(step_ms, size)` whose
/// slot data co-locates in one wide-row family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::FromRow)]
pub struct RraBundle {
    /// Bundle id.
    pub id: BundleId,
    /// Slot step in milliseconds, shared by all member archives.
    pub step_ms: i64,
    /// Slots per lap of the ring.
    pub size: i32,
    /// Archives per wide row, fixed at bundle creation.
    pub width: i32,
}

impl RraBundle {
    /// Wall-clock span of one full lap.
    pub fn span_ms(&self) -> i64 {
        self.step_ms * self.size as i64
    }
}

/// A round-robin archive as loaded from the catalog, with its bundle
/// geometry and latest-write timestamp denormalised in.
#[derive(Debug, Clone, PartialEq)]
pub struct RoundRobinArchive {
    /// Archive id.
    pub id: RraId,
    /// Owning data source.
    pub ds_id: DsId,
    /// Bundle this archive's slots live in.
    pub bundle_id: BundleId,
    /// Position within the bundle, 0-based, allocated once and never reused.
    pub pos: i64,
    /// `pos / width`: which wide-row family within the bundle.
    pub seg: i32,
    /// `pos % width`: offset within the segment's arrays, 0-based.
    pub idx: i32,
    /// Consolidation function tag.
    pub cf: ConsolidationFn,
    /// Unknown-fraction threshold, stored for upstream consolidation.
    pub xff: f32,
    /// Current in-progress consolidation value.
    pub value: f64,
    /// Duration covered by `value` so far.
    pub duration_ms: i64,
    /// Slot step in milliseconds (from the bundle).
    pub step_ms: i64,
    /// Slots per lap (from the bundle).
    pub size: i32,
    /// Archives per wide row (from the bundle).
    pub width: i32,
    /// Wall-clock of the most recent slot write, if any.
    pub latest: Option<DateTime<Utc>>,
}

impl RoundRobinArchive {
    /// Wall-clock span of one full lap.
    pub fn span_ms(&self) -> i64 {
        self.step_ms * self.size as i64
    }

    /// The ring slot holding time `t`.
    pub fn slot_index(&self, t: DateTime<Utc>) -> i32 {
        addressing::slot_index(epoch_ms(t), self.step_ms, self.size)
    }

    /// Earliest retained slot time, given the archive's latest write.
    /// `None` until something has been written.
    pub fn begins(&self) -> Option<DateTime<Utc>> {
        self.latest
            .map(|l| from_epoch_ms(addressing::earliest_ms(epoch_ms(l), self.step_ms, self.size)))
    }

    /// True when `t` still falls inside the retained window.
    pub fn covers(&self, t: DateTime<Utc>) -> bool {
        match (self.begins(), self.latest) {
            (Some(begins), Some(latest)) => begins <= t && t <= latest,
            _ => false,
        }
    }
}

/// A data source with its archives attached.
#[derive(Debug, Clone, PartialEq)]
pub struct DataSource {
    /// Data source id.
    pub id: DsId,
    /// Unique structured identifier.
    pub ident: Ident,
    /// Raw-sample step in milliseconds.
    pub step_ms: i64,
    /// Heartbeat in milliseconds.
    pub heartbeat_ms: i64,
    /// Wall-clock of the last update flushed for this source.
    pub last_update: Option<DateTime<Utc>>,
    /// Current in-progress value.
    pub value: f64,
    /// Duration covered by `value` so far.
    pub duration_ms: i64,
    /// Whether the row was freshly inserted by the call that produced this
    /// value. The conflict path of the upsert forces this to `false`.
    pub created: bool,
    /// The archives owned by this source.
    pub rras: Vec<RoundRobinArchive>,
}

impl DataSource {
    /// Choose the archive best suited to serve `[from, to]` within a point
    /// budget: among archives whose retained window still covers `from`,
    /// the finest step that keeps the raw slot count at or under
    /// `max_points`; if every candidate is finer than the budget allows,
    /// the coarsest candidate; if nothing covers `from`, the archive with
    /// the longest span.
    pub fn best_rra(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        max_points: i64,
    ) -> Option<&RoundRobinArchive> {
        let candidates: Vec<&RoundRobinArchive> =
            self.rras.iter().filter(|r| r.covers(from)).collect();

        if candidates.is_empty() {
            return self.rras.iter().max_by_key(|r| r.span_ms());
        }

        let want_step = (to - from).num_milliseconds() / max_points.max(1);
        candidates
            .iter()
            .filter(|r| r.step_ms >= want_step)
            .min_by_key(|r| r.step_ms)
            .or_else(|| candidates.iter().max_by_key(|r| r.step_ms))
            .copied()
    }
}

/// Spec for creating a data source, handed to the fetch-or-create upsert.
#[derive(Debug, Clone, PartialEq)]
pub struct DsSpec {
    /// Raw-sample step.
    pub step: Duration,
    /// Heartbeat.
    pub heartbeat: Duration,
    /// Archives to create alongside the source.
    pub rras: Vec<RraSpec>,
}

/// Spec for a single archive within a [`DsSpec`].
#[derive(Debug, Clone, PartialEq)]
pub struct RraSpec {
    /// Consolidation function.
    pub function: ConsolidationFn,
    /// Slot step; determines the bundle together with `span`.
    pub step: Duration,
    /// Full ring span; `span / step` slots per lap.
    pub span: Duration,
    /// Unknown-fraction threshold.
    pub xff: f32,
    /// Latest-write seed for archives restored from elsewhere.
    pub latest: Option<DateTime<Utc>>,
}

impl RraSpec {
    /// Slot step in milliseconds.
    pub fn step_ms(&self) -> i64 {
        self.step.as_millis() as i64
    }

    /// Slots per lap.
    pub fn size(&self) -> i32 {
        (self.span.as_millis() / self.step.as_millis().max(1)) as i32
    }
}

/// One aligned reading of a series: bucket end time and the average of the
/// live slot values that fell in the bucket, if any.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeriesPoint {
    /// Bucket end timestamp.
    pub t: DateTime<Utc>,
    /// Average of live readings in the bucket; `None` when every slot in
    /// the bucket was missing.
    pub value: Option<f64>,
}

/// An aligned, bucketed series produced by the fetch pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct Series {
    /// Source the series was read from.
    pub ds_id: DsId,
    /// Archive the series was read from.
    pub rra_id: RraId,
    /// Bucket width in milliseconds.
    pub bucket_ms: i64,
    /// Points ordered by bucket end time.
    pub points: Vec<SeriesPoint>,
}

/// A search over data source identifiers: each entry maps an ident key to a
/// regular expression its value must match; entries are ANDed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchQuery(BTreeMap<String, String>);

impl SearchQuery {
    /// Match everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `key`'s value to match `pattern`, builder style.
    pub fn matching(mut self, key: impl Into<String>, pattern: impl Into<String>) -> Self {
        self.0.insert(key.into(), pattern.into());
        self
    }

    /// Iterate the (key, pattern) constraints.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// True when the query has no constraints.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A single search result.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    /// Matching data source id.
    pub ds_id: DsId,
    /// Its full ident.
    pub ident: Ident,
}

/// Milliseconds since the Unix epoch.
pub fn epoch_ms(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

/// The inverse of [`epoch_ms`].
pub fn from_epoch_ms(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).expect("epoch millis in range")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(ms: i64) -> DateTime<Utc> {
        from_epoch_ms(ms)
    }

    fn rra(id: i64, step_ms: i64, size: i32, latest: Option<i64>) -> RoundRobinArchive {
        RoundRobinArchive {
            id: RraId::new(id),
            ds_id: DsId::new(1),
            bundle_id: BundleId::new(id),
            pos: 0,
            seg: 0,
            idx: 0,
            cf: ConsolidationFn::Wmean,
            xff: 0.5,
            value: f64::NAN,
            duration_ms: 0,
            step_ms,
            size,
            width: 200,
            latest: latest.map(ts),
        }
    }

    #[test]
    fn ident_canonical_json() {
        let ident = Ident::new().with("name", "foo.bar").with("host", "h1");
        // keys come out sorted regardless of insertion order
        assert_eq!(ident.to_string(), r#"{"host":"h1","name":"foo.bar"}"#);
        assert_eq!(ident.get("host"), Some("h1"));
        assert!(Ident::new().is_empty());
    }

    #[test]
    fn consolidation_fn_round_trips() {
        for cf in [
            ConsolidationFn::Wmean,
            ConsolidationFn::Min,
            ConsolidationFn::Max,
            ConsolidationFn::Last,
        ] {
            assert_eq!(cf.as_str().parse::<ConsolidationFn>().unwrap(), cf);
        }
        assert_eq!(
            "wmean".parse::<ConsolidationFn>().unwrap(),
            ConsolidationFn::Wmean
        );
        assert!("AVG".parse::<ConsolidationFn>().is_err());
    }

    #[test]
    fn archive_window() {
        let r = rra(1, 1000, 10, Some(11_000));
        assert_eq!(r.begins(), Some(ts(2_000)));
        assert!(r.covers(ts(2_000)));
        assert!(r.covers(ts(11_000)));
        assert!(!r.covers(ts(1_999)));
        assert!(!r.covers(ts(12_000)));
        assert!(!rra(1, 1000, 10, None).covers(ts(5_000)));
    }

    #[test]
    fn best_rra_prefers_finest_adequate_step() {
        let ds = DataSource {
            id: DsId::new(1),
            ident: Ident::new().with("name", "a"),
            step_ms: 1000,
            heartbeat_ms: 120_000,
            last_update: Some(ts(1_000_000)),
            value: f64::NAN,
            duration_ms: 0,
            created: false,
            rras: vec![
                rra(1, 1000, 100, Some(1_000_000)),   // 1s x 100 = 100s span
                rra(2, 10_000, 100, Some(1_000_000)), // 10s x 100 = 1000s span
            ],
        };

        // Range reaching past the fine archive's retention: only the
        // coarse archive still covers `from`.
        let got = ds.best_rra(ts(500_000), ts(1_000_000), 1000).unwrap();
        assert_eq!(got.id, RraId::new(2));

        // Narrow recent range, generous budget: the fine archive wins.
        let got = ds.best_rra(ts(990_000), ts(1_000_000), 100).unwrap();
        assert_eq!(got.id, RraId::new(1));

        // Narrow recent range, tiny budget: want_step is 5s, only the
        // 10s archive keeps the slot count under budget.
        let got = ds.best_rra(ts(990_000), ts(1_000_000), 2).unwrap();
        assert_eq!(got.id, RraId::new(2));
    }

    #[test]
    fn best_rra_falls_back_to_longest_span() {
        let ds = DataSource {
            id: DsId::new(1),
            ident: Ident::new().with("name", "a"),
            step_ms: 1000,
            heartbeat_ms: 120_000,
            last_update: None,
            value: f64::NAN,
            duration_ms: 0,
            created: false,
            rras: vec![rra(1, 1000, 10, None), rra(2, 10_000, 10, None)],
        };
        let got = ds.best_rra(ts(0), ts(1_000), 10).unwrap();
        assert_eq!(got.id, RraId::new(2));
    }

    #[test]
    fn rra_spec_geometry() {
        let spec = RraSpec {
            function: ConsolidationFn::Max,
            step: Duration::from_secs(10),
            span: Duration::from_secs(3600),
            xff: 0.5,
            latest: None,
        };
        assert_eq!(spec.step_ms(), 10_000);
        assert_eq!(spec.size(), 360);
    }
}
