//! Index metadata
//!
//! Declarative definition of one search index: primary sort, extra stored
//! columns, consolidation policy, maintenance intervals, write-buffer sizing
//! and the per-field analyzer assignment.
//!
//! Parsing is strict: every error names the offending key path, e.g.
//! `consolidationPolicy.threshold`.

use crate::error::{Error, Result};
use crate::value::{join_path, parse_path, FieldValue};
use serde_json::{json, Map, Value};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Default commit interval
pub const DEFAULT_COMMIT_INTERVAL_MSEC: u64 = 1000;
/// Default consolidation interval
pub const DEFAULT_CONSOLIDATION_INTERVAL_MSEC: u64 = 1000;
/// Default number of commits between cleanups
pub const DEFAULT_CLEANUP_INTERVAL_STEP: u64 = 2;
/// Default idle write-buffer pool size
pub const DEFAULT_WRITEBUFFER_IDLE: u64 = 64;
/// Default active write-buffer limit (0 = unlimited)
pub const DEFAULT_WRITEBUFFER_ACTIVE: u64 = 0;
/// Default maximum write-buffer size in bytes
pub const DEFAULT_WRITEBUFFER_SIZE_MAX: u64 = 32 * 1024 * 1024;

/// Analyzer used when a field lists none
pub const IDENTITY_ANALYZER: &str = "identity";

// ============================================================================
// Primary sort
// ============================================================================

/// Column compression
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    /// LZ4 block compression
    #[default]
    Lz4,
    /// Stored as is
    None,
}

impl Compression {
    fn parse(v: &Value, path: &str) -> Result<Self> {
        match v.as_str() {
            Some("lz4") => Ok(Compression::Lz4),
            Some("none") => Ok(Compression::None),
            _ => Err(field_error(path, "expected \"lz4\" or \"none\"")),
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Compression::Lz4 => "lz4",
            Compression::None => "none",
        }
    }
}

/// One primary-sort field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortField {
    /// Attribute path
    pub path: Vec<String>,
    /// Ascending order
    pub ascending: bool,
}

/// The index-level sort order documents are stored in
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PrimarySort {
    fields: Vec<SortField>,
    compression: Compression,
}

impl PrimarySort {
    /// Build from `(path, ascending)` pairs
    pub fn new(fields: Vec<SortField>) -> Self {
        PrimarySort {
            fields,
            compression: Compression::default(),
        }
    }

    /// Number of sort fields
    pub fn size(&self) -> usize {
        self.fields.len()
    }

    /// True when no sort is declared
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Sort fields in declaration order
    pub fn fields(&self) -> &[SortField] {
        &self.fields
    }

    /// Column compression
    pub fn compression(&self) -> Compression {
        self.compression
    }

    /// Compare two decoded sort keys over the first `buckets` fields.
    ///
    /// Absent components sort first.
    pub fn compare(&self, a: &[Option<FieldValue>], b: &[Option<FieldValue>], buckets: usize) -> Ordering {
        for (i, field) in self.fields.iter().take(buckets).enumerate() {
            let ord = a.get(i).cmp(&b.get(i));
            let ord = if field.ascending { ord } else { ord.reverse() };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }

    fn from_json(v: &Value, compression: Compression) -> Result<Self> {
        let items = v
            .as_array()
            .ok_or_else(|| field_error("primarySort", "expected an array"))?;
        let mut fields = Vec::with_capacity(items.len());
        for (i, item) in items.iter().enumerate() {
            let path = format!("primarySort[{}]", i);
            let obj = item
                .as_object()
                .ok_or_else(|| field_error(&path, "expected an object"))?;
            let field = obj
                .get("field")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .ok_or_else(|| field_error(&format!("{}.field", path), "expected a non-empty string"))?;
            let ascending = match (obj.get("asc"), obj.get("direction")) {
                (Some(Value::Bool(b)), _) => *b,
                (Some(_), _) => return Err(field_error(&format!("{}.asc", path), "expected a boolean")),
                (None, Some(Value::String(d))) if d.eq_ignore_ascii_case("asc") => true,
                (None, Some(Value::String(d))) if d.eq_ignore_ascii_case("desc") => false,
                (None, Some(_)) => {
                    return Err(field_error(
                        &format!("{}.direction", path),
                        "expected \"asc\" or \"desc\"",
                    ))
                }
                (None, None) => true,
            };
            fields.push(SortField {
                path: parse_path(field),
                ascending,
            });
        }
        Ok(PrimarySort {
            fields,
            compression,
        })
    }

    fn to_json(&self) -> Value {
        Value::Array(
            self.fields
                .iter()
                .map(|f| json!({"field": join_path(&f.path), "asc": f.ascending}))
                .collect(),
        )
    }
}

// ============================================================================
// Stored values
// ============================================================================

/// One extra stored column (a group of attributes stored together)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredColumn {
    /// Attribute paths in column order
    pub fields: Vec<Vec<String>>,
    /// Column compression
    pub compression: Compression,
    /// Keep the column cached in memory
    pub cache: bool,
}

/// All extra stored columns of an index
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StoredValues {
    columns: Vec<StoredColumn>,
}

impl StoredValues {
    /// Build from columns
    pub fn new(columns: Vec<StoredColumn>) -> Self {
        StoredValues { columns }
    }

    /// Columns in declaration order
    pub fn columns(&self) -> &[StoredColumn] {
        &self.columns
    }

    /// True when there are no stored columns
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    fn from_json(v: &Value) -> Result<Self> {
        let items = v
            .as_array()
            .ok_or_else(|| field_error("storedValues", "expected an array"))?;
        let mut columns: Vec<StoredColumn> = Vec::with_capacity(items.len());
        for (i, item) in items.iter().enumerate() {
            let path = format!("storedValues[{}]", i);
            let (names, compression, cache) = match item {
                Value::Array(names) => (names.clone(), Compression::default(), false),
                Value::Object(obj) => {
                    let names = obj
                        .get("fields")
                        .and_then(Value::as_array)
                        .cloned()
                        .ok_or_else(|| field_error(&format!("{}.fields", path), "expected an array"))?;
                    let compression = match obj.get("compression") {
                        Some(c) => Compression::parse(c, &format!("{}.compression", path))?,
                        None => Compression::default(),
                    };
                    let cache = match obj.get("cache") {
                        Some(Value::Bool(b)) => *b,
                        Some(_) => {
                            return Err(field_error(&format!("{}.cache", path), "expected a boolean"))
                        }
                        None => false,
                    };
                    (names, compression, cache)
                }
                _ => return Err(field_error(&path, "expected an array or an object")),
            };
            let mut fields = Vec::with_capacity(names.len());
            for (j, name) in names.iter().enumerate() {
                let name = name
                    .as_str()
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| {
                        field_error(&format!("{}.fields[{}]", path, j), "expected a non-empty string")
                    })?;
                let parsed = parse_path(name);
                if !fields.contains(&parsed) {
                    fields.push(parsed);
                }
            }
            if fields.is_empty() {
                return Err(field_error(&path, "stored column must name at least one field"));
            }
            if columns.iter().any(|c| c.fields == fields) {
                continue;
            }
            columns.push(StoredColumn {
                fields,
                compression,
                cache,
            });
        }
        Ok(StoredValues { columns })
    }

    fn to_json(&self) -> Value {
        Value::Array(
            self.columns
                .iter()
                .map(|c| {
                    json!({
                        "fields": c.fields.iter().map(|f| join_path(f)).collect::<Vec<_>>(),
                        "compression": c.compression.as_str(),
                        "cache": c.cache,
                    })
                })
                .collect(),
        )
    }
}

// ============================================================================
// Consolidation policy
// ============================================================================

/// Tiered consolidation parameters
#[derive(Debug, Clone, PartialEq)]
pub struct TierPolicy {
    /// Minimum number of segments merged at once
    pub segments_min: usize,
    /// Maximum number of segments merged at once
    pub segments_max: usize,
    /// Upper bound on the size of a merge result
    pub segments_bytes_max: u64,
    /// Segments smaller than this are treated as this size
    pub segments_bytes_floor: u64,
    /// Candidates scoring below this are skipped
    pub min_score: f64,
}

impl Default for TierPolicy {
    fn default() -> Self {
        TierPolicy {
            segments_min: 1,
            segments_max: 10,
            segments_bytes_max: 5 * (1 << 30),
            segments_bytes_floor: 2 * (1 << 20),
            min_score: 0.0,
        }
    }
}

/// Which segments background consolidation merges
#[derive(Debug, Clone, PartialEq)]
pub enum ConsolidationPolicy {
    /// Merge groups of similarly sized segments
    Tier(TierPolicy),
    /// Merge small segments while their accumulated size stays below
    /// `threshold` of the total
    BytesAccum {
        /// Fraction in `[0, 1]`
        threshold: f64,
    },
}

impl Default for ConsolidationPolicy {
    fn default() -> Self {
        ConsolidationPolicy::Tier(TierPolicy::default())
    }
}

impl ConsolidationPolicy {
    fn from_json(v: &Value) -> Result<Self> {
        let obj = v
            .as_object()
            .ok_or_else(|| field_error("consolidationPolicy", "expected an object"))?;
        match obj.get("type").and_then(Value::as_str) {
            Some("tier") | None => {
                let d = TierPolicy::default();
                let policy = TierPolicy {
                    segments_min: opt_u64(obj, "consolidationPolicy", "segmentsMin")?
                        .map_or(d.segments_min, |v| v as usize),
                    segments_max: opt_u64(obj, "consolidationPolicy", "segmentsMax")?
                        .map_or(d.segments_max, |v| v as usize),
                    segments_bytes_max: opt_u64(obj, "consolidationPolicy", "segmentsBytesMax")?
                        .unwrap_or(d.segments_bytes_max),
                    segments_bytes_floor: opt_u64(obj, "consolidationPolicy", "segmentsBytesFloor")?
                        .unwrap_or(d.segments_bytes_floor),
                    min_score: opt_f64(obj, "consolidationPolicy", "minScore")?.unwrap_or(d.min_score),
                };
                if policy.segments_min > policy.segments_max {
                    return Err(field_error(
                        "consolidationPolicy.segmentsMin",
                        "must not exceed segmentsMax",
                    ));
                }
                Ok(ConsolidationPolicy::Tier(policy))
            }
            Some("bytes_accum") => {
                let threshold = opt_f64(obj, "consolidationPolicy", "threshold")?.unwrap_or(0.1);
                if !(0.0..=1.0).contains(&threshold) {
                    return Err(field_error(
                        "consolidationPolicy.threshold",
                        "expected a value in [0, 1]",
                    ));
                }
                Ok(ConsolidationPolicy::BytesAccum { threshold })
            }
            Some(other) => Err(field_error(
                "consolidationPolicy.type",
                &format!("unknown policy '{}'", other),
            )),
        }
    }

    fn to_json(&self) -> Value {
        match self {
            ConsolidationPolicy::Tier(t) => json!({
                "type": "tier",
                "segmentsMin": t.segments_min,
                "segmentsMax": t.segments_max,
                "segmentsBytesMax": t.segments_bytes_max,
                "segmentsBytesFloor": t.segments_bytes_floor,
                "minScore": t.min_score,
            }),
            ConsolidationPolicy::BytesAccum { threshold } => {
                json!({"type": "bytes_accum", "threshold": threshold})
            }
        }
    }
}

// ============================================================================
// Field definitions
// ============================================================================

/// Whether raw values are kept for `fields` entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreValues {
    /// Nothing is stored
    #[default]
    None,
    /// Document ids are tracked per field
    Id,
}

/// Per-field indexing definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldMeta {
    /// Analyzer names applied to this field
    pub analyzers: Vec<String>,
    /// Explicit sub-field definitions
    pub fields: BTreeMap<String, FieldMeta>,
    /// Index every nested attribute
    pub include_all_fields: bool,
    /// Index array positions as part of the path
    pub track_list_positions: bool,
}

impl Default for FieldMeta {
    fn default() -> Self {
        FieldMeta {
            analyzers: vec![IDENTITY_ANALYZER.to_string()],
            fields: BTreeMap::new(),
            include_all_fields: false,
            track_list_positions: false,
        }
    }
}

impl FieldMeta {
    fn from_json(v: &Value, path: &str, inherited: &FieldMeta) -> Result<Self> {
        let empty = Map::new();
        let obj = match v {
            Value::Object(o) => o,
            Value::Null => &empty,
            _ => return Err(field_error(path, "expected an object")),
        };
        let analyzers = match obj.get("analyzers") {
            None => inherited.analyzers.clone(),
            Some(Value::Array(items)) => {
                let mut out = Vec::with_capacity(items.len());
                for (i, a) in items.iter().enumerate() {
                    let name = a.as_str().filter(|s| !s.is_empty()).ok_or_else(|| {
                        field_error(&format!("{}.analyzers[{}]", path, i), "expected an analyzer name")
                    })?;
                    if !out.iter().any(|n: &String| n == name) {
                        out.push(name.to_string());
                    }
                }
                out
            }
            Some(_) => return Err(field_error(&format!("{}.analyzers", path), "expected an array")),
        };
        let include_all_fields = opt_bool(obj, path, "includeAllFields")?.unwrap_or(inherited.include_all_fields);
        let track_list_positions =
            opt_bool(obj, path, "trackListPositions")?.unwrap_or(inherited.track_list_positions);
        let mut meta = FieldMeta {
            analyzers,
            fields: BTreeMap::new(),
            include_all_fields,
            track_list_positions,
        };
        if let Some(fields) = obj.get("fields") {
            meta.fields = parse_fields(fields, &format!("{}.fields", path), &meta)?;
        }
        Ok(meta)
    }

    fn to_json(&self) -> Value {
        let fields: Map<String, Value> = self
            .fields
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect();
        json!({
            "analyzers": self.analyzers,
            "fields": fields,
            "includeAllFields": self.include_all_fields,
            "trackListPositions": self.track_list_positions,
        })
    }

    fn is_indexed(&self, rest: &[String]) -> bool {
        match rest.split_first() {
            None => true,
            Some((head, tail)) => match self.fields.get(head) {
                Some(sub) => sub.is_indexed(tail),
                None => self.include_all_fields,
            },
        }
    }
}

fn parse_fields(v: &Value, path: &str, inherited: &FieldMeta) -> Result<BTreeMap<String, FieldMeta>> {
    let obj = v
        .as_object()
        .ok_or_else(|| field_error(path, "expected an object"))?;
    let mut out = BTreeMap::new();
    for (name, def) in obj {
        if name.is_empty() {
            return Err(field_error(path, "field names must not be empty"));
        }
        let sub = FieldMeta::from_json(def, &format!("{}.{}", path, name), inherited)?;
        out.insert(name.clone(), sub);
    }
    Ok(out)
}

// ============================================================================
// IndexMeta
// ============================================================================

/// Full definition of one search index
#[derive(Debug, Clone, PartialEq)]
pub struct IndexMeta {
    /// Sort order of documents inside segments
    pub primary_sort: PrimarySort,
    /// Extra stored columns
    pub stored_values: StoredValues,
    /// Background consolidation policy
    pub consolidation_policy: ConsolidationPolicy,
    /// Milliseconds between background commits (0 disables)
    pub commit_interval_msec: u64,
    /// Milliseconds between background consolidations (0 disables)
    pub consolidation_interval_msec: u64,
    /// Number of commits between cleanups (0 disables)
    pub cleanup_interval_step: u64,
    /// Idle write-buffer pool size
    pub writebuffer_idle: u64,
    /// Active write-buffer limit
    pub writebuffer_active: u64,
    /// Maximum write-buffer size in bytes
    pub writebuffer_size_max: u64,
    /// Root field definition (top-level `analyzers`, `fields`, ...)
    pub root: FieldMeta,
    /// Value storage mode
    pub store_values: StoreValues,
    /// Format version
    pub version: u32,
}

impl Default for IndexMeta {
    fn default() -> Self {
        IndexMeta {
            primary_sort: PrimarySort::default(),
            stored_values: StoredValues::default(),
            consolidation_policy: ConsolidationPolicy::default(),
            commit_interval_msec: DEFAULT_COMMIT_INTERVAL_MSEC,
            consolidation_interval_msec: DEFAULT_CONSOLIDATION_INTERVAL_MSEC,
            cleanup_interval_step: DEFAULT_CLEANUP_INTERVAL_STEP,
            writebuffer_idle: DEFAULT_WRITEBUFFER_IDLE,
            writebuffer_active: DEFAULT_WRITEBUFFER_ACTIVE,
            writebuffer_size_max: DEFAULT_WRITEBUFFER_SIZE_MAX,
            root: FieldMeta {
                include_all_fields: true,
                ..FieldMeta::default()
            },
            store_values: StoreValues::default(),
            version: 0,
        }
    }
}

impl IndexMeta {
    /// Parse and validate a JSON definition. Missing keys take defaults.
    pub fn from_json(v: &Value) -> Result<Self> {
        let obj = v
            .as_object()
            .ok_or_else(|| field_error("<root>", "index definition must be an object"))?;
        let d = IndexMeta::default();

        let compression = match obj.get("primarySortCompression") {
            Some(c) => Compression::parse(c, "primarySortCompression")?,
            None => Compression::default(),
        };
        let primary_sort = match obj.get("primarySort") {
            Some(ps) => PrimarySort::from_json(ps, compression)?,
            None => PrimarySort {
                fields: Vec::new(),
                compression,
            },
        };
        let stored_values = match obj.get("storedValues") {
            Some(sv) => StoredValues::from_json(sv)?,
            None => StoredValues::default(),
        };
        let consolidation_policy = match obj.get("consolidationPolicy") {
            Some(p) => ConsolidationPolicy::from_json(p)?,
            None => ConsolidationPolicy::default(),
        };
        let store_values = match obj.get("storeValues").map(|v| v.as_str()) {
            None => StoreValues::None,
            Some(Some("none")) => StoreValues::None,
            Some(Some("id")) => StoreValues::Id,
            Some(_) => return Err(field_error("storeValues", "expected \"none\" or \"id\"")),
        };

        // Top level behaves like a field definition whose default is to
        // include every attribute unless `fields` are listed.
        let mut root_default = FieldMeta::default();
        root_default.include_all_fields = !obj.contains_key("fields");
        let root = FieldMeta::from_json(v, "", &root_default).map_err(strip_leading_dot)?;

        let meta = IndexMeta {
            primary_sort,
            stored_values,
            consolidation_policy,
            commit_interval_msec: opt_u64(obj, "", "commitIntervalMsec")?.unwrap_or(d.commit_interval_msec),
            consolidation_interval_msec: opt_u64(obj, "", "consolidationIntervalMsec")?
                .unwrap_or(d.consolidation_interval_msec),
            cleanup_interval_step: opt_u64(obj, "", "cleanupIntervalStep")?.unwrap_or(d.cleanup_interval_step),
            writebuffer_idle: opt_u64(obj, "", "writebufferIdle")?.unwrap_or(d.writebuffer_idle),
            writebuffer_active: opt_u64(obj, "", "writebufferActive")?.unwrap_or(d.writebuffer_active),
            writebuffer_size_max: opt_u64(obj, "", "writebufferSizeMax")?.unwrap_or(d.writebuffer_size_max),
            root,
            store_values,
            version: opt_u64(obj, "", "version")?.map_or(0, |v| v as u32),
        };
        Ok(meta)
    }

    /// Encode with every key present
    pub fn to_json(&self) -> Value {
        let mut root = self.root.to_json();
        if let Value::Object(map) = &mut root {
            map.insert("primarySort".into(), self.primary_sort.to_json());
            map.insert(
                "primarySortCompression".into(),
                json!(self.primary_sort.compression.as_str()),
            );
            map.insert("storedValues".into(), self.stored_values.to_json());
            map.insert("consolidationPolicy".into(), self.consolidation_policy.to_json());
            map.insert("commitIntervalMsec".into(), json!(self.commit_interval_msec));
            map.insert(
                "consolidationIntervalMsec".into(),
                json!(self.consolidation_interval_msec),
            );
            map.insert("cleanupIntervalStep".into(), json!(self.cleanup_interval_step));
            map.insert("writebufferIdle".into(), json!(self.writebuffer_idle));
            map.insert("writebufferActive".into(), json!(self.writebuffer_active));
            map.insert("writebufferSizeMax".into(), json!(self.writebuffer_size_max));
            map.insert(
                "storeValues".into(),
                json!(match self.store_values {
                    StoreValues::None => "none",
                    StoreValues::Id => "id",
                }),
            );
            map.insert("version".into(), json!(self.version));
        }
        root
    }

    /// True when values found at `path` go into the inverted index
    pub fn is_indexed(&self, path: &[String]) -> bool {
        !path.is_empty() && self.root.is_indexed(path)
    }

    /// Analyzers configured for `path` (closest explicit definition wins)
    pub fn analyzers_for(&self, path: &[String]) -> &[String] {
        let mut cur = &self.root;
        for part in path {
            match cur.fields.get(part) {
                Some(sub) => cur = sub,
                None => break,
            }
        }
        &cur.analyzers
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn field_error(path: &str, msg: &str) -> Error {
    Error::bad_parameter(format!("invalid index definition at '{}': {}", path, msg))
}

fn strip_leading_dot(e: Error) -> Error {
    match e {
        Error::BadParameter(msg) => Error::BadParameter(msg.replace("at '.", "at '")),
        other => other,
    }
}

fn key_path(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", prefix, key)
    }
}

fn opt_u64(obj: &Map<String, Value>, prefix: &str, key: &str) -> Result<Option<u64>> {
    match obj.get(key) {
        None => Ok(None),
        Some(v) => v
            .as_u64()
            .map(Some)
            .ok_or_else(|| field_error(&key_path(prefix, key), "expected a non-negative integer")),
    }
}

fn opt_f64(obj: &Map<String, Value>, prefix: &str, key: &str) -> Result<Option<f64>> {
    match obj.get(key) {
        None => Ok(None),
        Some(v) => v
            .as_f64()
            .map(Some)
            .ok_or_else(|| field_error(&key_path(prefix, key), "expected a number")),
    }
}

fn opt_bool(obj: &Map<String, Value>, prefix: &str, key: &str) -> Result<Option<bool>> {
    match obj.get(key) {
        None => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(_) => Err(field_error(&key_path(prefix, key), "expected a boolean")),
    }
}
