use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, FixedOffset, NaiveDate};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Canonical columns
// ---------------------------------------------------------------------------

/// Canonical (upper-case) column names every snapshot is normalized onto.
pub mod columns {
    pub const REGION: &str = "MODIFIED_ZCTA";
    pub const DATE: &str = "DATA_DATE";
    pub const NEIGHBORHOOD: &str = "NEIGHBORHOOD_NAME";
    pub const BOROUGH: &str = "BOROUGH_GROUP";
    pub const CASE_COUNT: &str = "COVID_CASE_COUNT";
    pub const CASE_RATE: &str = "COVID_CASE_RATE";
    pub const POPULATION: &str = "POP_DENOMINATOR";
    pub const PERCENT_POSITIVE: &str = "PERCENT_POSITIVE";
    pub const TOTAL: &str = "TOTAL";
    pub const DEATH_COUNT: &str = "COVID_DEATH_COUNT";
    pub const DEATH_RATE: &str = "COVID_DEATH_RATE";

    /// Export order of the typed columns.
    pub const ALL: [&str; 11] = [
        DATE,
        REGION,
        NEIGHBORHOOD,
        BOROUGH,
        CASE_COUNT,
        CASE_RATE,
        POPULATION,
        PERCENT_POSITIVE,
        TOTAL,
        DEATH_COUNT,
        DEATH_RATE,
    ];
}

// ---------------------------------------------------------------------------
// Revisions
// ---------------------------------------------------------------------------

/// Canonical integer code of a reporting region (MODZCTA).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegionKey(pub u32);

impl fmt::Display for RegionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One recorded version of the upstream dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    pub id: String,
    pub label: String,
    pub recorded_at: DateTime<FixedOffset>,
}

impl Revision {
    /// First seven characters of the id, for display.
    pub fn short_id(&self) -> &str {
        match self.id.char_indices().nth(7) {
            Some((idx, _)) => &self.id[..idx],
            None => &self.id,
        }
    }
}

/// Calendar date → the revision chosen to represent it.
pub type SnapshotSelection = BTreeMap<NaiveDate, Revision>;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// One region's row of one snapshot, on the canonical schema.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedRecord {
    #[serde(rename = "MODIFIED_ZCTA")]
    pub region: RegionKey,
    #[serde(rename = "DATA_DATE")]
    pub date: NaiveDate,
    #[serde(rename = "COVID_CASE_COUNT")]
    pub case_count: i64,
    #[serde(rename = "PERCENT_POSITIVE")]
    pub percent_positive: Option<f64>,
    #[serde(rename = "TOTAL")]
    pub total: Option<i64>,
    #[serde(rename = "POP_DENOMINATOR")]
    pub population: Option<f64>,
    #[serde(rename = "COVID_CASE_RATE")]
    pub case_rate: Option<f64>,
    #[serde(rename = "COVID_DEATH_COUNT")]
    pub death_count: Option<i64>,
    #[serde(rename = "COVID_DEATH_RATE")]
    pub death_rate: Option<f64>,
    #[serde(rename = "NEIGHBORHOOD_NAME")]
    pub neighborhood: Option<String>,
    #[serde(rename = "BOROUGH_GROUP")]
    pub borough: Option<String>,
    /// Columns outside the canonical schema, passed through untouched.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

impl NormalizedRecord {
    /// A record with only the guaranteed fields set.
    pub fn new(region: RegionKey, date: NaiveDate, case_count: i64) -> Self {
        Self {
            region,
            date,
            case_count,
            percent_positive: None,
            total: None,
            population: None,
            case_rate: None,
            death_count: None,
            death_rate: None,
            neighborhood: None,
            borough: None,
            extra: BTreeMap::new(),
        }
    }

    /// Render a column as text, empty when absent. Unknown names look in `extra`.
    pub fn field_text(&self, column: &str) -> String {
        fn opt<T: ToString>(v: &Option<T>) -> String {
            v.as_ref().map(|x| x.to_string()).unwrap_or_default()
        }
        match column {
            columns::REGION => self.region.to_string(),
            columns::DATE => self.date.to_string(),
            columns::CASE_COUNT => self.case_count.to_string(),
            columns::PERCENT_POSITIVE => opt(&self.percent_positive),
            columns::TOTAL => opt(&self.total),
            columns::POPULATION => opt(&self.population),
            columns::CASE_RATE => opt(&self.case_rate),
            columns::DEATH_COUNT => opt(&self.death_count),
            columns::DEATH_RATE => opt(&self.death_rate),
            columns::NEIGHBORHOOD => opt(&self.neighborhood),
            columns::BOROUGH => opt(&self.borough),
            other => self.extra.get(other).cloned().unwrap_or_default(),
        }
    }
}

/// The normalized rows of one selected snapshot.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub date: NaiveDate,
    pub revision: String,
    /// Which file identity the rows were read from.
    pub file: String,
    pub records: Vec<NormalizedRecord>,
}

// ---------------------------------------------------------------------------
// Longitudinal dataset
// ---------------------------------------------------------------------------

/// Reconciled records across all selected dates, sorted by (date, region).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct LongitudinalDataset {
    records: Vec<NormalizedRecord>,
}

impl LongitudinalDataset {
    /// Wrap already-reconciled records. Records are put in (date, region) order.
    pub fn from_records(mut records: Vec<NormalizedRecord>) -> Self {
        records.sort_by(|a, b| (a.date, a.region).cmp(&(b.date, b.region)));
        Self { records }
    }

    pub fn records(&self) -> &[NormalizedRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<NormalizedRecord> {
        self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn dates(&self) -> BTreeSet<NaiveDate> {
        self.records.iter().map(|r| r.date).collect()
    }

    pub fn regions(&self) -> BTreeSet<RegionKey> {
        self.records.iter().map(|r| r.region).collect()
    }

    pub fn on_date(&self, date: NaiveDate) -> impl Iterator<Item = &NormalizedRecord> {
        self.records.iter().filter(move |r| r.date == date)
    }

    pub fn get(&self, region: RegionKey, date: NaiveDate) -> Option<&NormalizedRecord> {
        self.records
            .binary_search_by(|r| (r.date, r.region).cmp(&(date, region)))
            .ok()
            .map(|i| &self.records[i])
    }

    /// Sorted union of passthrough column names.
    pub fn extra_columns(&self) -> BTreeSet<String> {
        self.records
            .iter()
            .flat_map(|r| r.extra.keys().cloned())
            .collect()
    }

    /// Canonical JSON encoding.
    pub fn to_json(&self) -> String {
        // Records contain only strings, integers, floats and maps with string keys.
        serde_json::to_string(&self.records).unwrap_or_default()
    }

    /// blake3 hex digest of the canonical JSON encoding.
    pub fn fingerprint(&self) -> String {
        blake3::hash(self.to_json().as_bytes()).to_hex().to_string()
    }
}

// ---------------------------------------------------------------------------
// Pipeline output
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct SelectedSnapshot {
    pub date: NaiveDate,
    pub revision: String,
    pub label: String,
    pub recorded_at: DateTime<FixedOffset>,
    pub file: String,
    pub rows: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineMeta {
    pub config_name: String,
    pub engine_version: String,
    /// Which anomaly table produced the dataset (`builtin-v1`, `config-…`).
    pub anomaly_table: String,
    pub run_at: String,
    pub snapshots: Vec<SelectedSnapshot>,
    pub fingerprint: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    pub meta: PipelineMeta,
    pub dataset: LongitudinalDataset,
}
