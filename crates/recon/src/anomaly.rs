//! Known upstream defects and the corrections applied for them.
//!
//! The default table is versioned with the crate. Each entry is an exact
//! predicate; nothing here is inferred from the data.
//!
//! | # | kind          | predicate                                                  | reason                                |
//! |---|---------------|------------------------------------------------------------|---------------------------------------|
//! | 1 | `drop_region` | region == 99999                                            | "unassigned" sentinel on two dates    |
//! | 2 | `drop_record` | date == 2020-04-10, region == 11697, case_count == 52      | carried-over copy of the previous day |
//! | 3 | `drop_date`   | date == 2020-04-26                                         | snapshot corrupt upstream             |

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::model::{NormalizedRecord, RegionKey};

/// Version of the built-in table. Bump when an entry is added or changed.
pub const ANOMALY_TABLE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Anomaly {
    /// Remove every row for a region.
    DropRegion {
        region: RegionKey,
        #[serde(default)]
        note: String,
    },
    /// Remove rows matching an exact (date, region, case count).
    DropRecord {
        date: NaiveDate,
        region: RegionKey,
        case_count: i64,
        #[serde(default)]
        note: String,
    },
    /// Remove every row for a date.
    DropDate {
        date: NaiveDate,
        #[serde(default)]
        note: String,
    },
}

impl Anomaly {
    pub fn matches(&self, record: &NormalizedRecord) -> bool {
        match self {
            Self::DropRegion { region, .. } => record.region == *region,
            Self::DropRecord {
                date,
                region,
                case_count,
                ..
            } => record.date == *date && record.region == *region && record.case_count == *case_count,
            Self::DropDate { date, .. } => record.date == *date,
        }
    }

    pub fn note(&self) -> &str {
        match self {
            Self::DropRegion { note, .. }
            | Self::DropRecord { note, .. }
            | Self::DropDate { note, .. } => note,
        }
    }
}

/// The built-in correction table (see module docs).
pub fn known_anomalies() -> Vec<Anomaly> {
    let date = |m, d| NaiveDate::from_ymd_opt(2020, m, d).unwrap_or_default();
    vec![
        Anomaly::DropRegion {
            region: RegionKey(99999),
            note: "unassigned region sentinel".into(),
        },
        Anomaly::DropRecord {
            date: date(4, 10),
            region: RegionKey(11697),
            case_count: 52,
            note: "copy of 2020-04-09 row carried into 2020-04-10".into(),
        },
        Anomaly::DropDate {
            date: date(4, 26),
            note: "2020-04-26 snapshot corrupt upstream".into(),
        },
    ]
}

/// Identifies the correction table a run used: `builtin-v<N>` for the
/// built-in table, otherwise `config-<hash>` over the table's JSON.
pub fn table_version(rules: &[Anomaly]) -> String {
    if rules == known_anomalies().as_slice() {
        return format!("builtin-v{ANOMALY_TABLE_VERSION}");
    }
    let json = serde_json::to_string(rules).unwrap_or_default();
    let hash = blake3::hash(json.as_bytes()).to_hex();
    format!("config-{}", &hash.as_str()[..12])
}

/// Apply `rules` in order. Returns the surviving records and how many rows
/// each rule removed.
pub fn apply_anomalies(
    records: Vec<NormalizedRecord>,
    rules: &[Anomaly],
) -> (Vec<NormalizedRecord>, Vec<usize>) {
    let mut removed = Vec::with_capacity(rules.len());
    let mut current = records;

    for rule in rules {
        let before = current.len();
        current.retain(|r| !rule.matches(r));
        let dropped = before - current.len();
        if dropped > 0 {
            log::info!("anomaly correction removed {dropped} row(s): {}", rule.note());
        }
        removed.push(dropped);
    }

    (current, removed)
}
