//! Snapshot loading and schema normalization.
//!
//! Upstream changed file names and column spellings several times. Every
//! snapshot is mapped onto the canonical schema in [`crate::model::columns`]:
//! headers are upper-cased, historical names renamed, and `TOTAL` synthesized
//! from the case count and percent positive when a revision does not carry it.

use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDate;

use crate::config::SnapshotFiles;
use crate::error::ReconError;
use crate::model::{columns, NormalizedRecord, RegionKey, Revision, Snapshot};
use crate::store::{SnapshotStore, StoreError};

/// Cell spellings read as "no value" (the upstream tooling's NA markers).
const MISSING_MARKERS: [&str; 7] = ["", "NA", "N/A", "NaN", "nan", "null", "NULL"];

/// Read the snapshot table for a revision. Returns (file used, content).
///
/// `files.fallback` is tried only when the store reports `files.primary` as
/// not found; every other store error propagates.
pub fn load_snapshot(
    store: &dyn SnapshotStore,
    revision_id: &str,
    files: &SnapshotFiles,
) -> Result<(String, String), ReconError> {
    match store.read_file_at_revision(revision_id, &files.primary) {
        Ok(text) => Ok((files.primary.clone(), text)),
        Err(StoreError::NotFound { .. }) => {
            log::debug!(
                "revision {revision_id}: {} not found, reading {}",
                files.primary,
                files.fallback
            );
            let text = store.read_file_at_revision(revision_id, &files.fallback)?;
            Ok((files.fallback.clone(), text))
        }
        Err(e) => Err(e.into()),
    }
}

/// Load and normalize the snapshot selected for `date`.
pub fn load_and_normalize(
    store: &dyn SnapshotStore,
    revision: &Revision,
    date: NaiveDate,
    files: &SnapshotFiles,
    renames: &BTreeMap<String, String>,
) -> Result<Snapshot, ReconError> {
    let (file, text) = load_snapshot(store, &revision.id, files)?;
    let records = normalize_snapshot(&text, date, renames)?;
    log::debug!(
        "{date}: {} row(s) from {file} at {}",
        records.len(),
        revision.short_id()
    );
    Ok(Snapshot {
        date,
        revision: revision.id.clone(),
        file,
        records,
    })
}

/// `round(100 * case_count / percent_positive)`; absent when undefined.
pub fn derive_total(case_count: i64, percent_positive: Option<f64>) -> Option<i64> {
    let pct = percent_positive?;
    if pct == 0.0 {
        return None;
    }
    let total = 100.0 * case_count as f64 / pct;
    if !total.is_finite() {
        return None;
    }
    // Half-to-even, as the original numeric tooling rounds.
    Some(total.round_ties_even() as i64)
}

/// Canonical column name → (index, raw header).
fn canonical_headers(
    headers: &csv::StringRecord,
    date: NaiveDate,
    renames: &BTreeMap<String, String>,
) -> Result<HashMap<String, (usize, String)>, ReconError> {
    let mut map: HashMap<String, (usize, String)> = HashMap::new();
    for (i, raw) in headers.iter().enumerate() {
        let upper = raw.trim_start_matches('\u{feff}').trim().to_uppercase();
        let canonical = renames.get(&upper).cloned().unwrap_or(upper);
        if let Some((_, first)) = map.get(&canonical) {
            return Err(ReconError::DuplicateColumn {
                date,
                canonical,
                first: first.clone(),
                second: raw.to_string(),
            });
        }
        map.insert(canonical, (i, raw.to_string()));
    }
    Ok(map)
}

fn is_missing(cell: &str) -> bool {
    MISSING_MARKERS.contains(&cell.trim())
}

/// Integer cell; integral decimals such as `10001.0` are accepted.
fn parse_integral(cell: &str) -> Option<i64> {
    let cell = cell.trim();
    if let Ok(v) = cell.parse::<i64>() {
        return Some(v);
    }
    let v: f64 = cell.parse().ok()?;
    (v.is_finite() && v.fract() == 0.0 && v.abs() < 9.0e15).then_some(v as i64)
}

fn parse_real(cell: &str) -> Option<f64> {
    cell.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Normalize one snapshot's CSV text. Every row is stamped with `date`.
pub fn normalize_snapshot(
    text: &str,
    date: NaiveDate,
    renames: &BTreeMap<String, String>,
) -> Result<Vec<NormalizedRecord>, ReconError> {
    let csv_err = |e: csv::Error| ReconError::CsvParse {
        date,
        message: e.to_string(),
    };

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(text.as_bytes());

    let headers = reader.headers().map_err(csv_err)?.clone();
    let header_map = canonical_headers(&headers, date, renames)?;

    let idx = |name: &str| header_map.get(name).map(|(i, _)| *i);
    let required = |name: &str| {
        idx(name).ok_or_else(|| ReconError::MissingColumn {
            date,
            column: name.into(),
        })
    };

    let region_idx = required(columns::REGION)?;
    let case_count_idx = required(columns::CASE_COUNT)?;
    let pct_idx = idx(columns::PERCENT_POSITIVE);
    let total_idx = idx(columns::TOTAL);
    let population_idx = idx(columns::POPULATION);
    let case_rate_idx = idx(columns::CASE_RATE);
    let death_count_idx = idx(columns::DEATH_COUNT);
    let death_rate_idx = idx(columns::DEATH_RATE);
    let neighborhood_idx = idx(columns::NEIGHBORHOOD);
    let borough_idx = idx(columns::BOROUGH);

    // Everything outside the typed schema passes through. A raw DATA_DATE is
    // dropped: the selection date is authoritative.
    let mut extra_cols: Vec<(String, usize)> = header_map
        .iter()
        .filter(|(name, _)| !columns::ALL.contains(&name.as_str()))
        .map(|(name, (i, _))| (name.clone(), *i))
        .collect();
    extra_cols.sort_by_key(|(_, i)| *i);

    let mut records = Vec::new();
    let mut unkeyed = 0usize;

    for (n, row) in reader.records().enumerate() {
        let row = row.map_err(csv_err)?;
        let line = row.position().map(|p| p.line() as usize).unwrap_or(n + 2);
        let cell = |i: usize| row.get(i).unwrap_or("");
        let number_err = |column: &str, value: &str| ReconError::NumberParse {
            date,
            row: line,
            column: column.into(),
            value: value.into(),
        };

        let region_cell = cell(region_idx);
        if is_missing(region_cell) {
            unkeyed += 1;
            continue;
        }
        let region = parse_integral(region_cell)
            .and_then(|v| u32::try_from(v).ok())
            .map(RegionKey)
            .ok_or_else(|| number_err(columns::REGION, region_cell))?;

        let count_cell = cell(case_count_idx);
        let case_count =
            parse_integral(count_cell).ok_or_else(|| number_err(columns::CASE_COUNT, count_cell))?;

        let opt_real = |i: Option<usize>, column: &str| -> Result<Option<f64>, ReconError> {
            match i.map(cell) {
                None => Ok(None),
                Some(c) if is_missing(c) => Ok(None),
                Some(c) => parse_real(c).map(Some).ok_or_else(|| number_err(column, c)),
            }
        };
        let opt_int = |i: Option<usize>, column: &str| -> Result<Option<i64>, ReconError> {
            match i.map(cell) {
                None => Ok(None),
                Some(c) if is_missing(c) => Ok(None),
                Some(c) => parse_integral(c).map(Some).ok_or_else(|| number_err(column, c)),
            }
        };
        let opt_text = |i: Option<usize>| -> Option<String> {
            i.map(cell)
                .filter(|c| !is_missing(c))
                .map(|c| c.trim().to_string())
        };

        let percent_positive = opt_real(pct_idx, columns::PERCENT_POSITIVE)?;
        let total = match total_idx {
            Some(_) => opt_int(total_idx, columns::TOTAL)?,
            None => derive_total(case_count, percent_positive),
        };

        let extra = extra_cols
            .iter()
            .map(|(name, i)| (name.clone(), cell(*i).to_string()))
            .collect();

        records.push(NormalizedRecord {
            region,
            date,
            case_count,
            percent_positive,
            total,
            population: opt_real(population_idx, columns::POPULATION)?,
            case_rate: opt_real(case_rate_idx, columns::CASE_RATE)?,
            death_count: opt_int(death_count_idx, columns::DEATH_COUNT)?,
            death_rate: opt_real(death_rate_idx, columns::DEATH_RATE)?,
            neighborhood: opt_text(neighborhood_idx),
            borough: opt_text(borough_idx),
            extra,
        });
    }

    if unkeyed > 0 {
        log::warn!("{date}: skipped {unkeyed} row(s) without a region key");
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_renames;
    use crate::store::MemoryStore;
    use chrono::DateTime;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2020, 4, 10).unwrap()
    }

    fn rev(id: &str) -> Revision {
        Revision {
            id: id.into(),
            label: "4/10".into(),
            recorded_at: DateTime::parse_from_rfc3339("2020-04-10T12:00:00Z").unwrap(),
        }
    }

    #[test]
    fn derive_total_worked_example() {
        assert_eq!(derive_total(50, Some(10.0)), Some(500));
        assert_eq!(derive_total(50, Some(0.0)), None);
        assert_eq!(derive_total(50, None), None);
        // 100 * 1 / 40 = 2.5 rounds to even
        assert_eq!(derive_total(1, Some(40.0)), Some(2));
        assert_eq!(derive_total(3, Some(40.0)), Some(8));
    }

    #[test]
    fn old_schema_renamed() {
        let csv = "\
MODZCTA,Positive,Total,zcta_cum.perc_pos
,1583,2256,70.17
10001,211,448,47.1
10002,539,1024,52.64
";
        let rows = normalize_snapshot(csv, date(), &default_renames()).unwrap();
        assert_eq!(rows.len(), 2, "unkeyed summary row skipped");
        assert_eq!(rows[0].region, RegionKey(10001));
        assert_eq!(rows[0].case_count, 211);
        assert_eq!(rows[0].total, Some(448), "raw TOTAL never overwritten");
        assert_eq!(rows[0].percent_positive, Some(47.1));
        assert_eq!(rows[1].date, date());
        assert!(rows[0].extra.is_empty());
    }

    #[test]
    fn new_schema_without_total() {
        let csv = "\
MODIFIED_ZCTA,NEIGHBORHOOD_NAME,BOROUGH_GROUP,COVID_CASE_COUNT,COVID_CASE_RATE,POP_DENOMINATOR,COVID_DEATH_COUNT,COVID_DEATH_RATE,PERCENT_POSITIVE,TOTAL_COVID_TESTS
10001,Chelsea/NoMad/West Chelsea,Manhattan,50,216.26,23120.4,26,112.45,10.0,3000
10002,Chinatown/Lower East Side,Manhattan,7,9.23,75882.4,NA,,0,1000
";
        let rows = normalize_snapshot(csv, date(), &default_renames()).unwrap();
        assert_eq!(rows[0].total, Some(500));
        assert_eq!(rows[0].population, Some(23120.4));
        assert_eq!(rows[0].neighborhood.as_deref(), Some("Chelsea/NoMad/West Chelsea"));
        assert_eq!(rows[0].death_count, Some(26));
        assert_eq!(rows[0].extra["TOTAL_COVID_TESTS"], "3000");
        assert_eq!(rows[1].total, None, "zero percent positive leaves TOTAL absent");
        assert_eq!(rows[1].death_count, None);
        assert_eq!(rows[1].death_rate, None);
    }

    #[test]
    fn raw_data_date_ignored() {
        let csv = "MODIFIED_ZCTA,COVID_CASE_COUNT,DATA_DATE\n10001,5,2019-01-01\n";
        let rows = normalize_snapshot(csv, date(), &default_renames()).unwrap();
        assert_eq!(rows[0].date, date());
        assert!(rows[0].extra.is_empty());
    }

    #[test]
    fn numeric_failure_is_fatal() {
        let csv = "MODIFIED_ZCTA,COVID_CASE_COUNT,PERCENT_POSITIVE\n10001,5,abc\n";
        let err = normalize_snapshot(csv, date(), &default_renames()).unwrap_err();
        match err {
            ReconError::NumberParse { row, column, value, .. } => {
                assert_eq!(row, 2);
                assert_eq!(column, "PERCENT_POSITIVE");
                assert_eq!(value, "abc");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn blank_case_count_is_fatal() {
        let csv = "MODIFIED_ZCTA,COVID_CASE_COUNT\n10001,\n";
        let err = normalize_snapshot(csv, date(), &default_renames()).unwrap_err();
        assert!(matches!(err, ReconError::NumberParse { .. }));
    }

    #[test]
    fn integral_decimal_region_accepted() {
        let csv = "MODIFIED_ZCTA,COVID_CASE_COUNT\n10001.0,5.0\n";
        let rows = normalize_snapshot(csv, date(), &default_renames()).unwrap();
        assert_eq!(rows[0].region, RegionKey(10001));
        assert_eq!(rows[0].case_count, 5);

        let csv = "MODIFIED_ZCTA,COVID_CASE_COUNT\n10001.5,5\n";
        assert!(normalize_snapshot(csv, date(), &default_renames()).is_err());
    }

    #[test]
    fn missing_and_duplicate_columns() {
        let csv = "MODZCTA,TOTAL\n10001,5\n";
        let err = normalize_snapshot(csv, date(), &default_renames()).unwrap_err();
        assert!(matches!(err, ReconError::MissingColumn { ref column, .. } if column == "COVID_CASE_COUNT"));

        let csv = "MODZCTA,POSITIVE,ZCTA_CUM.PERC_POS,MODZCTA_CUM_PERC_POS\n10001,5,1,1\n";
        let err = normalize_snapshot(csv, date(), &default_renames()).unwrap_err();
        assert!(matches!(err, ReconError::DuplicateColumn { ref canonical, .. } if canonical == "PERCENT_POSITIVE"));
    }

    #[test]
    fn ragged_csv_is_fatal() {
        let csv = "MODIFIED_ZCTA,COVID_CASE_COUNT\n10001,5,9\n";
        let err = normalize_snapshot(csv, date(), &default_renames()).unwrap_err();
        assert!(matches!(err, ReconError::CsvParse { .. }));
    }

    #[test]
    fn loader_falls_back_only_on_not_found() {
        let files = SnapshotFiles::default();
        let mut store = MemoryStore::new();
        store.add_revision(
            rev("old"),
            [("tests-by-zcta.csv", "MODZCTA,Positive,Total\n10001,1,2\n")],
        );
        store.add_revision(
            rev("both"),
            [
                ("data-by-modzcta.csv", "MODIFIED_ZCTA,COVID_CASE_COUNT\n10001,9\n"),
                ("tests-by-zcta.csv", "MODZCTA,Positive,Total\n10001,1,2\n"),
            ],
        );
        store.add_revision(rev("neither"), []);

        let (file, _) = load_snapshot(&store, "old", &files).unwrap();
        assert_eq!(file, "tests-by-zcta.csv");

        let snap =
            load_and_normalize(&store, &rev("both"), date(), &files, &default_renames()).unwrap();
        assert_eq!(snap.file, "data-by-modzcta.csv");
        assert_eq!(snap.records[0].case_count, 9);

        let err = load_snapshot(&store, "neither", &files).unwrap_err();
        assert!(matches!(
            err,
            ReconError::Store(StoreError::NotFound { ref path, .. }) if path == "tests-by-zcta.csv"
        ));

        // Not a NotFound: no fallback attempt.
        let err = load_snapshot(&store, "missing-rev", &files).unwrap_err();
        assert!(matches!(err, ReconError::Store(StoreError::UnknownRevision(_))));
    }
}
