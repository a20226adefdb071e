use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

use chrono::{DateTime, NaiveDate};
use proptest::prelude::*;

use casemap_recon::config::{SourceConfig, SourceKind};
use casemap_recon::reconcile::reconcile;
use casemap_recon::{
    run, MemoryStore, NormalizedRecord, PipelineConfig, PipelineResult, ReconError, RegionKey,
    Revision,
};

fn fixtures_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures")
}

fn fixture(name: &str) -> String {
    let path = fixtures_dir().join(name);
    std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("cannot read {}: {e}", path.display()))
}

fn rev(id: &str, label: &str, at: &str) -> Revision {
    Revision {
        id: id.into(),
        label: label.into(),
        recorded_at: DateTime::parse_from_rfc3339(at).unwrap(),
    }
}

fn date(m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2020, m, d).unwrap()
}

fn config() -> PipelineConfig {
    PipelineConfig::with_source(
        "fixture corpus",
        SourceConfig {
            kind: SourceKind::Directory,
            path: "fixtures".into(),
        },
    )
}

/// Revision history mirroring the upstream repository: an initial commit, a
/// pre-cutoff snapshot, a superseded same-day snapshot, the old file name
/// through April and the renamed file from May on.
fn corpus() -> MemoryStore {
    let old = "tests-by-zcta.csv";
    let new = "data-by-modzcta.csv";
    let s0410 = fixture("tests-by-zcta.0410.csv");
    let s0411 = fixture("tests-by-zcta.0411.csv");
    let s0426 = fixture("tests-by-zcta.0426.csv");
    let s0520 = fixture("data-by-modzcta.0520.csv");

    let mut store = MemoryStore::new();
    store
        .add_revision(rev("0001", "Initial commit", "2020-03-28T10:00:00-04:00"), [("README.md", "#")])
        .add_revision(
            rev("0002", "Add 3/31 data", "2020-03-31T10:00:00-04:00"),
            [(old, "MODZCTA,Positive\n10001,1\n")],
        )
        .add_revision(
            rev("0003", "Add 4/10 data", "2020-04-10T09:00:00-04:00"),
            [(old, "not,a,usable\nsnapshot")],
        )
        .add_revision(rev("0004", "Data as of 4/10", "2020-04-10T18:00:00-04:00"), [(old, s0410.as_str())])
        .add_revision(rev("0005", "04.11 update", "2020-04-11T18:00:00-04:00"), [(old, s0411.as_str())])
        .add_revision(
            rev("0006", "Update for 4/26/2020 case counts", "2020-04-26T18:00:00-04:00"),
            [(old, s0426.as_str())],
        )
        .add_revision(rev("0007", "Data as of 5/20", "2020-05-20T18:00:00-04:00"), [(new, s0520.as_str())]);
    store
}

fn run_corpus() -> PipelineResult {
    run(&config(), &corpus()).unwrap()
}

// -------------------------------------------------------------------------
// Selection
// -------------------------------------------------------------------------

#[test]
fn selects_latest_revision_per_date() {
    let result = run_corpus();
    let picked: Vec<(String, &str)> = result
        .meta
        .snapshots
        .iter()
        .map(|s| (s.date.to_string(), s.revision.as_str()))
        .collect();
    assert_eq!(
        picked,
        vec![
            ("2020-04-10".to_string(), "0004"),
            ("2020-04-11".to_string(), "0005"),
            ("2020-04-26".to_string(), "0006"),
            ("2020-05-20".to_string(), "0007"),
        ]
    );
    assert_eq!(result.meta.snapshots[0].file, "tests-by-zcta.csv");
    assert_eq!(result.meta.snapshots[3].file, "data-by-modzcta.csv");
}

// -------------------------------------------------------------------------
// Reconciled dataset
// -------------------------------------------------------------------------

#[test]
fn anomalies_corrected() {
    let ds = run_corpus().dataset;

    assert!(!ds.regions().contains(&RegionKey(99999)));
    assert!(!ds.dates().contains(&date(4, 26)));
    assert_eq!(ds.get(RegionKey(11697), date(4, 10)).unwrap().case_count, 60);
    assert_eq!(
        ds.dates().into_iter().collect::<Vec<_>>(),
        vec![date(4, 10), date(4, 11), date(5, 20)]
    );
    assert_eq!(ds.len(), 9);
}

#[test]
fn no_duplicate_region_date() {
    let ds = run_corpus().dataset;
    let mut keys = HashSet::new();
    for r in ds.records() {
        assert!(keys.insert((r.region, r.date)), "duplicate {} {}", r.region, r.date);
    }
}

#[test]
fn names_backfilled_to_earliest_date() {
    let ds = run_corpus().dataset;
    let early = ds.get(RegionKey(11368), date(4, 10)).unwrap();
    assert_eq!(early.neighborhood.as_deref(), Some("Corona/North Corona"));
    assert_eq!(early.borough.as_deref(), Some("Queens"));
}

#[test]
fn totals_raw_or_derived() {
    let ds = run_corpus().dataset;
    // raw Total column on 4/10
    assert_eq!(ds.get(RegionKey(10001), date(4, 10)).unwrap().total, Some(500));
    // derived: 100 * 62 / 25.0
    assert_eq!(ds.get(RegionKey(11697), date(4, 11)).unwrap().total, Some(248));
    // derived: 100 * 300 / 14.2 = 2112.67
    let may = ds.get(RegionKey(10001), date(5, 20)).unwrap();
    assert_eq!(may.total, Some(2113));
    assert_eq!(may.extra["TOTAL_COVID_TESTS"], "2113");
}

#[test]
fn population_and_rates_backfilled() {
    let ds = run_corpus().dataset;
    let early = ds.get(RegionKey(10001), date(4, 11)).unwrap();
    assert_eq!(early.population, Some(23228.0));
    let rate = early.case_rate.unwrap();
    assert!((rate - 100_000.0 * 55.0 / 23228.0).abs() < 1e-9);

    let late = ds.get(RegionKey(10001), date(5, 20)).unwrap();
    assert_eq!(late.case_rate, Some(1291.55), "published rate kept");
}

// -------------------------------------------------------------------------
// Determinism
// -------------------------------------------------------------------------

#[test]
fn repeated_runs_byte_identical() {
    let a = run_corpus();
    let b = run_corpus();
    assert_eq!(a.dataset.to_json(), b.dataset.to_json());
    assert_eq!(a.meta.fingerprint, b.meta.fingerprint);
}

#[test]
fn reconciling_output_is_identity() {
    let config = config();
    let ds = run_corpus().dataset;
    let again = reconcile(ds.clone().into_records(), &config.anomalies).unwrap();
    assert_eq!(again, ds);
}

// -------------------------------------------------------------------------
// Failures
// -------------------------------------------------------------------------

#[test]
fn conflicting_denominator_fails_run() {
    let mut store = corpus();
    store.add_revision(
        rev("0008", "Data as of 5/21", "2020-05-21T18:00:00-04:00"),
        [(
            "data-by-modzcta.csv",
            "MODIFIED_ZCTA,COVID_CASE_COUNT,POP_DENOMINATOR\n10001,310,23300.0\n",
        )],
    );
    let err = run(&config(), &store).unwrap_err();
    assert!(
        matches!(err, ReconError::DenominatorConflict { region: RegionKey(10001), .. }),
        "{err}"
    );
    assert!(err.is_integrity_violation());
}

#[test]
fn invalid_label_date_fails_run() {
    let mut store = corpus();
    store.add_revision(rev("0009", "Data as of 13/45", "2020-05-22T18:00:00-04:00"), std::iter::empty::<(&str, &str)>());
    let err = run(&config(), &store).unwrap_err();
    assert!(matches!(err, ReconError::LabelParse { .. }));
}

#[test]
fn missing_both_files_fails_run() {
    let mut store = corpus();
    store.add_revision(
        rev("000a", "Data as of 5/23", "2020-05-23T18:00:00-04:00"),
        [("boro.csv", "x\n")],
    );
    let err = run(&config(), &store).unwrap_err();
    assert!(matches!(err, ReconError::Load { ref revision, .. } if revision == "000a"));
    assert!(matches!(err.root(), ReconError::Store(_)));
}

// -------------------------------------------------------------------------
// Properties
// -------------------------------------------------------------------------

fn population_of(region: u32) -> f64 {
    1_000.0 * f64::from(region)
}

proptest! {
    /// Any corpus without duplicate keys reconciles to unique, sorted keys
    /// with one denominator and one name pair per region.
    #[test]
    fn reconcile_keeps_keys_unique(
        rows in prop::collection::vec((1u32..6, 1u32..20, 0i64..10_000, any::<bool>(), any::<bool>()), 0..80)
    ) {
        let mut by_key = BTreeMap::new();
        for (region, day, count, with_pop, with_name) in rows {
            let mut r = NormalizedRecord::new(RegionKey(region), date(5, day), count);
            if with_pop {
                r.population = Some(population_of(region));
            }
            if with_name {
                r.neighborhood = Some(format!("n{region}-{day}"));
                r.borough = Some("Queens".into());
            }
            by_key.insert((region, day), r);
        }
        let input: Vec<_> = by_key.into_values().collect();
        let n = input.len();

        let ds = reconcile(input, &[]).unwrap();
        prop_assert_eq!(ds.len(), n);

        let keys: Vec<_> = ds.records().iter().map(|r| (r.date, r.region)).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        sorted.dedup();
        prop_assert_eq!(keys, sorted);

        let mut names = BTreeMap::new();
        for r in ds.records() {
            let pair = (r.neighborhood.clone(), r.borough.clone());
            let seen = names.entry(r.region).or_insert_with(|| pair.clone());
            prop_assert_eq!(&*seen, &pair);
            if let Some(pop) = r.population {
                prop_assert_eq!(pop, population_of(r.region.0));
                prop_assert!(r.case_rate.is_some());
            }
        }
    }
}
