//! Cross-snapshot reconciliation.
//!
//! Passes run in a fixed order, each taking and returning the full corpus:
//!
//! 1. region names: the most recently observed (neighborhood, borough) pair
//!    per region is applied to every date of that region;
//! 2. population denominators: the single denominator per region is applied
//!    to every date, and missing case rates are derived from it;
//! 3. anomaly corrections from the configured table;
//! 4. (region, date) uniqueness check.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::NaiveDate;
use ordered_float::OrderedFloat;

use crate::anomaly::{apply_anomalies, Anomaly};
use crate::error::ReconError;
use crate::model::{LongitudinalDataset, NormalizedRecord, RegionKey, Snapshot};

/// Cases per this many residents.
pub const CASE_RATE_SCALE: f64 = 100_000.0;

/// Concatenate snapshots in date order, keeping each snapshot's row order.
pub fn concat_snapshots(snapshots: &[Snapshot]) -> Vec<NormalizedRecord> {
    let mut ordered: Vec<&Snapshot> = snapshots.iter().collect();
    ordered.sort_by_key(|s| s.date);
    ordered
        .into_iter()
        .flat_map(|s| s.records.iter().cloned())
        .collect()
}

/// Run every pass over the corpus.
pub fn reconcile(
    records: Vec<NormalizedRecord>,
    anomalies: &[Anomaly],
) -> Result<LongitudinalDataset, ReconError> {
    let input_rows = records.len();
    let records = backfill_region_names(records);
    let records = backfill_population(records)?;
    let (records, _) = apply_anomalies(records, anomalies);
    ensure_unique(&records)?;

    let dataset = LongitudinalDataset::from_records(records);
    log::info!(
        "reconciled {input_rows} row(s) into {} record(s) over {} date(s)",
        dataset.len(),
        dataset.dates().len(),
    );
    Ok(dataset)
}

/// Most recently observed (neighborhood, borough) per region.
///
/// Only rows carrying both names count. Ties on the latest date go to the
/// first such row in corpus order.
pub fn resolve_region_names(
    records: &[NormalizedRecord],
) -> BTreeMap<RegionKey, (String, String)> {
    let mut best: BTreeMap<RegionKey, (NaiveDate, String, String)> = BTreeMap::new();

    for r in records {
        let (Some(name), Some(borough)) = (&r.neighborhood, &r.borough) else {
            continue;
        };
        let newer = best.get(&r.region).map_or(true, |(seen, _, _)| r.date > *seen);
        if newer {
            best.insert(r.region, (r.date, name.clone(), borough.clone()));
        }
    }

    best.into_iter()
        .map(|(region, (_, name, borough))| (region, (name, borough)))
        .collect()
}

/// Replace every record's names with its region's resolved pair. Regions
/// never observed with names end up with neither.
pub fn backfill_region_names(records: Vec<NormalizedRecord>) -> Vec<NormalizedRecord> {
    let names = resolve_region_names(&records);
    log::debug!("resolved names for {} region(s)", names.len());

    records
        .into_iter()
        .map(|mut r| {
            match names.get(&r.region) {
                Some((name, borough)) => {
                    r.neighborhood = Some(name.clone());
                    r.borough = Some(borough.clone());
                }
                None => {
                    r.neighborhood = None;
                    r.borough = None;
                }
            }
            r
        })
        .collect()
}

/// The one population denominator per region.
///
/// The upstream series publishes a fixed denominator per region, so more than
/// one distinct value for a region is a data defect and fails the run.
pub fn resolve_population(
    records: &[NormalizedRecord],
) -> Result<BTreeMap<RegionKey, f64>, ReconError> {
    let mut seen: BTreeMap<RegionKey, BTreeSet<OrderedFloat<f64>>> = BTreeMap::new();
    for r in records {
        if let Some(pop) = r.population {
            seen.entry(r.region).or_default().insert(OrderedFloat(pop));
        }
    }

    let mut resolved = BTreeMap::new();
    for (region, values) in seen {
        if values.len() > 1 {
            return Err(ReconError::DenominatorConflict {
                region,
                values: values.into_iter().map(|v| v.0).collect(),
            });
        }
        if let Some(value) = values.into_iter().next() {
            resolved.insert(region, value.0);
        }
    }
    Ok(resolved)
}

/// `CASE_RATE_SCALE * case_count / population`; absent when undefined.
pub fn derive_case_rate(case_count: i64, population: Option<f64>) -> Option<f64> {
    let pop = population?;
    if pop == 0.0 {
        return None;
    }
    let rate = CASE_RATE_SCALE * case_count as f64 / pop;
    rate.is_finite().then_some(rate)
}

/// Attach the per-region denominator to every record and fill missing case
/// rates. A case rate already present is never overwritten.
pub fn backfill_population(
    records: Vec<NormalizedRecord>,
) -> Result<Vec<NormalizedRecord>, ReconError> {
    let population = resolve_population(&records)?;
    let mut derived = 0usize;

    let records = records
        .into_iter()
        .map(|mut r| {
            r.population = population.get(&r.region).copied();
            if r.case_rate.is_none() {
                r.case_rate = derive_case_rate(r.case_count, r.population);
                if r.case_rate.is_some() {
                    derived += 1;
                }
            }
            r
        })
        .collect();

    log::debug!(
        "denominators for {} region(s); derived {derived} case rate(s)",
        population.len()
    );
    Ok(records)
}

/// Fail on the first (region, date) seen twice.
pub fn ensure_unique(records: &[NormalizedRecord]) -> Result<(), ReconError> {
    let mut keys: HashSet<(RegionKey, NaiveDate)> = HashSet::with_capacity(records.len());
    for r in records {
        if !keys.insert((r.region, r.date)) {
            return Err(ReconError::DuplicateKey {
                region: r.region,
                date: r.date,
            });
        }
    }
    Ok(())
}
