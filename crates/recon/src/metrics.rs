//! Per-region metric series derived from a reconciled dataset.
//!
//! A [`MetricTable`] holds one value per (region, date). Differences and
//! moving averages are computed per region over the region's own sequence of
//! available dates, so a missing date does not shift other regions.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;

use crate::model::{columns, LongitudinalDataset, NormalizedRecord, RegionKey};

// ---------------------------------------------------------------------------
// Column selection
// ---------------------------------------------------------------------------

/// A numeric column of the reconciled dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Column {
    CaseCount,
    CaseRate,
    PercentPositive,
    Total,
    Population,
    DeathCount,
    DeathRate,
    /// A passthrough column, parsed as a number when read.
    Other(String),
}

impl Column {
    pub fn name(&self) -> &str {
        match self {
            Self::CaseCount => columns::CASE_COUNT,
            Self::CaseRate => columns::CASE_RATE,
            Self::PercentPositive => columns::PERCENT_POSITIVE,
            Self::Total => columns::TOTAL,
            Self::Population => columns::POPULATION,
            Self::DeathCount => columns::DEATH_COUNT,
            Self::DeathRate => columns::DEATH_RATE,
            Self::Other(name) => name,
        }
    }

    pub fn value(&self, record: &NormalizedRecord) -> Option<f64> {
        match self {
            Self::CaseCount => Some(record.case_count as f64),
            Self::CaseRate => record.case_rate,
            Self::PercentPositive => record.percent_positive,
            Self::Total => record.total.map(|v| v as f64),
            Self::Population => record.population,
            Self::DeathCount => record.death_count.map(|v| v as f64),
            Self::DeathRate => record.death_rate,
            Self::Other(name) => record
                .extra
                .get(name)
                .and_then(|v| v.trim().parse::<f64>().ok())
                .filter(|v| v.is_finite()),
        }
    }
}

impl FromStr for Column {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_uppercase();
        Ok(match upper.as_str() {
            columns::CASE_COUNT => Self::CaseCount,
            columns::CASE_RATE => Self::CaseRate,
            columns::PERCENT_POSITIVE => Self::PercentPositive,
            columns::TOTAL => Self::Total,
            columns::POPULATION => Self::Population,
            columns::DEATH_COUNT => Self::DeathCount,
            columns::DEATH_RATE => Self::DeathRate,
            columns::REGION | columns::DATE | columns::NEIGHBORHOOD | columns::BOROUGH => {
                return Err(format!("{upper} is not a numeric column"));
            }
            "" => return Err("empty column name".into()),
            _ => Self::Other(upper),
        })
    }
}

impl fmt::Display for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// Date range
// ---------------------------------------------------------------------------

/// Inclusive date range; an open end is unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DateRange {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

impl DateRange {
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.from.map_or(true, |f| date >= f) && self.to.map_or(true, |t| date <= t)
    }
}

// ---------------------------------------------------------------------------
// Metric table
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct MetricTable {
    pub name: String,
    values: BTreeMap<(RegionKey, NaiveDate), Option<f64>>,
}

impl MetricTable {
    pub fn from_dataset(dataset: &LongitudinalDataset, column: &Column) -> Self {
        let values = dataset
            .records()
            .iter()
            .map(|r| ((r.region, r.date), column.value(r)))
            .collect();
        Self {
            name: column.name().to_string(),
            values,
        }
    }

    pub fn get(&self, region: RegionKey, date: NaiveDate) -> Option<f64> {
        self.values.get(&(region, date)).copied().flatten()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn dates(&self) -> BTreeSet<NaiveDate> {
        self.values.keys().map(|(_, d)| *d).collect()
    }

    /// Region → value for one date.
    pub fn on_date(&self, date: NaiveDate) -> BTreeMap<RegionKey, Option<f64>> {
        self.values
            .iter()
            .filter(|((_, d), _)| *d == date)
            .map(|((region, _), v)| (*region, *v))
            .collect()
    }

    /// Earliest date on which every row has a value. Differences and moving
    /// averages leave the leading dates of each region empty.
    pub fn first_complete_date(&self) -> Option<NaiveDate> {
        let mut incomplete = BTreeSet::new();
        for (&(_, date), value) in &self.values {
            if value.is_none() {
                incomplete.insert(date);
            }
        }
        self.dates().into_iter().find(|d| !incomplete.contains(d))
    }

    fn present_in(&self, range: DateRange) -> impl Iterator<Item = f64> + '_ {
        self.values
            .iter()
            .filter(move |((_, d), _)| range.contains(*d))
            .filter_map(|(_, v)| *v)
    }

    /// (min, max) of present values in the range.
    pub fn bounds(&self, range: DateRange) -> Option<(f64, f64)> {
        self.present_in(range).fold(None, |acc, v| match acc {
            None => Some((v, v)),
            Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
        })
    }

    /// Present values in the range strictly below `min` or above `max`.
    pub fn count_outside(&self, min: f64, max: f64, range: DateRange) -> usize {
        self.present_in(range).filter(|v| *v < min || *v > max).count()
    }

    /// Per-region difference from the region's previous available date.
    pub fn diff(&self) -> MetricTable {
        let mut values = BTreeMap::new();
        let mut prev: Option<(RegionKey, Option<f64>)> = None;

        for (&(region, date), &value) in &self.values {
            let delta = match prev {
                Some((prev_region, Some(p))) if prev_region == region => value.map(|v| v - p),
                _ => None,
            };
            values.insert((region, date), delta);
            prev = Some((region, value));
        }

        MetricTable {
            name: format!("{}_DIFF", self.name),
            values,
        }
    }

    /// Per-region mean of the last `window` values (inclusive). Absent until
    /// `window` values exist or when any of them is absent.
    pub fn moving_average(&self, window: usize) -> MetricTable {
        let window = window.max(1);
        let mut values = BTreeMap::new();
        let mut current: Option<RegionKey> = None;
        let mut recent: VecDeque<Option<f64>> = VecDeque::with_capacity(window);

        for (&(region, date), &value) in &self.values {
            if current != Some(region) {
                current = Some(region);
                recent.clear();
            }
            recent.push_back(value);
            if recent.len() > window {
                recent.pop_front();
            }

            let mean = if recent.len() == window {
                recent
                    .iter()
                    .copied()
                    .sum::<Option<f64>>()
                    .map(|sum| sum / window as f64)
            } else {
                None
            };
            values.insert((region, date), mean);
        }

        MetricTable {
            name: format!("{}_SMA{window}", self.name),
            values,
        }
    }
}

// ---------------------------------------------------------------------------
// Transforms
// ---------------------------------------------------------------------------

/// How a column is turned into the plotted series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MetricTransform {
    #[default]
    Level,
    Diff,
    /// Moving average of the day-over-day differences.
    DiffMovingAverage(usize),
}

impl MetricTransform {
    pub fn apply(&self, table: MetricTable) -> MetricTable {
        match self {
            Self::Level => table,
            Self::Diff => table.diff(),
            Self::DiffMovingAverage(window) => table.diff().moving_average(*window),
        }
    }
}

impl FromStr for MetricTransform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        match s.as_str() {
            "level" => Ok(Self::Level),
            "diff" => Ok(Self::Diff),
            _ => {
                let window = s
                    .strip_prefix("sma:")
                    .ok_or_else(|| format!("unknown transform '{s}' (expected level, diff, sma:N)"))?;
                match window.parse::<usize>() {
                    Ok(n) if n >= 1 => Ok(Self::DiffMovingAverage(n)),
                    _ => Err(format!("invalid moving-average window '{window}'")),
                }
            }
        }
    }
}
