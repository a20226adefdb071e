use chrono::NaiveDate;
use thiserror::Error;

use crate::model::RegionKey;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum ReconError {
    /// TOML parse / deserialization error.
    #[error("config parse error: {0}")]
    ConfigParse(String),
    /// Config validation error (empty source path, bad colors, etc.).
    #[error("config validation error: {0}")]
    ConfigValidation(String),

    /// A revision label matched the date pattern but is not a month/day.
    #[error("revision {revision}: label token '{token}' is not a valid date (label: {label:?})")]
    LabelParse {
        revision: String,
        label: String,
        token: String,
    },
    /// Snapshot content is not well-formed CSV.
    #[error("snapshot {date}: malformed CSV: {message}")]
    CsvParse { date: NaiveDate, message: String },
    /// A required canonical column is absent after renaming.
    #[error("snapshot {date}: missing column '{column}'")]
    MissingColumn { date: NaiveDate, column: String },
    /// Two raw columns normalize onto the same canonical column.
    #[error("snapshot {date}: columns '{first}' and '{second}' both map to '{canonical}'")]
    DuplicateColumn {
        date: NaiveDate,
        canonical: String,
        first: String,
        second: String,
    },
    /// A numeric cell failed to parse.
    #[error("snapshot {date}, row {row}: cannot parse {column} value '{value}'")]
    NumberParse {
        date: NaiveDate,
        row: usize,
        column: String,
        value: String,
    },

    /// More than one population denominator observed for a region.
    #[error("region {region}: conflicting population denominators {values:?}")]
    DenominatorConflict { region: RegionKey, values: Vec<f64> },
    /// (region, date) appears more than once after reconciliation.
    #[error("region {region} appears more than once on {date}")]
    DuplicateKey { region: RegionKey, date: NaiveDate },

    /// Snapshot store failure outside the primary/fallback rule.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Loading the snapshot selected for a date failed.
    #[error("loading snapshot for {date} (revision {revision}): {source}")]
    Load {
        date: NaiveDate,
        revision: String,
        #[source]
        source: Box<ReconError>,
    },
}

impl ReconError {
    /// Unwrap `Load` context to reach the error that caused it.
    pub fn root(&self) -> &ReconError {
        match self {
            Self::Load { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_integrity_violation(&self) -> bool {
        matches!(
            self.root(),
            Self::DenominatorConflict { .. } | Self::DuplicateKey { .. }
        )
    }

    pub fn is_parse_error(&self) -> bool {
        matches!(
            self.root(),
            Self::LabelParse { .. }
                | Self::CsvParse { .. }
                | Self::MissingColumn { .. }
                | Self::DuplicateColumn { .. }
                | Self::NumberParse { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_context_unwraps_to_root() {
        let date = NaiveDate::from_ymd_opt(2020, 4, 10).unwrap();
        let err = ReconError::Load {
            date,
            revision: "b92f6e5".into(),
            source: Box::new(ReconError::MissingColumn {
                date,
                column: "COVID_CASE_COUNT".into(),
            }),
        };
        assert!(err.is_parse_error());
        assert!(!err.is_integrity_violation());
        assert!(err.to_string().contains("b92f6e5"));
        assert!(err.to_string().contains("COVID_CASE_COUNT"));
    }
}
