use std::collections::BTreeMap;

use chrono::{Datelike, NaiveDate};
use serde::Deserialize;

use crate::anomaly::{known_anomalies, Anomaly};
use crate::error::ReconError;
use crate::model::columns;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    pub name: String,
    pub source: SourceConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub files: SnapshotFiles,
    #[serde(default = "default_renames")]
    pub renames: BTreeMap<String, String>,
    #[serde(default = "known_anomalies")]
    pub anomalies: Vec<Anomaly>,
    #[serde(default)]
    pub render: Option<RenderConfig>,
}

// ---------------------------------------------------------------------------
// Source
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub kind: SourceKind,
    /// Repository or directory path, relative to the config file.
    pub path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Commit history of a git repository.
    Git,
    /// Flat directory of pre-extracted `<filetype>.<seq>.<revision>.csv` files.
    Directory,
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Git => write!(f, "git"),
            Self::Directory => write!(f, "directory"),
        }
    }
}

// ---------------------------------------------------------------------------
// Index + files
// ---------------------------------------------------------------------------

/// How revision labels are turned into calendar dates.
#[derive(Debug, Clone, Deserialize)]
pub struct IndexConfig {
    /// Year assigned to every `M/D` token.
    #[serde(default = "default_year")]
    pub assumed_year: i32,
    /// Dates before this are dropped (early commits predate usable data).
    #[serde(default = "default_min_date")]
    pub min_date: NaiveDate,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            assumed_year: default_year(),
            min_date: default_min_date(),
        }
    }
}

fn default_year() -> i32 {
    2020
}

fn default_min_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2020, 4, 1).unwrap_or_default()
}

/// File identities a revision may carry its table under. `primary` is read
/// first; `fallback` only when the store reports `primary` as not found.
#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotFiles {
    #[serde(default = "default_primary")]
    pub primary: String,
    #[serde(default = "default_fallback")]
    pub fallback: String,
}

impl Default for SnapshotFiles {
    fn default() -> Self {
        Self {
            primary: default_primary(),
            fallback: default_fallback(),
        }
    }
}

fn default_primary() -> String {
    "data-by-modzcta.csv".into()
}

fn default_fallback() -> String {
    "tests-by-zcta.csv".into()
}

/// Historical column names (upper-cased) → canonical names.
pub fn default_renames() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("POSITIVE".to_string(), columns::CASE_COUNT.to_string()),
        ("ZCTA_CUM.PERC_POS".to_string(), columns::PERCENT_POSITIVE.to_string()),
        ("MODZCTA_CUM_PERC_POS".to_string(), columns::PERCENT_POSITIVE.to_string()),
        ("MODZCTA".to_string(), columns::REGION.to_string()),
    ])
}

// ---------------------------------------------------------------------------
// Render defaults
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct RenderConfig {
    pub template: String,
    #[serde(default = "default_out_dir")]
    pub out_dir: String,
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// Evenly spaced gradient stops, `#rrggbb`.
    #[serde(default = "default_colors")]
    pub colors: Vec<String>,
}

fn default_out_dir() -> String {
    "maps".into()
}

fn default_prefix() -> String {
    "NYC".into()
}

fn default_colors() -> Vec<String> {
    vec!["#3b4cc0".into(), "#dddddd".into(), "#b40426".into()]
}

// ---------------------------------------------------------------------------
// Parse + Validate
// ---------------------------------------------------------------------------

impl PipelineConfig {
    pub fn from_toml(input: &str) -> Result<Self, ReconError> {
        let mut config: PipelineConfig =
            toml::from_str(input).map_err(|e| ReconError::ConfigParse(e.to_string()))?;
        config.renames = config
            .renames
            .into_iter()
            .map(|(from, to)| (from.trim().to_uppercase(), to.trim().to_uppercase()))
            .collect();
        config.validate()?;
        Ok(config)
    }

    /// Config for `source` with every other setting at its default.
    pub fn with_source(name: impl Into<String>, source: SourceConfig) -> Self {
        Self {
            name: name.into(),
            source,
            index: IndexConfig::default(),
            files: SnapshotFiles::default(),
            renames: default_renames(),
            anomalies: known_anomalies(),
            render: None,
        }
    }

    pub fn validate(&self) -> Result<(), ReconError> {
        if self.name.trim().is_empty() {
            return Err(ReconError::ConfigValidation("name must not be empty".into()));
        }

        if self.source.path.trim().is_empty() {
            return Err(ReconError::ConfigValidation(
                "source.path must not be empty".into(),
            ));
        }

        if self.files.primary.is_empty() || self.files.fallback.is_empty() {
            return Err(ReconError::ConfigValidation(
                "files.primary and files.fallback must not be empty".into(),
            ));
        }
        if self.files.primary == self.files.fallback {
            return Err(ReconError::ConfigValidation(format!(
                "files.primary and files.fallback are both '{}'",
                self.files.primary
            )));
        }

        if !(1..=9999).contains(&self.index.assumed_year) {
            return Err(ReconError::ConfigValidation(format!(
                "index.assumed_year out of range: {}",
                self.index.assumed_year
            )));
        }
        if self.index.min_date.year() > self.index.assumed_year {
            return Err(ReconError::ConfigValidation(format!(
                "index.min_date {} is after every date in {}",
                self.index.min_date, self.index.assumed_year
            )));
        }

        for (from, to) in &self.renames {
            if from.is_empty() || to.is_empty() {
                return Err(ReconError::ConfigValidation(format!(
                    "renames: empty column name in '{from}' = '{to}'"
                )));
            }
        }

        if let Some(ref render) = self.render {
            if render.colors.len() < 2 {
                return Err(ReconError::ConfigValidation(
                    "render.colors needs at least 2 stops".into(),
                ));
            }
            for color in &render.colors {
                if parse_hex_color(color).is_none() {
                    return Err(ReconError::ConfigValidation(format!(
                        "render.colors: '{color}' is not a #rrggbb color"
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Parse `#rrggbb`.
pub fn parse_hex_color(input: &str) -> Option<(u8, u8, u8)> {
    let hex = input.strip_prefix('#')?;
    if hex.len() != 6 || !hex.is_ascii() {
        return None;
    }
    let r = u8::from_str_radix(&hex[0..2], 16).ok()?;
    let g = u8::from_str_radix(&hex[2..4], 16).ok()?;
    let b = u8::from_str_radix(&hex[4..6], 16).ok()?;
    Some((r, g, b))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
