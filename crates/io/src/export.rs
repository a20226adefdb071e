// Dataset export (CSV / JSON)

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

use casemap_recon::model::{columns, LongitudinalDataset};

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("unsupported output format for {0} (expected .csv or .json)")]
    UnknownFormat(PathBuf),
    #[error("cannot write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("csv: {0}")]
    Csv(#[from] csv::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Csv,
    Json,
}

impl ExportFormat {
    pub fn from_path(path: &Path) -> Result<Self, ExportError> {
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref()
        {
            Some("csv") => Ok(Self::Csv),
            Some("json") => Ok(Self::Json),
            _ => Err(ExportError::UnknownFormat(path.to_owned())),
        }
    }
}

/// Header row: canonical columns, then the sorted union of passthrough columns.
pub fn csv_headers(dataset: &LongitudinalDataset) -> Vec<String> {
    columns::ALL
        .iter()
        .map(|c| c.to_string())
        .chain(dataset.extra_columns())
        .collect()
}

/// One row per record; absent values are empty cells.
pub fn write_csv<W: Write>(dataset: &LongitudinalDataset, out: W) -> Result<(), ExportError> {
    let headers = csv_headers(dataset);
    let mut writer = csv::Writer::from_writer(out);
    writer.write_record(&headers)?;
    for record in dataset.records() {
        writer.write_record(headers.iter().map(|h| record.field_text(h)))?;
    }
    writer.flush().map_err(csv::Error::from)?;
    Ok(())
}

pub fn write_json<W: Write>(dataset: &LongitudinalDataset, out: W) -> Result<(), ExportError> {
    serde_json::to_writer_pretty(out, dataset)?;
    Ok(())
}

/// Write `dataset` to `path`, format chosen by extension.
pub fn export(dataset: &LongitudinalDataset, path: &Path) -> Result<ExportFormat, ExportError> {
    let format = ExportFormat::from_path(path)?;
    let io_err = |source| ExportError::Io {
        path: path.to_owned(),
        source,
    };
    let file = File::create(path).map_err(io_err)?;
    let mut out = BufWriter::new(file);
    match format {
        ExportFormat::Csv => write_csv(dataset, &mut out)?,
        ExportFormat::Json => write_json(dataset, &mut out)?,
    }
    out.flush().map_err(io_err)?;
    log::info!("wrote {} record(s) to {}", dataset.len(), path.display());
    Ok(format)
}
