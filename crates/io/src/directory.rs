// Directory-backed snapshot store

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::DateTime;
use serde::Deserialize;

use casemap_recon::model::Revision;
use casemap_recon::store::{SnapshotStore, StoreError};

/// Revision manifest file name inside the directory.
pub const MANIFEST: &str = "revisions.csv";

/// Flat directory of pre-extracted snapshots.
///
/// Files are named `<filetype>.<sequence>.<revision>.csv`, for example
/// `data-by-modzcta.csv.004.b92f6e5.csv`. Revision metadata comes from a
/// `revisions.csv` manifest with `revision,recorded_at,label` columns
/// (`recorded_at` in RFC 3339). When a revision has several files of one
/// filetype the highest sequence is used.
#[derive(Debug)]
pub struct DirectoryStore {
    root: PathBuf,
    revisions: Vec<Revision>,
    /// (revision, filetype) → (sequence, file name)
    files: BTreeMap<(String, String), (u32, String)>,
}

#[derive(Debug, Deserialize)]
struct ManifestRow {
    revision: String,
    recorded_at: String,
    label: String,
}

/// Split `<filetype>.<sequence>.<revision>.csv` into its parts.
pub fn parse_snapshot_file_name(name: &str) -> Option<(String, u32, String)> {
    let stem = name.strip_suffix(".csv")?;
    let mut parts = stem.rsplitn(3, '.');
    let revision = parts.next()?;
    let sequence = parts.next()?.parse::<u32>().ok()?;
    let filetype = parts.next()?;
    if revision.is_empty() || filetype.is_empty() {
        return None;
    }
    Some((filetype.to_string(), sequence, revision.to_string()))
}

impl DirectoryStore {
    pub fn open(root: &Path) -> Result<Self, StoreError> {
        let revisions = read_manifest(&root.join(MANIFEST))?;

        let entries = std::fs::read_dir(root)
            .map_err(|e| StoreError::Backend(format!("cannot list {}: {e}", root.display())))?;

        let mut files: BTreeMap<(String, String), (u32, String)> = BTreeMap::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::Backend(format!("cannot list {}: {e}", root.display())))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == MANIFEST {
                continue;
            }
            let Some((filetype, sequence, revision)) = parse_snapshot_file_name(&name) else {
                log::debug!("{}: ignoring {name}", root.display());
                continue;
            };
            let slot = files.entry((revision, filetype)).or_insert((sequence, name.clone()));
            if sequence > slot.0 {
                *slot = (sequence, name);
            }
        }

        log::debug!(
            "{}: {} revision(s), {} snapshot file(s)",
            root.display(),
            revisions.len(),
            files.len()
        );

        Ok(Self {
            root: root.to_owned(),
            revisions,
            files,
        })
    }
}

fn read_manifest(path: &Path) -> Result<Vec<Revision>, StoreError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| StoreError::Backend(format!("cannot read manifest {}: {e}", path.display())))?;

    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());

    let mut revisions = Vec::new();
    for (i, row) in reader.deserialize::<ManifestRow>().enumerate() {
        let line = i + 2;
        let row = row.map_err(|e| {
            StoreError::Backend(format!("{} line {line}: {e}", path.display()))
        })?;
        let recorded_at = DateTime::parse_from_rfc3339(&row.recorded_at).map_err(|e| {
            StoreError::Backend(format!(
                "{} line {line}: bad recorded_at '{}': {e}",
                path.display(),
                row.recorded_at
            ))
        })?;
        revisions.push(Revision {
            id: row.revision,
            label: row.label,
            recorded_at,
        });
    }
    Ok(revisions)
}

impl SnapshotStore for DirectoryStore {
    fn list_revisions(&self) -> Result<Vec<Revision>, StoreError> {
        Ok(self.revisions.clone())
    }

    fn read_file_at_revision(&self, revision_id: &str, path: &str) -> Result<String, StoreError> {
        if !self.revisions.iter().any(|r| r.id == revision_id) {
            return Err(StoreError::UnknownRevision(revision_id.to_string()));
        }
        let Some((_, name)) = self.files.get(&(revision_id.to_string(), path.to_string())) else {
            return Err(StoreError::NotFound {
                revision: revision_id.to_string(),
                path: path.to_string(),
            });
        };
        let full = self.root.join(name);
        std::fs::read_to_string(&full)
            .map_err(|e| StoreError::Backend(format!("cannot read {}: {e}", full.display())))
    }
}
