//! Snapshot storage seam.
//!
//! The engine never touches git or the filesystem directly; it asks a
//! [`SnapshotStore`] for the revision history and for file content at a
//! revision. Concrete backings live in `casemap-io`.

use std::collections::HashMap;

use thiserror::Error;

use crate::model::Revision;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The file does not exist at that revision.
    #[error("{path} not found at revision {revision}")]
    NotFound { revision: String, path: String },
    /// The revision id does not resolve.
    #[error("unknown revision {0}")]
    UnknownRevision(String),
    /// Any other backend failure (repository corrupt, unreadable file, ...).
    #[error("snapshot store: {0}")]
    Backend(String),
}

pub trait SnapshotStore {
    /// All revisions the store knows about, in any order.
    fn list_revisions(&self) -> Result<Vec<Revision>, StoreError>;

    /// Raw text of `path` as of `revision_id`.
    fn read_file_at_revision(&self, revision_id: &str, path: &str) -> Result<String, StoreError>;
}

impl<S: SnapshotStore + ?Sized> SnapshotStore for &S {
    fn list_revisions(&self) -> Result<Vec<Revision>, StoreError> {
        (**self).list_revisions()
    }

    fn read_file_at_revision(&self, revision_id: &str, path: &str) -> Result<String, StoreError> {
        (**self).read_file_at_revision(revision_id, path)
    }
}

/// In-memory store: revisions plus (revision, path) → content.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    revisions: Vec<Revision>,
    files: HashMap<(String, String), String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a revision with the files it carries.
    pub fn add_revision<'a>(
        &mut self,
        revision: Revision,
        files: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> &mut Self {
        for (path, content) in files {
            self.files
                .insert((revision.id.clone(), path.to_string()), content.to_string());
        }
        self.revisions.push(revision);
        self
    }
}

impl SnapshotStore for MemoryStore {
    fn list_revisions(&self) -> Result<Vec<Revision>, StoreError> {
        Ok(self.revisions.clone())
    }

    fn read_file_at_revision(&self, revision_id: &str, path: &str) -> Result<String, StoreError> {
        if !self.revisions.iter().any(|r| r.id == revision_id) {
            return Err(StoreError::UnknownRevision(revision_id.to_string()));
        }
        self.files
            .get(&(revision_id.to_string(), path.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                revision: revision_id.to_string(),
                path: path.to_string(),
            })
    }
}
