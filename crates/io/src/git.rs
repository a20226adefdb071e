// Git-backed snapshot store

use std::path::{Path, PathBuf};

use chrono::{DateTime, FixedOffset};
use git2::{ErrorCode, Oid, Repository, Sort};

use casemap_recon::model::Revision;
use casemap_recon::store::{SnapshotStore, StoreError};

/// Reads snapshots from the commit history reachable from `HEAD`.
///
/// Revision id is the full hex oid, label the commit message and
/// `recorded_at` the committer time in the committer's offset.
pub struct GitStore {
    repo: Repository,
    path: PathBuf,
}

impl GitStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let repo = Repository::open(path)
            .map_err(|e| StoreError::Backend(format!("cannot open git repository {}: {}", path.display(), e.message())))?;
        Ok(Self {
            repo,
            path: path.to_owned(),
        })
    }

    fn backend(&self, what: &str, err: git2::Error) -> StoreError {
        StoreError::Backend(format!("{} ({what}): {}", self.path.display(), err.message()))
    }

    fn find_commit(&self, revision_id: &str) -> Result<git2::Commit<'_>, StoreError> {
        let unknown = || StoreError::UnknownRevision(revision_id.to_string());
        let oid = Oid::from_str(revision_id).map_err(|_| unknown())?;
        self.repo.find_commit(oid).map_err(|err| match err.code() {
            ErrorCode::NotFound => unknown(),
            _ => self.backend("find commit", err),
        })
    }
}

fn commit_time(time: git2::Time) -> Option<DateTime<FixedOffset>> {
    let offset = FixedOffset::east_opt(time.offset_minutes() * 60)?;
    let utc = DateTime::from_timestamp(time.seconds(), 0)?;
    Some(utc.with_timezone(&offset))
}

impl SnapshotStore for GitStore {
    fn list_revisions(&self) -> Result<Vec<Revision>, StoreError> {
        match self.repo.head() {
            Ok(_) => {}
            Err(err) if matches!(err.code(), ErrorCode::UnbornBranch | ErrorCode::NotFound) => {
                log::warn!("{}: no commits", self.path.display());
                return Ok(Vec::new());
            }
            Err(err) => return Err(self.backend("resolve HEAD", err)),
        }

        let mut walk = self.repo.revwalk().map_err(|e| self.backend("revwalk", e))?;
        walk.set_sorting(Sort::TIME).map_err(|e| self.backend("revwalk", e))?;
        walk.push_head().map_err(|e| self.backend("revwalk", e))?;

        let mut revisions = Vec::new();
        for oid in walk {
            let oid = oid.map_err(|e| self.backend("revwalk", e))?;
            let commit = self
                .repo
                .find_commit(oid)
                .map_err(|e| self.backend("find commit", e))?;
            let recorded_at = commit_time(commit.committer().when()).ok_or_else(|| {
                StoreError::Backend(format!("commit {oid}: committer time out of range"))
            })?;
            revisions.push(Revision {
                id: oid.to_string(),
                label: String::from_utf8_lossy(commit.message_bytes()).trim().to_string(),
                recorded_at,
            });
        }

        log::debug!("{}: {} commit(s) from HEAD", self.path.display(), revisions.len());
        Ok(revisions)
    }

    fn read_file_at_revision(&self, revision_id: &str, path: &str) -> Result<String, StoreError> {
        let commit = self.find_commit(revision_id)?;
        let tree = commit.tree().map_err(|e| self.backend("read tree", e))?;

        let entry = match tree.get_path(Path::new(path)) {
            Ok(entry) => entry,
            Err(err) if err.code() == ErrorCode::NotFound => {
                return Err(StoreError::NotFound {
                    revision: revision_id.to_string(),
                    path: path.to_string(),
                });
            }
            Err(err) => return Err(self.backend("read tree", err)),
        };

        // A directory at that path is not a snapshot.
        let blob = match self.repo.find_blob(entry.id()) {
            Ok(blob) => blob,
            Err(err) if err.code() == ErrorCode::NotFound => {
                return Err(StoreError::NotFound {
                    revision: revision_id.to_string(),
                    path: path.to_string(),
                });
            }
            Err(err) => return Err(self.backend("read blob", err)),
        };

        String::from_utf8(blob.content().to_vec()).map_err(|_| {
            StoreError::Backend(format!("{path} at {revision_id} is not valid UTF-8"))
        })
    }
}
