//! `casemap-recon` - longitudinal reconstruction of a revised public-health
//! series from its revision history.
//!
//! Pure engine crate: reads snapshots through the [`SnapshotStore`] trait and
//! returns a reconciled [`LongitudinalDataset`]. No git, filesystem or CLI
//! dependencies; those live in `casemap-io` and `casemap-cli`.

pub mod anomaly;
pub mod config;
pub mod engine;
pub mod error;
pub mod index;
pub mod metrics;
pub mod model;
pub mod normalize;
pub mod reconcile;
pub mod store;

pub use config::PipelineConfig;
pub use engine::run;
pub use error::ReconError;
pub use model::{
    LongitudinalDataset, NormalizedRecord, PipelineResult, RegionKey, Revision, Snapshot,
};
pub use store::{MemoryStore, SnapshotStore, StoreError};
