use crate::anomaly::table_version;
use crate::config::PipelineConfig;
use crate::error::ReconError;
use crate::index::select_snapshots;
use crate::model::{PipelineMeta, PipelineResult, SelectedSnapshot};
use crate::normalize::load_and_normalize;
use crate::reconcile::{concat_snapshots, reconcile};
use crate::store::SnapshotStore;

/// Run the pipeline against `store`: select one revision per date, load and
/// normalize each selected snapshot, reconcile the corpus.
///
/// Either the full dataset is returned or the first error; a failure on any
/// date fails the run.
pub fn run(config: &PipelineConfig, store: &dyn SnapshotStore) -> Result<PipelineResult, ReconError> {
    let revisions = store.list_revisions()?;
    log::info!("{}: {} revision(s) in store", config.name, revisions.len());

    let selection = select_snapshots(&revisions, &config.index)?;

    let mut snapshots = Vec::with_capacity(selection.len());
    let mut selected = Vec::with_capacity(selection.len());
    for (date, revision) in &selection {
        let snapshot = load_and_normalize(store, revision, *date, &config.files, &config.renames)
            .map_err(|e| ReconError::Load {
                date: *date,
                revision: revision.id.clone(),
                source: Box::new(e),
            })?;

        selected.push(SelectedSnapshot {
            date: *date,
            revision: revision.id.clone(),
            label: revision.label.clone(),
            recorded_at: revision.recorded_at,
            file: snapshot.file.clone(),
            rows: snapshot.records.len(),
        });
        snapshots.push(snapshot);
    }

    let dataset = reconcile(concat_snapshots(&snapshots), &config.anomalies)?;
    let fingerprint = dataset.fingerprint();

    Ok(PipelineResult {
        meta: PipelineMeta {
            config_name: config.name.clone(),
            engine_version: env!("CARGO_PKG_VERSION").to_string(),
            anomaly_table: table_version(&config.anomalies),
            run_at: chrono::Utc::now().to_rfc3339(),
            snapshots: selected,
            fingerprint,
        },
        dataset,
    })
}
