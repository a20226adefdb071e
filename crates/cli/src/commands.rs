//! `casemap snapshots | build | render | validate`: config-driven pipeline runs.

use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use clap::Args;
use serde::Serialize;

use casemap_io::svg::{render_range, Bounds, Gradient, MapStyle};
use casemap_io::{export, DirectoryStore, ExportFormat, GitStore};
use casemap_recon::config::SourceKind;
use casemap_recon::index::select_snapshots;
use casemap_recon::metrics::{Column, DateRange, MetricTable, MetricTransform};
use casemap_recon::model::SelectedSnapshot;
use casemap_recon::{PipelineConfig, PipelineResult, SnapshotStore};

use crate::exit_codes::{
    export_exit_code, recon_exit_code, render_exit_code, EXIT_INVALID_CONFIG, EXIT_OUTPUT, EXIT_RENDER,
    EXIT_STORE, EXIT_USAGE,
};
use crate::CliError;

fn recon_err(code: u8, msg: impl Into<String>) -> CliError {
    CliError { code, message: msg.into(), hint: None }
}

// ---------------------------------------------------------------------------
// Config + store
// ---------------------------------------------------------------------------

/// A parsed config and the directory its relative paths resolve against.
struct Loaded {
    config: PipelineConfig,
    base_dir: PathBuf,
}

impl Loaded {
    fn resolve(&self, path: impl AsRef<Path>) -> PathBuf {
        self.base_dir.join(path)
    }
}

fn load_config(config_path: &Path) -> Result<Loaded, CliError> {
    let config_str = std::fs::read_to_string(config_path).map_err(|e| {
        recon_err(EXIT_INVALID_CONFIG, format!("cannot read config {}: {e}", config_path.display()))
    })?;
    let config = PipelineConfig::from_toml(&config_str)
        .map_err(|e| recon_err(recon_exit_code(&e), e.to_string()))?;

    let base_dir = config_path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
    Ok(Loaded { config, base_dir })
}

fn open_store(loaded: &Loaded) -> Result<Box<dyn SnapshotStore>, CliError> {
    let path = loaded.resolve(&loaded.config.source.path);
    log::info!("opening {} store at {}", loaded.config.source.kind, path.display());

    let store: Result<Box<dyn SnapshotStore>, _> = match loaded.config.source.kind {
        SourceKind::Git => GitStore::open(&path).map(|s| Box::new(s) as Box<dyn SnapshotStore>),
        SourceKind::Directory => DirectoryStore::open(&path).map(|s| Box::new(s) as Box<dyn SnapshotStore>),
    };
    store.map_err(|e| {
        recon_err(EXIT_STORE, e.to_string())
            .with_hint("source.path is resolved relative to the config file")
    })
}

fn run_pipeline(loaded: &Loaded) -> Result<PipelineResult, CliError> {
    let store = open_store(loaded)?;
    casemap_recon::run(&loaded.config, store.as_ref())
        .map_err(|e| recon_err(recon_exit_code(&e), e.to_string()))
}

// ---------------------------------------------------------------------------
// snapshots
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct SnapshotRow<'a> {
    date: NaiveDate,
    revision: &'a str,
    label: &'a str,
    recorded_at: String,
}

pub fn cmd_snapshots(config_path: PathBuf, json_output: bool) -> Result<(), CliError> {
    let loaded = load_config(&config_path)?;
    let store = open_store(&loaded)?;

    let revisions = store
        .list_revisions()
        .map_err(|e| recon_err(EXIT_STORE, e.to_string()))?;
    let selection = select_snapshots(&revisions, &loaded.config.index)
        .map_err(|e| recon_err(recon_exit_code(&e), e.to_string()))?;

    if json_output {
        let rows: Vec<SnapshotRow<'_>> = selection
            .iter()
            .map(|(date, rev)| SnapshotRow {
                date: *date,
                revision: &rev.id,
                label: &rev.label,
                recorded_at: rev.recorded_at.to_rfc3339(),
            })
            .collect();
        let json_str = serde_json::to_string_pretty(&rows)
            .map_err(|e| recon_err(EXIT_OUTPUT, format!("JSON serialization error: {e}")))?;
        println!("{json_str}");
    } else {
        for (date, rev) in &selection {
            println!("{date}  {}  {}", rev.short_id(), rev.label);
        }
    }

    eprintln!(
        "{} revision(s), {} date(s) selected",
        revisions.len(),
        selection.len()
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// build
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct BuildSummary<'a> {
    config_name: &'a str,
    engine_version: &'a str,
    anomaly_table: &'a str,
    run_at: &'a str,
    records: usize,
    regions: usize,
    dates: usize,
    fingerprint: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    output: Option<String>,
    snapshots: &'a [SelectedSnapshot],
}

pub fn cmd_build(config_path: PathBuf, output_file: Option<PathBuf>, json_output: bool) -> Result<(), CliError> {
    // Reject an unsupported extension before doing any work.
    if let Some(ref path) = output_file {
        ExportFormat::from_path(path).map_err(|e| {
            recon_err(export_exit_code(&e), e.to_string()).with_hint("use a .csv or .json output path")
        })?;
    }

    let loaded = load_config(&config_path)?;
    let result = run_pipeline(&loaded)?;
    let dataset = &result.dataset;

    if let Some(ref path) = output_file {
        export(dataset, path).map_err(|e| recon_err(export_exit_code(&e), e.to_string()))?;
        eprintln!("wrote {}", path.display());
    }

    let dates = dataset.dates();
    if json_output {
        let summary = BuildSummary {
            config_name: &result.meta.config_name,
            engine_version: &result.meta.engine_version,
            anomaly_table: &result.meta.anomaly_table,
            run_at: &result.meta.run_at,
            records: dataset.len(),
            regions: dataset.regions().len(),
            dates: dates.len(),
            fingerprint: &result.meta.fingerprint,
            output: output_file.as_ref().map(|p| p.display().to_string()),
            snapshots: &result.meta.snapshots,
        };
        let json_str = serde_json::to_string_pretty(&summary)
            .map_err(|e| recon_err(EXIT_OUTPUT, format!("JSON serialization error: {e}")))?;
        println!("{json_str}");
    }

    // Human summary to stderr
    let span = match (dates.first(), dates.last()) {
        (Some(first), Some(last)) => format!("{first}..{last}"),
        _ => "no dates".to_string(),
    };
    eprintln!(
        "{}: {} records, {} regions, {} dates ({}); fingerprint {}",
        result.meta.config_name,
        dataset.len(),
        dataset.regions().len(),
        dates.len(),
        span,
        &result.meta.fingerprint[..16.min(result.meta.fingerprint.len())],
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// render
// ---------------------------------------------------------------------------

#[derive(Args)]
pub struct RenderArgs {
    /// Column to plot (e.g. COVID_CASE_RATE, PERCENT_POSITIVE)
    #[arg(long, short = 'm')]
    pub metric: Column,

    /// Series transform: level, diff or sma:N (moving average of diffs)
    #[arg(long, short = 't', default_value = "level")]
    pub transform: MetricTransform,

    /// First date to render (YYYY-MM-DD, inclusive; default: first date with
    /// every value present)
    #[arg(long)]
    pub from: Option<NaiveDate>,

    /// Last date to render (YYYY-MM-DD, inclusive)
    #[arg(long)]
    pub to: Option<NaiveDate>,

    /// Lower color bound (default: observed minimum)
    #[arg(long, allow_negative_numbers = true)]
    pub min: Option<f64>,

    /// Upper color bound (default: observed maximum)
    #[arg(long, allow_negative_numbers = true)]
    pub max: Option<f64>,

    /// Legend title (default: the metric name)
    #[arg(long)]
    pub legend_title: Option<String>,

    /// SVG template (default: render.template from the config)
    #[arg(long)]
    pub template: Option<PathBuf>,

    /// Output directory (default: render.out_dir from the config)
    #[arg(long)]
    pub out_dir: Option<PathBuf>,

    /// Output file prefix (default: render.prefix from the config)
    #[arg(long)]
    pub prefix: Option<String>,
}

pub fn cmd_render(config_path: PathBuf, args: RenderArgs) -> Result<(), CliError> {
    if let (Some(from), Some(to)) = (args.from, args.to) {
        if from > to {
            return Err(recon_err(EXIT_USAGE, format!("--from {from} is after --to {to}")));
        }
    }

    let loaded = load_config(&config_path)?;
    let render_config = loaded.config.render.as_ref();

    // Flags win; config paths resolve against the config directory.
    let template_path = match (&args.template, render_config) {
        (Some(path), _) => path.clone(),
        (None, Some(rc)) => loaded.resolve(&rc.template),
        (None, None) => {
            return Err(recon_err(EXIT_USAGE, "no SVG template given")
                .with_hint("pass --template or set render.template in the config"));
        }
    };
    let out_dir = match (&args.out_dir, render_config) {
        (Some(dir), _) => dir.clone(),
        (None, Some(rc)) => loaded.resolve(&rc.out_dir),
        (None, None) => loaded.resolve("maps"),
    };
    let prefix = args
        .prefix
        .clone()
        .or_else(|| render_config.map(|rc| rc.prefix.clone()))
        .unwrap_or_else(|| "NYC".to_string());
    let scale = match render_config {
        Some(rc) => Gradient::from_hex(rc.colors.as_slice()).map_err(|e| recon_err(EXIT_INVALID_CONFIG, e.to_string()))?,
        None => Gradient::default(),
    };

    let template = std::fs::read_to_string(&template_path).map_err(|e| {
        recon_err(EXIT_RENDER, format!("cannot read template {}: {e}", template_path.display()))
    })?;

    let result = run_pipeline(&loaded)?;
    let table = args
        .transform
        .apply(MetricTable::from_dataset(&result.dataset, &args.metric));
    // Without --from, start where the transformed series is complete.
    let from = args.from.or_else(|| {
        let first = table.first_complete_date();
        if let Some(first) = first {
            log::info!("{}: rendering from {first}, the first date with every value present", table.name);
        }
        first
    });
    let range = DateRange { from, to: args.to };

    let bounds = Bounds::resolve(&table, range, args.min, args.max)
        .map_err(|e| recon_err(render_exit_code(&e), e.to_string()))?;
    let outside = table.count_outside(bounds.min, bounds.max, range);
    if outside > 0 {
        eprintln!(
            "{outside} value(s) of {} fall outside [{}, {}] and are drawn at the scale ends",
            table.name, bounds.min, bounds.max
        );
    }

    let legend_title = args.legend_title.clone().unwrap_or_else(|| table.name.clone());
    let style = MapStyle {
        legend_title: &legend_title,
        bounds,
        scale: &scale,
    };

    let written = render_range(&template, &result.dataset, &table, range, &style, &out_dir, &prefix)
        .map_err(|e| recon_err(render_exit_code(&e), e.to_string()))?;

    eprintln!("wrote {} map(s) of {} to {}", written.len(), table.name, out_dir.display());
    Ok(())
}

// ---------------------------------------------------------------------------
// validate
// ---------------------------------------------------------------------------

pub fn cmd_validate(config_path: PathBuf) -> Result<(), CliError> {
    let loaded = load_config(&config_path)?;
    let config = &loaded.config;

    eprintln!("valid: {}", config_path.display());
    eprintln!("  name:      {}", config.name);
    eprintln!("  source:    {} ({})", loaded.resolve(&config.source.path).display(), config.source.kind);
    eprintln!("  files:     {} (fallback {})", config.files.primary, config.files.fallback);
    eprintln!("  min date:  {}", config.index.min_date);
    eprintln!("  anomalies: {}", config.anomalies.len());
    if let Some(ref render) = config.render {
        eprintln!("  template:  {}", loaded.resolve(&render.template).display());
    }
    Ok(())
}
