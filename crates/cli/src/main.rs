// casemap CLI - rebuild a longitudinal dataset from a revised series' history

mod commands;
mod exit_codes;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgAction, Parser, Subcommand};

use commands::RenderArgs;
use exit_codes::EXIT_SUCCESS;

#[derive(Parser)]
#[command(name = "casemap")]
#[command(about = "Reconstruct per-region case data from revision history and render choropleth maps")]
#[command(version, long_version = long_version())]
struct Cli {
    /// Raise log verbosity (-v info, -vv debug); RUST_LOG overrides
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the revision selected for each calendar date
    #[command(after_help = "\
Examples:
  casemap snapshots casemap.toml
  casemap snapshots casemap.toml --json")]
    Snapshots {
        /// Path to the pipeline config (TOML)
        config: PathBuf,

        /// Output JSON to stdout instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Run the pipeline and optionally export the dataset
    #[command(after_help = "\
Examples:
  casemap build casemap.toml
  casemap build casemap.toml --output dataset.csv
  casemap build casemap.toml --output dataset.json --json")]
    Build {
        /// Path to the pipeline config (TOML)
        config: PathBuf,

        /// Write the dataset to FILE (.csv or .json)
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,

        /// Print the run summary as JSON to stdout
        #[arg(long)]
        json: bool,
    },

    /// Run the pipeline and render one SVG map per date
    #[command(after_help = "\
Examples:
  casemap render casemap.toml --metric COVID_CASE_RATE
  casemap render casemap.toml --metric COVID_CASE_RATE --transform sma:3 \\
      --from 2020-05-20 --min -50 --max 50 --out-dir maps/sma3")]
    Render {
        /// Path to the pipeline config (TOML)
        config: PathBuf,

        #[command(flatten)]
        args: RenderArgs,
    },

    /// Parse and validate a config without running
    Validate {
        /// Path to the pipeline config (TOML)
        config: PathBuf,
    },
}

#[derive(Debug)]
pub struct CliError {
    pub code: u8,
    pub message: String,
    pub hint: Option<String>,
}

impl CliError {
    pub fn new(code: u8, msg: impl Into<String>) -> Self {
        Self { code, message: msg.into(), hint: None }
    }

    /// Add a hint to an existing error.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

fn long_version() -> &'static str {
    concat!(
        env!("CARGO_PKG_VERSION"),
        " (", env!("CASEMAP_COMMIT"), ")",
        "\nrecon:   casemap-recon ", env!("CARGO_PKG_VERSION"),
        "\ntarget:  ", env!("CASEMAP_TARGET"),
    )
}

/// Log to stderr through a `tracing` fmt subscriber; library `log` records
/// are forwarded by its log bridge.
fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .try_init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = match cli.command {
        Commands::Snapshots { config, json } => commands::cmd_snapshots(config, json),
        Commands::Build { config, output, json } => commands::cmd_build(config, output, json),
        Commands::Render { config, args } => commands::cmd_render(config, args),
        Commands::Validate { config } => commands::cmd_validate(config),
    };

    match result {
        Ok(()) => ExitCode::from(EXIT_SUCCESS),
        Err(CliError { code, message, hint }) => {
            if !message.is_empty() {
                eprintln!("error: {}", message);
            }
            if let Some(hint) = hint {
                eprintln!("hint:  {}", hint);
            }
            ExitCode::from(code)
        }
    }
}
