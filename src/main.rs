mod classify;
mod config;
mod correlate;
mod data_dir;
mod extract;
mod logs;
mod metrics;
mod record;
mod segment;
mod store;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

/// Derive per-task benchmark metrics from coding-agent session logs.
#[derive(Parser, Debug)]
#[command(name = "taskbench", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, global = true, default_value = "taskbench.toml")]
    config: PathBuf,

    /// Debug logging (segment boundaries, per-segment counters)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Extract one record per task segment, then rebuild the summary
    Extract {
        /// Root directory holding one subdirectory per session
        #[arg(long)]
        logs: Option<PathBuf>,
        /// Directory for per-task records and summary.json
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Overwrite records that already exist
        #[arg(short, long)]
        force: bool,
        /// Model to record, skipping signature detection
        #[arg(long)]
        model: Option<String>,
        /// Client label
        #[arg(long)]
        client: Option<String>,
        /// Server label
        #[arg(long)]
        server: Option<String>,
        /// Success flag to record
        #[arg(long)]
        success: Option<bool>,
    },
    /// Rebuild summary.json from the per-task records on disk
    Summary {
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Merge raw record arrays into summary.json, one record per session
    Merge {
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[arg(required = true, value_name = "FILES")]
        files: Vec<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose {
        "taskbench=debug"
    } else {
        "taskbench=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    let cfg = match config::load_config(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command {
        Commands::Extract {
            logs,
            output,
            force,
            model,
            client,
            server,
            success,
        } => {
            let opts = extract::ExtractOptions {
                logs_root: logs.unwrap_or_else(|| cfg.paths.logs_root.clone()),
                output_dir: output.unwrap_or_else(|| cfg.paths.output_dir.clone()),
                force,
                record: metrics::RecordOptions {
                    model_override: model,
                    default_model: cfg.defaults.model.clone(),
                    client: client.unwrap_or_else(|| cfg.defaults.client.clone()),
                    server: server.unwrap_or_else(|| cfg.defaults.server.clone()),
                    success: success.unwrap_or(cfg.defaults.success),
                },
            };
            extract::run_extraction(&cfg, opts)
                .await
                .map(|report| println!("{report}"))
        }
        Commands::Summary { output } => {
            let dir = output.unwrap_or_else(|| cfg.paths.output_dir.clone());
            extract::rebuild_summary(&dir).map(|report| {
                println!("summary rebuilt: {} entries", report.entries);
                for name in &report.failed {
                    println!("  - unreadable record: {name}");
                }
            })
        }
        Commands::Merge { output, files } => {
            let dir = output.unwrap_or_else(|| cfg.paths.output_dir.clone());
            extract::merge_raw_files(&dir, &files).map(|outcome| {
                println!(
                    "summary merged: {} replaced, {} appended, {} total",
                    outcome.merge.replaced, outcome.merge.appended, outcome.merge.total
                );
                for name in &outcome.failed {
                    println!("  - unreadable batch: {name}");
                }
            })
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
