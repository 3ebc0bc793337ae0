//! mcp-server-validator: validates generated MCP servers
//!
//! Runs the validation pipeline over one or more server directories, prints
//! or writes reports, and exits non-zero if any server failed.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

use mcp_server_validator::config::{self, ReportFormat, TestConfig};
use mcp_server_validator::pipeline::{Pipeline, PipelineResult};
use mcp_server_validator::report::{self, Reporter};
use mcp_server_validator::{BatchRunner, CancelSignal, DiagnosticsEngine};

/// Validation pipeline for generated Model Context Protocol servers.
///
/// One path runs a single pipeline; several paths run a batch.
#[derive(Parser, Debug)]
#[command(name = "mcp-server-validator")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server project directories to validate
    #[arg(value_name = "SERVER_PATH", required = true)]
    servers: Vec<PathBuf>,

    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Report format (overrides the configuration)
    #[arg(short, long, value_enum)]
    format: Option<Format>,

    /// Directory to write reports to (overrides the configuration)
    #[arg(short, long, value_name = "DIR")]
    output: Option<PathBuf>,

    /// Pipelines to run at once in a batch
    #[arg(short, long, value_parser = clap::value_parser!(u16).range(1..))]
    workers: Option<u16>,

    /// Stop starting new servers after the first failure
    #[arg(long)]
    stop_on_failure: bool,

    /// Diagnose failures even if diagnostics are disabled in the configuration
    #[arg(long)]
    diagnose: bool,

    /// Write a CSV summary of the batch to FILE
    #[arg(long, value_name = "FILE")]
    csv: Option<PathBuf>,

    /// Increase logging verbosity (-v for info, -vv for debug, -vvv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Decrease logging verbosity (only show errors)
    #[arg(short, long)]
    quiet: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum Format {
    Json,
    Html,
    Xml,
}

impl From<Format> for ReportFormat {
    fn from(format: Format) -> Self {
        match format {
            Format::Json => Self::Json,
            Format::Html => Self::Html,
            Format::Xml => Self::Xml,
        }
    }
}

/// Determines the log level from CLI arguments.
#[allow(clippy::match_same_arms)] // Explicit "warn" arm for clarity
fn get_log_level(verbose: u8, quiet: bool, config_level: &str) -> Level {
    if quiet {
        return Level::ERROR;
    }

    match verbose {
        0 => match config_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::WARN,
        },
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// Initialises the tracing subscriber for logging.
fn init_tracing(level: Level) {
    let filter = EnvFilter::from_default_env().add_directive(level.into());

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn apply_overrides(cfg: &mut TestConfig, args: &Args) {
    if let Some(format) = args.format {
        cfg.report.format = format.into();
    }
    if let Some(dir) = &args.output {
        cfg.report.output_dir = Some(dir.clone());
    }
    if let Some(workers) = args.workers {
        cfg.concurrency.batch_workers = usize::from(workers);
    }
}

/// Diagnoses (when enabled) and reports one finished pipeline.
async fn report_one(
    config: &Arc<TestConfig>,
    result: &PipelineResult,
    diagnose: bool,
    print: bool,
) -> Result<(), mcp_server_validator::error::ReportError> {
    let diagnosis = if diagnose {
        DiagnosticsEngine::new(Arc::clone(config))
            .diagnose(&result.test_result, Some(result))
            .await
    } else {
        None
    };
    let reporter = Reporter::new(Arc::clone(config));
    let report = reporter.report(&result.test_result, diagnosis.as_ref());
    if reporter.write(&report).await?.is_none() && print {
        println!("{}", Reporter::render(&report, config.report.format)?);
    }
    Ok(())
}

async fn run(args: Args, config: Arc<TestConfig>) -> bool {
    let cancel = CancelSignal::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted, cancelling run");
                cancel.cancel();
            }
        });
    }
    let diagnose = args.diagnose || config.features.diagnostics;
    let pipeline = Pipeline::for_config(Arc::clone(&config)).on_stage_complete(|stage| {
        info!(
            stage = %stage.name,
            success = stage.success,
            skipped = stage.skipped,
            retries = stage.retry_count,
            "Stage complete"
        );
    });

    if let [server] = args.servers.as_slice() {
        let result = pipeline.run(server, &cancel).await;
        if let Err(e) = report_one(&config, &result, diagnose, true).await {
            error!(error = %e, "Failed to write report");
            return false;
        }
        return result.success;
    }

    let batch = BatchRunner::new(pipeline)
        .stop_on_failure(args.stop_on_failure)
        .run(&args.servers, &cancel)
        .await;
    let mut ok = batch.success();
    for result in batch.server_results.values() {
        if let Err(e) = report_one(&config, result, diagnose, false).await {
            error!(server = %result.server_path.display(), error = %e, "Failed to write report");
            ok = false;
        }
    }
    if let Some(path) = &args.csv {
        if let Err(e) = report::write_batch_csv(&batch, path) {
            error!(path = %path.display(), error = %e, "Failed to write CSV");
            ok = false;
        }
    }
    match serde_json::to_string_pretty(&batch.summary) {
        Ok(summary) => println!("{summary}"),
        Err(e) => error!(error = %e, "Failed to serialise batch summary"),
    }
    ok
}

/// Entry point for the mcp-server-validator CLI.
fn main() -> ExitCode {
    let args = Args::parse();

    // Load configuration
    let config_path = args.config.as_deref();
    let mut cfg = match config::load_config(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            if config_path.is_none() {
                if let Some(default_path) = config::default_config_path() {
                    eprintln!("\nExpected config at: {}", default_path.display());
                }
            }
            return ExitCode::FAILURE;
        }
    };
    apply_overrides(&mut cfg, &args);

    // Initialise logging
    let log_level = get_log_level(args.verbose, args.quiet, &cfg.logging.level);
    init_tracing(log_level);

    if let Some(missing) = args.servers.iter().find(|p| !p.is_dir()) {
        error!(path = %missing.display(), "Server path is not a directory");
        return ExitCode::FAILURE;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        servers = args.servers.len(),
        "Starting mcp-server-validator"
    );

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to create Tokio runtime");
            return ExitCode::FAILURE;
        }
    };

    if runtime.block_on(run(args, Arc::new(cfg))) {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
