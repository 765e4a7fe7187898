use clap::Parser;
use eyre::{eyre, Result};
use fs2::FileExt;
use leadgrid_runner::config::{CliOverrides, JobConfig, TOOL_CONFIG_ENV};
use leadgrid_runner::http::HttpActorDriver;
use leadgrid_runner::report::{LogLevel, Phase, Reporter};
use leadgrid_runner::wallet::Wallet;
use leadgrid_runner::{cancel, runner, tools};
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(
    name = "leadgrid-runner",
    version,
    about = "Credit-aware job runner for LeadGrid enrichment tools"
)]
struct Args {
    /// CSV input file. A `Status` column is added if missing.
    #[arg(long)]
    input_path: Option<PathBuf>,

    /// CSV output file, appended row-by-row as work completes.
    #[arg(long)]
    output_path: Option<PathBuf>,

    /// Credentials seed JSON: an array of token strings or an id → token
    /// object. Credit/ban state persists in a sibling `.state.json`.
    #[arg(long)]
    credentials_path: Option<PathBuf>,

    /// Tool registry entry to run (e.g. post-reactions, email-enricher).
    #[arg(long)]
    tool_id: Option<String>,

    /// Initial credit quota for credentials seeded this run.
    #[arg(long)]
    per_credential_limit: Option<u32>,

    /// Global in-flight call cap.
    #[arg(long)]
    max_concurrent: Option<usize>,

    /// Token-bucket rate shared by all workers.
    #[arg(long)]
    max_requests_per_second: Option<u32>,

    /// Transient-retry attempts inside the driver.
    #[arg(long)]
    retry_max: Option<u32>,

    /// Items per request for tools whose driver batches.
    #[arg(long)]
    batch_size: Option<u32>,

    /// Wall-clock ceiling for a single driver call.
    #[arg(long)]
    call_timeout_seconds: Option<u64>,

    /// JSON object mapping logical fields to input column names,
    /// e.g. '{"postUrl":"Post Link"}'.
    #[arg(long)]
    column_map: Option<String>,

    /// Sentinel file whose presence begins a graceful cancel.
    #[arg(long)]
    stop_flag_path: Option<PathBuf>,

    /// Base URL of the actor API.
    #[arg(long)]
    api_base_url: Option<String>,

    /// Read and map rows, but never call the driver or write anything.
    #[arg(long)]
    dry_run: bool,
}

impl Args {
    fn into_overrides(self) -> CliOverrides {
        CliOverrides {
            input_path: self.input_path,
            output_path: self.output_path,
            credentials_path: self.credentials_path,
            tool_id: self.tool_id,
            per_credential_limit: self.per_credential_limit,
            max_concurrent: self.max_concurrent,
            max_requests_per_second: self.max_requests_per_second,
            retry_max: self.retry_max,
            batch_size: self.batch_size,
            call_timeout_seconds: self.call_timeout_seconds,
            column_map_json: self.column_map,
            stop_flag_path: self.stop_flag_path,
            api_base_url: self.api_base_url,
            dry_run: self.dry_run,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Human logs go to stderr; stdout carries the line protocol only.
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let reporter = Reporter::stdout();

    let env_blob = std::env::var(TOOL_CONFIG_ENV).ok();
    let cfg = match JobConfig::resolve(args.into_overrides(), env_blob.as_deref()) {
        Ok(cfg) => cfg,
        Err(err) => return fail(&reporter, err),
    };

    let Some(tool) = tools::lookup(&cfg.tool_id) else {
        return fail(&reporter, eyre!("unknown toolId '{}'", cfg.tool_id));
    };

    // Single-instance guard: lock beside the wallet state file. Two runners
    // sharing one wallet would corrupt the credit ledger.
    let state_path = Wallet::state_path_for(&cfg.credentials_path);
    if let Some(parent) = state_path.parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(err) = std::fs::create_dir_all(parent) {
                return fail(
                    &reporter,
                    eyre!("failed to create state directory {}: {err}", parent.display()),
                );
            }
        }
    }
    let lock_path = state_path.with_extension("lock");
    let lock_file = match OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(&lock_path)
    {
        Ok(file) => file,
        Err(err) => {
            return fail(
                &reporter,
                eyre!("failed to open lock file {}: {err}", lock_path.display()),
            )
        }
    };
    if let Err(err) = lock_file.try_lock_exclusive() {
        return fail(
            &reporter,
            eyre!(
                "another runner is already using {} ({err})",
                cfg.credentials_path.display()
            ),
        );
    }
    // Keep file handle alive.
    let _lock_guard = lock_file;

    tracing::info!(
        tool = tool.id,
        input = %cfg.input_path.display(),
        output = %cfg.output_path.display(),
        max_concurrent = cfg.max_concurrent,
        max_rps = cfg.max_requests_per_second,
        dry_run = cfg.dry_run,
        "runner starting"
    );
    reporter.status(Phase::Start, None);

    let cancel_token = cancel::spawn(cfg.stop_flag_path.clone(), reporter.clone());
    let driver = Arc::new(HttpActorDriver::new(&cfg.api_base_url, tool.endpoint));

    match runner::execute(&cfg, tool, driver, reporter.clone(), cancel_token).await {
        Ok(outcome) => {
            tracing::info!(cancelled = outcome.cancelled, "run finished");
            Ok(())
        }
        Err(err) => fail(&reporter, err),
    }
}

fn fail(reporter: &Arc<Reporter>, err: eyre::Report) -> Result<()> {
    reporter.log(LogLevel::Error, &format!("{err:#}"));
    reporter.status(Phase::Error, None);
    Err(err)
}
