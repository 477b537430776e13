use std::process::ExitCode;

use clap::{Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing::{info, warn};

use crosscheck_worker::api::HttpCoordinatorClient;
use crosscheck_worker::checker::JarChecker;
use crosscheck_worker::config::{Config, ConfigLoader};
use crosscheck_worker::error::WorkerError;
use crosscheck_worker::layout::CacheLayout;
use crosscheck_worker::logging;
use crosscheck_worker::output::{JsonOutput, MaintainResult, StatusResult};
use crosscheck_worker::pipeline::TaskPipeline;
use crosscheck_worker::store::SqliteWorkStore;
use crosscheck_worker::worker;

type Pipeline = TaskPipeline<HttpCoordinatorClient, SqliteWorkStore, JarChecker>;

#[derive(Parser)]
#[command(name = "crosscheck-worker")]
#[command(about = "Fetches new submissions, runs the similarity checker and reports findings")]
#[command(version)]
struct Cli {
    /// JSON config file; environment variables override its values.
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Poll the coordinator until stopped (default)")]
    Run,
    #[command(about = "Process a single task and exit")]
    Once,
    #[command(about = "Enforce the cache budget once")]
    Maintain,
    #[command(about = "Print cached works as JSON")]
    Status,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(err) = report.downcast_ref::<WorkerError>() {
            return ExitCode::from(map_exit_code(err));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &WorkerError) -> u8 {
    if error.is_startup() { 2 } else { 1 }
}

fn run() -> miette::Result<()> {
    let cli = Cli::parse();
    let config = ConfigLoader::resolve(cli.config.as_deref())?;
    let _guard = logging::init(config.logs.as_std_path())?;

    let layout = CacheLayout::new(config.storage.clone());
    layout.ensure()?;
    let store = SqliteWorkStore::open(&layout.db_path())?;
    let api = HttpCoordinatorClient::new(&config.api)?;
    let checker = JarChecker::new(&config.checker, layout.result_path());
    let pipeline = TaskPipeline::new(api, store, checker, layout, config.storage_size_mb);

    let pipeline = match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_loop(pipeline, &config)?,
        Commands::Once => {
            let outcome = pipeline.process();
            info!(?outcome, "tick finished");
            pipeline
        }
        Commands::Maintain => {
            let reconciled = pipeline.reconcile()?;
            let report = pipeline.enforce_budget()?;
            JsonOutput::print_maintain(&MaintainResult { reconciled, report }).into_diagnostic()?;
            pipeline
        }
        Commands::Status => {
            let status =
                StatusResult::collect(pipeline.store(), pipeline.layout(), config.storage_size_mb)?;
            JsonOutput::print_status(&status).into_diagnostic()?;
            pipeline
        }
    };

    if let Err(err) = pipeline.into_store().close() {
        warn!(error = %err, "failed to close work cache");
    }
    Ok(())
}

fn run_loop(pipeline: Pipeline, config: &Config) -> miette::Result<Pipeline> {
    match pipeline.reconcile() {
        Ok(0) => {}
        Ok(removed) => info!(removed, "reconciled work cache with disk"),
        Err(err) => warn!(error = %err, "failed to reconcile work cache"),
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .into_diagnostic()?;
    info!("program is running");
    let pipeline = runtime.block_on(async {
        let shutdown = worker::spawn_shutdown_listener();
        worker::run(pipeline, config.tick, shutdown).await
    })?;
    info!("finishing the program");
    Ok(pipeline)
}
