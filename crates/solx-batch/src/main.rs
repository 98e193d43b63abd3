use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use dotenvy::dotenv;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use solx_common::config::{self, Mode};
use solx_common::db::LanePools;
use solx_common::exec::ProcExecutor;
use solx_common::pipeline::{LaneAllocation, WorkerPool};
use solx_common::report::{BatchLogger, Reporter, RunSummary};
use solx_common::spool;
use solx_common::stats::StatsRegistry;
use solx_common::template::{self, TemplateMap};

#[derive(Debug, Parser)]
#[command(
    name = "solx-batch",
    about = "Run nightly branch extract/insert batches"
)]
struct Cli {
    /// Application configuration: connection and concurrency settings
    #[arg(long = "appCfg", value_name = "PATH")]
    app_cfg: PathBuf,

    /// Run configuration: procedures, templates and output formats
    #[arg(long = "runCfg", value_name = "PATH")]
    run_cfg: PathBuf,

    /// E extracts rows into spool files, I invokes insert procedures
    #[arg(long, value_parser = parse_mode)]
    mode: Mode,
}

fn parse_mode(raw: &str) -> Result<Mode, String> {
    Mode::from_flag(raw)
        .ok_or_else(|| "valid modes are 'E' (extract) and 'I' (insert)".to_string())
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Cli::parse();
    let app_cfg = config::load_app_config(&args.app_cfg)?;
    let run_cfg = Arc::new(config::load_run_config(&args.run_cfg)?);
    let sols = config::read_sol_list(&app_cfg.sol_list_path)?;

    // Templates are only needed to build SELECT lists; insert mode calls
    // procedures directly.
    let templates = Arc::new(match args.mode {
        Mode::Extract => template::load_templates(&run_cfg.procedures, &run_cfg.template_path)?,
        Mode::Insert => TemplateMap::new(),
    });

    solx_metrics::init_metrics("SOLX_METRICS_PORT", 9187);

    let allocation = LaneAllocation::split(app_cfg.concurrency);
    let pools = Arc::new(LanePools::connect(&app_cfg, allocation)?);
    pools.warmup().await?;

    let log_path = app_cfg
        .log_path
        .join(format!("{}_{}.csv", run_cfg.package_name, args.mode.log_suffix()));
    let summary_path = app_cfg.log_path.join(format!(
        "{}_{}_summary.csv",
        run_cfg.package_name,
        args.mode.log_suffix()
    ));
    let (logger, log_tx) = BatchLogger::spawn(log_path);
    let summary = Arc::new(RunSummary::new());
    let reporter = Reporter::new(log_tx, Arc::clone(&summary));

    let registry = Arc::new(StatsRegistry::new(&run_cfg.procedures));
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received; cancelling in-flight work");
                cancel.cancel();
            }
        });
    }

    let executor = Arc::new(ProcExecutor::new(
        args.mode,
        Arc::clone(&run_cfg),
        templates,
        Arc::clone(&pools),
    ));
    let worker_pool = WorkerPool::new(
        app_cfg.concurrency,
        Arc::clone(&registry),
        executor,
        cancel.clone(),
    );

    let started = Instant::now();
    let totals = worker_pool.run(&run_cfg.procedures, &sols, reporter).await;
    logger.close().await;

    registry.log_final();
    summary.write_csv(&summary_path)?;

    if args.mode == Mode::Extract && !cancel.is_cancelled() {
        let merge_cfg = Arc::clone(&run_cfg);
        tokio::task::spawn_blocking(move || spool::merge_spools(&merge_cfg)).await??;
    }

    pools.close();
    info!(
        procedures = run_cfg.procedures.len(),
        sols = sols.len(),
        completed = totals.completed,
        failed = totals.failed,
        elapsed_secs = started.elapsed().as_secs(),
        "batch run finished"
    );
    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("solx-batch failed: {err}");
        std::process::exit(1);
    }
}
