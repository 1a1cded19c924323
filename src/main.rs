use anyhow::{Context as _, Result};
use std::sync::Arc;

use clap::Parser;
use tokio::io::AsyncReadExt as _;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use kvusers::{
    accounts::{AccountDriver, DryRunDriver, platform_driver},
    config::{Cli, Command, Settings},
    fetcher::ConsulKvFetcher,
    gate::{GateHandle, spawn_gate},
    pipeline::run_batch,
    reconcile::Reconciler,
    state::WatermarkStore,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::resolve(&cli.config)?;
    init_tracing(&settings)?;

    match cli.command.unwrap_or(Command::Apply) {
        Command::Apply => apply(settings).await,
        Command::ShowState => show_state(&settings),
    }
}

async fn apply(settings: Settings) -> Result<()> {
    let mut input = Vec::new();
    tokio::io::stdin()
        .read_to_end(&mut input)
        .await
        .context("read notification from stdin")?;

    let gate = match &settings.state_file {
        Some(path) if settings.dry_run => {
            let baseline = WatermarkStore::peek(path)
                .with_context(|| format!("read state file {}", path.display()))?
                .unwrap_or_default();
            GateHandle::read_only(baseline)
        }
        Some(path) => spawn_gate(path.clone())
            .await
            .with_context(|| format!("open state file {}", path.display()))?,
        None => {
            warn!("no state file configured, replayed batches will be reconciled again");
            GateHandle::noop()
        }
    };

    let fetcher = Arc::new(ConsulKvFetcher::new(&settings.consul)?);
    let platform = platform_driver(settings.driver_settings());
    let driver: Arc<dyn AccountDriver> = if settings.dry_run {
        Arc::new(DryRunDriver::new(platform))
    } else {
        platform
    };

    info!(
        version = kvusers::version::VERSION,
        consul = %settings.consul.http_addr,
        prefix = %settings.consul.user_key_prefix,
        driver = driver.name(),
        baseline = gate.baseline().modify_index,
        "kvusers starting"
    );

    let reconciler = Reconciler::new(fetcher, driver, settings.defaults.clone());
    let summary = run_batch(&input, gate, &reconciler).await?;

    info!(
        records = summary.records,
        fresh = summary.fresh,
        users = summary.reconcile.users.len(),
        failed = summary.reconcile.failed(),
        modify_index = summary.gate.persisted.modify_index,
        "kvusers done"
    );
    Ok(())
}

fn show_state(settings: &Settings) -> Result<()> {
    let path = settings
        .state_file
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("no state file configured (--state-file)"))?;
    let watermark = WatermarkStore::peek(path)
        .with_context(|| format!("read state file {}", path.display()))?;

    let out = serde_json::json!({
        "state_file": path,
        "exists": watermark.is_some(),
        "watermark": watermark.unwrap_or_default(),
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

fn init_tracing(settings: &Settings) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.effective_log_level()));
    let builder = fmt().with_env_filter(filter).compact();

    match &settings.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("open log file {}", path.display()))?;
            builder
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .init();
        }
        None => builder.with_writer(std::io::stderr).init(),
    }
    Ok(())
}
