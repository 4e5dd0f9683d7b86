use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use relay_watch::config;
use relay_watch::db;
use relay_watch::monitor::Monitor;
use relay_watch::notify::{Notifier, ResendMailer};
use relay_watch::scheduler::Scheduler;
use relay_watch::vault::Vault;
use relay_watch::vendor::VendorClient;

#[derive(Debug, Parser)]
#[command(author, version, about = "Probe relay sites on schedule and alert on catalog changes")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let vault = Arc::new(
        Vault::from_hex_key(&cfg.resolved_secret_key()).context("failed to initialise vault")?,
    );
    let prober = Arc::new(VendorClient::new(cfg.request_timeout(), &cfg.vendor.user_agent)?);
    let mailer = Arc::new(
        ResendMailer::new(&cfg.notify.api_base, &cfg.vendor.user_agent)
            .context("failed to build mailer")?,
    );
    let notifier = Arc::new(Notifier::new(
        pool.clone(),
        Arc::clone(&vault),
        mailer,
        cfg.notify.from_address.clone(),
    ));
    let monitor = Arc::new(Monitor::new(
        pool.clone(),
        vault,
        prober,
        Some(notifier),
        cfg.group_stagger(),
    ));

    let scheduler = Arc::new(Scheduler::new(
        monitor,
        Duration::from_secs(cfg.app.tick_seconds),
    ));
    let ticker = scheduler.spawn();

    info!("relay-watch running; press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    warn!("shutting down");
    ticker.abort();
    pool.close().await;
    Ok(())
}
