use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use relay_watch::config::{self, Config};
use relay_watch::db::{self, Pool};
use relay_watch::diff;
use relay_watch::model::{BillingAuthType, CheckInMode, Dialect, NewSite, ScheduleConfig};
use relay_watch::monitor::{CheckOptions, Monitor};
use relay_watch::notify::{Notifier, ResendMailer};
use relay_watch::scheduler::Scheduler;
use relay_watch::sites;
use relay_watch::vault::Vault;
use relay_watch::vendor::VendorClient;

#[derive(Debug, Parser)]
#[command(name = "sitectl", author, version, about = "Manage and check relay sites")]
struct Cli {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml", global = true)]
    config: PathBuf,

    /// Owner whose sites are managed
    #[arg(long, default_value_t = 1, global = true)]
    owner: i64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Register a site; the API key is encrypted before it is stored
    AddSite {
        #[arg(long)]
        name: String,
        #[arg(long)]
        base_url: String,
        /// newapi, veloera, donehub, voapi or other
        #[arg(long, default_value = "newapi")]
        dialect: String,
        #[arg(long)]
        api_key: String,
        #[arg(long)]
        account_id: Option<String>,
        /// Five-field cron expression for this site alone
        #[arg(long)]
        cron: Option<String>,
        #[arg(long)]
        timezone: Option<String>,
        #[arg(long)]
        category: Option<i64>,
        #[arg(long)]
        pinned: bool,
        #[arg(long)]
        exclude_from_batch: bool,
        #[arg(long)]
        billing_url: Option<String>,
        /// token or cookie
        #[arg(long)]
        billing_auth_type: Option<String>,
        #[arg(long)]
        billing_auth_value: Option<String>,
        #[arg(long)]
        billing_limit_field: Option<String>,
        #[arg(long)]
        billing_usage_field: Option<String>,
        #[arg(long)]
        unlimited_quota: bool,
        /// Enable check-in with this mode: model, checkin or both
        #[arg(long)]
        check_in: Option<String>,
    },
    /// List sites, optionally filtered by name, URL or model id
    List { query: Option<String> },
    /// Delete a site and its history
    Delete { site_id: i64 },
    /// Replace a site's API key and/or account id
    SetCredentials {
        site_id: i64,
        #[arg(long)]
        api_key: Option<String>,
        #[arg(long)]
        account_id: Option<String>,
    },
    /// Set or clear a site's own cron
    SiteCron {
        site_id: i64,
        /// Omit to fall back to the global schedule
        #[arg(long)]
        cron: Option<String>,
        #[arg(long, default_value = "UTC")]
        timezone: String,
    },
    /// Probe one site now
    Check {
        site_id: i64,
        #[arg(long)]
        no_notify: bool,
    },
    /// Probe several sites in sequence
    CheckGroup {
        /// Check the batch-eligible sites of this category
        #[arg(long, conflicts_with = "site_ids")]
        category: Option<i64>,
        site_ids: Vec<i64>,
        #[arg(long)]
        no_notify: bool,
    },
    /// Show the latest billing, check-in and catalog state of a site
    Status { site_id: i64 },
    /// Show recent successful catalog snapshots, newest first
    Snapshots {
        site_id: i64,
        #[arg(long, default_value_t = 1)]
        limit: i64,
    },
    /// Show recorded catalog changes
    Diffs {
        site_id: i64,
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
    /// Set the owner's global schedule
    Schedule {
        #[arg(long)]
        disable: bool,
        #[arg(long, default_value_t = 9)]
        hour: u32,
        #[arg(long, default_value_t = 0)]
        minute: u32,
        #[arg(long, default_value = "Asia/Shanghai")]
        timezone: String,
        /// Pause between sites, in seconds
        #[arg(long, default_value_t = 30)]
        interval: u64,
        /// Apply the global schedule to sites that have their own cron
        #[arg(long)]
        override_individual: bool,
    },
    /// Configure change alerts
    Email {
        #[arg(long)]
        api_key: String,
        /// Comma-separated recipient addresses
        #[arg(long)]
        to: String,
        #[arg(long)]
        disable: bool,
    },
}

struct Ctx {
    cfg: Config,
    pool: Pool,
    vault: Arc<Vault>,
}

impl Ctx {
    fn monitor(&self) -> Result<Arc<Monitor>> {
        let prober = Arc::new(VendorClient::new(
            self.cfg.request_timeout(),
            &self.cfg.vendor.user_agent,
        )?);
        let mailer = Arc::new(ResendMailer::new(
            &self.cfg.notify.api_base,
            &self.cfg.vendor.user_agent,
        )?);
        let notifier = Arc::new(Notifier::new(
            self.pool.clone(),
            Arc::clone(&self.vault),
            mailer,
            self.cfg.notify.from_address.clone(),
        ));
        Ok(Arc::new(Monitor::new(
            self.pool.clone(),
            Arc::clone(&self.vault),
            prober,
            Some(notifier),
            self.cfg.group_stagger(),
        )))
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();
    let cfg = config::load(Some(&cli.config))?;
    cfg.ensure_dirs()?;
    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;
    let vault = Arc::new(
        Vault::from_hex_key(&cfg.resolved_secret_key()).context("failed to initialise vault")?,
    );
    let ctx = Ctx { cfg, pool, vault };
    let owner = cli.owner;

    match cli.command {
        Command::AddSite {
            name,
            base_url,
            dialect,
            api_key,
            account_id,
            cron,
            timezone,
            category,
            pinned,
            exclude_from_batch,
            billing_url,
            billing_auth_type,
            billing_auth_value,
            billing_limit_field,
            billing_usage_field,
            unlimited_quota,
            check_in,
        } => {
            let new = NewSite {
                name,
                base_url,
                dialect: Some(Dialect::parse_tag(&dialect)),
                api_key,
                account_id,
                schedule_cron: cron,
                timezone,
                pinned,
                exclude_from_batch,
                category_id: category,
                billing_url,
                billing_auth_type: billing_auth_type.as_deref().map(BillingAuthType::parse_tag),
                billing_auth_value,
                billing_limit_field,
                billing_usage_field,
                unlimited_quota,
                enable_check_in: check_in.is_some(),
                check_in_mode: check_in.as_deref().map(CheckInMode::parse_tag),
            };
            let site = sites::create_site(&ctx.pool, &ctx.vault, owner, new).await?;
            println!("created site {} ({})", site.id, site.name);
        }
        Command::List { query } => {
            let found = diff::search_sites(&ctx.pool, owner, query.as_deref().unwrap_or("")).await?;
            for site in found {
                println!(
                    "{:>5}  {:<24} {:<8} {}{}",
                    site.id,
                    site.name,
                    site.dialect.as_str(),
                    site.base_url,
                    if site.pinned { "  [pinned]" } else { "" }
                );
            }
        }
        Command::Delete { site_id } => {
            if !db::delete_site(&ctx.pool, owner, site_id).await? {
                bail!("site {} not found", site_id);
            }
            println!("deleted site {}", site_id);
        }
        Command::SetCredentials {
            site_id,
            api_key,
            account_id,
        } => {
            if api_key.is_none() && account_id.is_none() {
                bail!("nothing to update: pass --api-key and/or --account-id");
            }
            let updated = sites::update_credentials(
                &ctx.pool,
                &ctx.vault,
                owner,
                site_id,
                api_key.as_deref(),
                account_id.as_deref(),
            )
            .await?;
            if !updated {
                bail!("site {} not found", site_id);
            }
            println!("credentials updated for site {}", site_id);
        }
        Command::SiteCron {
            site_id,
            cron,
            timezone,
        } => {
            if !sites::set_site_schedule(&ctx.pool, owner, site_id, cron.as_deref(), &timezone).await? {
                bail!("site {} not found", site_id);
            }
            println!("schedule updated for site {}", site_id);
        }
        Command::Check { site_id, no_notify } => {
            let opts = CheckOptions {
                skip_notification: no_notify,
                is_manual: true,
            };
            let report = ctx.monitor()?.check_site(owner, site_id, opts).await?;
            print_json(&report)?;
        }
        Command::CheckGroup {
            category,
            site_ids,
            no_notify,
        } => {
            let opts = CheckOptions {
                skip_notification: no_notify,
                is_manual: false,
            };
            let monitor = ctx.monitor()?;
            let report = match category {
                Some(c) => monitor.check_category(owner, c, opts).await?,
                None => monitor.check_group(owner, &site_ids, opts).await?,
            };
            print_json(&report)?;
        }
        Command::Status { site_id } => match diff::site_status(&ctx.pool, owner, site_id).await? {
            Some(status) => print_json(&status)?,
            None => bail!("site {} not found", site_id),
        },
        Command::Snapshots { site_id, limit } => {
            match diff::snapshot_history(&ctx.pool, owner, site_id, limit).await? {
                Some(history) => print_json(&history)?,
                None => bail!("site {} not found", site_id),
            }
        }
        Command::Diffs { site_id, limit } => {
            if db::get_site(&ctx.pool, owner, site_id).await?.is_none() {
                bail!("site {} not found", site_id);
            }
            print_json(&db::list_diffs(&ctx.pool, site_id, limit).await?)?;
        }
        Command::Schedule {
            disable,
            hour,
            minute,
            timezone,
            interval,
            override_individual,
        } => {
            let scheduler = Scheduler::new(ctx.monitor()?, Duration::from_secs(ctx.cfg.app.tick_seconds));
            let cfg = ScheduleConfig {
                owner_id: owner,
                enabled: !disable,
                hour,
                minute,
                timezone,
                interval_seconds: interval,
                override_individual,
            };
            scheduler.reconfigure(cfg.clone()).await?;
            print_json(&cfg)?;
        }
        Command::Email {
            api_key,
            to,
            disable,
        } => {
            let recipients = db::split_recipients(&to);
            let cfg =
                sites::set_email_config(&ctx.pool, &ctx.vault, owner, !disable, &api_key, &recipients)
                    .await?;
            println!(
                "email alerts {} for {} recipient(s)",
                if cfg.enabled { "enabled" } else { "disabled" },
                cfg.recipients.len()
            );
        }
    }

    ctx.pool.close().await;
    Ok(())
}
