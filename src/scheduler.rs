//! Background sweep driver.
//!
//! Once per wall-clock minute the scheduler asks every owner's sites whether
//! they are due and starts one sweep task per owner. Owners never share a
//! sweep, so a slow vendor only delays its own owner's queue.
use crate::db;
use crate::model::ScheduleConfig;
use crate::monitor::{GroupReport, Monitor};
use crate::schedule::{is_due, validate_schedule_config, ScheduleError};
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ReconfigureError {
    #[error(transparent)]
    Invalid(#[from] ScheduleError),
    #[error("failed to persist schedule: {0}")]
    Store(#[from] anyhow::Error),
}

/// A sweep started by a tick.
pub struct SweepHandle {
    pub owner_id: i64,
    pub sweep_id: Uuid,
    pub handle: JoinHandle<GroupReport>,
}

pub struct Scheduler {
    monitor: Arc<Monitor>,
    configs: RwLock<HashMap<i64, ScheduleConfig>>,
    running: Arc<StdMutex<HashSet<i64>>>,
    last_minute: Mutex<Option<i64>>,
    tick_period: Duration,
}

impl Scheduler {
    pub fn new(monitor: Arc<Monitor>, tick_period: Duration) -> Self {
        Self {
            monitor,
            configs: RwLock::new(HashMap::new()),
            running: Arc::new(StdMutex::new(HashSet::new())),
            last_minute: Mutex::new(None),
            tick_period: minute_aligned_period(tick_period),
        }
    }

    /// Validate, persist and apply a new schedule. Takes effect at the next tick.
    pub async fn reconfigure(&self, cfg: ScheduleConfig) -> Result<(), ReconfigureError> {
        validate_schedule_config(&cfg)?;
        db::upsert_schedule_config(self.monitor.pool(), &cfg).await?;
        info!(
            owner_id = cfg.owner_id,
            enabled = cfg.enabled,
            hour = cfg.hour,
            minute = cfg.minute,
            override_individual = cfg.override_individual,
            "schedule reconfigured"
        );
        self.configs.write().await.insert(cfg.owner_id, cfg);
        Ok(())
    }

    pub async fn config_for(&self, owner_id: i64) -> ScheduleConfig {
        self.configs
            .read()
            .await
            .get(&owner_id)
            .cloned()
            .unwrap_or_else(|| ScheduleConfig::default_for(owner_id))
    }

    /// Reload every owner's schedule from the store so edits made by other
    /// processes are picked up. An owner whose row cannot be read keeps its
    /// previous config.
    async fn refresh_configs(&self, owners: &[i64]) {
        let previous = self.configs.read().await.clone();
        let mut fresh = HashMap::with_capacity(owners.len());
        for &owner in owners {
            let cfg = match db::get_schedule_config(self.monitor.pool(), owner).await {
                Ok(cfg) => cfg.unwrap_or_else(|| ScheduleConfig::default_for(owner)),
                Err(err) => {
                    error!(owner_id = owner, ?err, "failed to load schedule; keeping previous");
                    previous
                        .get(&owner)
                        .cloned()
                        .unwrap_or_else(|| ScheduleConfig::default_for(owner))
                }
            };
            fresh.insert(owner, cfg);
        }
        *self.configs.write().await = fresh;
    }

    /// Evaluate every owner at `now` and start sweeps for those with due
    /// sites. Returns the started sweeps.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<Vec<SweepHandle>> {
        let owners = db::list_owner_ids(self.monitor.pool()).await?;
        self.refresh_configs(&owners).await;

        let mut started = Vec::new();
        for owner_id in owners {
            let cfg = self.config_for(owner_id).await;
            let sites = match db::list_sites(self.monitor.pool(), owner_id).await {
                Ok(sites) => sites,
                Err(err) => {
                    error!(owner_id, ?err, "failed to load sites; skipping owner this tick");
                    continue;
                }
            };
            let due: Vec<_> = sites.into_iter().filter(|s| is_due(s, &cfg, now)).collect();
            if due.is_empty() {
                continue;
            }

            let Some(guard) = RunningGuard::claim(&self.running, owner_id) else {
                warn!(owner_id, due = due.len(), "previous sweep still running; skipping tick");
                continue;
            };

            let sweep_id = Uuid::new_v4();
            let monitor = Arc::clone(&self.monitor);
            let stagger = Duration::from_secs(cfg.interval_seconds);
            let span = info_span!("sweep", %sweep_id, owner_id);
            let handle = tokio::spawn(
                async move {
                    // Released on completion and on panic.
                    let _guard = guard;
                    info!(sites = due.len(), "sweep started");
                    monitor.run_sweep(owner_id, &due, stagger).await
                }
                .instrument(span),
            );
            started.push(SweepHandle {
                owner_id,
                sweep_id,
                handle,
            });
        }
        Ok(started)
    }

    /// Run ticks aligned to the tick period until the task is dropped.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(period_secs = self.tick_period.as_secs(), "scheduler started");
            loop {
                tokio::time::sleep(until_next_boundary(Utc::now(), self.tick_period)).await;
                let now = Utc::now();
                let minute = now.timestamp().div_euclid(60);
                {
                    let mut last = self.last_minute.lock().await;
                    if *last == Some(minute) {
                        continue;
                    }
                    *last = Some(minute);
                }
                if let Err(err) = self.tick(now).await {
                    error!(?err, "scheduler tick failed");
                }
            }
        })
    }
}

/// Marks an owner as having a sweep in flight until dropped.
struct RunningGuard {
    running: Arc<StdMutex<HashSet<i64>>>,
    owner_id: i64,
}

impl RunningGuard {
    fn claim(running: &Arc<StdMutex<HashSet<i64>>>, owner_id: i64) -> Option<Self> {
        let inserted = running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(owner_id);
        inserted.then(|| Self {
            running: Arc::clone(running),
            owner_id,
        })
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.owner_id);
    }
}

/// Largest divisor of 60 seconds not above `requested`, so every minute
/// boundary is also a tick boundary.
pub fn minute_aligned_period(requested: Duration) -> Duration {
    let secs = requested.as_secs().clamp(1, 60);
    let aligned = (1..=secs).rev().find(|d| 60 % d == 0).unwrap_or(1);
    Duration::from_secs(aligned)
}

/// Time left until the next multiple of `period` since the epoch.
pub fn until_next_boundary(now: DateTime<Utc>, period: Duration) -> Duration {
    let period_ms = period.as_millis().max(1) as i64;
    let rem = now.timestamp_millis().rem_euclid(period_ms);
    Duration::from_millis((period_ms - rem) as u64)
}
