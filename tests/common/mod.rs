#![allow(dead_code)]

use async_trait::async_trait;
use relay_watch::db::Pool;
use relay_watch::model::{ModelRef, NewSite, Site};
use relay_watch::notify::{Mailer, Message, NotifyError};
use relay_watch::sites;
use relay_watch::vault::Vault;
use relay_watch::vendor::{ProbeError, ProbeResult, ProbeTarget, SiteProber};
use sqlx::sqlite::SqlitePoolOptions;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;

pub const KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

pub async fn setup_pool() -> Pool {
    // A single connection keeps every query on the same in-memory database.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

pub fn vault() -> Arc<Vault> {
    Arc::new(Vault::from_hex_key(KEY).unwrap())
}

pub fn models(ids: &[(&str, &str)]) -> Vec<ModelRef> {
    ids.iter().map(|(id, owner)| ModelRef::new(*id, *owner)).collect()
}

pub async fn add_site(pool: &Pool, vault: &Vault, owner: i64, name: &str) -> Site {
    add_site_with(pool, vault, owner, name, |_| {}).await
}

pub async fn add_site_with(
    pool: &Pool,
    vault: &Vault,
    owner: i64,
    name: &str,
    tweak: impl FnOnce(&mut NewSite),
) -> Site {
    let mut new = NewSite {
        name: name.to_string(),
        base_url: format!("https://{}.example", name),
        api_key: format!("sk-{}", name),
        account_id: Some("1".into()),
        timezone: Some("UTC".into()),
        ..NewSite::default()
    };
    tweak(&mut new);
    sites::create_site(pool, vault, owner, new).await.unwrap()
}

#[derive(Debug, Clone)]
pub struct ProbeCall {
    pub base_url: String,
    pub api_key: Option<String>,
    pub at: Instant,
}

/// Replays queued results per base URL and records every probe.
#[derive(Clone, Default)]
pub struct ScriptedProber {
    scripts: Arc<Mutex<HashMap<String, VecDeque<ProbeResult>>>>,
    calls: Arc<Mutex<Vec<ProbeCall>>>,
    gate: Option<Arc<Semaphore>>,
}

impl ScriptedProber {
    pub fn new() -> Self {
        Self::default()
    }

    /// Probes block until a permit is added to the returned semaphore.
    pub fn gated() -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        (
            Self {
                gate: Some(Arc::clone(&gate)),
                ..Self::default()
            },
            gate,
        )
    }

    pub async fn push(&self, site: &Site, result: ProbeResult) {
        self.scripts
            .lock()
            .await
            .entry(site.base_url.clone())
            .or_default()
            .push_back(result);
    }

    pub async fn push_models(&self, site: &Site, ids: &[(&str, &str)]) {
        self.push(site, ProbeResult::with_models(models(ids))).await;
    }

    pub async fn calls(&self) -> Vec<ProbeCall> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl SiteProber for ScriptedProber {
    async fn probe(&self, target: &ProbeTarget) -> ProbeResult {
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        self.calls.lock().await.push(ProbeCall {
            base_url: target.base_url.clone(),
            api_key: target.api_key.clone(),
            at: Instant::now(),
        });
        self.scripts
            .lock()
            .await
            .get_mut(&target.base_url)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| ProbeResult::failed(ProbeError::Transport("no scripted reply".into())))
    }
}

#[derive(Debug, Clone)]
pub struct SentMail {
    pub api_key: String,
    pub message: Message,
}

#[derive(Clone, Default)]
pub struct RecordingMailer {
    sent: Arc<Mutex<Vec<SentMail>>>,
    fail: bool,
}

impl RecordingMailer {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub async fn sent(&self) -> Vec<SentMail> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, api_key: &str, message: &Message) -> Result<(), NotifyError> {
        self.sent.lock().await.push(SentMail {
            api_key: api_key.to_string(),
            message: message.clone(),
        });
        if self.fail {
            return Err(NotifyError::Rejected {
                status: 500,
                body: "provider down".into(),
            });
        }
        Ok(())
    }
}
