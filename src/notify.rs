//! Change alerts. Delivery is best-effort: every failure is logged and
//! reported back as an outcome, never as an error of the check itself.
use crate::db::{self, Pool};
use crate::model::{ModelDiff, Site};
use crate::vault::Vault;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{Client, Url};
use serde::Serialize;
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("valid email pattern"));

const SUBJECT_PREFIX: &str = "[relay-watch]";

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("delivery credential unavailable: {0}")]
    Credential(#[from] crate::vault::VaultError),
    #[error("delivery request failed: {0}")]
    Transport(String),
    #[error("delivery provider returned HTTP {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("invalid recipient address: {0}")]
    InvalidRecipient(String),
    #[error("invalid provider URL: {0}")]
    Url(String),
    #[error("failed to load email settings: {0}")]
    Store(String),
}

/// Message ready for the delivery provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub text: String,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, api_key: &str, message: &Message) -> Result<(), NotifyError>;
}

/// Resend-compatible HTTP delivery.
#[derive(Clone)]
pub struct ResendMailer {
    http: Client,
    base_url: Url,
}

impl fmt::Debug for ResendMailer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResendMailer")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl ResendMailer {
    pub fn new(api_base: &str, user_agent: &str) -> Result<Self, NotifyError> {
        let base = if api_base.ends_with('/') {
            api_base.to_string()
        } else {
            format!("{}/", api_base)
        };
        let base_url = Url::parse(&base).map_err(|e| NotifyError::Url(e.to_string()))?;
        let http = Client::builder()
            .user_agent(user_agent)
            .timeout(std::time::Duration::from_secs(15))
            .build()
            .map_err(|e| NotifyError::Transport(e.to_string()))?;
        Ok(Self { http, base_url })
    }

    pub fn build_request(&self, api_key: &str, message: &Message) -> Result<reqwest::Request, NotifyError> {
        let endpoint = self
            .base_url
            .join("emails")
            .map_err(|e| NotifyError::Url(e.to_string()))?;
        self.http
            .post(endpoint)
            .bearer_auth(api_key)
            .json(&json!({
                "from": message.from,
                "to": message.to,
                "subject": message.subject,
                "text": message.text,
            }))
            .build()
            .map_err(|e| NotifyError::Transport(e.without_url().to_string()))
    }
}

#[async_trait]
impl Mailer for ResendMailer {
    async fn send(&self, api_key: &str, message: &Message) -> Result<(), NotifyError> {
        let req = self.build_request(api_key, message)?;
        let res = self
            .http
            .execute(req)
            .await
            .map_err(|e| NotifyError::Transport(e.without_url().to_string()))?;
        let status = res.status();
        if status.is_success() {
            return Ok(());
        }
        let body = res.text().await.unwrap_or_default();
        Err(NotifyError::Rejected {
            status: status.as_u16(),
            body: crate::vendor::snippet(&body, &[Some(api_key)]),
        })
    }
}

/// Reject the whole list if any address is malformed.
pub fn validate_recipients(recipients: &[String]) -> Result<(), NotifyError> {
    match recipients.iter().find(|r| !EMAIL_RE.is_match(r.trim())) {
        Some(bad) => Err(NotifyError::InvalidRecipient(bad.clone())),
        None => Ok(()),
    }
}

fn id_list(ids: impl Iterator<Item = String>) -> String {
    let ids: Vec<String> = ids.collect();
    if ids.is_empty() {
        "  (none)".to_string()
    } else {
        ids.iter().map(|id| format!("  - {}", id)).collect::<Vec<_>>().join("\n")
    }
}

pub fn compose_message(site: &Site, diff: &ModelDiff, from: &str, to: &[String]) -> Message {
    let subject = format!(
        "{} {}: +{} -{} ~{}",
        SUBJECT_PREFIX,
        site.name,
        diff.added.len(),
        diff.removed.len(),
        diff.changed.len()
    );
    let text = format!(
        "Model catalog changed for {} ({}) at {}.\n\nAdded:\n{}\n\nRemoved:\n{}\n\nChanged:\n{}\n",
        site.name,
        site.base_url,
        diff.diff_at.to_rfc3339(),
        id_list(diff.added.iter().map(|m| m.id.clone())),
        id_list(diff.removed.iter().map(|m| m.id.clone())),
        id_list(
            diff.changed
                .iter()
                .map(|c| format!("{} ({} -> {})", c.id, c.before, c.after))
        ),
    );
    Message {
        from: from.to_string(),
        to: to.to_vec(),
        subject,
        text,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyOutcome {
    Sent { recipients: usize },
    Skipped(&'static str),
    Failed(String),
}

pub struct Notifier {
    pool: Pool,
    vault: Arc<Vault>,
    mailer: Arc<dyn Mailer>,
    from: String,
}

impl Notifier {
    pub fn new(pool: Pool, vault: Arc<Vault>, mailer: Arc<dyn Mailer>, from: impl Into<String>) -> Self {
        Self {
            pool,
            vault,
            mailer,
            from: from.into(),
        }
    }

    #[instrument(skip_all, fields(owner_id = site.owner_id, site_id = site.id))]
    pub async fn notify(&self, site: &Site, diff: &ModelDiff) -> NotifyOutcome {
        match self.try_notify(site, diff).await {
            Ok(outcome) => {
                if let NotifyOutcome::Sent { recipients } = &outcome {
                    info!(recipients = *recipients, "change alert sent");
                } else {
                    debug!(?outcome, "change alert skipped");
                }
                outcome
            }
            Err(err) => {
                warn!(error = %err, "change alert not delivered");
                NotifyOutcome::Failed(err.to_string())
            }
        }
    }

    async fn try_notify(&self, site: &Site, diff: &ModelDiff) -> Result<NotifyOutcome, NotifyError> {
        let cfg = db::get_email_config(&self.pool, site.owner_id)
            .await
            .map_err(|e| NotifyError::Store(e.to_string()))?;
        let Some(cfg) = cfg else {
            return Ok(NotifyOutcome::Skipped("no email settings"));
        };
        if !cfg.enabled {
            return Ok(NotifyOutcome::Skipped("email disabled"));
        }
        if cfg.recipients.is_empty() {
            return Ok(NotifyOutcome::Skipped("no recipients"));
        }
        validate_recipients(&cfg.recipients)?;
        let api_key = self.vault.decrypt(&cfg.api_key_enc)?;
        let message = compose_message(site, diff, &self.from, &cfg.recipients);
        self.mailer.send(&api_key, &message).await?;
        Ok(NotifyOutcome::Sent {
            recipients: cfg.recipients.len(),
        })
    }
}
