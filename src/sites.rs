//! Management operations used by `sitectl`. Plaintext secrets enter here and
//! leave encrypted; nothing below this layer sees them.
use crate::db::{self, Pool};
use crate::model::{BillingConfig, CheckInMode, Dialect, EmailConfig, NewSite, Site};
use crate::notify::{validate_recipients, NotifyError};
use crate::schedule::{validate_timezone, CronExpr, ScheduleError};
use crate::vault::{Vault, VaultError};
use reqwest::Url;
use thiserror::Error;
use tracing::{info, instrument};

#[derive(Debug, Error)]
pub enum ManageError {
    #[error("invalid site: {0}")]
    Invalid(String),
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
    #[error(transparent)]
    Recipients(#[from] NotifyError),
    #[error("failed to encrypt credential: {0}")]
    Vault(#[from] VaultError),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

fn clean(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn validate_base_url(raw: &str) -> Result<String, ManageError> {
    let trimmed = raw.trim().trim_end_matches('/');
    let url = Url::parse(trimmed).map_err(|e| ManageError::Invalid(format!("base URL: {}", e)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ManageError::Invalid("base URL must be http or https".into()));
    }
    Ok(trimmed.to_string())
}

fn encrypt_opt(vault: &Vault, plain: Option<&str>) -> Result<Option<String>, VaultError> {
    match plain.map(str::trim).filter(|s| !s.is_empty()) {
        Some(p) => vault.encrypt(p).map(Some),
        None => Ok(None),
    }
}

#[instrument(skip_all, fields(owner_id = owner_id))]
pub async fn create_site(
    pool: &Pool,
    vault: &Vault,
    owner_id: i64,
    new: NewSite,
) -> Result<Site, ManageError> {
    let name = new.name.trim().to_string();
    if name.is_empty() {
        return Err(ManageError::Invalid("name is required".into()));
    }
    let base_url = validate_base_url(&new.base_url)?;
    let schedule_cron = clean(new.schedule_cron);
    if let Some(cron) = schedule_cron.as_deref() {
        cron.parse::<CronExpr>()?;
    }
    let timezone = clean(new.timezone).unwrap_or_else(|| "UTC".to_string());
    validate_timezone(&timezone)?;

    let mut site = Site {
        id: 0,
        owner_id,
        name,
        base_url,
        dialect: new.dialect.unwrap_or(Dialect::NewApi),
        api_key_enc: encrypt_opt(vault, Some(new.api_key.as_str()))?,
        account_id: clean(new.account_id),
        schedule_cron,
        timezone,
        pinned: new.pinned,
        exclude_from_batch: new.exclude_from_batch,
        category_id: new.category_id,
        billing: BillingConfig {
            url: clean(new.billing_url),
            auth_type: new.billing_auth_type.unwrap_or(BillingConfig::default().auth_type),
            auth_value_enc: encrypt_opt(vault, new.billing_auth_value.as_deref())?,
            limit_field: clean(new.billing_limit_field),
            usage_field: clean(new.billing_usage_field),
            unlimited: new.unlimited_quota,
        },
        enable_check_in: new.enable_check_in,
        check_in_mode: new.check_in_mode.unwrap_or(CheckInMode::Both),
    };
    site.id = db::insert_site(pool, owner_id, &site).await?;
    info!(site_id = site.id, dialect = site.dialect.as_str(), "site created");
    Ok(site)
}

/// Replace the API key and/or account id. `None` keeps the stored value.
pub async fn update_credentials(
    pool: &Pool,
    vault: &Vault,
    owner_id: i64,
    site_id: i64,
    api_key: Option<&str>,
    account_id: Option<&str>,
) -> Result<bool, ManageError> {
    let api_key_enc = encrypt_opt(vault, api_key)?;
    Ok(db::update_site_credentials(pool, owner_id, site_id, api_key_enc.as_deref(), account_id).await?)
}

pub async fn set_site_schedule(
    pool: &Pool,
    owner_id: i64,
    site_id: i64,
    cron: Option<&str>,
    timezone: &str,
) -> Result<bool, ManageError> {
    let cron = cron.map(str::trim).filter(|c| !c.is_empty());
    if let Some(c) = cron {
        c.parse::<CronExpr>()?;
    }
    validate_timezone(timezone)?;
    Ok(db::update_site_schedule(pool, owner_id, site_id, cron, timezone.trim()).await?)
}

#[instrument(skip_all, fields(owner_id = owner_id))]
pub async fn set_email_config(
    pool: &Pool,
    vault: &Vault,
    owner_id: i64,
    enabled: bool,
    api_key: &str,
    recipients: &[String],
) -> Result<EmailConfig, ManageError> {
    let recipients: Vec<String> = recipients
        .iter()
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty())
        .collect();
    validate_recipients(&recipients)?;
    if enabled && recipients.is_empty() {
        return Err(ManageError::Invalid("at least one recipient is required".into()));
    }
    let cfg = EmailConfig {
        owner_id,
        enabled,
        api_key_enc: vault.encrypt(api_key.trim())?,
        recipients,
    };
    db::upsert_email_config(pool, &cfg).await?;
    info!(enabled, recipients = cfg.recipients.len(), "email settings saved");
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    const KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    async fn setup_pool() -> Pool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    fn new_site() -> NewSite {
        NewSite {
            name: " relay ".into(),
            base_url: "https://relay.example/".into(),
            api_key: "sk-plain".into(),
            account_id: Some("42".into()),
            billing_auth_value: Some("cookie=1".into()),
            ..NewSite::default()
        }
    }

    #[tokio::test]
    async fn create_site_encrypts_secrets() {
        let pool = setup_pool().await;
        let vault = Vault::from_hex_key(KEY).unwrap();
        let site = create_site(&pool, &vault, 1, new_site()).await.unwrap();
        assert_eq!(site.name, "relay");
        assert_eq!(site.base_url, "https://relay.example");

        let stored = db::get_site(&pool, 1, site.id).await.unwrap().unwrap();
        let enc = stored.api_key_enc.unwrap();
        assert!(!enc.contains("sk-plain"));
        assert_eq!(vault.decrypt(&enc).unwrap(), "sk-plain");
        assert_eq!(
            vault.decrypt_opt(stored.billing.auth_value_enc.as_deref()).unwrap().as_deref(),
            Some("cookie=1")
        );
    }

    #[tokio::test]
    async fn create_site_rejects_bad_input() {
        let pool = setup_pool().await;
        let vault = Vault::from_hex_key(KEY).unwrap();
        let mut bad_url = new_site();
        bad_url.base_url = "ftp://relay.example".into();
        assert!(matches!(
            create_site(&pool, &vault, 1, bad_url).await,
            Err(ManageError::Invalid(_))
        ));
        let mut bad_cron = new_site();
        bad_cron.schedule_cron = Some("every day".into());
        assert!(matches!(
            create_site(&pool, &vault, 1, bad_cron).await,
            Err(ManageError::Schedule(_))
        ));
        let mut bad_tz = new_site();
        bad_tz.timezone = Some("Asia/Shangai".into());
        assert!(matches!(
            create_site(&pool, &vault, 1, bad_tz).await,
            Err(ManageError::Schedule(ScheduleError::Timezone(_)))
        ));
        assert!(db::list_sites(&pool, 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn site_schedule_rejects_unknown_timezone() {
        let pool = setup_pool().await;
        let vault = Vault::from_hex_key(KEY).unwrap();
        let site = create_site(&pool, &vault, 1, new_site()).await.unwrap();
        assert!(matches!(
            set_site_schedule(&pool, 1, site.id, Some("0 9 * * *"), "Asia/Shangai").await,
            Err(ManageError::Schedule(ScheduleError::Timezone(_)))
        ));
        let stored = db::get_site(&pool, 1, site.id).await.unwrap().unwrap();
        assert_eq!(stored.schedule_cron, None);
        assert_eq!(stored.timezone, "UTC");

        assert!(set_site_schedule(&pool, 1, site.id, Some("0 9 * * *"), "Asia/Shanghai")
            .await
            .unwrap());
        let stored = db::get_site(&pool, 1, site.id).await.unwrap().unwrap();
        assert_eq!(stored.timezone, "Asia/Shanghai");
    }

    #[tokio::test]
    async fn email_config_validates_recipients() {
        let pool = setup_pool().await;
        let vault = Vault::from_hex_key(KEY).unwrap();
        assert!(matches!(
            set_email_config(&pool, &vault, 1, true, "re_x", &["nope".into()]).await,
            Err(ManageError::Recipients(_))
        ));
        let cfg = set_email_config(&pool, &vault, 1, true, "re_x", &[" me@x.io ".into()])
            .await
            .unwrap();
        assert_eq!(cfg.recipients, vec!["me@x.io".to_string()]);
        assert_eq!(vault.decrypt(&cfg.api_key_enc).unwrap(), "re_x");
    }
}
