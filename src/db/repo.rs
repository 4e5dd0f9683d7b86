use super::model::{NewDiff, NewSnapshot};
use crate::model::{
    BillingAuthType, BillingConfig, CheckInMode, Dialect, EmailConfig, ModelDiff, ModelSnapshot,
    ScheduleConfig, Site,
};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use sqlx::sqlite::SqliteRow;
use sqlx::{Executor, Row, Sqlite, SqlitePool, Transaction};
use tracing::{instrument, warn};

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    // sqlx refuses to create a missing file unless asked to.
    let mut rebuilt = format!("sqlite://{}", expanded_path);
    match query_part {
        Some(q) if q.contains("mode=") => {
            rebuilt.push('?');
            rebuilt.push_str(q);
        }
        Some(q) => {
            rebuilt.push('?');
            rebuilt.push_str(q);
            rebuilt.push_str("&mode=rwc");
        }
        None => rebuilt.push_str("?mode=rwc"),
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

fn parse_json_column<T: DeserializeOwned + Default>(raw: &str, column: &str) -> T {
    match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(err) => {
            warn!(?err, column, "unreadable JSON column; using empty value");
            T::default()
        }
    }
}

fn non_empty(v: Option<String>) -> Option<String> {
    v.filter(|s| !s.trim().is_empty())
}

// ---- sites ----

const SITE_COLUMNS: &str = "id, owner_id, name, base_url, dialect, api_key_enc, account_id, \
     schedule_cron, timezone, pinned, exclude_from_batch, category_id, billing_url, \
     billing_auth_type, billing_auth_value_enc, billing_limit_field, billing_usage_field, \
     unlimited_quota, enable_check_in, check_in_mode";

fn site_from_row(row: &SqliteRow) -> Result<Site> {
    let dialect: String = row.try_get("dialect")?;
    let auth_type: String = row.try_get("billing_auth_type")?;
    let mode: String = row.try_get("check_in_mode")?;
    Ok(Site {
        id: row.try_get("id")?,
        owner_id: row.try_get("owner_id")?,
        name: row.try_get("name")?,
        base_url: row.try_get("base_url")?,
        dialect: Dialect::parse_tag(&dialect),
        api_key_enc: non_empty(row.try_get("api_key_enc")?),
        account_id: non_empty(row.try_get("account_id")?),
        schedule_cron: non_empty(row.try_get("schedule_cron")?),
        timezone: row.try_get("timezone")?,
        pinned: row.try_get("pinned")?,
        exclude_from_batch: row.try_get("exclude_from_batch")?,
        category_id: row.try_get("category_id")?,
        billing: BillingConfig {
            url: non_empty(row.try_get("billing_url")?),
            auth_type: BillingAuthType::parse_tag(&auth_type),
            auth_value_enc: non_empty(row.try_get("billing_auth_value_enc")?),
            limit_field: non_empty(row.try_get("billing_limit_field")?),
            usage_field: non_empty(row.try_get("billing_usage_field")?),
            unlimited: row.try_get("unlimited_quota")?,
        },
        enable_check_in: row.try_get("enable_check_in")?,
        check_in_mode: CheckInMode::parse_tag(&mode),
    })
}

/// Insert a site whose secrets are already encrypted. `site.id` is ignored.
#[instrument(skip_all, fields(owner_id = owner_id))]
pub async fn insert_site(pool: &Pool, owner_id: i64, site: &Site) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO sites (owner_id, name, base_url, dialect, api_key_enc, account_id, \
         schedule_cron, timezone, pinned, exclude_from_batch, category_id, billing_url, \
         billing_auth_type, billing_auth_value_enc, billing_limit_field, billing_usage_field, \
         unlimited_quota, enable_check_in, check_in_mode) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(owner_id)
    .bind(&site.name)
    .bind(&site.base_url)
    .bind(site.dialect.as_str())
    .bind(&site.api_key_enc)
    .bind(&site.account_id)
    .bind(&site.schedule_cron)
    .bind(&site.timezone)
    .bind(site.pinned)
    .bind(site.exclude_from_batch)
    .bind(site.category_id)
    .bind(&site.billing.url)
    .bind(site.billing.auth_type.as_str())
    .bind(&site.billing.auth_value_enc)
    .bind(&site.billing.limit_field)
    .bind(&site.billing.usage_field)
    .bind(site.billing.unlimited)
    .bind(site.enable_check_in)
    .bind(site.check_in_mode.as_str())
    .fetch_one(pool)
    .await
    .context("failed to insert site")?;
    Ok(rec.get::<i64, _>("id"))
}

#[instrument(skip_all, fields(owner_id = owner_id, site_id = site_id))]
pub async fn get_site(pool: &Pool, owner_id: i64, site_id: i64) -> Result<Option<Site>> {
    let sql = format!("SELECT {} FROM sites WHERE id = ? AND owner_id = ?", SITE_COLUMNS);
    let row = sqlx::query(&sql)
        .bind(site_id)
        .bind(owner_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(site_from_row).transpose()
}

/// Pinned sites first, then newest.
#[instrument(skip_all, fields(owner_id = owner_id))]
pub async fn list_sites(pool: &Pool, owner_id: i64) -> Result<Vec<Site>> {
    let sql = format!(
        "SELECT {} FROM sites WHERE owner_id = ? ORDER BY pinned DESC, id DESC",
        SITE_COLUMNS
    );
    let rows = sqlx::query(&sql).bind(owner_id).fetch_all(pool).await?;
    rows.iter().map(site_from_row).collect()
}

/// Sites of a category eligible for a caller-triggered group check.
#[instrument(skip_all, fields(owner_id = owner_id, category_id = category_id))]
pub async fn list_group_candidates(
    pool: &Pool,
    owner_id: i64,
    category_id: i64,
) -> Result<Vec<Site>> {
    let sql = format!(
        "SELECT {} FROM sites WHERE owner_id = ? AND category_id = ? \
         AND pinned = 0 AND exclude_from_batch = 0 ORDER BY id ASC",
        SITE_COLUMNS
    );
    let rows = sqlx::query(&sql)
        .bind(owner_id)
        .bind(category_id)
        .fetch_all(pool)
        .await?;
    rows.iter().map(site_from_row).collect()
}

/// Owners that have at least one site. Used by the background ticker only.
#[instrument(skip_all)]
pub async fn list_owner_ids(pool: &Pool) -> Result<Vec<i64>> {
    let ids = sqlx::query_scalar::<_, i64>("SELECT DISTINCT owner_id FROM sites ORDER BY owner_id")
        .fetch_all(pool)
        .await?;
    Ok(ids)
}

#[instrument(skip_all, fields(owner_id = owner_id, site_id = site_id))]
pub async fn update_site_credentials(
    pool: &Pool,
    owner_id: i64,
    site_id: i64,
    api_key_enc: Option<&str>,
    account_id: Option<&str>,
) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE sites SET api_key_enc = COALESCE(?, api_key_enc), account_id = COALESCE(?, account_id), \
         updated_at = CURRENT_TIMESTAMP WHERE id = ? AND owner_id = ?",
    )
    .bind(api_key_enc)
    .bind(account_id)
    .bind(site_id)
    .bind(owner_id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() > 0)
}

#[instrument(skip_all, fields(owner_id = owner_id, site_id = site_id))]
pub async fn update_site_schedule(
    pool: &Pool,
    owner_id: i64,
    site_id: i64,
    schedule_cron: Option<&str>,
    timezone: &str,
) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE sites SET schedule_cron = ?, timezone = ?, updated_at = CURRENT_TIMESTAMP \
         WHERE id = ? AND owner_id = ?",
    )
    .bind(schedule_cron)
    .bind(timezone)
    .bind(site_id)
    .bind(owner_id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() > 0)
}

/// Delete a site together with its history. Returns false if the owner has
/// no such site.
#[instrument(skip_all, fields(owner_id = owner_id, site_id = site_id))]
pub async fn delete_site(pool: &Pool, owner_id: i64, site_id: i64) -> Result<bool> {
    let mut tx = pool.begin().await?;
    let exists = sqlx::query_scalar::<_, i64>("SELECT id FROM sites WHERE id = ? AND owner_id = ?")
        .bind(site_id)
        .bind(owner_id)
        .fetch_optional(&mut *tx)
        .await?;
    if exists.is_none() {
        return Ok(false);
    }
    sqlx::query("DELETE FROM model_diffs WHERE site_id = ?")
        .bind(site_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM model_snapshots WHERE site_id = ?")
        .bind(site_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM sites WHERE id = ?")
        .bind(site_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(true)
}

// ---- snapshots ----

const SNAPSHOT_COLUMNS: &str = "id, site_id, fetched_at, models_json, groups_json, billing_limit, \
     billing_usage, billing_error, check_in_success, check_in_message, check_in_error, error_message";

fn snapshot_from_row(row: &SqliteRow) -> Result<ModelSnapshot> {
    let models_json: String = row.try_get("models_json")?;
    let groups_json: String = row.try_get("groups_json")?;
    Ok(ModelSnapshot {
        id: row.try_get("id")?,
        site_id: row.try_get("site_id")?,
        fetched_at: row.try_get::<DateTime<Utc>, _>("fetched_at")?,
        models: parse_json_column(&models_json, "models_json"),
        groups: parse_json_column(&groups_json, "groups_json"),
        billing_limit: row.try_get("billing_limit")?,
        billing_usage: row.try_get("billing_usage")?,
        billing_error: row.try_get("billing_error")?,
        check_in_success: row.try_get("check_in_success")?,
        check_in_message: row.try_get("check_in_message")?,
        check_in_error: row.try_get("check_in_error")?,
        error_message: row.try_get("error_message")?,
    })
}

pub async fn insert_snapshot_tx(
    tx: &mut Transaction<'_, Sqlite>,
    site_id: i64,
    fetched_at: DateTime<Utc>,
    snap: &NewSnapshot,
) -> Result<ModelSnapshot> {
    let models_json = serde_json::to_string(&snap.models)?;
    let groups_json = serde_json::to_string(&snap.groups)?;
    let rec = sqlx::query(
        "INSERT INTO model_snapshots (site_id, fetched_at, models_json, groups_json, billing_limit, \
         billing_usage, billing_error, check_in_success, check_in_message, check_in_error, error_message) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(site_id)
    .bind(fetched_at)
    .bind(models_json)
    .bind(groups_json)
    .bind(snap.billing_limit)
    .bind(snap.billing_usage)
    .bind(&snap.billing_error)
    .bind(snap.check_in_success)
    .bind(&snap.check_in_message)
    .bind(&snap.check_in_error)
    .bind(&snap.error_message)
    .fetch_one(&mut **tx)
    .await
    .context("failed to insert snapshot")?;

    Ok(ModelSnapshot {
        id: rec.get("id"),
        site_id,
        fetched_at,
        models: snap.models.clone(),
        groups: snap.groups.clone(),
        billing_limit: snap.billing_limit,
        billing_usage: snap.billing_usage,
        billing_error: snap.billing_error.clone(),
        check_in_success: snap.check_in_success,
        check_in_message: snap.check_in_message.clone(),
        check_in_error: snap.check_in_error.clone(),
        error_message: snap.error_message.clone(),
    })
}

/// Most recent snapshot regardless of error state (billing / check-in display).
#[instrument(skip_all, fields(site_id = site_id))]
pub async fn latest_snapshot<'e, E>(exec: E, site_id: i64) -> Result<Option<ModelSnapshot>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!(
        "SELECT {} FROM model_snapshots WHERE site_id = ? ORDER BY fetched_at DESC, id DESC LIMIT 1",
        SNAPSHOT_COLUMNS
    );
    let row = sqlx::query(&sql).bind(site_id).fetch_optional(exec).await?;
    row.as_ref().map(snapshot_from_row).transpose()
}

/// Most recent snapshot whose catalog fetch succeeded (diff baseline).
#[instrument(skip_all, fields(site_id = site_id))]
pub async fn latest_successful_snapshot<'e, E>(
    exec: E,
    site_id: i64,
) -> Result<Option<ModelSnapshot>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!(
        "SELECT {} FROM model_snapshots WHERE site_id = ? AND error_message IS NULL \
         ORDER BY fetched_at DESC, id DESC LIMIT 1",
        SNAPSHOT_COLUMNS
    );
    let row = sqlx::query(&sql).bind(site_id).fetch_optional(exec).await?;
    row.as_ref().map(snapshot_from_row).transpose()
}

#[instrument(skip_all, fields(site_id = site_id, limit = limit))]
pub async fn list_successful_snapshots(
    pool: &Pool,
    site_id: i64,
    limit: i64,
) -> Result<Vec<ModelSnapshot>> {
    let sql = format!(
        "SELECT {} FROM model_snapshots WHERE site_id = ? AND error_message IS NULL \
         ORDER BY fetched_at DESC, id DESC LIMIT ?",
        SNAPSHOT_COLUMNS
    );
    let rows = sqlx::query(&sql)
        .bind(site_id)
        .bind(limit.max(1))
        .fetch_all(pool)
        .await?;
    rows.iter().map(snapshot_from_row).collect()
}

pub async fn count_snapshots(pool: &Pool, site_id: i64) -> Result<i64> {
    let cnt: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM model_snapshots WHERE site_id = ?")
        .bind(site_id)
        .fetch_one(pool)
        .await?;
    Ok(cnt)
}

// ---- diffs ----

fn diff_from_row(row: &SqliteRow) -> Result<ModelDiff> {
    let added: String = row.try_get("added_json")?;
    let removed: String = row.try_get("removed_json")?;
    let changed: String = row.try_get("changed_json")?;
    Ok(ModelDiff {
        id: row.try_get("id")?,
        site_id: row.try_get("site_id")?,
        diff_at: row.try_get::<DateTime<Utc>, _>("diff_at")?,
        added: parse_json_column(&added, "added_json"),
        removed: parse_json_column(&removed, "removed_json"),
        changed: parse_json_column(&changed, "changed_json"),
    })
}

pub async fn insert_diff_tx(
    tx: &mut Transaction<'_, Sqlite>,
    site_id: i64,
    diff: &NewDiff<'_>,
) -> Result<ModelDiff> {
    let rec = sqlx::query(
        "INSERT INTO model_diffs (site_id, diff_at, added_json, removed_json, changed_json) \
         VALUES (?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(site_id)
    .bind(diff.diff_at)
    .bind(serde_json::to_string(diff.added)?)
    .bind(serde_json::to_string(diff.removed)?)
    .bind(serde_json::to_string(diff.changed)?)
    .fetch_one(&mut **tx)
    .await
    .context("failed to insert diff")?;

    Ok(ModelDiff {
        id: rec.get("id"),
        site_id,
        diff_at: diff.diff_at,
        added: diff.added.to_vec(),
        removed: diff.removed.to_vec(),
        changed: diff.changed.to_vec(),
    })
}

#[instrument(skip_all, fields(site_id = site_id, limit = limit))]
pub async fn list_diffs(pool: &Pool, site_id: i64, limit: i64) -> Result<Vec<ModelDiff>> {
    let rows = sqlx::query(
        "SELECT id, site_id, diff_at, added_json, removed_json, changed_json FROM model_diffs \
         WHERE site_id = ? ORDER BY diff_at DESC, id DESC LIMIT ?",
    )
    .bind(site_id)
    .bind(limit.max(1))
    .fetch_all(pool)
    .await?;
    rows.iter().map(diff_from_row).collect()
}

pub async fn count_diffs(pool: &Pool, site_id: i64) -> Result<i64> {
    let cnt: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM model_diffs WHERE site_id = ?")
        .bind(site_id)
        .fetch_one(pool)
        .await?;
    Ok(cnt)
}

// ---- per-owner configuration ----

#[instrument(skip_all, fields(owner_id = owner_id))]
pub async fn get_schedule_config(pool: &Pool, owner_id: i64) -> Result<Option<ScheduleConfig>> {
    let row = sqlx::query(
        "SELECT owner_id, enabled, hour, minute, timezone, interval_seconds, override_individual \
         FROM schedule_configs WHERE owner_id = ?",
    )
    .bind(owner_id)
    .fetch_optional(pool)
    .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    Ok(Some(ScheduleConfig {
        owner_id: row.try_get("owner_id")?,
        enabled: row.try_get("enabled")?,
        hour: row.try_get::<i64, _>("hour")?.clamp(0, 23) as u32,
        minute: row.try_get::<i64, _>("minute")?.clamp(0, 59) as u32,
        timezone: row.try_get("timezone")?,
        interval_seconds: row.try_get::<i64, _>("interval_seconds")?.max(0) as u64,
        override_individual: row.try_get("override_individual")?,
    }))
}

#[instrument(skip_all, fields(owner_id = cfg.owner_id))]
pub async fn upsert_schedule_config(pool: &Pool, cfg: &ScheduleConfig) -> Result<()> {
    sqlx::query(
        "INSERT INTO schedule_configs (owner_id, enabled, hour, minute, timezone, interval_seconds, override_individual) \
         VALUES (?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(owner_id) DO UPDATE SET enabled = excluded.enabled, hour = excluded.hour, \
         minute = excluded.minute, timezone = excluded.timezone, interval_seconds = excluded.interval_seconds, \
         override_individual = excluded.override_individual, updated_at = CURRENT_TIMESTAMP",
    )
    .bind(cfg.owner_id)
    .bind(cfg.enabled)
    .bind(cfg.hour as i64)
    .bind(cfg.minute as i64)
    .bind(&cfg.timezone)
    .bind(cfg.interval_seconds as i64)
    .bind(cfg.override_individual)
    .execute(pool)
    .await
    .context("failed to save schedule config")?;
    Ok(())
}

#[instrument(skip_all, fields(owner_id = owner_id))]
pub async fn get_email_config(pool: &Pool, owner_id: i64) -> Result<Option<EmailConfig>> {
    let row = sqlx::query(
        "SELECT owner_id, enabled, api_key_enc, recipients FROM email_configs WHERE owner_id = ?",
    )
    .bind(owner_id)
    .fetch_optional(pool)
    .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    let recipients: String = row.try_get("recipients")?;
    Ok(Some(EmailConfig {
        owner_id: row.try_get("owner_id")?,
        enabled: row.try_get("enabled")?,
        api_key_enc: row.try_get("api_key_enc")?,
        recipients: split_recipients(&recipients),
    }))
}

#[instrument(skip_all, fields(owner_id = cfg.owner_id))]
pub async fn upsert_email_config(pool: &Pool, cfg: &EmailConfig) -> Result<()> {
    sqlx::query(
        "INSERT INTO email_configs (owner_id, enabled, api_key_enc, recipients) VALUES (?, ?, ?, ?) \
         ON CONFLICT(owner_id) DO UPDATE SET enabled = excluded.enabled, api_key_enc = excluded.api_key_enc, \
         recipients = excluded.recipients, updated_at = CURRENT_TIMESTAMP",
    )
    .bind(cfg.owner_id)
    .bind(cfg.enabled)
    .bind(&cfg.api_key_enc)
    .bind(cfg.recipients.join(","))
    .execute(pool)
    .await
    .context("failed to save email config")?;
    Ok(())
}

pub fn split_recipients(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelRef;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup_pool() -> Pool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    fn sample_site(name: &str) -> Site {
        Site {
            id: 0,
            owner_id: 0,
            name: name.into(),
            base_url: format!("https://{}.example", name),
            dialect: Dialect::NewApi,
            api_key_enc: Some("00".into()),
            account_id: Some("42".into()),
            schedule_cron: None,
            timezone: "UTC".into(),
            pinned: false,
            exclude_from_batch: false,
            category_id: Some(1),
            billing: BillingConfig::default(),
            enable_check_in: false,
            check_in_mode: CheckInMode::Both,
        }
    }

    #[test]
    fn prepare_sqlite_url_leaves_memory_alone() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(
            prepare_sqlite_url("postgres://x/y"),
            "postgres://x/y".to_string()
        );
    }

    #[test]
    fn prepare_sqlite_url_adds_create_mode() {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("nested").join("db.sqlite");
        let url = format!("sqlite://{}", path.display());
        let out = prepare_sqlite_url(&url);
        assert!(out.ends_with("?mode=rwc"));
        assert!(path.parent().unwrap().exists());
    }

    #[test]
    fn recipients_are_split_and_trimmed() {
        assert_eq!(
            split_recipients(" a@x.io, ,b@y.io "),
            vec!["a@x.io".to_string(), "b@y.io".to_string()]
        );
    }

    #[tokio::test]
    async fn sites_are_scoped_by_owner() {
        let pool = setup_pool().await;
        let id = insert_site(&pool, 1, &sample_site("alpha")).await.unwrap();
        assert!(get_site(&pool, 1, id).await.unwrap().is_some());
        assert!(get_site(&pool, 2, id).await.unwrap().is_none());
        assert!(!delete_site(&pool, 2, id).await.unwrap());
        assert_eq!(list_sites(&pool, 2).await.unwrap().len(), 0);
        assert_eq!(list_owner_ids(&pool).await.unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn group_candidates_skip_pinned_and_excluded() {
        let pool = setup_pool().await;
        let a = insert_site(&pool, 1, &sample_site("a")).await.unwrap();
        let mut pinned = sample_site("b");
        pinned.pinned = true;
        insert_site(&pool, 1, &pinned).await.unwrap();
        let mut excluded = sample_site("c");
        excluded.exclude_from_batch = true;
        insert_site(&pool, 1, &excluded).await.unwrap();

        let sites = list_group_candidates(&pool, 1, 1).await.unwrap();
        assert_eq!(sites.iter().map(|s| s.id).collect::<Vec<_>>(), vec![a]);

        let all = list_sites(&pool, 1).await.unwrap();
        assert_eq!(all.len(), 3);
        assert!(all[0].pinned);
    }

    #[tokio::test]
    async fn delete_site_cascades_history() {
        let pool = setup_pool().await;
        let id = insert_site(&pool, 1, &sample_site("a")).await.unwrap();
        let mut tx = pool.begin().await.unwrap();
        let snap = NewSnapshot {
            models: vec![ModelRef::new("gpt-4o", "openai")],
            ..NewSnapshot::default()
        };
        insert_snapshot_tx(&mut tx, id, Utc::now(), &snap).await.unwrap();
        insert_diff_tx(
            &mut tx,
            id,
            &NewDiff {
                diff_at: Utc::now(),
                added: &snap.models,
                removed: &[],
                changed: &[],
            },
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(count_snapshots(&pool, id).await.unwrap(), 1);
        assert!(delete_site(&pool, 1, id).await.unwrap());
        assert_eq!(count_snapshots(&pool, id).await.unwrap(), 0);
        assert_eq!(count_diffs(&pool, id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn latest_and_latest_successful_are_distinct() {
        let pool = setup_pool().await;
        let id = insert_site(&pool, 1, &sample_site("a")).await.unwrap();
        let t0 = Utc::now();
        let mut tx = pool.begin().await.unwrap();
        insert_snapshot_tx(
            &mut tx,
            id,
            t0,
            &NewSnapshot {
                models: vec![ModelRef::new("m1", "")],
                ..NewSnapshot::default()
            },
        )
        .await
        .unwrap();
        insert_snapshot_tx(
            &mut tx,
            id,
            t0 + chrono::Duration::seconds(5),
            &NewSnapshot {
                billing_limit: Some(10.0),
                error_message: Some("boom".into()),
                ..NewSnapshot::default()
            },
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();

        let latest = latest_snapshot(&pool, id).await.unwrap().unwrap();
        assert_eq!(latest.error_message.as_deref(), Some("boom"));
        assert_eq!(latest.billing_limit, Some(10.0));

        let ok = latest_successful_snapshot(&pool, id).await.unwrap().unwrap();
        assert!(ok.is_success());
        assert_eq!(ok.models, vec![ModelRef::new("m1", "")]);
    }

    #[tokio::test]
    async fn schedule_and_email_configs_upsert() {
        let pool = setup_pool().await;
        assert!(get_schedule_config(&pool, 9).await.unwrap().is_none());
        let mut cfg = ScheduleConfig::default_for(9);
        upsert_schedule_config(&pool, &cfg).await.unwrap();
        cfg.enabled = true;
        cfg.hour = 7;
        cfg.override_individual = true;
        upsert_schedule_config(&pool, &cfg).await.unwrap();
        assert_eq!(get_schedule_config(&pool, 9).await.unwrap(), Some(cfg));

        let email = EmailConfig {
            owner_id: 9,
            enabled: true,
            api_key_enc: "abcd".into(),
            recipients: vec!["a@x.io".into(), "b@y.io".into()],
        };
        upsert_email_config(&pool, &email).await.unwrap();
        assert_eq!(get_email_config(&pool, 9).await.unwrap(), Some(email));
        assert!(get_email_config(&pool, 10).await.unwrap().is_none());
    }
}
