//! Snapshot persistence and catalog diffing.
//!
//! Every probe appends a snapshot. A diff is written only when the probe
//! succeeded, a prior successful snapshot exists, and the model sets differ.
//! The baseline lookup and both inserts share one transaction so concurrent
//! checks of the same site cannot diff against a half-written history.
use crate::db::{self, NewDiff, NewSnapshot, Pool};
use crate::model::{ModelChange, ModelDiff, ModelRef, ModelSnapshot, Site};
use crate::vendor::ProbeResult;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, instrument};

/// Set difference keyed by model id. Positions are irrelevant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatalogDelta {
    pub added: Vec<ModelRef>,
    pub removed: Vec<ModelRef>,
    pub changed: Vec<ModelChange>,
}

impl CatalogDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

/// `added` follows the new order, `removed` the baseline order. Duplicate ids
/// on either side count once (first occurrence wins).
pub fn compute_diff(baseline: &[ModelRef], current: &[ModelRef]) -> CatalogDelta {
    let mut before: HashMap<&str, &ModelRef> = HashMap::new();
    for m in baseline {
        before.entry(m.id.as_str()).or_insert(m);
    }
    let mut after: HashMap<&str, &ModelRef> = HashMap::new();
    for m in current {
        after.entry(m.id.as_str()).or_insert(m);
    }

    let mut delta = CatalogDelta::default();
    let mut seen = HashSet::new();
    for m in current {
        if !seen.insert(m.id.as_str()) {
            continue;
        }
        match before.get(m.id.as_str()) {
            None => delta.added.push(m.clone()),
            Some(old) if old.owned_by != m.owned_by => delta.changed.push(ModelChange {
                id: m.id.clone(),
                before: old.owned_by.clone(),
                after: m.owned_by.clone(),
            }),
            Some(_) => {}
        }
    }
    let mut seen = HashSet::new();
    for m in baseline {
        if seen.insert(m.id.as_str()) && !after.contains_key(m.id.as_str()) {
            delta.removed.push(m.clone());
        }
    }
    delta
}

/// Flatten a probe into the row shape stored in history.
pub fn snapshot_from_probe(result: &ProbeResult) -> NewSnapshot {
    NewSnapshot {
        models: result.models.clone(),
        groups: result.groups.clone(),
        billing_limit: result.billing.limit,
        billing_usage: result.billing.usage,
        billing_error: result.billing.error.clone(),
        check_in_success: result.check_in.as_ref().map(|c| c.success),
        check_in_message: result.check_in.as_ref().and_then(|c| c.message.clone()),
        check_in_error: result.check_in.as_ref().and_then(|c| c.error.clone()),
        error_message: result.fetch_error.as_ref().map(ToString::to_string),
    }
}

#[derive(Debug, Clone)]
pub struct RecordedProbe {
    pub snapshot: ModelSnapshot,
    pub diff: Option<ModelDiff>,
}

/// Append the probe to the site's history and record a diff if warranted.
#[instrument(skip_all, fields(site_id = site.id))]
pub async fn record_probe(pool: &Pool, site: &Site, result: &ProbeResult) -> Result<RecordedProbe> {
    record_probe_at(pool, site, result, Utc::now()).await
}

pub async fn record_probe_at(
    pool: &Pool,
    site: &Site,
    result: &ProbeResult,
    at: DateTime<Utc>,
) -> Result<RecordedProbe> {
    let mut tx = pool.begin().await.context("failed to begin transaction")?;

    let baseline = if result.is_success() {
        db::latest_successful_snapshot(&mut *tx, site.id).await?
    } else {
        None
    };

    let snapshot = db::insert_snapshot_tx(&mut tx, site.id, at, &snapshot_from_probe(result)).await?;

    let diff = match baseline {
        None => {
            debug!(success = result.is_success(), "no baseline; snapshot only");
            None
        }
        Some(base) => {
            let delta = compute_diff(&base.models, &result.models);
            if delta.is_empty() {
                None
            } else {
                let diff = db::insert_diff_tx(
                    &mut tx,
                    site.id,
                    &NewDiff {
                        diff_at: at,
                        added: &delta.added,
                        removed: &delta.removed,
                        changed: &delta.changed,
                    },
                )
                .await?;
                info!(
                    added = diff.added.len(),
                    removed = diff.removed.len(),
                    changed = diff.changed.len(),
                    "catalog changed"
                );
                Some(diff)
            }
        }
    };

    tx.commit().await.context("failed to commit probe")?;
    Ok(RecordedProbe { snapshot, diff })
}

/// Current view of a site: billing and check-in from the newest snapshot,
/// models from the newest successful one.
#[derive(Debug, Clone, Serialize)]
pub struct SiteStatus {
    pub site_id: i64,
    pub name: String,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub models: Vec<ModelRef>,
    pub models_as_of: Option<DateTime<Utc>>,
    pub billing_limit: Option<f64>,
    pub billing_usage: Option<f64>,
    pub billing_error: Option<String>,
    pub check_in_success: Option<bool>,
    pub check_in_message: Option<String>,
    pub check_in_error: Option<String>,
}

fn status_of(site: &Site, latest: Option<ModelSnapshot>, good: Option<ModelSnapshot>) -> SiteStatus {
    let (models, models_as_of) = match good {
        Some(s) => (s.models, Some(s.fetched_at)),
        None => (Vec::new(), None),
    };
    let mut status = SiteStatus {
        site_id: site.id,
        name: site.name.clone(),
        last_checked_at: None,
        last_error: None,
        models,
        models_as_of,
        billing_limit: None,
        billing_usage: None,
        billing_error: None,
        check_in_success: None,
        check_in_message: None,
        check_in_error: None,
    };
    if let Some(s) = latest {
        status.last_checked_at = Some(s.fetched_at);
        status.last_error = s.error_message;
        status.billing_limit = s.billing_limit;
        status.billing_usage = s.billing_usage;
        status.billing_error = s.billing_error;
        status.check_in_success = s.check_in_success;
        status.check_in_message = s.check_in_message;
        status.check_in_error = s.check_in_error;
    }
    status
}

#[instrument(skip_all, fields(owner_id = owner_id, site_id = site_id))]
pub async fn site_status(pool: &Pool, owner_id: i64, site_id: i64) -> Result<Option<SiteStatus>> {
    let Some(site) = db::get_site(pool, owner_id, site_id).await? else {
        return Ok(None);
    };
    let latest = db::latest_snapshot(pool, site.id).await?;
    let good = db::latest_successful_snapshot(pool, site.id).await?;
    Ok(Some(status_of(&site, latest, good)))
}

/// Recent successful snapshots of an owner's site, newest first. At least
/// one is returned when any exist.
#[instrument(skip_all, fields(owner_id = owner_id, site_id = site_id))]
pub async fn snapshot_history(
    pool: &Pool,
    owner_id: i64,
    site_id: i64,
    limit: i64,
) -> Result<Option<Vec<ModelSnapshot>>> {
    if db::get_site(pool, owner_id, site_id).await?.is_none() {
        return Ok(None);
    }
    Ok(Some(db::list_successful_snapshots(pool, site_id, limit).await?))
}

/// Case-insensitive match on name, base URL, or any model id currently
/// offered by the site.
#[instrument(skip_all, fields(owner_id = owner_id))]
pub async fn search_sites(pool: &Pool, owner_id: i64, query: &str) -> Result<Vec<Site>> {
    let needle = query.trim().to_lowercase();
    let sites = db::list_sites(pool, owner_id).await?;
    if needle.is_empty() {
        return Ok(sites);
    }
    let mut hits = Vec::new();
    for site in sites {
        if site.name.to_lowercase().contains(&needle)
            || site.base_url.to_lowercase().contains(&needle)
        {
            hits.push(site);
            continue;
        }
        let offers = db::latest_successful_snapshot(pool, site.id)
            .await?
            .map(|s| s.models.iter().any(|m| m.id.to_lowercase().contains(&needle)))
            .unwrap_or(false);
        if offers {
            hits.push(site);
        }
    }
    Ok(hits)
}
