//! Check orchestration: one site, an explicit group, or a due sweep.
//!
//! Every path runs the same pipeline: decrypt credentials, probe, record the
//! snapshot (and diff), then alert. Sites in a group run strictly one after
//! another with a fixed pause between them.
use crate::db::{self, Pool};
use crate::diff::{self, RecordedProbe};
use crate::model::{ModelDiff, ModelSnapshot, Site};
use crate::notify::{Notifier, NotifyOutcome};
use crate::vault::Vault;
use crate::vendor::{BillingTarget, CheckInProbe, ProbeError, ProbeResult, ProbeTarget, SiteProber};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, instrument, warn};

#[derive(Debug, Error)]
pub enum CheckError {
    #[error("site {0} not found")]
    SiteNotFound(i64),
    #[error("no sites are eligible for a group check")]
    EmptyGroup,
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CheckOptions {
    pub skip_notification: bool,
    /// Caller-triggered single check. Only affects logging.
    pub is_manual: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CheckOutcome {
    Unchanged,
    Changed(ModelDiff),
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckReport {
    pub site_id: i64,
    pub site_name: String,
    pub snapshot: ModelSnapshot,
    pub outcome: CheckOutcome,
    #[serde(skip)]
    pub notification: Option<NotifyOutcome>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SiteChange {
    pub site_id: i64,
    pub site_name: String,
    pub diff: ModelDiff,
}

#[derive(Debug, Clone, Serialize)]
pub struct SiteFailure {
    pub site_id: i64,
    pub site_name: String,
    pub error: String,
}

/// Aggregate of a group check or sweep. `total_sites` counts every site
/// attempted, including those that failed.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GroupReport {
    pub total_sites: usize,
    pub results: Vec<CheckReport>,
    pub changes: Vec<SiteChange>,
    pub failures: Vec<SiteFailure>,
}

impl GroupReport {
    fn push(&mut self, report: CheckReport) {
        match &report.outcome {
            CheckOutcome::Changed(diff) => self.changes.push(SiteChange {
                site_id: report.site_id,
                site_name: report.site_name.clone(),
                diff: diff.clone(),
            }),
            CheckOutcome::Failed { error } => self.failures.push(SiteFailure {
                site_id: report.site_id,
                site_name: report.site_name.clone(),
                error: error.clone(),
            }),
            CheckOutcome::Unchanged => {}
        }
        self.results.push(report);
    }

    fn push_failure(&mut self, site_id: i64, site_name: String, error: String) {
        self.failures.push(SiteFailure {
            site_id,
            site_name,
            error,
        });
    }
}

/// Site secrets that could not be decrypted for a probe.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CredentialFailures {
    pub api_key: Option<ProbeError>,
    pub billing_value: Option<ProbeError>,
}

impl CredentialFailures {
    pub fn is_empty(&self) -> bool {
        self.api_key.is_none() && self.billing_value.is_none()
    }

    /// Write the failures into the probe's error fields so they land in the
    /// snapshot. A missing API key taints billing and check-in; a missing
    /// billing credential taints billing only. The catalog outcome is kept.
    pub fn apply(&self, result: &mut ProbeResult, check_in_enabled: bool) {
        if self.is_empty() {
            return;
        }
        let billing: Vec<String> = [&self.api_key, &self.billing_value]
            .into_iter()
            .flatten()
            .map(ToString::to_string)
            .collect();
        result.billing.error = Some(prepend(billing, result.billing.error.take()));

        if let (Some(err), true) = (&self.api_key, check_in_enabled) {
            let check_in = result.check_in.get_or_insert_with(CheckInProbe::default);
            check_in.error = Some(prepend(vec![err.to_string()], check_in.error.take()));
        }
    }
}

fn prepend(mut errors: Vec<String>, existing: Option<String>) -> String {
    errors.extend(existing);
    errors.join("; ")
}

pub struct Monitor {
    pool: Pool,
    vault: Arc<Vault>,
    prober: Arc<dyn SiteProber>,
    notifier: Option<Arc<Notifier>>,
    group_stagger: Duration,
}

impl Monitor {
    pub fn new(
        pool: Pool,
        vault: Arc<Vault>,
        prober: Arc<dyn SiteProber>,
        notifier: Option<Arc<Notifier>>,
        group_stagger: Duration,
    ) -> Self {
        Self {
            pool,
            vault,
            prober,
            notifier,
            group_stagger,
        }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Decrypt the site's secrets into a probe target. A secret that fails to
    /// decrypt is left off the target and reported in the returned failures.
    pub fn build_target(&self, site: &Site) -> (ProbeTarget, CredentialFailures) {
        let mut failures = CredentialFailures::default();
        let api_key = self.decrypt_or_record(
            site,
            "api key",
            site.api_key_enc.as_deref(),
            &mut failures.api_key,
        );
        let billing_value = self.decrypt_or_record(
            site,
            "billing credential",
            site.billing.auth_value_enc.as_deref(),
            &mut failures.billing_value,
        );
        let target = ProbeTarget {
            dialect: site.dialect,
            base_url: site.base_url.clone(),
            api_key,
            account_id: site.account_id.clone(),
            billing: BillingTarget {
                url: site.billing.url.clone(),
                auth_type: Some(site.billing.auth_type),
                auth_value: billing_value,
                limit_field: site.billing.limit_field.clone(),
                usage_field: site.billing.usage_field.clone(),
                unlimited: site.billing.unlimited,
            },
            check_in: site.enable_check_in.then_some(site.check_in_mode),
        };
        (target, failures)
    }

    fn decrypt_or_record(
        &self,
        site: &Site,
        field: &'static str,
        enc: Option<&str>,
        failure: &mut Option<ProbeError>,
    ) -> Option<String> {
        match self.vault.decrypt_opt(enc) {
            Ok(v) => v,
            Err(err) => {
                warn!(site_id = site.id, field, error = %err, "credential could not be decrypted; probing without it");
                *failure = Some(ProbeError::Credential(format!("{} could not be decrypted", field)));
                None
            }
        }
    }

    /// Probe one site now, regardless of its schedule.
    #[instrument(skip_all, fields(owner_id = owner_id, site_id = site_id, manual = opts.is_manual))]
    pub async fn check_site(
        &self,
        owner_id: i64,
        site_id: i64,
        opts: CheckOptions,
    ) -> Result<CheckReport, CheckError> {
        let site = db::get_site(&self.pool, owner_id, site_id)
            .await?
            .ok_or(CheckError::SiteNotFound(site_id))?;
        self.run_check(&site, opts).await
    }

    async fn run_check(&self, site: &Site, opts: CheckOptions) -> Result<CheckReport, CheckError> {
        let (target, credential_failures) = self.build_target(site);
        let mut result = self.prober.probe(&target).await;
        credential_failures.apply(&mut result, target.check_in.is_some());
        let RecordedProbe { snapshot, diff } = diff::record_probe(&self.pool, site, &result).await?;

        let outcome = match (&result.fetch_error, diff) {
            (Some(err), _) => {
                warn!(site_id = site.id, error = %err, class = ?err.class(), manual = opts.is_manual, "check failed");
                CheckOutcome::Failed {
                    error: err.to_string(),
                }
            }
            (None, Some(diff)) => CheckOutcome::Changed(diff),
            (None, None) => CheckOutcome::Unchanged,
        };

        let notification = match (&outcome, &self.notifier) {
            (CheckOutcome::Changed(diff), Some(notifier)) if !opts.skip_notification => {
                Some(notifier.notify(site, diff).await)
            }
            _ => None,
        };

        info!(
            site_id = site.id,
            models = snapshot.models.len(),
            changed = matches!(outcome, CheckOutcome::Changed(_)),
            manual = opts.is_manual,
            "check finished"
        );
        Ok(CheckReport {
            site_id: site.id,
            site_name: site.name.clone(),
            snapshot,
            outcome,
            notification,
        })
    }

    /// Check the given sites in order. Unknown ids are reported as failures.
    #[instrument(skip_all, fields(owner_id = owner_id, sites = site_ids.len()))]
    pub async fn check_group(
        &self,
        owner_id: i64,
        site_ids: &[i64],
        opts: CheckOptions,
    ) -> Result<GroupReport, CheckError> {
        if site_ids.is_empty() {
            return Err(CheckError::EmptyGroup);
        }
        let mut sites = Vec::with_capacity(site_ids.len());
        let mut report = GroupReport::default();
        for &id in site_ids {
            match db::get_site(&self.pool, owner_id, id).await? {
                Some(site) => sites.push(site),
                None => report.push_failure(id, String::new(), CheckError::SiteNotFound(id).to_string()),
            }
        }
        report.total_sites = site_ids.len();
        self.run_sequence(&sites, self.group_stagger, opts, &mut report).await;
        Ok(report)
    }

    /// Group check over a category's batch-eligible sites.
    pub async fn check_category(
        &self,
        owner_id: i64,
        category_id: i64,
        opts: CheckOptions,
    ) -> Result<GroupReport, CheckError> {
        let sites = db::list_group_candidates(&self.pool, owner_id, category_id).await?;
        if sites.is_empty() {
            return Err(CheckError::EmptyGroup);
        }
        let mut report = GroupReport {
            total_sites: sites.len(),
            ..GroupReport::default()
        };
        self.run_sequence(&sites, self.group_stagger, opts, &mut report).await;
        Ok(report)
    }

    /// Unattended sweep over already-selected due sites.
    #[instrument(skip_all, fields(owner_id = owner_id, sites = sites.len()))]
    pub async fn run_sweep(&self, owner_id: i64, sites: &[Site], stagger: Duration) -> GroupReport {
        let mut report = GroupReport {
            total_sites: sites.len(),
            ..GroupReport::default()
        };
        self.run_sequence(sites, stagger, CheckOptions::default(), &mut report)
            .await;
        info!(
            total = report.total_sites,
            changed = report.changes.len(),
            failed = report.failures.len(),
            "sweep finished"
        );
        report
    }

    async fn run_sequence(
        &self,
        sites: &[Site],
        stagger: Duration,
        opts: CheckOptions,
        report: &mut GroupReport,
    ) {
        for (i, site) in sites.iter().enumerate() {
            if i > 0 {
                stagger_pause(stagger).await;
            }
            match self.run_check(site, opts).await {
                Ok(r) => report.push(r),
                Err(err) => {
                    warn!(site_id = site.id, error = %err, "check aborted");
                    report.push_failure(site.id, site.name.clone(), err.to_string());
                }
            }
        }
    }
}

async fn stagger_pause(stagger: Duration) {
    if !stagger.is_zero() {
        tokio::time::sleep(stagger).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vendor::BillingProbe;

    fn key_failure() -> CredentialFailures {
        CredentialFailures {
            api_key: Some(ProbeError::Credential("api key could not be decrypted".into())),
            billing_value: None,
        }
    }

    #[test]
    fn no_failures_leave_result_untouched() {
        let mut result = ProbeResult::default();
        CredentialFailures::default().apply(&mut result, true);
        assert_eq!(result, ProbeResult::default());
    }

    #[test]
    fn key_failure_marks_billing_and_check_in() {
        let mut result = ProbeResult {
            billing: BillingProbe {
                error: Some("HTTP 401".into()),
                ..BillingProbe::default()
            },
            ..ProbeResult::default()
        };
        key_failure().apply(&mut result, true);
        assert_eq!(
            result.billing.error.as_deref(),
            Some("credential unavailable: api key could not be decrypted; HTTP 401")
        );
        let check_in = result.check_in.unwrap();
        assert!(!check_in.success);
        assert_eq!(
            check_in.error.as_deref(),
            Some("credential unavailable: api key could not be decrypted")
        );
        assert!(result.fetch_error.is_none());
    }

    #[test]
    fn billing_value_failure_spares_check_in() {
        let failures = CredentialFailures {
            api_key: None,
            billing_value: Some(ProbeError::Credential("billing credential could not be decrypted".into())),
        };
        let mut result = ProbeResult::default();
        failures.apply(&mut result, true);
        assert!(result.billing.error.unwrap().contains("billing credential"));
        assert_eq!(result.check_in, None);
    }

    #[test]
    fn check_in_untouched_when_disabled() {
        let mut result = ProbeResult::default();
        key_failure().apply(&mut result, false);
        assert!(result.billing.error.is_some());
        assert_eq!(result.check_in, None);
    }
}
