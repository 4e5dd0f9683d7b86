use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Vendor protocol variant a site speaks.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    NewApi,
    Veloera,
    DoneHub,
    VoApi,
    Other,
}

impl Dialect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::NewApi => "newapi",
            Dialect::Veloera => "veloera",
            Dialect::DoneHub => "donehub",
            Dialect::VoApi => "voapi",
            Dialect::Other => "other",
        }
    }

    /// Unknown tags degrade to the generic dialect.
    pub fn parse_tag(s: &str) -> Dialect {
        match s.trim().to_ascii_lowercase().as_str() {
            "newapi" | "new-api" => Dialect::NewApi,
            "veloera" => Dialect::Veloera,
            "donehub" | "done-hub" | "onehub" => Dialect::DoneHub,
            "voapi" => Dialect::VoApi,
            _ => Dialect::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BillingAuthType {
    Token,
    Cookie,
}

impl BillingAuthType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingAuthType::Token => "token",
            BillingAuthType::Cookie => "cookie",
        }
    }

    pub fn parse_tag(s: &str) -> BillingAuthType {
        if s.eq_ignore_ascii_case("cookie") {
            BillingAuthType::Cookie
        } else {
            BillingAuthType::Token
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CheckInMode {
    /// A reachable catalog counts as checked in.
    Model,
    /// Call the vendor's check-in endpoint.
    CheckIn,
    /// Call the endpoint and require the catalog to be reachable too.
    Both,
}

impl CheckInMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckInMode::Model => "model",
            CheckInMode::CheckIn => "checkin",
            CheckInMode::Both => "both",
        }
    }

    pub fn parse_tag(s: &str) -> CheckInMode {
        match s.trim().to_ascii_lowercase().as_str() {
            "model" => CheckInMode::Model,
            "checkin" => CheckInMode::CheckIn,
            _ => CheckInMode::Both,
        }
    }
}

/// One catalog entry as reported by a vendor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelRef {
    pub id: String,
    #[serde(default)]
    pub owned_by: String,
}

impl ModelRef {
    pub fn new(id: impl Into<String>, owned_by: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            owned_by: owned_by.into(),
        }
    }
}

/// Same model id, different owner tag.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelChange {
    pub id: String,
    pub before: String,
    pub after: String,
}

/// Billing-probe settings attached to a site. The auth value stays encrypted.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct BillingConfig {
    pub url: Option<String>,
    pub auth_type: BillingAuthType,
    pub auth_value_enc: Option<String>,
    pub limit_field: Option<String>,
    pub usage_field: Option<String>,
    pub unlimited: bool,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            url: None,
            auth_type: BillingAuthType::Token,
            auth_value_enc: None,
            limit_field: None,
            usage_field: None,
            unlimited: false,
        }
    }
}

impl std::fmt::Debug for BillingConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BillingConfig")
            .field("url", &self.url)
            .field("auth_type", &self.auth_type)
            .field("limit_field", &self.limit_field)
            .field("usage_field", &self.usage_field)
            .field("unlimited", &self.unlimited)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct Site {
    pub id: i64,
    pub owner_id: i64,
    pub name: String,
    pub base_url: String,
    pub dialect: Dialect,
    pub api_key_enc: Option<String>,
    pub account_id: Option<String>,
    pub schedule_cron: Option<String>,
    pub timezone: String,
    pub pinned: bool,
    pub exclude_from_batch: bool,
    pub category_id: Option<i64>,
    pub billing: BillingConfig,
    pub enable_check_in: bool,
    pub check_in_mode: CheckInMode,
}

impl std::fmt::Debug for Site {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Site")
            .field("id", &self.id)
            .field("owner_id", &self.owner_id)
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field("dialect", &self.dialect)
            .field("schedule_cron", &self.schedule_cron)
            .field("timezone", &self.timezone)
            .field("pinned", &self.pinned)
            .field("exclude_from_batch", &self.exclude_from_batch)
            .finish_non_exhaustive()
    }
}

/// Fields needed to create a site. Secrets arrive in plaintext and are
/// encrypted before they reach the store.
#[derive(Clone, Default)]
pub struct NewSite {
    pub name: String,
    pub base_url: String,
    pub dialect: Option<Dialect>,
    pub api_key: String,
    pub account_id: Option<String>,
    pub schedule_cron: Option<String>,
    pub timezone: Option<String>,
    pub pinned: bool,
    pub exclude_from_batch: bool,
    pub category_id: Option<i64>,
    pub billing_url: Option<String>,
    pub billing_auth_type: Option<BillingAuthType>,
    pub billing_auth_value: Option<String>,
    pub billing_limit_field: Option<String>,
    pub billing_usage_field: Option<String>,
    pub unlimited_quota: bool,
    pub enable_check_in: bool,
    pub check_in_mode: Option<CheckInMode>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelSnapshot {
    pub id: i64,
    pub site_id: i64,
    pub fetched_at: DateTime<Utc>,
    pub models: Vec<ModelRef>,
    pub groups: BTreeMap<String, f64>,
    pub billing_limit: Option<f64>,
    pub billing_usage: Option<f64>,
    pub billing_error: Option<String>,
    pub check_in_success: Option<bool>,
    pub check_in_message: Option<String>,
    pub check_in_error: Option<String>,
    pub error_message: Option<String>,
}

impl ModelSnapshot {
    pub fn is_success(&self) -> bool {
        self.error_message.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelDiff {
    pub id: i64,
    pub site_id: i64,
    pub diff_at: DateTime<Utc>,
    pub added: Vec<ModelRef>,
    pub removed: Vec<ModelRef>,
    pub changed: Vec<ModelChange>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScheduleConfig {
    pub owner_id: i64,
    pub enabled: bool,
    pub hour: u32,
    pub minute: u32,
    pub timezone: String,
    pub interval_seconds: u64,
    pub override_individual: bool,
}

impl ScheduleConfig {
    /// Used when an owner has never saved a schedule.
    pub fn default_for(owner_id: i64) -> Self {
        Self {
            owner_id,
            enabled: false,
            hour: 9,
            minute: 0,
            timezone: "Asia/Shanghai".to_string(),
            interval_seconds: 30,
            override_individual: false,
        }
    }
}

#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EmailConfig {
    pub owner_id: i64,
    pub enabled: bool,
    pub api_key_enc: String,
    pub recipients: Vec<String>,
}

impl std::fmt::Debug for EmailConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmailConfig")
            .field("owner_id", &self.owner_id)
            .field("enabled", &self.enabled)
            .field("recipients", &self.recipients)
            .finish_non_exhaustive()
    }
}
