//! Insert payloads used by repositories.
//!
//! Keep these structs focused on what the queries write. Business logic
//! should live in higher layers.

use crate::model::{ModelChange, ModelRef};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// One probe outcome, ready to be appended to a site's history.
#[derive(Debug, Clone, Default)]
pub struct NewSnapshot {
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

/// A detected catalog change, written alongside its snapshot.
#[derive(Debug, Clone)]
pub struct NewDiff<'a> {
    pub diff_at: DateTime<Utc>,
    pub added: &'a [ModelRef],
    pub removed: &'a [ModelRef],
    pub changed: &'a [ModelChange],
}
