//! Due-ness resolution: cron parsing, timezone handling and the precedence
//! between a site's own cron and its owner's global schedule.
use crate::model::{ScheduleConfig, Site};
use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::warn;

pub const MIN_INTERVAL_SECONDS: u64 = 5;
pub const MAX_INTERVAL_SECONDS: u64 = 300;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("cron expression must have 5 or 6 fields, got {0}")]
    FieldCount(usize),
    #[error("invalid cron {field} field: {value}")]
    Field { field: &'static str, value: String },
    #[error("hour must be 0-23, got {0}")]
    Hour(u32),
    #[error("minute must be 0-59, got {0}")]
    Minute(u32),
    #[error("stagger interval must be 5-300 seconds, got {0}")]
    Interval(u64),
    #[error("unknown timezone: {0}")]
    Timezone(String),
}

const MONTH_NAMES: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
const DOW_NAMES: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

#[derive(Clone, Copy)]
struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    names: &'static [&'static str],
    name_base: u32,
}

const MINUTE: FieldSpec = FieldSpec { name: "minute", min: 0, max: 59, names: &[], name_base: 0 };
const HOUR: FieldSpec = FieldSpec { name: "hour", min: 0, max: 23, names: &[], name_base: 0 };
const DOM: FieldSpec = FieldSpec { name: "day-of-month", min: 1, max: 31, names: &[], name_base: 0 };
const MONTH: FieldSpec = FieldSpec { name: "month", min: 1, max: 12, names: &MONTH_NAMES, name_base: 1 };
// 7 is accepted and folded onto 0 (Sunday).
const DOW: FieldSpec = FieldSpec { name: "day-of-week", min: 0, max: 7, names: &DOW_NAMES, name_base: 0 };

/// Parsed five-field cron expression. Each field is a bitmask of allowed
/// values.
#[derive(Clone, PartialEq, Eq)]
pub struct CronExpr {
    source: String,
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl fmt::Debug for CronExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CronExpr({:?})", self.source)
    }
}

impl fmt::Display for CronExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl FromStr for CronExpr {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut fields: Vec<&str> = s.split_whitespace().collect();
        match fields.len() {
            5 => {}
            // Leading seconds field is ignored; ticks are per minute.
            6 => {
                fields.remove(0);
            }
            n => return Err(ScheduleError::FieldCount(n)),
        }

        let mut days_of_week = parse_field(fields[4], DOW)?;
        if days_of_week & (1 << 7) != 0 {
            days_of_week = (days_of_week & !(1 << 7)) | 1;
        }
        Ok(CronExpr {
            source: s.trim().to_string(),
            minutes: parse_field(fields[0], MINUTE)?,
            hours: parse_field(fields[1], HOUR)?,
            days_of_month: parse_field(fields[2], DOM)?,
            months: parse_field(fields[3], MONTH)?,
            days_of_week,
            dom_restricted: !fields[2].starts_with('*'),
            dow_restricted: !fields[4].starts_with('*'),
        })
    }
}

fn parse_value(raw: &str, def: FieldSpec) -> Option<u32> {
    if let Ok(v) = raw.parse::<u32>() {
        return (def.min..=def.max).contains(&v).then_some(v);
    }
    let lower = raw.to_ascii_lowercase();
    def.names
        .iter()
        .position(|n| *n == lower)
        .map(|i| i as u32 + def.name_base)
}

fn parse_field(raw: &str, def: FieldSpec) -> Result<u64, ScheduleError> {
    let bad = || ScheduleError::Field {
        field: def.name,
        value: raw.to_string(),
    };
    let mut mask = 0u64;
    for item in raw.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((r, s)) => {
                let step: u32 = s.parse().map_err(|_| bad())?;
                if step == 0 {
                    return Err(bad());
                }
                (r, step)
            }
            None => (item, 1),
        };
        let (lo, hi) = if range == "*" {
            (def.min, def.max)
        } else if let Some((a, b)) = range.split_once('-') {
            let lo = parse_value(a, def).ok_or_else(bad)?;
            let hi = parse_value(b, def).ok_or_else(bad)?;
            if lo > hi {
                return Err(bad());
            }
            (lo, hi)
        } else {
            let v = parse_value(range, def).ok_or_else(bad)?;
            // `5/15` means "from 5 to the end, every 15".
            if item.contains('/') {
                (v, def.max)
            } else {
                (v, v)
            }
        };
        for v in (lo..=hi).step_by(step as usize) {
            mask |= 1 << v;
        }
    }
    if mask == 0 {
        return Err(bad());
    }
    Ok(mask)
}

impl CronExpr {
    /// Whether the expression fires at the minute containing `t`.
    pub fn matches<T: Datelike + Timelike>(&self, t: &T) -> bool {
        let bit = |mask: u64, v: u32| mask & (1 << v) != 0;
        if !bit(self.minutes, t.minute()) || !bit(self.hours, t.hour()) || !bit(self.months, t.month()) {
            return false;
        }
        let dom = bit(self.days_of_month, t.day());
        let dow = bit(self.days_of_week, t.weekday().num_days_from_sunday());
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }
}

/// Resolve an IANA zone name, falling back to UTC.
pub fn parse_timezone(name: &str) -> Tz {
    match name.trim().parse::<Tz>() {
        Ok(tz) => tz,
        Err(_) => {
            warn!(timezone = name, "unknown timezone; using UTC");
            Tz::UTC
        }
    }
}

/// Strict zone check for write paths. Stored names are read back through
/// [`parse_timezone`], so anything accepted here never falls back to UTC.
pub fn validate_timezone(name: &str) -> Result<Tz, ScheduleError> {
    name.trim()
        .parse::<Tz>()
        .map_err(|_| ScheduleError::Timezone(name.trim().to_string()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EffectiveSchedule {
    SiteCron { cron: CronExpr, tz: Tz },
    Global { hour: u32, minute: u32, tz: Tz },
    Unscheduled,
}

impl EffectiveSchedule {
    pub fn fires_at(&self, now: DateTime<Utc>) -> bool {
        match self {
            EffectiveSchedule::SiteCron { cron, tz } => cron.matches(&tz.from_utc_datetime(&now.naive_utc())),
            EffectiveSchedule::Global { hour, minute, tz } => {
                let local = tz.from_utc_datetime(&now.naive_utc());
                local.hour() == *hour && local.minute() == *minute
            }
            EffectiveSchedule::Unscheduled => false,
        }
    }
}

/// Site cron unless the owner forces the global schedule; then the global
/// schedule if enabled; otherwise nothing.
pub fn effective_schedule(site: &Site, cfg: &ScheduleConfig) -> Result<EffectiveSchedule, ScheduleError> {
    let own_cron = site
        .schedule_cron
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty());
    if let (Some(cron), false) = (own_cron, cfg.override_individual) {
        return Ok(EffectiveSchedule::SiteCron {
            cron: cron.parse()?,
            tz: parse_timezone(&site.timezone),
        });
    }
    if cfg.enabled {
        return Ok(EffectiveSchedule::Global {
            hour: cfg.hour,
            minute: cfg.minute,
            tz: parse_timezone(&cfg.timezone),
        });
    }
    Ok(EffectiveSchedule::Unscheduled)
}

/// Whether an unattended sweep should check `site` at `now`. Pinned and
/// batch-excluded sites are never due. A broken cron is logged and skipped.
pub fn is_due(site: &Site, cfg: &ScheduleConfig, now: DateTime<Utc>) -> bool {
    if site.pinned || site.exclude_from_batch {
        return false;
    }
    match effective_schedule(site, cfg) {
        Ok(schedule) => schedule.fires_at(now),
        Err(err) => {
            warn!(site_id = site.id, error = %err, "site cron is invalid; skipping");
            false
        }
    }
}

pub fn validate_schedule_config(cfg: &ScheduleConfig) -> Result<(), ScheduleError> {
    if cfg.hour > 23 {
        return Err(ScheduleError::Hour(cfg.hour));
    }
    if cfg.minute > 59 {
        return Err(ScheduleError::Minute(cfg.minute));
    }
    if !(MIN_INTERVAL_SECONDS..=MAX_INTERVAL_SECONDS).contains(&cfg.interval_seconds) {
        return Err(ScheduleError::Interval(cfg.interval_seconds));
    }
    validate_timezone(&cfg.timezone)?;
    Ok(())
}
