//! Configuration loader and validator for the relay-watch daemon.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Environment variable that overrides `security.secret_key`.
pub const SECRET_KEY_ENV: &str = "RELAY_WATCH_SECRET_KEY";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub security: Security,
    #[serde(default)]
    pub vendor: Vendor,
    pub notify: Notify,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    #[serde(default = "default_tick_seconds")]
    pub tick_seconds: u64,
    #[serde(default = "default_group_stagger_seconds")]
    pub group_stagger_seconds: u64,
}

#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Security {
    /// 32-byte AES key, hex encoded.
    pub secret_key: String,
}

impl std::fmt::Debug for Security {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Security")
            .field("secret_key", &"[REDACTED]")
            .finish()
    }
}

/// Outbound vendor HTTP settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Vendor {
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for Vendor {
    fn default() -> Self {
        Self {
            request_timeout_seconds: default_request_timeout_seconds(),
            user_agent: default_user_agent(),
        }
    }
}

/// Delivery provider used for change alerts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Notify {
    pub api_base: String,
    pub from_address: String,
}

fn default_tick_seconds() -> u64 {
    60
}

fn default_group_stagger_seconds() -> u64 {
    5
}

fn default_request_timeout_seconds() -> u64 {
    10
}

fn default_user_agent() -> String {
    format!("relay-watch/{}", env!("CARGO_PKG_VERSION"))
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(self.app.resolved_data_dir())
    }

    /// The vault key, preferring the environment override when set.
    pub fn resolved_secret_key(&self) -> String {
        std::env::var(SECRET_KEY_ENV)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| self.security.secret_key.clone())
    }

    /// `DATABASE_URL` wins over the file-backed default under `data_dir`.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL").unwrap_or_else(|_| {
            format!("sqlite://{}/relay-watch.db", self.app.resolved_data_dir())
        })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.vendor.request_timeout_seconds)
    }

    pub fn group_stagger(&self) -> Duration {
        Duration::from_secs(self.app.group_stagger_seconds)
    }
}

impl App {
    /// Expand a leading `~/` against `$HOME`.
    pub fn resolved_data_dir(&self) -> String {
        match self.data_dir.strip_prefix("~/") {
            Some(rest) => match std::env::var("HOME") {
                Ok(home) => format!("{}/{}", home.trim_end_matches('/'), rest),
                Err(_) => self.data_dir.clone(),
            },
            None => self.data_dir.clone(),
        }
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    // Ticks must land on every minute boundary or scheduled minutes are missed.
    let tick = cfg.app.tick_seconds;
    if tick == 0 || tick > 60 || 60 % tick != 0 {
        return Err(ConfigError::Invalid("app.tick_seconds must divide 60"));
    }
    // group_stagger_seconds may be 0 to disable the delay

    let key = cfg.resolved_secret_key();
    let key = key.trim();
    if key.len() != 64 || !key.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ConfigError::Invalid(
            "security.secret_key must be 64 hex characters",
        ));
    }

    if cfg.vendor.request_timeout_seconds == 0 {
        return Err(ConfigError::Invalid(
            "vendor.request_timeout_seconds must be > 0",
        ));
    }
    if cfg.vendor.user_agent.trim().is_empty() {
        return Err(ConfigError::Invalid("vendor.user_agent must be non-empty"));
    }

    if cfg.notify.api_base.trim().is_empty() {
        return Err(ConfigError::Invalid("notify.api_base must be non-empty"));
    }
    if reqwest::Url::parse(&cfg.notify.api_base).is_err() {
        return Err(ConfigError::Invalid("notify.api_base must be a valid URL"));
    }
    if cfg.notify.from_address.trim().is_empty() {
        return Err(ConfigError::Invalid("notify.from_address must be non-empty"));
    }

    Ok(())
}

/// Returns the example YAML shipped with the crate.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  tick_seconds: 60
  group_stagger_seconds: 5

security:
  secret_key: "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f"

vendor:
  request_timeout_seconds: 10
  user_agent: "relay-watch/0.1"

notify:
  api_base: "https://api.resend.com/"
  from_address: "relay-watch <alerts@example.com>"
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parse_example_ok() {
        let cfg: Config = serde_yaml::from_str(example()).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.request_timeout(), Duration::from_secs(10));
        assert_eq!(cfg.group_stagger(), Duration::from_secs(5));
    }

    #[test]
    fn vendor_section_defaults_when_missing() {
        let yaml = example().replace(
            "vendor:\n  request_timeout_seconds: 10\n  user_agent: \"relay-watch/0.1\"\n",
            "",
        );
        let cfg: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(cfg.vendor.request_timeout_seconds, 10);
        assert!(cfg.vendor.user_agent.starts_with("relay-watch/"));
    }

    #[test]
    fn invalid_secret_key() {
        if std::env::var(SECRET_KEY_ENV).is_ok() {
            return;
        }
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.security.secret_key = "abcd".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("security.secret_key")),
            _ => panic!("wrong error"),
        }

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.security.secret_key = "z".repeat(64);
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn invalid_notify_settings() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.notify.api_base = "not a url".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("notify.api_base")),
            _ => panic!("wrong error"),
        }

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.notify.from_address = " ".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn invalid_timing() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.tick_seconds = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
        for bad in [7, 45, 90, 120] {
            cfg.app.tick_seconds = bad;
            assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))), "{bad}");
        }
        for good in [1, 15, 30, 60] {
            cfg.app.tick_seconds = good;
            assert!(validate(&cfg).is_ok(), "{good}");
        }

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.vendor.request_timeout_seconds = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn debug_redacts_secret_key() {
        let cfg: Config = serde_yaml::from_str(example()).unwrap();
        let rendered = format!("{:?}", cfg);
        assert!(!rendered.contains("000102030405"));
        assert!(rendered.contains("[REDACTED]"));
    }

    #[test]
    fn ensure_dirs_creates_data_dir() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.exists());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.app.tick_seconds, 60);
        assert_eq!(cfg.notify.api_base, "https://api.resend.com/");
    }
}
