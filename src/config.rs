use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::pdb::comments::DEFAULT_MAX_PAGES;
use crate::pdb::proxy::ProxyMode;
use crate::pdb::DEFAULT_API_BASE;
use crate::util::env::{env_flag_opt, env_opt, env_parse_opt, redact_value};
use crate::wiki::client::DEFAULT_WIKI_API;

pub const DEFAULT_CONFIG_FILE: &str = "config.json";

/// Runtime settings, built once at startup and handed to each component.
///
/// Sources, lowest precedence first: built-in defaults, `config.json`,
/// `HARVEST_*` environment variables, command-line flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarvestConfig {
    pub proxy_enabled: bool,
    pub use_proxy_pool: bool,
    pub proxy_pool_url: Option<String>,
    /// Seconds each worker sleeps before every request.
    pub delay_between_requests: f64,
    pub max_workers: usize,
    pub num_profiles_to_scrape: u64,

    pub api_base_url: String,
    pub db_path: PathBuf,
    pub data_dir: PathBuf,
    pub request_timeout_secs: u64,
    pub max_comment_pages: usize,
    /// First id of the range; defaults to one past the highest checkpoint.
    pub start_id: Option<i64>,
    /// Re-enqueue failed ids below the range start.
    pub retry_failed: bool,

    pub wiki_api_url: String,
    pub wiki_user_agent: String,
    pub wiki_max_workers: usize,
    pub wiki_delay_secs: f64,
    pub wiki_max_section_depth: usize,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            proxy_enabled: false,
            use_proxy_pool: false,
            proxy_pool_url: None,
            delay_between_requests: 1.5,
            max_workers: 10,
            num_profiles_to_scrape: 1000,
            api_base_url: DEFAULT_API_BASE.to_string(),
            db_path: PathBuf::from("personality_profiles.db"),
            data_dir: PathBuf::from("data"),
            request_timeout_secs: 30,
            max_comment_pages: DEFAULT_MAX_PAGES,
            start_id: None,
            retry_failed: false,
            wiki_api_url: DEFAULT_WIKI_API.to_string(),
            wiki_user_agent: "profile-harvest/0.1 (encyclopedia summaries)".to_string(),
            wiki_max_workers: 2,
            wiki_delay_secs: 1.0,
            wiki_max_section_depth: 16,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("proxy_enabled requires use_proxy_pool; no other proxy source is supported")]
    ProxyWithoutPool,
    #[error("use_proxy_pool requires proxy_pool_url")]
    PoolWithoutUrl,
    #[error("{0} must be at least 1")]
    ZeroWorkers(&'static str),
    #[error("{field} must be a finite, non-negative number of seconds (got {value})")]
    BadDelay { field: &'static str, value: f64 },
    #[error("start_id must be positive (got {0})")]
    BadStartId(i64),
}

impl HarvestConfig {
    /// Read `path` if given (must exist), else `config.json` if present, else
    /// defaults; then apply environment overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut cfg = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => {
                info!(target = "config", "no config file found; using defaults");
                Self::default()
            }
        };
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let cfg = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        info!(target = "config", path = %path.display(), "loaded config file");
        Ok(cfg)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = env_flag_opt("HARVEST_PROXY_ENABLED") {
            self.proxy_enabled = v;
        }
        if let Some(v) = env_flag_opt("HARVEST_USE_PROXY_POOL") {
            self.use_proxy_pool = v;
        }
        if let Some(v) = env_opt("HARVEST_PROXY_POOL_URL") {
            self.proxy_pool_url = Some(v);
        }
        if let Some(v) = env_parse_opt("HARVEST_DELAY_BETWEEN_REQUESTS") {
            self.delay_between_requests = v;
        }
        if let Some(v) = env_parse_opt("HARVEST_MAX_WORKERS") {
            self.max_workers = v;
        }
        if let Some(v) = env_parse_opt("HARVEST_NUM_PROFILES") {
            self.num_profiles_to_scrape = v;
        }
        if let Some(v) = env_opt("HARVEST_API_BASE_URL") {
            self.api_base_url = v;
        }
        if let Some(v) = env_opt("HARVEST_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = env_opt("HARVEST_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Some(v) = env_parse_opt("HARVEST_REQUEST_TIMEOUT_SECS") {
            self.request_timeout_secs = v;
        }
        if let Some(v) = env_parse_opt("HARVEST_START_ID") {
            self.start_id = Some(v);
        }
        if let Some(v) = env_flag_opt("HARVEST_RETRY_FAILED") {
            self.retry_failed = v;
        }
        if let Some(v) = env_opt("HARVEST_WIKI_USER_AGENT") {
            self.wiki_user_agent = v;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.proxy_enabled && !self.use_proxy_pool {
            return Err(ConfigError::ProxyWithoutPool);
        }
        if self.proxy_enabled
            && self
                .proxy_pool_url
                .as_deref()
                .map_or(true, |u| u.trim().is_empty())
        {
            return Err(ConfigError::PoolWithoutUrl);
        }
        if self.max_workers == 0 {
            return Err(ConfigError::ZeroWorkers("max_workers"));
        }
        if self.wiki_max_workers == 0 {
            return Err(ConfigError::ZeroWorkers("wiki_max_workers"));
        }
        for (field, value) in [
            ("delay_between_requests", self.delay_between_requests),
            ("wiki_delay_secs", self.wiki_delay_secs),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::BadDelay { field, value });
            }
        }
        if let Some(id) = self.start_id.filter(|id| *id < 1) {
            return Err(ConfigError::BadStartId(id));
        }
        Ok(())
    }

    pub fn request_delay(&self) -> Duration {
        Duration::from_secs_f64(self.delay_between_requests)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn wiki_delay(&self) -> Duration {
        Duration::from_secs_f64(self.wiki_delay_secs)
    }

    /// Pool mode only applies when proxying is switched on.
    pub fn proxy_mode(&self) -> ProxyMode {
        match (self.proxy_enabled, self.use_proxy_pool, &self.proxy_pool_url) {
            (true, true, Some(url)) => ProxyMode::Pool { url: url.clone() },
            _ => ProxyMode::Disabled,
        }
    }

    /// A required proxy is never bypassed for a direct connection.
    pub fn proxy_required(&self) -> bool {
        self.proxy_enabled
    }

    pub fn log_summary(&self) {
        let pool = self
            .proxy_pool_url
            .as_deref()
            .map(|u| redact_value("PROXY_POOL_URL", u))
            .unwrap_or_default();
        info!(
            target = "config",
            proxy_enabled = self.proxy_enabled,
            proxy_pool = %pool,
            delay_secs = self.delay_between_requests,
            max_workers = self.max_workers,
            num_profiles = self.num_profiles_to_scrape,
            db = %self.db_path.display(),
            data_dir = %self.data_dir.display(),
            "configuration"
        );
    }
}
