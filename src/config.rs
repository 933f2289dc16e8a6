//! Configuration module
//!
//! Credentials come from the environment (`CLIENT_ID`, `CLIENT_SECRET`,
//! `TENANT_ID`, `RESOURCE`). Everything else has a default and may be set in
//! an optional TOML file pointed to by `CRM_MCP_CONFIG`, or overridden by the
//! matching `CRM_*` environment variable.

use crate::crm::MatchPolicy;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_API_VERSION: &str = "v9.1";
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_CACHE_FILE: &str = "crm_entity_cache.json";
pub const DEFAULT_CACHE_TTL_HOURS: u64 = 7 * 24;
pub const DEFAULT_DIVISION_FIELD: &str = "_owningbusinessunit_value";
pub const DEFAULT_AUTHORITY_HOST: &str = "https://login.microsoftonline.com";
pub const DEFAULT_MAX_PAGE_COUNT: usize = 50;

const REQUIRED_VARS: [&str; 4] = ["CLIENT_ID", "CLIENT_SECRET", "TENANT_ID", "RESOURCE"];

/// Configuration errors, fatal at startup
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variables: {}", .0.join(", "))]
    MissingVariables(Vec<String>),

    #[error("Invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },

    #[error("Failed to read config file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {}: {source}", .path.display())]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Optional settings file layout
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub crm: CrmSettings,
}

/// `[crm]` table; every key is optional
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CrmSettings {
    pub api_version: Option<String>,
    pub timeout_secs: Option<u64>,
    pub cache_file: Option<PathBuf>,
    pub cache_ttl_hours: Option<u64>,
    pub match_policy: Option<MatchPolicy>,
    pub division_field: Option<String>,
    pub authority_host: Option<String>,
    pub max_page_count: Option<usize>,
}

impl Config {
    /// Parse a settings file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content, path)
    }

    fn parse(content: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Toml {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Fully resolved configuration used at runtime
#[derive(Clone)]
pub struct RuntimeConfig {
    pub client_id: String,
    pub client_secret: String,
    pub tenant_id: String,
    pub resource: String,
    pub api_version: String,
    pub timeout: Duration,
    pub cache_file: PathBuf,
    pub cache_ttl: chrono::Duration,
    pub match_policy: MatchPolicy,
    pub division_field: String,
    pub authority_host: String,
    pub max_page_count: usize,
}

impl RuntimeConfig {
    /// Load from the process environment and the optional `CRM_MCP_CONFIG` file
    pub fn load_default() -> Result<Self, ConfigError> {
        let file = match std::env::var("CRM_MCP_CONFIG") {
            Ok(path) if !path.trim().is_empty() => Config::load(Path::new(path.trim()))?,
            _ => Config::default(),
        };
        Self::from_lookup(file, |key| std::env::var(key).ok())
    }

    /// Build from a settings file and an arbitrary variable lookup
    pub fn from_lookup<F>(file: Config, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let missing: Vec<String> = REQUIRED_VARS
            .iter()
            .filter(|key| get(**key).is_none())
            .map(|key| key.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(ConfigError::MissingVariables(missing));
        }

        let settings = file.crm;

        let resource = get("RESOURCE")
            .unwrap_or_default()
            .trim_end_matches('/')
            .to_string();
        if !resource.starts_with("https://") && !resource.starts_with("http://") {
            return Err(ConfigError::Invalid {
                key: "RESOURCE".to_string(),
                reason: format!("expected an http(s) URL, got '{}'", resource),
            });
        }

        let timeout_secs = match get("CRM_TIMEOUT_SECS") {
            Some(raw) => parse_positive("CRM_TIMEOUT_SECS", &raw)?,
            None => settings.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS),
        };
        if timeout_secs == 0 {
            return Err(zero("timeout_secs"));
        }

        let ttl_hours = match get("CRM_CACHE_TTL_HOURS") {
            Some(raw) => parse_positive("CRM_CACHE_TTL_HOURS", &raw)?,
            None => settings.cache_ttl_hours.unwrap_or(DEFAULT_CACHE_TTL_HOURS),
        };
        if ttl_hours == 0 {
            return Err(zero("cache_ttl_hours"));
        }
        let cache_ttl = i64::try_from(ttl_hours)
            .ok()
            .and_then(chrono::Duration::try_hours)
            .ok_or_else(|| ConfigError::Invalid {
                key: "cache_ttl_hours".to_string(),
                reason: format!("{} hours is out of range", ttl_hours),
            })?;

        let match_policy = match get("CRM_MATCH_POLICY") {
            Some(raw) => raw.parse().map_err(|reason| ConfigError::Invalid {
                key: "CRM_MATCH_POLICY".to_string(),
                reason,
            })?,
            None => settings.match_policy.unwrap_or_default(),
        };

        let max_page_count = settings.max_page_count.unwrap_or(DEFAULT_MAX_PAGE_COUNT);
        if max_page_count == 0 {
            return Err(zero("max_page_count"));
        }

        Ok(Self {
            client_id: get("CLIENT_ID").unwrap_or_default(),
            client_secret: get("CLIENT_SECRET").unwrap_or_default(),
            tenant_id: get("TENANT_ID").unwrap_or_default(),
            resource,
            api_version: get("CRM_API_VERSION")
                .or(settings.api_version)
                .unwrap_or_else(|| DEFAULT_API_VERSION.to_string()),
            timeout: Duration::from_secs(timeout_secs),
            cache_file: get("CRM_CACHE_FILE")
                .map(PathBuf::from)
                .or(settings.cache_file)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_FILE)),
            cache_ttl,
            match_policy,
            division_field: get("CRM_DIVISION_FIELD")
                .or(settings.division_field)
                .unwrap_or_else(|| DEFAULT_DIVISION_FIELD.to_string()),
            authority_host: get("CRM_AUTHORITY_HOST")
                .or(settings.authority_host)
                .unwrap_or_else(|| DEFAULT_AUTHORITY_HOST.to_string())
                .trim_end_matches('/')
                .to_string(),
            max_page_count,
        })
    }

    /// Web API root, e.g. `https://org.crm.dynamics.com/api/data/v9.1/`
    pub fn api_url(&self) -> String {
        format!("{}/api/data/{}/", self.resource, self.api_version)
    }
}

impl std::fmt::Debug for RuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeConfig")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("tenant_id", &self.tenant_id)
            .field("resource", &self.resource)
            .field("api_version", &self.api_version)
            .field("timeout", &self.timeout)
            .field("cache_file", &self.cache_file)
            .field("cache_ttl", &self.cache_ttl)
            .field("match_policy", &self.match_policy)
            .field("division_field", &self.division_field)
            .field("authority_host", &self.authority_host)
            .field("max_page_count", &self.max_page_count)
            .finish()
    }
}

fn parse_positive(key: &str, raw: &str) -> Result<u64, ConfigError> {
    raw.parse::<u64>().map_err(|e| ConfigError::Invalid {
        key: key.to_string(),
        reason: format!("'{}' is not a positive integer: {}", raw, e),
    })
}

fn zero(key: &str) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        reason: "must be greater than zero".to_string(),
    }
}
