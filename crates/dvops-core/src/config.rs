use crate::entity::EntityCatalog;
use crate::error::{OpsError, Result};
use crate::paths;
use crate::retry::RetryPolicy;
use dataverse_client::{ClientCredentials, EntityDescriptor, GatewayConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

impl ConfigWarning {
    fn warning(message: impl Into<String>) -> Self {
        Self {
            level: WarnLevel::Warning,
            message: message.into(),
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            level: WarnLevel::Error,
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// DataverseConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataverseConfig {
    #[serde(default)]
    pub base_uri: Option<String>,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_page_size")]
    pub max_page_size: u32,
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
}

fn default_api_version() -> String {
    "9.2".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_page_size() -> u32 {
    500
}

fn default_max_pages() -> u32 {
    50
}

impl Default for DataverseConfig {
    fn default() -> Self {
        Self {
            base_uri: None,
            api_version: default_api_version(),
            timeout_secs: default_timeout_secs(),
            max_page_size: default_max_page_size(),
            max_pages: default_max_pages(),
        }
    }
}

// ---------------------------------------------------------------------------
// AuthConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing)]
    pub client_secret: Option<String>,
    /// Defaults to `dataverse.base_uri`.
    #[serde(default)]
    pub resource: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub authority: Option<String>,
    #[serde(default = "default_safety_margin_secs")]
    pub safety_margin_secs: u64,
    #[serde(default = "default_fetch_attempts")]
    pub fetch_attempts: u32,
    /// Set when the secret was read from the YAML file rather than the
    /// environment.
    #[serde(skip)]
    pub secret_in_file: bool,
}

fn default_safety_margin_secs() -> u64 {
    180
}

fn default_fetch_attempts() -> u32 {
    3
}

// ---------------------------------------------------------------------------
// BatchConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Attempts per call for transient failures, first attempt included.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Retries per call after throttling responses.
    #[serde(default = "default_throttle_attempts")]
    pub throttle_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
    #[serde(default = "default_journal")]
    pub journal: PathBuf,
    /// Entity used by rows that don't name one.
    #[serde(default = "default_entity")]
    pub default_entity: String,
    /// Attach an audit note to the master after every merge.
    #[serde(default)]
    pub merge_notes: bool,
}

fn default_workers() -> usize {
    4
}

fn default_max_attempts() -> u32 {
    3
}

fn default_throttle_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_jitter_ms() -> u64 {
    250
}

fn default_journal() -> PathBuf {
    PathBuf::from(paths::JOURNAL_FILE)
}

fn default_entity() -> String {
    "account".to_string()
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_attempts: default_max_attempts(),
            throttle_attempts: default_throttle_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_ms: default_jitter_ms(),
            journal: default_journal(),
            default_entity: default_entity(),
            merge_notes: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub dataverse: DataverseConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub entities: Vec<EntityDescriptor>,
}

/// Environment variables that override file settings.
pub const ENV_OVERRIDES: &[&str] = &[
    "DATAVERSE_BASE_URI",
    "API_VERSION",
    "TENANT_ID",
    "CLIENT_ID",
    "CLIENT_SECRET",
    "AUTHORITY",
    "DATAVERSE_SCOPE",
];

impl Config {
    /// Load `path`, or `./dvops.yaml` when no path is given. A missing
    /// explicit path is an error; a missing default file yields defaults so
    /// the environment alone can configure a run.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut cfg = match path {
            Some(p) => {
                if !p.exists() {
                    return Err(OpsError::NotConfigured(p.display().to_string()));
                }
                Self::from_yaml(&std::fs::read_to_string(p)?)?
            }
            None => {
                let default = paths::config_path(Path::new("."));
                if default.exists() {
                    Self::from_yaml(&std::fs::read_to_string(&default)?)?
                } else {
                    Self::default()
                }
            }
        };
        cfg.apply_env(|key| std::env::var(key).ok());
        Ok(cfg)
    }

    pub fn from_yaml(data: &str) -> Result<Self> {
        if data.trim().is_empty() {
            return Ok(Self::default());
        }
        let mut cfg: Config = serde_yaml::from_str(data)?;
        cfg.auth.secret_in_file = cfg.auth.client_secret.is_some();
        Ok(cfg)
    }

    /// Apply environment overrides through `lookup`; empty values are ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("DATAVERSE_BASE_URI") {
            self.dataverse.base_uri = Some(v);
        }
        if let Some(v) = get("API_VERSION") {
            self.dataverse.api_version = v;
        }
        if let Some(v) = get("TENANT_ID") {
            self.auth.tenant_id = Some(v);
        }
        if let Some(v) = get("CLIENT_ID") {
            self.auth.client_id = Some(v);
        }
        if let Some(v) = get("CLIENT_SECRET") {
            self.auth.client_secret = Some(v);
            self.auth.secret_in_file = false;
        }
        if let Some(v) = get("AUTHORITY") {
            self.auth.authority = Some(v);
        }
        if let Some(v) = get("DATAVERSE_SCOPE") {
            self.auth.scope = Some(v);
        }
    }

    // -----------------------------------------------------------------------
    // Builders
    // -----------------------------------------------------------------------

    pub fn gateway_config(&self) -> Result<GatewayConfig> {
        let base_uri = required(&self.dataverse.base_uri, "dataverse.base_uri")?;
        Ok(GatewayConfig {
            base_uri,
            api_version: self.dataverse.api_version.clone(),
            timeout: Duration::from_secs(self.dataverse.timeout_secs.max(1)),
            max_page_size: self.dataverse.max_page_size,
            max_pages: self.dataverse.max_pages,
        })
    }

    pub fn credentials(&self) -> Result<ClientCredentials> {
        let resource = match &self.auth.resource {
            Some(r) => r.clone(),
            None => required(&self.dataverse.base_uri, "dataverse.base_uri")?,
        };
        Ok(ClientCredentials {
            tenant_id: required(&self.auth.tenant_id, "auth.tenant_id")?,
            client_id: required(&self.auth.client_id, "auth.client_id")?,
            client_secret: required(&self.auth.client_secret, "auth.client_secret")?,
            resource,
            scope: self.auth.scope.clone(),
            authority: self.auth.authority.clone(),
        })
    }

    pub fn safety_margin(&self) -> Duration {
        Duration::from_secs(self.auth.safety_margin_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.batch.max_attempts.max(1),
            throttle_attempts: self.batch.throttle_attempts,
            base_delay: Duration::from_millis(self.batch.base_delay_ms),
            max_delay: Duration::from_millis(self.batch.max_delay_ms.max(self.batch.base_delay_ms)),
        }
    }

    pub fn catalog(&self) -> Result<EntityCatalog> {
        EntityCatalog::with_entities(&self.entities)
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        let missing = [
            (&self.dataverse.base_uri, "dataverse.base_uri", "DATAVERSE_BASE_URI"),
            (&self.auth.tenant_id, "auth.tenant_id", "TENANT_ID"),
            (&self.auth.client_id, "auth.client_id", "CLIENT_ID"),
            (&self.auth.client_secret, "auth.client_secret", "CLIENT_SECRET"),
        ];
        for (value, key, env) in missing {
            if value.as_deref().map_or(true, |v| v.trim().is_empty()) {
                warnings.push(ConfigWarning::error(format!("{key} is not set (or set {env})")));
            }
        }

        if let Some(uri) = &self.dataverse.base_uri {
            if !uri.starts_with("https://") && !uri.starts_with("http://") {
                warnings.push(ConfigWarning::error(format!(
                    "dataverse.base_uri '{uri}' is not an http(s) URL"
                )));
            }
        }

        if self.auth.secret_in_file {
            warnings.push(ConfigWarning::warning(
                "auth.client_secret is stored in the config file; prefer CLIENT_SECRET",
            ));
        }

        if self.batch.workers == 0 {
            warnings.push(ConfigWarning::warning(
                "batch.workers is 0; rows will run one at a time",
            ));
        }

        if self.batch.max_attempts > 10 {
            warnings.push(ConfigWarning::warning(format!(
                "batch.max_attempts={} (>10 is unusual)",
                self.batch.max_attempts
            )));
        }

        if self.auth.fetch_attempts > 10 {
            warnings.push(ConfigWarning::warning(format!(
                "auth.fetch_attempts={} (>10 is unusual; waits are capped at batch.max_delay_ms)",
                self.auth.fetch_attempts
            )));
        }

        if let Err(e) = self.catalog() {
            warnings.push(ConfigWarning::error(format!("entities: {e}")));
        }

        warnings
    }
}

fn required(value: &Option<String>, key: &str) -> Result<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| OpsError::InvalidConfig(format!("{key} is not set")))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
