pub mod validation;

use serde::{Deserialize, Serialize};

use self::validation::validate_config;
use crate::accounts::AccountKind;
use crate::auth::Permission;

/// Error type for configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    /// Seconds before an upstream request is abandoned.
    #[serde(default = "default_upstream_timeout")]
    pub upstream_timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default)]
    pub base_path: String,
    #[serde(default = "default_http_pool_max_idle_per_host")]
    pub http_pool_max_idle_per_host: usize,
    #[serde(default = "default_http_pool_idle_timeout_secs")]
    pub http_pool_idle_timeout_secs: u64,
}

fn default_port() -> u16 {
    8082
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_upstream_timeout() -> u64 {
    600
}
fn default_user_agent() -> String {
    format!("chatbridge-rs/{}", env!("CARGO_PKG_VERSION"))
}
fn default_http_pool_max_idle_per_host() -> usize {
    16
}
fn default_http_pool_idle_timeout_secs() -> u64 {
    15
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            upstream_timeout_secs: default_upstream_timeout(),
            user_agent: default_user_agent(),
            base_path: String::new(),
            http_pool_max_idle_per_host: default_http_pool_max_idle_per_host(),
            http_pool_idle_timeout_secs: default_http_pool_idle_timeout_secs(),
        }
    }
}

/// One upstream OpenAI-compatible account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamAccountConfig {
    pub id: String,
    #[serde(default = "default_account_kind")]
    pub kind: AccountKind,
    pub api_key: String,
    pub base_api: String,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub proxy: Option<String>,
}

fn default_account_kind() -> AccountKind {
    AccountKind::OpenAi
}

/// One downstream client key with its grants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientKeyConfig {
    pub id: String,
    pub key: String,
    #[serde(default = "default_permissions")]
    pub permissions: Vec<Permission>,
    /// Empty means every model is allowed.
    #[serde(default)]
    pub allowed_models: Vec<String>,
}

fn default_permissions() -> Vec<Permission> {
    vec![Permission::All]
}

/// Feature flags and settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeaturesConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "INFO".to_string()
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    pub accounts: Vec<UpstreamAccountConfig>,
    pub client_keys: Vec<ClientKeyConfig>,
    #[serde(default)]
    pub features: FeaturesConfig,
}

/// Load configuration from a YAML file and validate it.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] when reading the file fails,
/// [`ConfigError::Yaml`] when parsing fails, or [`ConfigError::Validation`]
/// when semantic validation fails.
pub fn load_config(path: &str) -> Result<AppConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    let config: AppConfig = serde_yaml::from_str(&contents)?;
    validate_config(&config)?;
    Ok(config)
}
