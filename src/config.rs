//! Proxy configuration.
//!
//! Loaded from YAML; every section has defaults so an empty file is a valid
//! (local development) configuration.

use std::{fmt, path::Path};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::permissions::{TokenRecord, UserRecord};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub permissions: PermissionStoreConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Prometheus exporter; disabled when absent.
    #[serde(default)]
    pub metrics: Option<MetricsConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_max_body_bytes() -> usize {
    1024 * 1024
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_backend_url")]
    pub url: String,
    #[serde(default = "default_range_route")]
    pub range_route: String,
    #[serde(default = "default_watch_route")]
    pub watch_route: String,
    #[serde(default = "default_backend_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: default_backend_url(),
            range_route: default_range_route(),
            watch_route: default_watch_route(),
            timeout_secs: default_backend_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

fn default_backend_url() -> String {
    "http://localhost:2379".to_string()
}

fn default_range_route() -> String {
    "/v3/kv/range".to_string()
}

fn default_watch_route() -> String {
    "/v3/watch".to_string()
}

fn default_backend_timeout_secs() -> u64 {
    10
}

fn default_connect_timeout_secs() -> u64 {
    3
}

/// Where permission records come from.
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PermissionStoreConfig {
    /// Records in the backend store under a reserved namespace.
    Etcd {
        /// Defaults to the backend url.
        #[serde(default)]
        url: Option<String>,
        #[serde(default = "default_namespace")]
        namespace: String,
        #[serde(default = "default_permission_timeout_secs")]
        timeout_secs: u64,
    },
    /// Records listed in the configuration file.
    Static {
        #[serde(default)]
        users: Vec<UserRecord>,
        #[serde(default)]
        tokens: Vec<TokenRecord>,
    },
}

impl Default for PermissionStoreConfig {
    fn default() -> Self {
        PermissionStoreConfig::Etcd {
            url: None,
            namespace: default_namespace(),
            timeout_secs: default_permission_timeout_secs(),
        }
    }
}

impl fmt::Debug for PermissionStoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PermissionStoreConfig::Etcd {
                url,
                namespace,
                timeout_secs,
            } => f
                .debug_struct("Etcd")
                .field("url", url)
                .field("namespace", namespace)
                .field("timeout_secs", timeout_secs)
                .finish(),
            PermissionStoreConfig::Static { users, tokens } => f
                .debug_struct("Static")
                .field("users", &users.len())
                .field("tokens", &tokens.len())
                .finish(),
        }
    }
}

fn default_namespace() -> String {
    "/aviso/auth/".to_string()
}

fn default_permission_timeout_secs() -> u64 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_permission_ttl_secs")]
    pub permission_ttl_secs: u64,
    #[serde(default = "default_permission_max_entries")]
    pub permission_max_entries: usize,
    #[serde(default = "default_decision_ttl_secs")]
    pub decision_ttl_secs: u64,
    #[serde(default = "default_decision_max_entries")]
    pub decision_max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            permission_ttl_secs: default_permission_ttl_secs(),
            permission_max_entries: default_permission_max_entries(),
            decision_ttl_secs: default_decision_ttl_secs(),
            decision_max_entries: default_decision_max_entries(),
        }
    }
}

fn default_permission_ttl_secs() -> u64 {
    300
}

fn default_permission_max_entries() -> usize {
    1000
}

fn default_decision_ttl_secs() -> u64 {
    30
}

fn default_decision_max_entries() -> usize {
    10_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_metrics_port() -> u16 {
    29000
}

impl ProxyConfig {
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml(&text)
    }

    /// Permission store url, falling back to the backend url.
    pub fn permission_store_url(&self) -> &str {
        match &self.permissions {
            PermissionStoreConfig::Etcd { url: Some(url), .. } => url,
            _ => &self.backend.url,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_http_url("backend.url", &self.backend.url)?;
        for (name, route) in [
            ("backend.range_route", &self.backend.range_route),
            ("backend.watch_route", &self.backend.watch_route),
        ] {
            if !route.starts_with('/') {
                return Err(ConfigError::Invalid(format!(
                    "{} must start with '/', got '{}'",
                    name, route
                )));
            }
        }
        if self.backend.range_route == self.backend.watch_route {
            return Err(ConfigError::Invalid(
                "backend.range_route and backend.watch_route must differ".to_string(),
            ));
        }
        if self.backend.timeout_secs == 0 || self.backend.connect_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "backend timeouts must be greater than 0".to_string(),
            ));
        }
        if self.server.max_body_bytes == 0 {
            return Err(ConfigError::Invalid(
                "server.max_body_bytes must be greater than 0".to_string(),
            ));
        }

        match &self.permissions {
            PermissionStoreConfig::Etcd {
                url, timeout_secs, ..
            } => {
                if let Some(url) = url {
                    validate_http_url("permissions.url", url)?;
                }
                if *timeout_secs == 0 {
                    return Err(ConfigError::Invalid(
                        "permissions.timeout_secs must be greater than 0".to_string(),
                    ));
                }
            }
            PermissionStoreConfig::Static { users, tokens } => {
                for user in users {
                    if user.identity.is_empty() {
                        return Err(ConfigError::Invalid(
                            "static permission users need an identity".to_string(),
                        ));
                    }
                    if !user.secret_sha256.is_empty() && !is_sha256_hex(&user.secret_sha256) {
                        return Err(ConfigError::Invalid(format!(
                            "user '{}' has a malformed secret_sha256",
                            user.identity
                        )));
                    }
                }
                for token in tokens {
                    if !is_sha256_hex(&token.token_sha256) {
                        return Err(ConfigError::Invalid(format!(
                            "token for '{}' has a malformed token_sha256",
                            token.identity
                        )));
                    }
                }
            }
        }

        let cache = &self.cache;
        if cache.permission_ttl_secs == 0 || cache.decision_ttl_secs == 0 {
            return Err(ConfigError::Invalid(
                "cache TTLs must be greater than 0".to_string(),
            ));
        }
        if cache.decision_ttl_secs > cache.permission_ttl_secs {
            return Err(ConfigError::Invalid(format!(
                "cache.decision_ttl_secs ({}) must not exceed cache.permission_ttl_secs ({})",
                cache.decision_ttl_secs, cache.permission_ttl_secs
            )));
        }
        if cache.permission_max_entries == 0 || cache.decision_max_entries == 0 {
            return Err(ConfigError::Invalid(
                "cache capacities must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

fn validate_http_url(name: &str, value: &str) -> Result<(), ConfigError> {
    let url = Url::parse(value.trim())
        .map_err(|e| ConfigError::Invalid(format!("{} is not a valid url: {}", name, e)))?;
    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(ConfigError::Invalid(format!(
                "{} has unsupported scheme '{}'",
                name, other
            )))
        }
    }
    if url.host().is_none() {
        return Err(ConfigError::Invalid(format!("{} needs a host", name)));
    }
    Ok(())
}

fn is_sha256_hex(value: &str) -> bool {
    let value = value.trim();
    value.len() == 64 && value.chars().all(|c| c.is_ascii_hexdigit())
}
