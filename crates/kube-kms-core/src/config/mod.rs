pub mod credentials;

use crate::error::{KmsError, Result};
use crate::keyid::ConfigHash;
use crate::types::{KeyConfig, ProviderKind};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level plugin configuration stored as TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginConfig {
    #[serde(default)]
    pub plugin: PluginSettings,
    pub key: KeyConfig,
    /// Vault authentication (required for `type = "Vault"`).
    #[serde(default)]
    pub auth: Option<VaultAuthConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginSettings {
    /// Socket endpoint (`unix:///path/socket.sock`). Defaults to
    /// `unix:///var/kube-kms/<config hash>/socket.sock`.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Address of the HTTP livez/healthz listener.
    #[serde(default = "default_health_addr")]
    pub health_addr: String,
    /// Address for the Prometheus metrics endpoint (e.g. "0.0.0.0:9090").
    #[serde(default)]
    pub metrics_addr: Option<String>,
    /// Upper bound for a single RPC, including backend round trips.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    /// Extra attempts for Status when the backend is transiently down.
    #[serde(default = "default_status_retries")]
    pub status_retries: u32,
    /// First backoff between Status attempts; doubles per attempt.
    #[serde(default = "default_status_backoff_ms")]
    pub status_backoff_ms: u64,
    /// Interval of the background backend probe feeding readiness.
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,
    /// Fail startup instead of starting degraded when the backend is down.
    #[serde(default)]
    pub require_backend_at_startup: bool,
    /// Renew the Vault token this long before it expires.
    #[serde(default = "default_token_refresh_margin_secs")]
    pub token_refresh_margin_secs: u64,
    /// PEM bundle trusted for the Vault TLS connection.
    #[serde(default)]
    pub vault_ca_cert: Option<String>,
}

impl Default for PluginSettings {
    fn default() -> Self {
        Self {
            endpoint: None,
            health_addr: default_health_addr(),
            metrics_addr: None,
            call_timeout_ms: default_call_timeout_ms(),
            status_retries: default_status_retries(),
            status_backoff_ms: default_status_backoff_ms(),
            probe_interval_ms: default_probe_interval_ms(),
            require_backend_at_startup: false,
            token_refresh_margin_secs: default_token_refresh_margin_secs(),
            vault_ca_cert: None,
        }
    }
}

fn default_health_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_call_timeout_ms() -> u64 {
    3000
}

fn default_status_retries() -> u32 {
    2
}

fn default_status_backoff_ms() -> u64 {
    100
}

fn default_probe_interval_ms() -> u64 {
    10_000
}

fn default_token_refresh_margin_secs() -> u64 {
    60
}

fn default_approle_mount() -> String {
    "approle".to_string()
}

/// How the plugin obtains a Vault token.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "lowercase")]
pub enum VaultAuthConfig {
    /// A pre-issued token, inline or from a mounted file.
    Token {
        #[serde(default)]
        token: Option<String>,
        #[serde(default)]
        token_file: Option<String>,
    },
    /// AppRole login with a RoleID/SecretID pair.
    Approle {
        #[serde(default = "default_approle_mount")]
        mount: String,
        #[serde(default)]
        role_id: Option<String>,
        #[serde(default)]
        role_id_file: Option<String>,
        #[serde(default)]
        secret_id: Option<String>,
        #[serde(default)]
        secret_id_file: Option<String>,
    },
}

impl PluginSettings {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn status_backoff(&self) -> Duration {
        Duration::from_millis(self.status_backoff_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn token_refresh_margin(&self) -> Duration {
        Duration::from_secs(self.token_refresh_margin_secs)
    }
}

impl PluginConfig {
    /// Load and validate config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(KmsError::ConfigInvalid(format!(
                "configuration file not found at {}",
                path.display()
            )));
        }
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&content)?;
        tracing::debug!(path = %path.display(), provider = %config.key.provider, "Loaded configuration");
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(|e| KmsError::TomlDe(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Fail fast on anything the plugin cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.key.validate()?;

        let settings = &self.plugin;
        if settings.call_timeout_ms == 0 {
            return Err(KmsError::ConfigInvalid(
                "call_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if settings.probe_interval_ms == 0 {
            return Err(KmsError::ConfigInvalid(
                "probe_interval_ms must be greater than zero".to_string(),
            ));
        }
        if let Some(endpoint) = &settings.endpoint {
            socket_path(endpoint)?;
        }

        match (&self.key.provider, &self.auth) {
            (ProviderKind::Vault, None) => {
                return Err(KmsError::ConfigInvalid(
                    "key type Vault requires an [auth] section".to_string(),
                ));
            }
            (ProviderKind::Vault, Some(auth)) => auth.validate()?,
            (_, Some(_)) => {
                tracing::warn!(provider = %self.key.provider, "[auth] section ignored for this key type");
            }
            (_, None) => {}
        }
        Ok(())
    }

    pub fn config_hash(&self) -> Result<ConfigHash> {
        ConfigHash::of(&self.key)
    }

    /// Configured endpoint, or the per-lineage default.
    pub fn endpoint(&self) -> Result<String> {
        match &self.plugin.endpoint {
            Some(endpoint) => Ok(endpoint.clone()),
            None => Ok(self.config_hash()?.default_endpoint()),
        }
    }
}

impl VaultAuthConfig {
    fn validate(&self) -> Result<()> {
        match self {
            VaultAuthConfig::Token { token, token_file } => {
                credentials::require_one("token", token, token_file)
            }
            VaultAuthConfig::Approle {
                mount,
                role_id,
                role_id_file,
                secret_id,
                secret_id_file,
            } => {
                if mount.trim().is_empty() {
                    return Err(KmsError::ConfigInvalid(
                        "approle mount must not be empty".to_string(),
                    ));
                }
                credentials::require_one("role_id", role_id, role_id_file)?;
                credentials::require_one("secret_id", secret_id, secret_id_file)
            }
        }
    }
}

/// Resolve a `unix://` endpoint (or bare absolute path) to a socket path.
pub fn socket_path(endpoint: &str) -> Result<PathBuf> {
    let path = match endpoint.strip_prefix("unix://") {
        Some(rest) => rest,
        None if endpoint.contains("://") => {
            return Err(KmsError::ConfigInvalid(format!(
                "unsupported endpoint scheme in '{endpoint}', expected unix://"
            )));
        }
        None => endpoint,
    };
    if !path.starts_with('/') {
        return Err(KmsError::ConfigInvalid(format!(
            "endpoint '{endpoint}' must be an absolute socket path"
        )));
    }
    Ok(PathBuf::from(path))
}
