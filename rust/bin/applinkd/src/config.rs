//! Server configuration.
//!
//! Loaded once from `/etc/applink/<name>.toml` (or an explicit path) and
//! handed to the components that need it. Every field has a default, so an
//! empty file is a valid configuration.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use provision::worker::ProvisionConfig;

const CONFIG_DIR: &str = "/etc/applink";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub server: ListenConfig,
    pub provision: ProvisionSection,
    pub org: OrgConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    pub listen: String,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProvisionSection {
    /// Simulated per-item provisioning time.
    pub item_delay_ms: u64,
    /// Per-job deadline. 0 disables it.
    pub job_timeout_secs: u64,
    /// How long shutdown waits for running jobs.
    pub shutdown_grace_secs: u64,
    pub settings_object: String,
}

impl Default for ProvisionSection {
    fn default() -> Self {
        Self {
            item_delay_ms: 1500,
            job_timeout_secs: 0,
            shutdown_grace_secs: 30,
            settings_object: "Provisioning_Setting__mdt".to_string(),
        }
    }
}

impl ProvisionSection {
    pub fn worker_config(&self) -> ProvisionConfig {
        ProvisionConfig {
            item_delay: Duration::from_millis(self.item_delay_ms),
            job_timeout: (self.job_timeout_secs > 0)
                .then(|| Duration::from_secs(self.job_timeout_secs)),
            settings_object: self.settings_object.clone(),
        }
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrgConfig {
    /// REST API version used when the client context carries none.
    pub api_version: String,
}

impl Default for OrgConfig {
    fn default() -> Self {
        Self {
            api_version: "62.0".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub format: LogFormat,
}

impl ServerConfig {
    /// A bare name maps to `/etc/applink/<name>.toml`; anything that looks
    /// like a path is used as is.
    pub fn resolve_path(name_or_path: &str) -> PathBuf {
        if name_or_path.contains('/') || name_or_path.contains('.') {
            PathBuf::from(name_or_path)
        } else {
            Path::new(CONFIG_DIR).join(format!("{name_or_path}.toml"))
        }
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read {}: {}", path.display(), e))?;
        let config: ServerConfig = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("failed to parse {}: {}", path.display(), e))?;
        Ok(config)
    }
}

/// Refuse to start on a configuration that cannot work.
pub fn verify_config(config: &ServerConfig) -> anyhow::Result<()> {
    config
        .server
        .listen
        .parse::<SocketAddr>()
        .map_err(|e| anyhow::anyhow!("invalid listen address {:?}: {}", config.server.listen, e))?;
    if config.provision.settings_object.trim().is_empty() {
        anyhow::bail!("provision.settings_object is empty in configuration.");
    }
    if config.org.api_version.trim().is_empty() {
        anyhow::bail!("org.api_version is empty in configuration.");
    }
    Ok(())
}
