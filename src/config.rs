use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;

use crate::error::{PrecheckError, Result};

/// Longest upload lifetime accepted, one year.
pub const MAX_UPLOAD_EXPIRY_MINUTES: u64 = 60 * 24 * 365;

/// HTTP listener, storage and scheduling settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Root for `uploads/` and `runs/`
    pub storage_path: PathBuf,
    /// Maximum number of runs executing at once
    pub max_concurrent: usize,
    pub upload_expiry_minutes: u64,
    /// Queue processor tick
    pub poll_interval_ms: u64,
    /// Upload reaper tick
    pub cleanup_interval_secs: u64,
    pub max_upload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            storage_path: PathBuf::from("./data"),
            max_concurrent: 1,
            upload_expiry_minutes: 15,
            poll_interval_ms: 1000,
            cleanup_interval_secs: 60,
            max_upload_bytes: 2 * 1024 * 1024 * 1024,
        }
    }
}

impl ServerConfig {
    pub fn uploads_dir(&self) -> PathBuf {
        self.storage_path.join("uploads")
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.storage_path.join("runs")
    }

    pub fn upload_ttl(&self) -> chrono::Duration {
        let minutes = self.upload_expiry_minutes.min(MAX_UPLOAD_EXPIRY_MINUTES);
        chrono::Duration::minutes(minutes as i64)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| PrecheckError::Config(format!("invalid listen address: {e}")))
    }
}

/// Configuration for the precheck containers.
///
/// Every container started by the server is named `<container_prefix><run id>`;
/// the prefix is how managed containers (and orphans) are recognised.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    /// Image providing `precheck.py`
    pub image: String,
    pub container_prefix: String,
    /// Grace period for `docker stop` before the container is killed
    pub stop_timeout_secs: u64,
    /// Upper bound on any single docker CLI call
    pub command_timeout_secs: u64,
    /// Memory limit (e.g., "8g")
    pub memory_limit: Option<String>,
    /// CPU limit (e.g., "4")
    pub cpu_limit: Option<String>,
    /// Disable network access in the container
    pub network_disabled: bool,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            image: "ghcr.io/wafer-space/gf180mcu-precheck:latest".to_string(),
            container_prefix: "precheck-".to_string(),
            stop_timeout_secs: 10,
            command_timeout_secs: 60,
            memory_limit: None,
            cpu_limit: None,
            network_disabled: false,
        }
    }
}

impl DockerConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiKey {
    pub name: String,
    pub key: String,
}

/// Request authentication.
///
/// An empty `allowed_ips` list admits every address. When `required` is
/// false, API keys are not checked.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub required: bool,
    /// Single addresses or CIDR blocks
    pub allowed_ips: Vec<String>,
    pub api_keys: Vec<ApiKey>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub docker: DockerConfig,
    pub auth: AuthConfig,
}

impl Config {
    /// Load and validate a TOML config file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            PrecheckError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(text).map_err(|e| PrecheckError::Config(e.to_string()))?;
        for api_key in &mut config.auth.api_keys {
            api_key.key = expand_env_vars(&api_key.key);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.max_concurrent == 0 {
            return Err(PrecheckError::Config(
                "server.max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.server.poll_interval_ms == 0 {
            return Err(PrecheckError::Config(
                "server.poll_interval_ms must be at least 1".to_string(),
            ));
        }
        if self.server.cleanup_interval_secs == 0 {
            return Err(PrecheckError::Config(
                "server.cleanup_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.server.upload_expiry_minutes > MAX_UPLOAD_EXPIRY_MINUTES {
            return Err(PrecheckError::Config(format!(
                "server.upload_expiry_minutes must be at most {MAX_UPLOAD_EXPIRY_MINUTES}"
            )));
        }
        if self.docker.container_prefix.is_empty() {
            return Err(PrecheckError::Config(
                "docker.container_prefix must not be empty".to_string(),
            ));
        }
        if self.docker.command_timeout_secs == 0 {
            return Err(PrecheckError::Config(
                "docker.command_timeout_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_storage_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.server.storage_path = path.into();
        self
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.server.max_concurrent = max_concurrent;
        self
    }
}

/// Replace `${VAR}` with the environment value; unknown variables are left as is.
fn expand_env_vars(value: &str) -> String {
    let Ok(pattern) = Regex::new(r"\$\{([^}]+)\}") else {
        return value.to_string();
    };
    pattern
        .replace_all(value, |caps: &regex::Captures<'_>| {
            std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
        })
        .into_owned()
}
