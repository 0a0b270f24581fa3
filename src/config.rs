use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Client configuration for talking to the session backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Backend origin, e.g. `http://localhost:9090`
    pub base_url: String,

    #[serde(default = "default_refresh_path")]
    pub refresh_path: String,

    #[serde(default = "default_login_path")]
    pub login_path: String,

    #[serde(default = "default_logout_path")]
    pub logout_path: String,

    #[serde(default = "default_profile_path")]
    pub profile_path: String,

    /// Upper bound for a single refresh call before the cycle is failed
    #[serde(default = "default_refresh_timeout")]
    pub refresh_timeout_secs: u64,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Directory holding the persisted session record. `None` keeps the
    /// session in memory only.
    #[serde(default)]
    pub storage_dir: Option<PathBuf>,

    #[serde(default = "default_storage_key")]
    pub storage_key: String,
}

fn default_refresh_path() -> String {
    "/refresh".to_string()
}
fn default_login_path() -> String {
    "/login".to_string()
}
fn default_logout_path() -> String {
    "/logout".to_string()
}
fn default_profile_path() -> String {
    "/me".to_string()
}
fn default_refresh_timeout() -> u64 {
    10
}
fn default_request_timeout() -> u64 {
    30
}
fn default_storage_key() -> String {
    "user".to_string()
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            refresh_path: default_refresh_path(),
            login_path: default_login_path(),
            logout_path: default_logout_path(),
            profile_path: default_profile_path(),
            refresh_timeout_secs: default_refresh_timeout(),
            request_timeout_secs: default_request_timeout(),
            storage_dir: None,
            storage_key: default_storage_key(),
        }
    }

    pub fn from_file(path: &str) -> Result<Self> {
        let raw = fs::read_to_string(path).context("reading client config file")?;
        let cfg: ClientConfig = serde_json::from_str(&raw).context("parsing client config JSON")?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Build configuration from environment variables.
    ///
    /// - `API_BASE_URL` (required)
    /// - `SESSION_RELAY_REFRESH_PATH`
    /// - `SESSION_RELAY_REFRESH_TIMEOUT_SECS`
    /// - `SESSION_RELAY_REQUEST_TIMEOUT_SECS`
    /// - `SESSION_RELAY_STORAGE_DIR`
    /// - `SESSION_RELAY_STORAGE_KEY`
    pub fn from_env() -> Result<Self> {
        let base_url = std::env::var("API_BASE_URL").context("API_BASE_URL is not set")?;
        let mut cfg = Self::new(base_url);

        if let Ok(path) = std::env::var("SESSION_RELAY_REFRESH_PATH") {
            cfg.refresh_path = path;
        }
        if let Ok(raw) = std::env::var("SESSION_RELAY_REFRESH_TIMEOUT_SECS") {
            cfg.refresh_timeout_secs = raw
                .parse()
                .context("SESSION_RELAY_REFRESH_TIMEOUT_SECS must be an integer")?;
        }
        if let Ok(raw) = std::env::var("SESSION_RELAY_REQUEST_TIMEOUT_SECS") {
            cfg.request_timeout_secs = raw
                .parse()
                .context("SESSION_RELAY_REQUEST_TIMEOUT_SECS must be an integer")?;
        }
        if let Ok(dir) = std::env::var("SESSION_RELAY_STORAGE_DIR") {
            cfg.storage_dir = Some(PathBuf::from(dir));
        }
        if let Ok(key) = std::env::var("SESSION_RELAY_STORAGE_KEY") {
            cfg.storage_key = key;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.base_url.trim().is_empty() {
            anyhow::bail!("base_url must not be empty");
        }
        if !self.refresh_path.starts_with('/') {
            anyhow::bail!("refresh_path must start with '/': {}", self.refresh_path);
        }
        if self.refresh_timeout_secs == 0 {
            anyhow::bail!("refresh_timeout_secs must be greater than zero");
        }
        if self.storage_key.trim().is_empty() {
            anyhow::bail!("storage_key must not be empty");
        }
        Ok(())
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.refresh_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_config_parsing_with_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"base_url": "http://localhost:9090"}}"#).unwrap();

        let config = ClientConfig::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.base_url, "http://localhost:9090");
        assert_eq!(config.refresh_path, "/refresh");
        assert_eq!(config.login_path, "/login");
        assert_eq!(config.profile_path, "/me");
        assert_eq!(config.refresh_timeout(), Duration::from_secs(10));
        assert_eq!(config.storage_key, "user");
        assert!(config.storage_dir.is_none());
    }

    #[test]
    fn test_config_overrides() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{
                "base_url": "https://api.example.com",
                "refresh_path": "/auth/refresh",
                "refresh_timeout_secs": 3,
                "storage_dir": "/var/lib/relay",
                "storage_key": "session"
            }}"#
        )
        .unwrap();

        let config = ClientConfig::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.refresh_path, "/auth/refresh");
        assert_eq!(config.refresh_timeout_secs, 3);
        assert_eq!(config.storage_dir, Some(PathBuf::from("/var/lib/relay")));
        assert_eq!(config.storage_key, "session");
    }

    #[test]
    fn test_config_missing_file() {
        let result = ClientConfig::from_file("/nonexistent/path/client.json");
        assert!(result.is_err());
    }

    #[test]
    fn test_config_invalid_json() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "{{invalid json").unwrap();

        assert!(ClientConfig::from_file(file.path().to_str().unwrap()).is_err());
    }

    #[test]
    fn test_config_rejects_zero_refresh_timeout() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{"base_url": "http://localhost", "refresh_timeout_secs": 0}}"#
        )
        .unwrap();

        assert!(ClientConfig::from_file(file.path().to_str().unwrap()).is_err());
    }

    #[test]
    fn test_config_from_env() {
        std::env::set_var("API_BASE_URL", "http://envhost:9090");
        std::env::set_var("SESSION_RELAY_REFRESH_TIMEOUT_SECS", "4");
        std::env::set_var("SESSION_RELAY_STORAGE_KEY", "envuser");

        let config = ClientConfig::from_env().unwrap();
        assert_eq!(config.base_url, "http://envhost:9090");
        assert_eq!(config.refresh_timeout_secs, 4);
        assert_eq!(config.storage_key, "envuser");

        std::env::remove_var("API_BASE_URL");
        std::env::remove_var("SESSION_RELAY_REFRESH_TIMEOUT_SECS");
        std::env::remove_var("SESSION_RELAY_STORAGE_KEY");
    }
}
