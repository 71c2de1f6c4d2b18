//! Configuration loaded from a YAML file.
//!
//! Every section has defaults, so a missing file or a partial file is valid.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_FILE: &str = "ledger-desk.yaml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub processing: ProcessingConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Public base URL used when building signed download links
    #[serde(default = "default_public_url")]
    pub public_url: String,
    /// Built frontend to serve for non-API paths
    #[serde(default)]
    pub static_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            public_url: default_public_url(),
            static_dir: None,
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_public_url() -> String {
    "http://localhost:3000".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

fn default_database_path() -> PathBuf {
    PathBuf::from("./data/ledger-desk.db")
}

/// Object storage (uploads / exports buckets)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
    /// Secret mixed into signed download URLs
    #[serde(default = "default_signing_secret")]
    pub signing_secret: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
            signing_secret: default_signing_secret(),
        }
    }
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("./data/storage")
}

fn default_signing_secret() -> String {
    "change-me".to_string()
}

/// Remote `process-file` function
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    #[serde(default = "default_functions_url")]
    pub functions_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            functions_url: default_functions_url(),
            api_key: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_functions_url() -> String {
    "http://localhost:54321".to_string()
}

fn default_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_password_iterations")]
    pub password_iterations: u32,
    #[serde(default = "default_session_ttl_hours")]
    pub session_ttl_hours: i64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            password_iterations: default_password_iterations(),
            session_ttl_hours: default_session_ttl_hours(),
        }
    }
}

fn default_password_iterations() -> u32 {
    100_000
}

fn default_session_ttl_hours() -> i64 {
    24 * 7
}

impl Config {
    /// Load configuration from a YAML file; a missing file yields defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::warn!("Config file {} not found, using defaults", path.display());
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_yaml(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Config::default());
        }
        let config: Config = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.auth.password_iterations == 0 {
            anyhow::bail!("auth.password_iterations must be greater than zero");
        }
        if self.auth.session_ttl_hours <= 0 {
            anyhow::bail!("auth.session_ttl_hours must be positive");
        }
        if self.storage.signing_secret.is_empty() {
            anyhow::bail!("storage.signing_secret must not be empty");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let config = Config::from_yaml(
            "server:\n  port: 8080\nstorage:\n  signing_secret: s3cret\n",
        )
        .unwrap();

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.storage.signing_secret, "s3cret");
        assert_eq!(config.auth.password_iterations, 100_000);
        assert_eq!(config.database.path, PathBuf::from("./data/ledger-desk.db"));
    }

    #[test]
    fn test_empty_yaml_is_default() {
        let config = Config::from_yaml("").unwrap();
        assert_eq!(config.server.bind_addr(), "0.0.0.0:3000");
    }

    #[test]
    fn test_rejects_zero_iterations() {
        let result = Config::from_yaml("auth:\n  password_iterations: 0\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = Config::load("/definitely/not/here.yaml").unwrap();
        assert_eq!(config.processing.timeout_secs, 120);
    }
}
