//! Server file model for the `certgate` binary.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::settings::{Setting, StaticSettings};
use crate::{ConfigError, Result};

/// Process-level configuration read from a KDL file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CertgateConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub acme: AcmeConfig,
    /// Setting overrides, keyed by setting name
    #[serde(default)]
    pub settings: HashMap<String, String>,
}

/// Ports, bind address and store location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_https_port")]
    pub https_port: u16,
    /// Bind on 127.0.0.1 instead of all interfaces
    #[serde(default)]
    pub bind_loopback: bool,
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,
    #[serde(default = "default_store_path")]
    pub store: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: default_http_port(),
            https_port: default_https_port(),
            bind_loopback: false,
            reconcile_interval_secs: default_reconcile_interval(),
            store: default_store_path(),
        }
    }
}

/// ACME account and certificate cache settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcmeConfig {
    #[serde(default)]
    pub email: Option<String>,
    /// Use the Let's Encrypt staging directory
    #[serde(default)]
    pub staging: bool,
    /// Explicit directory URL; overrides `staging`
    #[serde(default)]
    pub directory_url: Option<String>,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    #[serde(default = "default_renew_before_days")]
    pub renew_before_days: u32,
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            email: None,
            staging: false,
            directory_url: None,
            cache_dir: default_cache_dir(),
            renew_before_days: default_renew_before_days(),
        }
    }
}

pub fn default_http_port() -> u16 {
    80
}

pub fn default_https_port() -> u16 {
    443
}

pub fn default_reconcile_interval() -> u64 {
    5
}

pub fn default_store_path() -> PathBuf {
    PathBuf::from("listen-configs.json")
}

pub fn default_cache_dir() -> PathBuf {
    PathBuf::from("certs-cache")
}

pub fn default_renew_before_days() -> u32 {
    30
}

impl CertgateConfig {
    /// Load the server file. `.kdl` and `.json` are supported.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;

        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("kdl");

        match extension {
            "kdl" => Self::from_kdl(&content),
            "json" => Ok(serde_json::from_str(&content)?),
            other => Err(ConfigError::Parse(format!(
                "Unsupported config format: {}",
                other
            ))),
        }
    }

    /// Parse the KDL form.
    pub fn from_kdl(content: &str) -> Result<Self> {
        let doc = crate::kdl::parse_document(content).map_err(ConfigError::Parse)?;
        crate::kdl::parse_kdl_document(doc)
            .context("Invalid certgate configuration")
            .map_err(|e| ConfigError::Parse(format!("{:#}", e)))
    }

    /// Setting overrides as a settings provider.
    pub fn static_settings(&self) -> Result<StaticSettings> {
        let mut values = HashMap::new();
        for (name, value) in &self.settings {
            values.insert(name.parse::<Setting>()?, value.clone());
        }
        Ok(StaticSettings::from(values))
    }

    /// ACME directory to use
    pub fn acme_directory_url(&self) -> &str {
        self.acme.directory_url()
    }
}

impl AcmeConfig {
    /// The explicit directory URL, or Let's Encrypt production/staging
    pub fn directory_url(&self) -> &str {
        match self.directory_url {
            Some(ref url) => url,
            None if self.staging => LETS_ENCRYPT_STAGING,
            None => LETS_ENCRYPT_PRODUCTION,
        }
    }
}

pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";
pub const LETS_ENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";
