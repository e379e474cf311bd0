//! Listener configuration objects and the updates written back to the store.

use certgate_common::{ConfigRef, ConfigUid, ResourceVersion};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::{ConfigError, Result};

/// How the TLS listener obtains certificates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ListenerMode {
    /// Static certificate, or leaves signed by the configured CA
    #[default]
    #[serde(rename = "static-tls", alias = "https")]
    StaticTls,
    /// On-demand ACME issuance
    #[serde(rename = "acme")]
    Acme,
}

impl fmt::Display for ListenerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerMode::StaticTls => write!(f, "static-tls"),
            ListenerMode::Acme => write!(f, "acme"),
        }
    }
}

impl FromStr for ListenerMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "static-tls" | "https" => Ok(ListenerMode::StaticTls),
            "acme" => Ok(ListenerMode::Acme),
            other => Err(ConfigError::UnknownMode(other.to_string())),
        }
    }
}

/// Values derived from the certificate material of a configuration.
///
/// Recomputed by the store whenever `cert`, `key` or `ca_cert` change.
/// Never used for decisions by the listener.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_serial: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_expires_at: Option<DateTime<Utc>>,
}

/// A listener configuration as held by the configuration store.
///
/// The listener treats these as immutable snapshots. Changes flow back to
/// the store through [`ConfigurationUpdate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenerConfiguration {
    #[serde(default)]
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub uid: ConfigUid,
    #[serde(default = "Utc::now")]
    pub creation_timestamp: DateTime<Utc>,
    #[serde(default)]
    pub resource_version: ResourceVersion,

    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub mode: ListenerMode,

    /// Hostnames ACME may issue for. The first entry replaces empty or
    /// `localhost` SNI.
    #[serde(default)]
    pub domains: Vec<String>,
    /// Accepted terms-of-service URLs; empty or `auto` accepts everything
    #[serde(default)]
    pub tos: Vec<String>,

    #[serde(default)]
    pub cert: String,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub ca_cert: String,
    #[serde(default)]
    pub ca_key: String,

    #[serde(default)]
    pub known_ips: Vec<String>,
    #[serde(default)]
    pub generated_certs: BTreeMap<String, String>,

    #[serde(default)]
    pub metadata: CertificateMetadata,
}

fn default_enabled() -> bool {
    true
}

impl ListenerConfiguration {
    /// A fresh, enabled, cluster-scoped configuration created now.
    pub fn new(name: impl Into<String>, mode: ListenerMode) -> Self {
        Self {
            namespace: String::new(),
            name: name.into(),
            uid: ConfigUid::new(),
            creation_timestamp: Utc::now(),
            resource_version: ResourceVersion::default(),
            enabled: true,
            mode,
            domains: Vec::new(),
            tos: Vec::new(),
            cert: String::new(),
            key: String::new(),
            ca_cert: String::new(),
            ca_key: String::new(),
            known_ips: Vec::new(),
            generated_certs: BTreeMap::new(),
            metadata: CertificateMetadata::default(),
        }
    }

    /// Parse a single configuration from JSON.
    pub fn from_json(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    pub fn config_ref(&self) -> ConfigRef {
        ConfigRef::new(self.namespace.clone(), self.name.clone())
    }

    /// Whether a static certificate/key pair is configured
    pub fn has_static_cert(&self) -> bool {
        !self.cert.is_empty() && !self.key.is_empty()
    }

    pub fn accepts_all_tos(&self) -> bool {
        self.tos.is_empty() || self.tos.iter().any(|t| t == "auto")
    }

    /// Recompute the derived certificate metadata.
    pub fn refresh_metadata(&mut self) {
        self.metadata = crate::validate::certs::derive_metadata(self);
    }
}

/// A desired change to a stored configuration.
///
/// Carries the `resource_version` the change was computed from; the store
/// applies it only while that version is still current.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationUpdate {
    pub target: ConfigRef,
    pub uid: ConfigUid,
    pub resource_version: ResourceVersion,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_certs: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub known_ips: Option<Vec<String>>,
}

impl ConfigurationUpdate {
    /// An empty update against the given snapshot.
    pub fn for_config(config: &ListenerConfiguration) -> Self {
        Self {
            target: config.config_ref(),
            uid: config.uid.clone(),
            resource_version: config.resource_version.clone(),
            generated_certs: None,
            known_ips: None,
        }
    }

    pub fn with_generated_certs(mut self, certs: BTreeMap<String, String>) -> Self {
        self.generated_certs = Some(certs);
        self
    }

    pub fn with_known_ips(mut self, ips: Vec<String>) -> Self {
        self.known_ips = Some(ips);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.generated_certs.is_none() && self.known_ips.is_none()
    }

    /// Produce the object that results from applying this update to
    /// `current`, with the resource version advanced.
    pub fn apply_to(&self, current: &ListenerConfiguration) -> Result<ListenerConfiguration> {
        if current.uid != self.uid {
            return Err(ConfigError::UidMismatch {
                target: self.target.to_string(),
                update_uid: self.uid.to_string(),
                stored_uid: current.uid.to_string(),
            });
        }
        if current.resource_version != self.resource_version {
            return Err(ConfigError::VersionConflict {
                target: self.target.to_string(),
                expected: self.resource_version.clone(),
                actual: current.resource_version.clone(),
            });
        }

        let mut updated = current.clone();
        if let Some(ref certs) = self.generated_certs {
            updated.generated_certs = certs.clone();
        }
        if let Some(ref ips) = self.known_ips {
            updated.known_ips = ips.clone();
        }
        updated.resource_version = current.resource_version.next();
        Ok(updated)
    }
}
