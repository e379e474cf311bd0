//! Configuration for the certgate dynamic TLS listener.
//!
//! This crate owns three things:
//!
//! - the [`ListenerConfiguration`] object that the store hands to the
//!   listener, together with the explicit [`ConfigurationUpdate`] the
//!   listener hands back;
//! - the [`SettingsProvider`] abstraction for string settings such as
//!   `tls-min-version`;
//! - the KDL server file ([`CertgateConfig`]) read by the `certgate` binary.

pub mod kdl;
pub mod listener;
pub mod server;
pub mod settings;
pub mod validate;

pub use listener::{
    CertificateMetadata, ConfigurationUpdate, ListenerConfiguration, ListenerMode,
};
pub use server::{AcmeConfig, CertgateConfig, ServerConfig};
pub use settings::{EnvSettings, Setting, SettingsProvider, StaticSettings};
pub use validate::{ErrorCategory, ValidationError, ValidationResult, ValidationWarning};

use certgate_common::ResourceVersion;
use thiserror::Error;

/// Errors produced while loading or interpreting configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Parse(String),

    #[error("invalid JSON configuration: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown listener mode '{0}', valid modes: static-tls, https, acme")]
    UnknownMode(String),

    #[error("unknown setting '{0}'")]
    UnknownSetting(String),

    #[error("resource version conflict for {target}: update computed from {expected}, store has {actual}")]
    VersionConflict {
        target: String,
        expected: ResourceVersion,
        actual: ResourceVersion,
    },

    #[error("update for {target} carries uid {update_uid} but stored object has uid {stored_uid}")]
    UidMismatch {
        target: String,
        update_uid: String,
        stored_uid: String,
    },

    #[error("configuration is invalid:\n{0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
