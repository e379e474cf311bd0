//! Error types for the dynamic listener.

use std::io;
use std::net::SocketAddr;
use thiserror::Error;

use certgate_config::ConfigError;

use crate::acme::AcmeError;

/// Errors surfaced by `enable`, reloads and certificate resolution.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// The configuration's certificate material could not be used
    #[error("invalid {field} for configuration {config}: {message}")]
    InvalidCertificate {
        config: String,
        field: &'static str,
        message: String,
    },

    #[error("{0}")]
    TlsPolicy(#[from] TlsPolicyError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("acme mode requires at least one domain in configuration {0}")]
    NoAcmeDomains(String),

    #[error("certificate issuance failed: {0}")]
    Issuance(#[from] IssuanceError),

    #[error("acme error: {0}")]
    Acme(#[from] AcmeError),

    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Invalid TLS version or cipher settings.
#[derive(Debug, Error)]
pub enum TlsPolicyError {
    #[error("Invalid minimal TLS version [{value}], must be one of: {accepted}")]
    InvalidVersion { value: String, accepted: String },

    #[error("Unsupported cipher [{value}], must be one or more from: {accepted}")]
    UnsupportedCipher { value: String, accepted: String },

    #[error("failed to build TLS configuration: {0}")]
    Rustls(#[from] rustls::Error),
}

/// Failures while producing a certificate for a handshake.
#[derive(Debug, Error)]
pub enum IssuanceError {
    #[error("no static certificate or certificate authority is configured")]
    NoCertificateAuthority,

    #[error("no configuration is active")]
    NotActive,

    #[error("certificate generation failed: {0}")]
    Generation(#[from] rcgen::Error),

    #[error("private key conversion failed: {0}")]
    KeyEncoding(String),

    #[error("failed to load signing key: {0}")]
    SigningKey(#[from] rustls::Error),

    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),

    #[error("malformed persisted certificate: {0}")]
    Malformed(String),

    #[error("certificate generation task failed: {0}")]
    Task(String),
}

/// Failures talking to the configuration store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("configuration {0} not found")]
    NotFound(String),

    #[error("conflicting update: {0}")]
    Conflict(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Config(ConfigError),
}

impl From<ConfigError> for StoreError {
    fn from(e: ConfigError) -> Self {
        match e {
            ConfigError::VersionConflict { .. } | ConfigError::UidMismatch { .. } => {
                StoreError::Conflict(e.to_string())
            }
            other => StoreError::Config(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, ListenerError>;
