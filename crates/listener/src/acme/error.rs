//! ACME error types

use std::io;
use thiserror::Error;

/// Errors from on-demand ACME issuance. Each fails only the handshake that
/// triggered it.
#[derive(Debug, Error)]
pub enum AcmeError {
    /// The requested host is not one of the active domains
    #[error("acme: host '{0}' not configured")]
    HostNotAllowed(String),

    /// The directory's terms of service are not in the accepted list
    #[error("acme: terms of service {0} not accepted")]
    TermsNotAccepted(String),

    #[error("acme: no configuration is active")]
    NotActive,

    #[error("ACME account not initialized")]
    NoAccount,

    #[error("Failed to create ACME account: {0}")]
    AccountCreation(String),

    #[error("Failed to fetch ACME directory {url}: {message}")]
    Directory { url: String, message: String },

    #[error("Failed to create certificate order: {0}")]
    OrderCreation(String),

    #[error("Challenge validation failed for domain '{domain}': {message}")]
    ChallengeValidation { domain: String, message: String },

    #[error("No HTTP-01 challenge available for domain '{0}'")]
    NoHttp01Challenge(String),

    #[error("Failed to finalize certificate: {0}")]
    Finalization(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Failed to parse certificate: {0}")]
    CertificateParse(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("ACME protocol error: {0}")]
    Protocol(String),
}

/// Errors from the on-disk certificate cache.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Domain names are used as directory names
    #[error("Refusing to store certificate for invalid domain '{0}'")]
    InvalidDomain(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

impl From<instant_acme::Error> for AcmeError {
    fn from(e: instant_acme::Error) -> Self {
        AcmeError::Protocol(e.to_string())
    }
}
