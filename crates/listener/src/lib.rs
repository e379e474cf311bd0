//! Certgate Listener Library
//!
//! A TLS front-end whose certificates, trusted hosts and issuance strategy
//! follow a reconciled configuration object instead of a static file.
//!
//! This library provides:
//!
//! - **Configuration selection**: one active [`ListenerConfiguration`] at a time
//! - **Self-signed issuance**: per-host and per-IP leaves signed by a configured CA
//! - **ACME**: on-demand HTTP-01 issuance with a disk cache and renewal
//! - **Listener lifecycle**: plain and TLS ports rebuilt on every reload
//! - **Reconciliation**: generated certificates and client IPs written back to the store
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use certgate_listener::{AppHandler, DynamicListener, ListenerOptions, MemoryConfigStore};
//! use certgate_config::{ListenerConfiguration, ListenerMode, StaticSettings};
//!
//! let settings = Arc::new(StaticSettings::new());
//! let listener = DynamicListener::new(
//!     settings.clone(),
//!     Arc::new(MemoryConfigStore::new()),
//!     Arc::new(AppHandler::new(settings)),
//!     ListenerOptions::default(),
//! );
//! listener.enable(&ListenerConfiguration::new("main", ListenerMode::StaticTls)).await?;
//! ```
//!
//! [`ListenerConfiguration`]: certgate_config::ListenerConfiguration

// ============================================================================
// Module Declarations
// ============================================================================

pub mod acme;
pub mod certs;
pub mod error;
pub mod reload;
pub mod server;
pub mod store;
pub mod tls;

// ============================================================================
// Public API Re-exports
// ============================================================================

// Listener
pub use server::{
    AppHandler, BoundAddresses, DynamicListener, ListenerOptions, ReconcileOutcome,
    RequestHandler,
};

// Errors
pub use error::{IssuanceError, ListenerError, StoreError, TlsPolicyError};

// Configuration store
pub use store::{FileConfigStore, ListenerConfigStore, MemoryConfigStore};

// TLS
pub use tls::TlsPolicy;
