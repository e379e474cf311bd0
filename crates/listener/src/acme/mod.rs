//! On-demand ACME certificates for the TLS listener.
//!
//! In ACME mode every handshake asks the [`AcmeManager`] for a certificate.
//! The manager checks the host against the active domain list, serves a
//! cached certificate when one is available, and otherwise runs an HTTP-01
//! order:
//!
//! 1. [`AcmeClient`] creates the order with the directory
//! 2. the challenge token is published through [`ChallengeManager`]
//! 3. the plain listener answers `/.well-known/acme-challenge/<token>`
//! 4. the order is finalized and the chain is written to
//!    [`CertificateStorage`] (`certs-cache` by default)
//!
//! [`RenewalScheduler`] re-issues cached certificates before they expire.

mod challenge;
mod client;
mod error;
mod manager;
mod scheduler;
mod storage;

pub use challenge::{ChallengeManager, ACME_CHALLENGE_PREFIX};
pub use client::{certificate_expiry, AcmeClient, IssuedCertificate};
pub use error::{AcmeError, StorageError};
pub use manager::{AcmeManager, AcmePolicy};
pub use scheduler::RenewalScheduler;
pub use storage::{CertificateMeta, CertificateStorage, StoredCertificate};
