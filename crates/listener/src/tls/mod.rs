//! TLS plumbing shared by the static and ACME listeners.

pub mod policy;

pub use policy::{TlsPolicy, ALPN_PROTOCOLS};

use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::{CertifiedKey, SigningKey};

/// Load a private key with the aws-lc-rs key provider.
pub fn load_signing_key(key: PrivateKeyDer<'static>) -> Result<Arc<dyn SigningKey>, rustls::Error> {
    rustls::crypto::aws_lc_rs::default_provider()
        .key_provider
        .load_private_key(key)
}

/// Build a certified key from PEM certificate chain and private key text.
pub fn certified_key_from_pem(cert_pem: &str, key_pem: &str) -> Result<CertifiedKey, String> {
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("failed to parse certificate PEM: {}", e))?;

    if certs.is_empty() {
        return Err("no certificates found in PEM".to_string());
    }

    let key = rustls_pemfile::private_key(&mut key_pem.as_bytes())
        .map_err(|e| format!("failed to parse key PEM: {}", e))?
        .ok_or_else(|| "no private key found in PEM".to_string())?;

    let signing_key =
        load_signing_key(key).map_err(|e| format!("failed to load private key: {:?}", e))?;

    let certified = CertifiedKey::new(certs, signing_key);
    certified
        .keys_match()
        .map_err(|e| format!("private key does not match certificate: {}", e))?;
    Ok(certified)
}

/// Resolver that always presents one certificate.
///
/// Each accepted connection gets its own server configuration carrying the
/// certificate chosen for its ClientHello.
#[derive(Debug)]
pub struct FixedCertResolver(pub Arc<CertifiedKey>);

impl ResolvesServerCert for FixedCertResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(&self.0))
    }
}
