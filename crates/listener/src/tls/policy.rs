//! Minimum TLS version and cipher suite resolution.
//!
//! Settings use Go-style names (`TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256`,
//! `1.2`) and are mapped onto the rustls aws-lc-rs provider. TLS 1.3 suites
//! are not configurable and are always offered when TLS 1.3 is enabled.

use std::sync::Arc;

use rustls::crypto::aws_lc_rs::{self, cipher_suite};
use rustls::crypto::CryptoProvider;
use rustls::server::ResolvesServerCert;
use rustls::{ProtocolVersion, ServerConfig, SupportedCipherSuite, SupportedProtocolVersion};
use tracing::debug;

use certgate_config::{Setting, SettingsProvider};

use crate::error::TlsPolicyError;

/// ALPN protocols offered on every TLS listener
pub const ALPN_PROTOCOLS: [&[u8]; 2] = [b"h2", b"http/1.1"];

const TLS_VERSION_NAMES: [&str; 2] = ["1.2", "1.3"];

fn tls_versions(name: &str) -> Option<Vec<&'static SupportedProtocolVersion>> {
    match name {
        "1.2" => Some(vec![&rustls::version::TLS13, &rustls::version::TLS12]),
        "1.3" => Some(vec![&rustls::version::TLS13]),
        _ => None,
    }
}

fn tls12_ciphers() -> [(&'static str, SupportedCipherSuite); 8] {
    [
        (
            "TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256",
            cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
        ),
        (
            "TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256",
            cipher_suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
        ),
        (
            "TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384",
            cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
        ),
        (
            "TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384",
            cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
        ),
        (
            "TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305",
            cipher_suite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
        ),
        (
            "TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256",
            cipher_suite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
        ),
        (
            "TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305",
            cipher_suite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
        ),
        (
            "TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256",
            cipher_suite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
        ),
    ]
}

/// TLS 1.3 suite names are accepted in the cipher list but have no effect
const TLS13_CIPHER_NAMES: [&str; 3] = [
    "TLS_AES_128_GCM_SHA256",
    "TLS_AES_256_GCM_SHA384",
    "TLS_CHACHA20_POLY1305_SHA256",
];

fn tls13_ciphers() -> [SupportedCipherSuite; 3] {
    [
        cipher_suite::TLS13_AES_128_GCM_SHA256,
        cipher_suite::TLS13_AES_256_GCM_SHA384,
        cipher_suite::TLS13_CHACHA20_POLY1305_SHA256,
    ]
}

/// Resolved protocol versions and cipher suites for one listener generation.
#[derive(Debug, Clone)]
pub struct TlsPolicy {
    versions: Vec<&'static SupportedProtocolVersion>,
    tls12_suites: Vec<SupportedCipherSuite>,
}

impl TlsPolicy {
    /// Resolve `tls-min-version` and `tls-ciphers` from the settings provider.
    pub fn from_settings(settings: &dyn SettingsProvider) -> Result<Self, TlsPolicyError> {
        Self::resolve(
            &settings.value(Setting::TlsMinVersion),
            &settings.value(Setting::TlsCiphers),
        )
    }

    pub fn resolve(min_version: &str, ciphers: &str) -> Result<Self, TlsPolicyError> {
        let min_version = min_version.trim();
        let versions =
            tls_versions(min_version).ok_or_else(|| TlsPolicyError::InvalidVersion {
                value: min_version.to_string(),
                accepted: TLS_VERSION_NAMES.join(" "),
            })?;

        let mut tls12_suites: Vec<SupportedCipherSuite> = Vec::new();
        for name in ciphers.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            if TLS13_CIPHER_NAMES.contains(&name) {
                continue;
            }
            let suite = tls12_ciphers()
                .into_iter()
                .find(|(known, _)| *known == name)
                .map(|(_, suite)| suite)
                .ok_or_else(|| TlsPolicyError::UnsupportedCipher {
                    value: name.to_string(),
                    accepted: accepted_cipher_names(),
                })?;
            if !tls12_suites.iter().any(|s| s.suite() == suite.suite()) {
                tls12_suites.push(suite);
            }
        }

        debug!(
            min_version = %min_version,
            tls12_suites = tls12_suites.len(),
            "Resolved TLS policy"
        );

        Ok(Self {
            versions,
            tls12_suites,
        })
    }

    pub fn allows_tls12(&self) -> bool {
        self.versions
            .iter()
            .any(|v| v.version == ProtocolVersion::TLSv1_2)
    }

    /// The aws-lc-rs provider restricted to this policy's suites
    pub fn crypto_provider(&self) -> CryptoProvider {
        let mut provider = aws_lc_rs::default_provider();
        let mut suites = tls13_ciphers().to_vec();
        if self.allows_tls12() {
            suites.extend(self.tls12_suites.iter().copied());
        }
        provider.cipher_suites = suites;
        provider
    }

    /// Build a server configuration using `resolver` for certificates.
    pub fn server_config(
        &self,
        resolver: Arc<dyn ResolvesServerCert>,
    ) -> Result<ServerConfig, TlsPolicyError> {
        let mut config = ServerConfig::builder_with_provider(Arc::new(self.crypto_provider()))
            .with_protocol_versions(&self.versions)?
            .with_no_client_auth()
            .with_cert_resolver(resolver);
        config.alpn_protocols = ALPN_PROTOCOLS.iter().map(|p| p.to_vec()).collect();
        Ok(config)
    }
}

fn accepted_cipher_names() -> String {
    tls12_ciphers()
        .iter()
        .map(|(name, _)| *name)
        .chain(TLS13_CIPHER_NAMES)
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use certgate_config::settings::DEFAULT_TLS_CIPHERS;
    use certgate_config::StaticSettings;
    use rustls::CipherSuite;

    #[test]
    fn test_default_settings_resolve() {
        let policy = TlsPolicy::from_settings(&StaticSettings::new()).unwrap();

        assert!(policy.allows_tls12());
        assert_eq!(policy.tls12_suites.len(), 6);
        assert_eq!(policy.crypto_provider().cipher_suites.len(), 9);
    }

    #[test]
    fn test_tls13_only() {
        let policy = TlsPolicy::resolve("1.3", DEFAULT_TLS_CIPHERS).unwrap();

        assert!(!policy.allows_tls12());
        let provider = policy.crypto_provider();
        assert_eq!(provider.cipher_suites.len(), 3);
        assert!(provider
            .cipher_suites
            .iter()
            .all(|s| s.version().version == ProtocolVersion::TLSv1_3));
    }

    #[test]
    fn test_invalid_version_lists_accepted_values() {
        let err = TlsPolicy::resolve("1.1", DEFAULT_TLS_CIPHERS).unwrap_err();
        let message = err.to_string();

        assert!(message.contains("[1.1]"));
        assert!(message.contains("1.2 1.3"));
    }

    #[test]
    fn test_unsupported_cipher_names_value() {
        let err = TlsPolicy::resolve("1.2", "TLS_RSA_WITH_AES_128_CBC_SHA").unwrap_err();
        let message = err.to_string();

        assert!(message.contains("[TLS_RSA_WITH_AES_128_CBC_SHA]"));
        assert!(message.contains("TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256"));
    }

    #[test]
    fn test_cipher_subset_and_aliases() {
        let policy = TlsPolicy::resolve(
            "1.2",
            " TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256 , TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305,TLS_AES_128_GCM_SHA256",
        )
        .unwrap();

        assert_eq!(policy.tls12_suites.len(), 1);
        assert_eq!(
            policy.tls12_suites[0].suite(),
            CipherSuite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256
        );
    }

    #[test]
    fn test_server_config_has_alpn() {
        #[derive(Debug)]
        struct NoCert;
        impl ResolvesServerCert for NoCert {
            fn resolve(
                &self,
                _: rustls::server::ClientHello<'_>,
            ) -> Option<Arc<rustls::sign::CertifiedKey>> {
                None
            }
        }

        let policy = TlsPolicy::resolve("1.2", DEFAULT_TLS_CIPHERS).unwrap();
        let config = policy.server_config(Arc::new(NoCert)).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"h2".to_vec(), b"http/1.1".to_vec()]);
    }
}
