//! On-demand certificate manager used by the TLS listener in ACME mode.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rustls::sign::CertifiedKey;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

use certgate_config::AcmeConfig;

use super::challenge::ChallengeManager;
use super::client::AcmeClient;
use super::error::AcmeError;
use super::storage::CertificateStorage;
use crate::tls::certified_key_from_pem;

/// Host and terms-of-service decisions, evaluated against the active
/// configuration at the time of each handshake.
#[async_trait]
pub trait AcmePolicy: Send + Sync {
    /// Configured domains in order
    async fn domains(&self) -> Vec<String>;

    async fn host_allowed(&self, host: &str) -> bool;

    async fn accepts_tos(&self, tos_url: &str) -> bool;
}

#[derive(Debug)]
struct ManagedCertificate {
    certified: Arc<CertifiedKey>,
    expires: DateTime<Utc>,
}

/// Issues, caches and renews ACME certificates per host.
pub struct AcmeManager {
    config: AcmeConfig,
    policy: Arc<dyn AcmePolicy>,
    challenges: ChallengeManager,
    storage: OnceCell<Arc<CertificateStorage>>,
    client: OnceCell<Arc<AcmeClient>>,
    memory: DashMap<String, Arc<ManagedCertificate>>,
    issuing: DashMap<String, Arc<Mutex<()>>>,
}

impl AcmeManager {
    pub fn new(config: AcmeConfig, policy: Arc<dyn AcmePolicy>) -> Self {
        Self {
            config,
            policy,
            challenges: ChallengeManager::new(),
            storage: OnceCell::new(),
            client: OnceCell::new(),
            memory: DashMap::new(),
            issuing: DashMap::new(),
        }
    }

    pub fn config(&self) -> &AcmeConfig {
        &self.config
    }

    /// Pending HTTP-01 challenges, served by the plain listener
    pub fn challenges(&self) -> &ChallengeManager {
        &self.challenges
    }

    async fn storage(&self) -> Result<Arc<CertificateStorage>, AcmeError> {
        let storage = self
            .storage
            .get_or_try_init(|| async move {
                CertificateStorage::new(&self.config.cache_dir).map(Arc::new)
            })
            .await?;
        Ok(Arc::clone(storage))
    }

    async fn client(&self) -> Result<Arc<AcmeClient>, AcmeError> {
        let storage = self.storage().await?;
        let client = self
            .client
            .get_or_try_init(|| async move {
                let client = AcmeClient::new(
                    self.config.directory_url(),
                    self.config.email.clone(),
                    storage,
                );
                client.init_account(self.policy.as_ref()).await?;
                Ok::<_, AcmeError>(Arc::new(client))
            })
            .await?;
        Ok(Arc::clone(client))
    }

    /// Map the handshake's SNI to the host to issue for. Empty and
    /// `localhost` SNI become the first configured domain.
    pub async fn resolve_host(&self, server_name: &str) -> Result<String, AcmeError> {
        let host = if server_name.is_empty() || server_name.eq_ignore_ascii_case("localhost") {
            self.policy
                .domains()
                .await
                .into_iter()
                .next()
                .ok_or_else(|| AcmeError::HostNotAllowed(server_name.to_string()))?
        } else {
            server_name.trim_end_matches('.').to_ascii_lowercase()
        };

        if !self.policy.host_allowed(&host).await {
            return Err(AcmeError::HostNotAllowed(host));
        }
        Ok(host)
    }

    /// The certificate to present for `server_name`, issuing one if no
    /// unexpired certificate is cached.
    pub async fn get_certificate(&self, server_name: &str) -> Result<Arc<CertifiedKey>, AcmeError> {
        let host = self.resolve_host(server_name).await?;

        if let Some(cert) = self.cached(&host, Utc::now()) {
            return Ok(cert);
        }

        let lock = Arc::clone(self.issuing.entry(host.clone()).or_default().value());
        let _guard = lock.lock().await;

        // another handshake may have finished issuing while we waited
        let now = Utc::now();
        if let Some(cert) = self.cached(&host, now) {
            return Ok(cert);
        }

        let storage = self.storage().await?;
        if let Some(stored) = storage.load_certificate(&host)? {
            if stored.meta.expires > now {
                return self.remember(
                    &host,
                    &stored.cert_pem,
                    &stored.key_pem,
                    stored.meta.expires,
                );
            }
        }

        self.issue(&host).await
    }

    fn cached(&self, host: &str, now: DateTime<Utc>) -> Option<Arc<CertifiedKey>> {
        let entry = self.memory.get(host)?;
        if entry.expires > now {
            debug!(host = %host, "ACME certificate cache hit");
            Some(Arc::clone(&entry.certified))
        } else {
            None
        }
    }

    fn remember(
        &self,
        host: &str,
        cert_pem: &str,
        key_pem: &str,
        expires: DateTime<Utc>,
    ) -> Result<Arc<CertifiedKey>, AcmeError> {
        let certified = Arc::new(
            certified_key_from_pem(cert_pem, key_pem).map_err(AcmeError::CertificateParse)?,
        );
        self.memory.insert(
            host.to_string(),
            Arc::new(ManagedCertificate {
                certified: Arc::clone(&certified),
                expires,
            }),
        );
        Ok(certified)
    }

    async fn issue(&self, host: &str) -> Result<Arc<CertifiedKey>, AcmeError> {
        let client = self.client().await?;
        let issued = client.issue(host, &self.challenges).await?;

        self.storage().await?.save_certificate(
            host,
            &issued.cert_pem,
            &issued.key_pem,
            issued.expires,
            Some(client.directory_url()),
        )?;
        self.remember(host, &issued.cert_pem, &issued.key_pem, issued.expires)
    }

    /// Re-issue every cached certificate of a configured domain that expires
    /// within `renew-before-days`. Returns the number renewed.
    pub async fn renew_due(&self) -> Result<usize, AcmeError> {
        let storage = self.storage().await?;
        let mut renewed = 0;

        for domain in self.policy.domains().await {
            let stored = match storage.load_certificate(&domain) {
                Ok(Some(stored)) => stored,
                Ok(None) => continue,
                Err(e) => {
                    warn!(domain = %domain, error = %e, "Failed to read cached certificate");
                    continue;
                }
            };
            if !stored.needs_renewal(self.config.renew_before_days, Utc::now()) {
                debug!(domain = %domain, expires = %stored.meta.expires, "Certificate still valid");
                continue;
            }

            let lock = Arc::clone(self.issuing.entry(domain.clone()).or_default().value());
            let _guard = lock.lock().await;

            info!(domain = %domain, expires = %stored.meta.expires, "Renewing certificate");
            match self.issue(&domain).await {
                Ok(_) => renewed += 1,
                Err(e) => warn!(domain = %domain, error = %e, "Certificate renewal failed"),
            }
        }

        Ok(renewed)
    }
}

impl std::fmt::Debug for AcmeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcmeManager")
            .field("config", &self.config)
            .field("cached", &self.memory.len())
            .field("pending_challenges", &self.challenges.pending_count())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::path::Path;

    pub(crate) struct FixedPolicy {
        pub domains: Vec<String>,
        pub tos: Vec<String>,
    }

    #[async_trait]
    impl AcmePolicy for FixedPolicy {
        async fn domains(&self) -> Vec<String> {
            self.domains.clone()
        }

        async fn host_allowed(&self, host: &str) -> bool {
            self.domains.iter().any(|d| d == host)
        }

        async fn accepts_tos(&self, tos_url: &str) -> bool {
            self.tos.iter().any(|t| t == tos_url)
        }
    }

    /// Write a self-signed certificate for `domain` into the cache layout.
    pub(crate) fn preload(cache_dir: &Path, domain: &str, days: i64) {
        let mut params = rcgen::CertificateParams::new(vec![domain.to_string()]).unwrap();
        let expires = time::OffsetDateTime::now_utc() + time::Duration::days(days);
        params.not_after = expires;
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();

        let storage = CertificateStorage::new(cache_dir).unwrap();
        storage
            .save_certificate(
                domain,
                &cert.pem(),
                &key.serialize_pem(),
                DateTime::from_timestamp(expires.unix_timestamp(), 0).unwrap(),
                None,
            )
            .unwrap();
    }

    fn manager(cache_dir: &Path) -> AcmeManager {
        let config = AcmeConfig {
            cache_dir: cache_dir.to_path_buf(),
            directory_url: Some("https://127.0.0.1:1/directory".to_string()),
            ..AcmeConfig::default()
        };
        let policy = FixedPolicy {
            domains: vec!["example.com".to_string(), "www.example.com".to_string()],
            tos: Vec::new(),
        };
        AcmeManager::new(config, Arc::new(policy))
    }

    #[tokio::test]
    async fn test_resolve_host_substitutes_first_domain() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());

        assert_eq!(manager.resolve_host("").await.unwrap(), "example.com");
        assert_eq!(manager.resolve_host("localhost").await.unwrap(), "example.com");
        assert_eq!(
            manager.resolve_host("WWW.example.com").await.unwrap(),
            "www.example.com"
        );
    }

    #[tokio::test]
    async fn test_unlisted_host_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());

        let err = manager.get_certificate("other.com").await.unwrap_err();
        assert!(matches!(err, AcmeError::HostNotAllowed(host) if host == "other.com"));
    }

    #[tokio::test]
    async fn test_serves_cached_certificate() {
        let dir = tempfile::tempdir().unwrap();
        preload(dir.path(), "example.com", 60);
        let manager = manager(dir.path());

        let first = manager.get_certificate("").await.unwrap();
        let second = manager.get_certificate("example.com").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_renewal_skips_fresh_certificates() {
        let dir = tempfile::tempdir().unwrap();
        preload(dir.path(), "example.com", 60);
        let manager = manager(dir.path());

        assert_eq!(manager.renew_due().await.unwrap(), 0);
    }
}
