//! The dynamic listener: configuration selection, certificate resolution
//! and listener reloads.
//!
//! All mutable state lives in one [`ServerState`] behind a single async
//! mutex. Handshakes, enable/disable calls and the reconciler serialize on
//! it; certificate generation holds it for the whole issuance.

pub mod handlers;
mod lifecycle;
mod reconcile;

pub use handlers::{
    AcmeHttpHandler, AppHandler, HttpResponse, IpRecorder, IpRecordingHandler, RedirectHandler,
    RequestHandler,
};
pub use lifecycle::{BoundAddresses, CertificateSource};
pub use reconcile::ReconcileOutcome;

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rustls::sign::CertifiedKey;
use tokio::sync::Mutex;
use tracing::{debug, info};

use certgate_config::{
    AcmeConfig, CertgateConfig, ListenerConfiguration, ListenerMode, Setting, SettingsProvider,
};

use crate::acme::{AcmeManager, AcmePolicy, RenewalScheduler};
use crate::certs::{rotation_threshold, CaIssuer, CertificateCache, KnownIps};
use crate::error::{IssuanceError, ListenerError, Result};
use crate::store::ListenerConfigStore;
use crate::tls::{certified_key_from_pem, TlsPolicy};
use lifecycle::Generation;

/// Default time open connections get to finish after a reload
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Process-level listener settings.
#[derive(Debug, Clone)]
pub struct ListenerOptions {
    pub http_port: u16,
    pub https_port: u16,
    /// Bind 127.0.0.1 instead of all interfaces
    pub bind_loopback: bool,
    pub reconcile_interval: Duration,
    pub drain_timeout: Duration,
    pub acme: AcmeConfig,
}

impl ListenerOptions {
    pub fn from_config(config: &CertgateConfig) -> Self {
        Self {
            http_port: config.server.http_port,
            https_port: config.server.https_port,
            bind_loopback: config.server.bind_loopback,
            reconcile_interval: Duration::from_secs(config.server.reconcile_interval_secs),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            acme: config.acme.clone(),
        }
    }

    fn addresses(&self) -> (SocketAddr, SocketAddr) {
        let ip = if self.bind_loopback {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        } else {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        };
        (
            SocketAddr::new(ip, self.http_port),
            SocketAddr::new(ip, self.https_port),
        )
    }
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self::from_config(&CertgateConfig::default())
    }
}

/// Certificate and host policy derived from the last accepted configuration.
#[derive(Debug, Default)]
struct Policy {
    domains: Vec<String>,
    domain_set: HashSet<String>,
    tos: Vec<String>,
    tos_all: bool,
    static_cert: Option<Arc<CertifiedKey>>,
    ca: Option<Arc<CaIssuer>>,
}

impl Policy {
    fn from_config(
        candidate: &ListenerConfiguration,
        settings: &dyn SettingsProvider,
    ) -> Result<Self> {
        let config = candidate.config_ref().to_string();

        if candidate.mode == ListenerMode::Acme && candidate.domains.is_empty() {
            return Err(ListenerError::NoAcmeDomains(config));
        }

        let static_cert = if candidate.has_static_cert() {
            let certified = certified_key_from_pem(&candidate.cert, &candidate.key).map_err(
                |message| ListenerError::InvalidCertificate {
                    config: config.clone(),
                    field: "cert",
                    message,
                },
            )?;
            Some(Arc::new(certified))
        } else {
            None
        };

        let ca = if candidate.ca_key.is_empty() {
            None
        } else {
            let ca_cert = if candidate.ca_cert.is_empty() {
                settings.value(Setting::CaCerts)
            } else {
                candidate.ca_cert.clone()
            };
            let issuer = CaIssuer::from_pem(&ca_cert, &candidate.ca_key).map_err(|message| {
                ListenerError::InvalidCertificate {
                    config: config.clone(),
                    field: "ca_cert",
                    message,
                }
            })?;
            Some(Arc::new(issuer))
        };

        Ok(Self {
            domains: candidate.domains.clone(),
            domain_set: candidate.domains.iter().cloned().collect(),
            tos: candidate.tos.clone(),
            tos_all: candidate.accepts_all_tos(),
            static_cert,
            ca,
        })
    }
}

#[derive(Debug, Default)]
struct ServerState {
    active: Option<ListenerConfiguration>,
    /// Mode of the running generation; `None` while stopped
    mode: Option<ListenerMode>,
    policy: Policy,
    known_ips: KnownIps,
    certs: CertificateCache,
    generation: Option<Generation>,
    /// Known IPs as last written to (or loaded from) the store
    persisted_ips: Vec<String>,
}

struct Shared {
    this: Weak<Shared>,
    state: Mutex<ServerState>,
    settings: Arc<dyn SettingsProvider>,
    store: Arc<dyn ListenerConfigStore>,
    options: ListenerOptions,
    app: Arc<dyn RequestHandler>,
    acme: Arc<AcmeManager>,
}

impl Shared {
    fn handle(&self) -> Arc<StateHandle> {
        Arc::new(StateHandle(self.this.clone()))
    }

    async fn get_certificate(&self, server_name: &str) -> Result<Arc<CertifiedKey>> {
        let mut state = self.state.lock().await;

        if state.mode == Some(ListenerMode::Acme) {
            drop(state);
            return Ok(self.acme.get_certificate(server_name).await?);
        }

        if let Some(cert) = &state.policy.static_cert {
            return Ok(Arc::clone(cert));
        }
        let ca = state
            .policy
            .ca
            .clone()
            .ok_or(IssuanceError::NoCertificateAuthority)?;

        let (key, common_name, ips) = if server_name.is_empty() {
            let ips: Vec<IpAddr> = state
                .known_ips
                .addresses()
                .iter()
                .filter_map(|ip| ip.parse().ok())
                .collect();
            (state.known_ips.key(), None, ips)
        } else {
            (server_name.to_string(), Some(server_name.to_string()), Vec::new())
        };

        let threshold = rotation_threshold(self.settings.as_ref());
        if let Some(leaf) = state.certs.get_fresh(&key, threshold, Utc::now()) {
            return Ok(leaf.certified_key());
        }

        let leaf = tokio::task::spawn_blocking(move || ca.issue(common_name.as_deref(), &ips))
            .await
            .map_err(|e| IssuanceError::Task(e.to_string()))??;

        info!(key = %key, serial = %leaf.serial(), expires = %leaf.not_after(), "Generated certificate");
        let certified = leaf.certified_key();
        state.certs.insert(key, leaf);
        Ok(certified)
    }

    /// Tear down the running generation and build one for `config`.
    ///
    /// The old listeners are closed before anything new binds. Any error
    /// leaves the listener stopped.
    async fn reload(&self, state: &mut ServerState, config: &ListenerConfiguration) -> Result<()> {
        let record_ips = state.active.is_none();

        if let Some(generation) = state.generation.take() {
            generation.shutdown().await;
        }
        state.mode = None;

        let tls = TlsPolicy::from_settings(self.settings.as_ref())?;
        let handle = self.handle();

        let app = Arc::clone(&self.app);
        let (plain, secure): (Arc<dyn RequestHandler>, Arc<dyn RequestHandler>) = match config.mode
        {
            ListenerMode::StaticTls => {
                let redirect: Arc<dyn RequestHandler> =
                    Arc::new(RedirectHandler::new(Arc::clone(&app)));
                if record_ips {
                    let recorder: Arc<dyn IpRecorder> = handle.clone();
                    let plain: Arc<dyn RequestHandler> =
                        Arc::new(IpRecordingHandler::new(Arc::clone(&recorder), redirect));
                    let secure: Arc<dyn RequestHandler> =
                        Arc::new(IpRecordingHandler::new(recorder, app));
                    (plain, secure)
                } else {
                    (redirect, app)
                }
            }
            ListenerMode::Acme => {
                let plain: Arc<dyn RequestHandler> =
                    Arc::new(AcmeHttpHandler::new(self.acme.challenges().clone()));
                (plain, app)
            }
        };

        let (http_addr, https_addr) = self.options.addresses();
        let generation = lifecycle::start(
            http_addr,
            https_addr,
            &tls,
            handle,
            plain,
            secure,
            self.options.drain_timeout,
        )?;

        if config.mode == ListenerMode::Acme {
            let scheduler = RenewalScheduler::new(Arc::clone(&self.acme));
            tokio::spawn(scheduler.run(generation.cancel_token()));
        }

        state.known_ips.load(&config.known_ips);
        state.persisted_ips = state.known_ips.addresses();
        state.certs.clear();
        let loaded = state.certs.load_persisted(&config.generated_certs);

        info!(
            config = %config.config_ref(),
            mode = %config.mode,
            known_ips = state.known_ips.len(),
            cached_certs = loaded,
            record_ips,
            "Listener reloaded"
        );

        state.mode = Some(config.mode);
        state.active = Some(config.clone());
        state.generation = Some(generation);
        Ok(())
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(generation) = &self.state.get_mut().generation {
            generation.abort();
        }
    }
}

/// Weak view of the listener state handed to handshakes, handlers and the
/// ACME manager, so none of them keep the listener alive.
struct StateHandle(Weak<Shared>);

impl StateHandle {
    fn shared(&self) -> Option<Arc<Shared>> {
        self.0.upgrade()
    }
}

#[async_trait]
impl CertificateSource for StateHandle {
    async fn certificate_for(&self, server_name: &str) -> Result<Arc<CertifiedKey>> {
        let shared = self.shared().ok_or(IssuanceError::NotActive)?;
        shared.get_certificate(server_name).await
    }
}

#[async_trait]
impl IpRecorder for StateHandle {
    async fn record_ip(&self, ip: IpAddr) {
        if let Some(shared) = self.shared() {
            if shared.state.lock().await.known_ips.add(&ip.to_string()) {
                debug!(ip = %ip, "Recorded client IP");
            }
        }
    }
}

#[async_trait]
impl AcmePolicy for StateHandle {
    async fn domains(&self) -> Vec<String> {
        match self.shared() {
            Some(shared) => shared.state.lock().await.policy.domains.clone(),
            None => Vec::new(),
        }
    }

    async fn host_allowed(&self, host: &str) -> bool {
        match self.shared() {
            Some(shared) => shared.state.lock().await.policy.domain_set.contains(host),
            None => false,
        }
    }

    async fn accepts_tos(&self, tos_url: &str) -> bool {
        let Some(shared) = self.shared() else {
            return false;
        };
        let state = shared.state.lock().await;
        state.policy.tos_all || state.policy.tos.iter().any(|t| t == tos_url)
    }
}

/// TLS front-end whose certificates and listeners follow the active
/// [`ListenerConfiguration`].
pub struct DynamicListener {
    shared: Arc<Shared>,
}

impl DynamicListener {
    pub fn new(
        settings: Arc<dyn SettingsProvider>,
        store: Arc<dyn ListenerConfigStore>,
        app: Arc<dyn RequestHandler>,
        options: ListenerOptions,
    ) -> Self {
        let shared = Arc::new_cyclic(|this: &Weak<Shared>| {
            let policy = Arc::new(StateHandle(this.clone()));
            Shared {
                this: this.clone(),
                state: Mutex::new(ServerState::default()),
                acme: Arc::new(AcmeManager::new(options.acme.clone(), policy)),
                settings,
                store,
                options,
                app,
            }
        });
        Self { shared }
    }

    /// Offer a configuration to the selector.
    ///
    /// Returns `Ok(false)` when a configuration is active and it is strictly
    /// older than `candidate`. Otherwise the candidate's policy replaces the
    /// current one and, if nothing was active or the mode changed, the
    /// listeners are rebuilt and `candidate` becomes active.
    pub async fn enable(&self, candidate: &ListenerConfiguration) -> Result<bool> {
        let mut state = self.shared.state.lock().await;

        if let Some(active) = &state.active {
            if active.creation_timestamp < candidate.creation_timestamp {
                debug!(
                    config = %candidate.config_ref(),
                    active = %active.config_ref(),
                    "Configuration not accepted, active configuration is older"
                );
                return Ok(false);
            }
        }

        state.policy = Policy::from_config(candidate, self.shared.settings.as_ref())?;

        let reload = state.active.is_none() || state.mode != Some(candidate.mode);
        info!(
            config = %candidate.config_ref(),
            mode = %candidate.mode,
            reload,
            "Configuration accepted"
        );
        if reload {
            self.shared.reload(&mut state, candidate).await?;
        }
        Ok(true)
    }

    /// Forget the active configuration if it is `candidate`. Listeners keep
    /// running. Returns whether anything changed.
    pub async fn disable(&self, candidate: &ListenerConfiguration) -> bool {
        let mut state = self.shared.state.lock().await;
        match &state.active {
            Some(active) if active.uid == candidate.uid => {
                info!(config = %candidate.config_ref(), "Active configuration disabled");
                state.active = None;
                true
            }
            _ => false,
        }
    }

    /// Close both listeners. Open connections drain in the background.
    pub async fn shutdown(&self) {
        let mut state = self.shared.state.lock().await;
        if let Some(generation) = state.generation.take() {
            generation.shutdown().await;
        }
        state.mode = None;
    }

    /// The certificate presented for `server_name` (empty when the client
    /// sent no SNI).
    pub async fn get_certificate(&self, server_name: &str) -> Result<Arc<CertifiedKey>> {
        self.shared.get_certificate(server_name).await
    }

    /// Record a client IP as the plain and TLS handlers do.
    pub async fn record_ip(&self, ip: IpAddr) {
        self.shared.handle().record_ip(ip).await;
    }

    pub async fn active_configuration(&self) -> Option<ListenerConfiguration> {
        self.shared.state.lock().await.active.clone()
    }

    /// Mode of the running listeners, `None` when stopped
    pub async fn mode(&self) -> Option<ListenerMode> {
        self.shared.state.lock().await.mode
    }

    pub async fn bound_addresses(&self) -> Option<BoundAddresses> {
        self.shared
            .state
            .lock()
            .await
            .generation
            .as_ref()
            .map(Generation::addresses)
    }

    /// Known client IPs, sorted
    pub async fn known_ips(&self) -> Vec<String> {
        self.shared.state.lock().await.known_ips.addresses()
    }

    pub fn acme(&self) -> &Arc<AcmeManager> {
        &self.shared.acme
    }

    pub fn options(&self) -> &ListenerOptions {
        &self.shared.options
    }
}

impl std::fmt::Debug for DynamicListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicListener")
            .field("options", &self.shared.options)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certs::issuer::tests::test_ca_pem;
    use crate::store::MemoryConfigStore;
    use certgate_config::StaticSettings;
    use chrono::Duration as ChronoDuration;

    fn static_pair(name: &str) -> (String, String) {
        let rcgen::CertifiedKey { cert, signing_key } =
            rcgen::generate_simple_self_signed(vec![name.to_string()]).unwrap();
        (cert.pem(), signing_key.serialize_pem())
    }

    fn listener(settings: StaticSettings) -> DynamicListener {
        let settings: Arc<dyn SettingsProvider> = Arc::new(settings);
        let options = ListenerOptions {
            http_port: 0,
            https_port: 0,
            bind_loopback: true,
            ..ListenerOptions::default()
        };
        DynamicListener::new(
            Arc::clone(&settings),
            Arc::new(MemoryConfigStore::new()),
            Arc::new(AppHandler::new(settings)),
            options,
        )
    }

    fn ca_config(name: &str) -> ListenerConfiguration {
        let (ca_cert, ca_key) = test_ca_pem();
        let mut config = ListenerConfiguration::new(name, ListenerMode::StaticTls);
        config.ca_cert = ca_cert;
        config.ca_key = ca_key;
        config
    }

    #[tokio::test]
    async fn test_selector_ordering() {
        let listener = listener(StaticSettings::new());
        let now = Utc::now();

        let mut c1 = ca_config("c1");
        c1.creation_timestamp = now;
        let mut c2 = ca_config("c2");
        c2.creation_timestamp = now + ChronoDuration::seconds(1);
        let mut c3 = ca_config("c3");
        c3.creation_timestamp = now + ChronoDuration::seconds(2);

        assert!(listener.enable(&c2).await.unwrap());
        assert!(listener.enable(&c1).await.unwrap());
        assert!(!listener.enable(&c3).await.unwrap());

        // same mode, so accepting c1 did not replace the active pointer
        let active = listener.active_configuration().await.unwrap();
        assert_eq!(active.uid, c2.uid);

        listener.shutdown().await;
    }

    #[tokio::test]
    async fn test_disable_matches_uid() {
        let listener = listener(StaticSettings::new());
        let config = ca_config("main");
        assert!(listener.enable(&config).await.unwrap());

        assert!(!listener.disable(&ca_config("main")).await);
        assert!(listener.disable(&config).await);
        assert!(listener.active_configuration().await.is_none());

        // listeners survive disable
        assert!(listener.bound_addresses().await.is_some());
        listener.shutdown().await;
        assert!(listener.bound_addresses().await.is_none());
        assert_eq!(listener.mode().await, None);
    }

    #[tokio::test]
    async fn test_static_cert_for_any_sni() {
        let listener = listener(StaticSettings::new());
        let (cert, key) = static_pair("static.example.com");
        let mut config = ListenerConfiguration::new("static", ListenerMode::StaticTls);
        config.cert = cert;
        config.key = key;
        listener.enable(&config).await.unwrap();

        let first = listener.get_certificate("a.example.com").await.unwrap();
        let second = listener.get_certificate("").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        listener.shutdown().await;
    }

    #[tokio::test]
    async fn test_serial_stable_within_threshold() {
        let listener = listener(StaticSettings::new());
        listener.enable(&ca_config("main")).await.unwrap();

        let first = listener.get_certificate("host.example.com").await.unwrap();
        let again = listener.get_certificate("host.example.com").await.unwrap();
        assert!(Arc::ptr_eq(&first, &again));

        listener.shutdown().await;
    }

    #[tokio::test]
    async fn test_rotation_inside_threshold() {
        // leaves live one year, so a 400 day threshold rotates every time
        let settings = StaticSettings::new().with(Setting::RotateCertsIfExpiringInDays, "400");
        let listener = listener(settings);
        listener.enable(&ca_config("main")).await.unwrap();

        let first = listener.get_certificate("host.example.com").await.unwrap();
        let second = listener.get_certificate("host.example.com").await.unwrap();
        assert_ne!(first.cert[0], second.cert[0]);

        listener.shutdown().await;
    }

    #[tokio::test]
    async fn test_ip_key_follows_recorded_ips() {
        let listener = listener(StaticSettings::new());
        listener.enable(&ca_config("main")).await.unwrap();

        let before = listener.get_certificate("").await.unwrap();
        listener.record_ip("10.0.0.7".parse().unwrap()).await;
        let after = listener.get_certificate("").await.unwrap();

        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(listener.known_ips().await, vec!["10.0.0.7"]);
        listener.shutdown().await;
    }

    #[tokio::test]
    async fn test_missing_ca_fails_handshake_only() {
        let listener = listener(StaticSettings::new());
        listener
            .enable(&ListenerConfiguration::new("bare", ListenerMode::StaticTls))
            .await
            .unwrap();

        let err = listener.get_certificate("host").await.unwrap_err();
        assert!(matches!(
            err,
            ListenerError::Issuance(IssuanceError::NoCertificateAuthority)
        ));
        assert!(listener.bound_addresses().await.is_some());
        listener.shutdown().await;
    }

    #[tokio::test]
    async fn test_malformed_cert_rejected() {
        let listener = listener(StaticSettings::new());
        let mut config = ListenerConfiguration::new("broken", ListenerMode::StaticTls);
        config.cert = "not a certificate".to_string();
        config.key = "not a key".to_string();

        let err = listener.enable(&config).await.unwrap_err();
        assert!(matches!(
            err,
            ListenerError::InvalidCertificate { field: "cert", .. }
        ));
        assert!(listener.active_configuration().await.is_none());
    }

    #[tokio::test]
    async fn test_mismatched_static_key_rejected() {
        let listener = listener(StaticSettings::new());
        let (cert, _) = static_pair("static.example.com");
        let (_, other_key) = static_pair("static.example.com");
        let mut config = ListenerConfiguration::new("static", ListenerMode::StaticTls);
        config.cert = cert;
        config.key = other_key;

        let err = listener.enable(&config).await.unwrap_err();
        assert!(matches!(
            err,
            ListenerError::InvalidCertificate { field: "cert", .. }
        ));
        assert!(listener.active_configuration().await.is_none());
        assert!(listener.bound_addresses().await.is_none());
    }

    #[tokio::test]
    async fn test_mismatched_ca_key_rejected() {
        let listener = listener(StaticSettings::new());
        let (_, other_key) = test_ca_pem();
        let mut config = ca_config("main");
        config.ca_key = other_key;

        let err = listener.enable(&config).await.unwrap_err();
        assert!(matches!(
            err,
            ListenerError::InvalidCertificate { field: "ca_cert", .. }
        ));
        assert!(listener.active_configuration().await.is_none());
    }

    #[tokio::test]
    async fn test_ca_cert_falls_back_to_setting() {
        let (ca_cert, ca_key) = test_ca_pem();
        let listener = listener(StaticSettings::new().with(Setting::CaCerts, ca_cert));
        let mut config = ListenerConfiguration::new("main", ListenerMode::StaticTls);
        config.ca_key = ca_key;

        listener.enable(&config).await.unwrap();
        assert!(listener.get_certificate("").await.is_ok());
        listener.shutdown().await;
    }

    #[tokio::test]
    async fn test_acme_requires_domains() {
        let listener = listener(StaticSettings::new());
        let config = ListenerConfiguration::new("acme", ListenerMode::Acme);

        let err = listener.enable(&config).await.unwrap_err();
        assert!(matches!(err, ListenerError::NoAcmeDomains(_)));
    }

    #[tokio::test]
    async fn test_bad_tls_setting_aborts_reload() {
        let listener = listener(StaticSettings::new().with(Setting::TlsMinVersion, "1.0"));

        let err = listener.enable(&ca_config("main")).await.unwrap_err();
        assert!(matches!(err, ListenerError::TlsPolicy(_)));
        assert!(listener.bound_addresses().await.is_none());
    }
}
