//! Shared fixtures for the listener integration tests.
//!
//! Listeners bind ephemeral loopback ports; clients connect with a verifier
//! that accepts any certificate so tests can inspect what was presented.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    KeyUsagePurpose,
};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use x509_parser::extensions::GeneralName;

use certgate_config::{SettingsProvider, StaticSettings};
use certgate_listener::{
    AppHandler, DynamicListener, ListenerConfigStore, ListenerOptions, MemoryConfigStore,
};

/// Organization carried by the test CA
pub const TEST_ORG: &str = "Certgate Integration";

/// Loopback, ephemeral ports, fast reconciler
pub fn test_options() -> ListenerOptions {
    ListenerOptions {
        http_port: 0,
        https_port: 0,
        bind_loopback: true,
        reconcile_interval: Duration::from_millis(50),
        drain_timeout: Duration::from_secs(1),
        ..ListenerOptions::default()
    }
}

pub fn listener_with(
    settings: StaticSettings,
    store: Arc<dyn ListenerConfigStore>,
    options: ListenerOptions,
) -> DynamicListener {
    let settings: Arc<dyn SettingsProvider> = Arc::new(settings);
    DynamicListener::new(
        Arc::clone(&settings),
        store,
        Arc::new(AppHandler::new(settings)),
        options,
    )
}

pub fn listener() -> DynamicListener {
    listener_with(
        StaticSettings::new(),
        Arc::new(MemoryConfigStore::new()),
        test_options(),
    )
}

/// PEM certificate and key of a self-signed CA
pub fn test_ca() -> (String, String) {
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "certgate-test-ca");
    dn.push(DnType::OrganizationName, TEST_ORG);
    params.distinguished_name = dn;

    let key = KeyPair::generate().unwrap();
    let cert = params.self_signed(&key).unwrap();
    (cert.pem(), key.serialize_pem())
}

/// PEM certificate and key for `names`
pub fn self_signed(names: &[&str]) -> (String, String) {
    let names = names.iter().map(|n| n.to_string()).collect::<Vec<_>>();
    let rcgen::CertifiedKey { cert, signing_key } =
        rcgen::generate_simple_self_signed(names).unwrap();
    (cert.pem(), signing_key.serialize_pem())
}

#[derive(Debug)]
struct AcceptAnything;

impl ServerCertVerifier for AcceptAnything {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::aws_lc_rs::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

fn client_config(send_sni: bool) -> ClientConfig {
    let mut config = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::aws_lc_rs::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .dangerous()
    .with_custom_certificate_verifier(Arc::new(AcceptAnything))
    .with_no_client_auth();
    config.enable_sni = send_sni;
    config
}

async fn connect(
    addr: SocketAddr,
    sni: Option<&str>,
) -> std::io::Result<tokio_rustls::client::TlsStream<TcpStream>> {
    let connector = TlsConnector::from(Arc::new(client_config(sni.is_some())));
    let name = ServerName::try_from(sni.unwrap_or("localhost").to_string()).unwrap();
    let stream = TcpStream::connect(addr).await?;
    tokio::time::timeout(Duration::from_secs(10), connector.connect(name, stream))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "handshake timed out"))?
}

/// Complete a handshake and return the presented leaf certificate.
/// `None` sends no SNI.
pub async fn presented_cert(
    addr: SocketAddr,
    sni: Option<&str>,
) -> std::io::Result<CertificateDer<'static>> {
    let tls = connect(addr, sni).await?;
    let (_, connection) = tls.get_ref();
    connection
        .peer_certificates()
        .and_then(|certs| certs.first())
        .cloned()
        .ok_or_else(|| std::io::Error::other("no certificate presented"))
}

/// Send one HTTP/1.1 request and return the raw response.
pub async fn http_request<S>(mut stream: S, method: &str, path: &str, host: &str) -> String
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let request = format!(
        "{} {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        method, path, host
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), stream.read_to_end(&mut response))
        .await
        .unwrap()
        .unwrap();
    String::from_utf8_lossy(&response).into_owned()
}

pub async fn plain_get(addr: SocketAddr, path: &str, host: &str) -> String {
    let stream = TcpStream::connect(addr).await.unwrap();
    http_request(stream, "GET", path, host).await
}

pub async fn tls_get(addr: SocketAddr, sni: Option<&str>, path: &str, host: &str) -> String {
    let stream = connect(addr, sni).await.unwrap();
    http_request(stream, "GET", path, host).await
}

pub fn common_name(der: &CertificateDer<'_>) -> String {
    let (_, cert) = x509_parser::parse_x509_certificate(der.as_ref()).unwrap();
    let cn = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap_or_default()
        .to_string();
    cn
}

pub fn organization(der: &CertificateDer<'_>) -> Vec<String> {
    let (_, cert) = x509_parser::parse_x509_certificate(der.as_ref()).unwrap();
    cert.subject()
        .iter_organization()
        .filter_map(|o| o.as_str().ok())
        .map(str::to_string)
        .collect()
}

/// DNS and IP subject alternative names, IPs in dotted/colon form
pub fn alt_names(der: &CertificateDer<'_>) -> Vec<String> {
    let (_, cert) = x509_parser::parse_x509_certificate(der.as_ref()).unwrap();
    let Some(san) = cert.subject_alternative_name().unwrap() else {
        return Vec::new();
    };
    san.value
        .general_names
        .iter()
        .filter_map(|name| match name {
            GeneralName::DNSName(dns) => Some(dns.to_string()),
            GeneralName::IPAddress(bytes) => match bytes.len() {
                4 => Some(std::net::Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]).to_string()),
                16 => {
                    let octets: [u8; 16] = (*bytes).try_into().ok()?;
                    Some(std::net::Ipv6Addr::from(octets).to_string())
                }
                _ => None,
            },
            _ => None,
        })
        .collect()
}

pub fn serial(der: &CertificateDer<'_>) -> Vec<u8> {
    let (_, cert) = x509_parser::parse_x509_certificate(der.as_ref()).unwrap();
    cert.raw_serial().to_vec()
}
