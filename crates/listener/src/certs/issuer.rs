//! Leaf certificate issuance from a configured certificate authority.

use std::fmt;
use std::net::IpAddr;

use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
    KeyUsagePurpose, PublicKeyData, SanType,
};
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey};
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use time::OffsetDateTime;
use tracing::debug;

use super::codec::LeafCertificate;
use crate::error::IssuanceError;

/// Common name used when the client sent no SNI
pub const PLACEHOLDER_CN: &str = "certgate";

/// Leaf certificates are valid for one year from issuance
const LEAF_VALIDITY_DAYS: i64 = 365;

/// A CA certificate and key able to sign leaf certificates.
pub struct CaIssuer {
    issuer: Issuer<'static, KeyPair>,
    organization: Vec<String>,
    cert_der: CertificateDer<'static>,
}

impl CaIssuer {
    /// Load from PEM. The key may be PKCS#8 or PKCS#1 (RSA).
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, String> {
        let cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .next()
            .ok_or_else(|| "no certificate found in PEM".to_string())?
            .map_err(|e| format!("failed to parse certificate PEM: {}", e))?;

        let key_pair = load_key_pair(key_pem)?;

        let organization = {
            let (_, parsed) = x509_parser::parse_x509_certificate(cert_der.as_ref())
                .map_err(|e| format!("invalid X509 certificate: {}", e))?;
            if parsed.public_key().raw != key_pair.subject_public_key_info().as_slice() {
                return Err("private key does not match CA certificate".to_string());
            }
            parsed
                .subject()
                .iter_organization()
                .filter_map(|attr| attr.as_str().ok())
                .map(str::to_string)
                .collect::<Vec<_>>()
        };

        let issuer = Issuer::from_ca_cert_der(&cert_der, key_pair)
            .map_err(|e| format!("failed to read issuer from certificate: {}", e))?;

        Ok(Self {
            issuer,
            organization,
            cert_der,
        })
    }

    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    /// Organization names copied into every leaf subject
    pub fn organization(&self) -> &[String] {
        &self.organization
    }

    /// Sign a new leaf with a fresh 2048-bit RSA key.
    ///
    /// The leaf's common name and DNS SAN are `common_name`, or
    /// [`PLACEHOLDER_CN`] when absent; every address in `ips` becomes an IP
    /// SAN.
    pub fn issue(
        &self,
        common_name: Option<&str>,
        ips: &[IpAddr],
    ) -> Result<LeafCertificate, IssuanceError> {
        let cn = common_name.filter(|n| !n.is_empty()).unwrap_or(PLACEHOLDER_CN);

        let mut params = CertificateParams::default();
        params.is_ca = IsCa::NoCa;
        params.use_authority_key_identifier_extension = true;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let mut distinguished_name = DistinguishedName::new();
        distinguished_name.push(DnType::CommonName, cn.to_string());
        for org in &self.organization {
            distinguished_name.push(DnType::OrganizationName, org.clone());
        }
        params.distinguished_name = distinguished_name;

        params.subject_alt_names.push(SanType::DnsName(cn.try_into()?));
        params
            .subject_alt_names
            .extend(ips.iter().map(|ip| SanType::IpAddress(*ip)));

        let now = OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + time::Duration::days(LEAF_VALIDITY_DAYS);

        let leaf_key = KeyPair::generate_for(&rcgen::PKCS_RSA_SHA256)?;
        let cert = params.signed_by(&leaf_key, &self.issuer)?;

        let pkcs1_key = RsaPrivateKey::from_pkcs8_der(&leaf_key.serialize_der())
            .map_err(|e| IssuanceError::KeyEncoding(e.to_string()))?
            .to_pkcs1_der()
            .map_err(|e| IssuanceError::KeyEncoding(e.to_string()))?
            .as_bytes()
            .to_vec();

        let leaf = LeafCertificate::from_der(cert.der().to_vec(), pkcs1_key)?;
        debug!(
            common_name = %cn,
            ip_sans = ips.len(),
            serial = %leaf.serial(),
            expires = %leaf.not_after(),
            "Issued leaf certificate"
        );
        Ok(leaf)
    }
}

impl fmt::Debug for CaIssuer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaIssuer")
            .field("organization", &self.organization)
            .finish()
    }
}

fn load_key_pair(key_pem: &str) -> Result<KeyPair, String> {
    let key = rustls_pemfile::private_key(&mut key_pem.as_bytes())
        .map_err(|e| format!("failed to parse key PEM: {}", e))?
        .ok_or_else(|| "no private key found in PEM".to_string())?;

    match key {
        PrivateKeyDer::Pkcs8(_) => {
            KeyPair::from_pem(key_pem).map_err(|e| format!("unsupported PKCS#8 key: {}", e))
        }
        PrivateKeyDer::Pkcs1(pkcs1) => {
            let rsa_key = RsaPrivateKey::from_pkcs1_der(pkcs1.secret_pkcs1_der())
                .map_err(|e| format!("invalid PKCS#1 RSA key: {}", e))?;
            let pkcs8_pem = rsa_key
                .to_pkcs8_pem(LineEnding::LF)
                .map_err(|e| format!("failed to re-encode RSA key: {}", e))?;
            KeyPair::from_pem(&pkcs8_pem).map_err(|e| format!("unsupported RSA key: {}", e))
        }
        _ => Err("unsupported private key format, expected PKCS#8 or PKCS#1".to_string()),
    }
}
