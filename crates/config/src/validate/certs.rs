//! Certificate validation
//!
//! Validates the PEM material carried by a listener configuration and
//! derives the informational metadata stored alongside it.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use std::net::IpAddr;
use x509_parser::certificate::X509Certificate;

use super::{ErrorCategory, ValidationError, ValidationResult, ValidationWarning};
use crate::listener::{CertificateMetadata, ListenerConfiguration, ListenerMode};

/// Certificates expiring within this window produce a warning
const EXPIRY_WARNING_DAYS: i64 = 30;

/// Validate a listener configuration
pub fn validate_listener_configuration(config: &ListenerConfiguration) -> ValidationResult {
    validate_at(config, Utc::now())
}

fn validate_at(config: &ListenerConfiguration, now: DateTime<Utc>) -> ValidationResult {
    let mut result = ValidationResult::new();
    let id = config.config_ref();

    match (config.cert.is_empty(), config.key.is_empty()) {
        (false, false) => {
            check_certificate(&mut result, "cert", &config.cert, now);
            if let Err(e) = check_private_key(&config.key) {
                result.add_error(ValidationError::new(
                    ErrorCategory::Certificate,
                    format!("{}: key: {}", id, e),
                ));
            }
        }
        (false, true) => result.add_error(ValidationError::new(
            ErrorCategory::Certificate,
            format!("{}: cert is set but key is empty", id),
        )),
        (true, false) => result.add_error(ValidationError::new(
            ErrorCategory::Certificate,
            format!("{}: key is set but cert is empty", id),
        )),
        (true, true) => {}
    }

    if !config.ca_cert.is_empty() {
        check_certificate(&mut result, "ca_cert", &config.ca_cert, now);
        if config.ca_key.is_empty() {
            result.add_warning(ValidationWarning::new(format!(
                "{}: ca_cert without ca_key cannot sign leaf certificates",
                id
            )));
        }
    } else if !config.ca_key.is_empty() {
        result.add_warning(ValidationWarning::new(format!(
            "{}: ca_key without ca_cert, the cacerts setting will be used as CA certificate",
            id
        )));
    }
    if !config.ca_key.is_empty() {
        if let Err(e) = check_private_key(&config.ca_key) {
            result.add_error(ValidationError::new(
                ErrorCategory::Certificate,
                format!("{}: ca_key: {}", id, e),
            ));
        }
    }

    if config.mode == ListenerMode::Acme {
        if config.domains.is_empty() {
            result.add_error(ValidationError::new(
                ErrorCategory::Logic,
                format!("{}: acme mode requires at least one domain", id),
            ));
        }
        if config.domains.iter().any(|d| d.trim().is_empty()) {
            result.add_error(ValidationError::new(
                ErrorCategory::Logic,
                format!("{}: domains must not contain empty names", id),
            ));
        }
    }

    for ip in &config.known_ips {
        if ip.parse::<IpAddr>().is_err() {
            result.add_error(ValidationError::new(
                ErrorCategory::Network,
                format!("{}: known IP '{}' is not an IP address", id, ip),
            ));
        }
    }

    for (key, value) in &config.generated_certs {
        if !is_persisted_cert(value) {
            result.add_error(ValidationError::new(
                ErrorCategory::Certificate,
                format!(
                    "{}: generated certificate '{}' is not in base64(cert)#base64(key) form",
                    id, key
                ),
            ));
        }
    }

    result
}

fn is_persisted_cert(value: &str) -> bool {
    match value.split_once('#') {
        Some((cert, key)) => STANDARD.decode(cert).is_ok() && STANDARD.decode(key).is_ok(),
        None => false,
    }
}

fn check_certificate(result: &mut ValidationResult, field: &str, pem_text: &str, now: DateTime<Utc>) {
    let der = match first_certificate_der(pem_text) {
        Ok(der) => der,
        Err(e) => {
            result.add_error(ValidationError::new(
                ErrorCategory::Certificate,
                format!("{}: {}", field, e),
            ));
            return;
        }
    };

    let cert = match x509_parser::parse_x509_certificate(&der) {
        Ok((_, cert)) => cert,
        Err(e) => {
            result.add_error(ValidationError::new(
                ErrorCategory::Certificate,
                format!("{}: invalid X509 certificate: {}", field, e),
            ));
            return;
        }
    };

    let Some(expires_at) = not_after(&cert) else {
        return;
    };
    if expires_at < now {
        result.add_error(ValidationError::new(
            ErrorCategory::Certificate,
            format!(
                "{}: certificate expired (expired at {})",
                field,
                cert.validity().not_after
            ),
        ));
    } else if expires_at < now + Duration::days(EXPIRY_WARNING_DAYS) {
        result.add_warning(ValidationWarning::new(format!(
            "{}: certificate expires soon (expires at {})",
            field,
            cert.validity().not_after
        )));
    }
}

fn check_private_key(pem_text: &str) -> Result<(), String> {
    match rustls_pemfile::private_key(&mut pem_text.as_bytes()) {
        Ok(Some(_)) => Ok(()),
        Ok(None) => Err("no private key found in PEM".to_string()),
        Err(e) => Err(format!("failed to parse PEM: {}", e)),
    }
}

/// DER bytes of the first CERTIFICATE block in `pem_text`
pub fn first_certificate_der(pem_text: &str) -> Result<Vec<u8>, String> {
    let blocks = pem::parse_many(pem_text).map_err(|e| format!("failed to parse PEM: {}", e))?;
    blocks
        .into_iter()
        .find(|block| block.tag() == "CERTIFICATE")
        .map(|block| block.into_contents())
        .ok_or_else(|| "no CERTIFICATE block found in PEM".to_string())
}

fn not_after(cert: &X509Certificate<'_>) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(cert.validity().not_after.timestamp(), 0)
}

fn describe(pem_text: &str) -> Option<(String, String, Option<DateTime<Utc>>)> {
    let der = first_certificate_der(pem_text).ok()?;
    let (_, cert) = x509_parser::parse_x509_certificate(&der).ok()?;
    let fingerprint = hex::encode(Sha256::digest(&der));
    let serial = hex::encode(cert.raw_serial());
    Some((fingerprint, serial, not_after(&cert)))
}

/// Compute the informational metadata for a configuration's certificates.
///
/// Unparsable material yields empty fields rather than an error.
pub fn derive_metadata(config: &ListenerConfiguration) -> CertificateMetadata {
    let mut metadata = CertificateMetadata::default();

    if let Some((fingerprint, serial, expires_at)) = describe(&config.cert) {
        metadata.cert_fingerprint = Some(fingerprint);
        metadata.cert_serial = Some(serial);
        metadata.cert_expires_at = expires_at;
    }
    if let Some((fingerprint, _, expires_at)) = describe(&config.ca_cert) {
        metadata.ca_fingerprint = Some(fingerprint);
        metadata.ca_expires_at = expires_at;
    }

    metadata
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{CertificateParams, KeyPair};

    fn pem_pair(days_valid: i64) -> (String, String) {
        let mut params = CertificateParams::new(vec!["example.com".to_string()]).unwrap();
        let now = time::OffsetDateTime::now_utc();
        params.not_before = now - time::Duration::days(1);
        params.not_after = now + time::Duration::days(days_valid);
        let key = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        (cert.pem(), key.serialize_pem())
    }

    #[test]
    fn test_valid_static_certificate() {
        let (cert, key) = pem_pair(365);
        let mut config = ListenerConfiguration::new("static", ListenerMode::StaticTls);
        config.cert = cert;
        config.key = key;

        let result = validate_listener_configuration(&config);
        assert!(result.is_valid(), "{:?}", result.errors);
        assert!(!result.has_warnings());
    }

    #[test]
    fn test_cert_without_key() {
        let (cert, _) = pem_pair(365);
        let mut config = ListenerConfiguration::new("static", ListenerMode::StaticTls);
        config.cert = cert;

        let result = validate_listener_configuration(&config);
        assert!(result
            .errors
            .iter()
            .any(|e| e.message.contains("key is empty")));
    }

    #[test]
    fn test_expiring_certificate_warns() {
        let (cert, key) = pem_pair(10);
        let mut config = ListenerConfiguration::new("static", ListenerMode::StaticTls);
        config.cert = cert;
        config.key = key;

        let result = validate_listener_configuration(&config);
        assert!(result.is_valid());
        assert!(result.warnings[0].message.contains("expires soon"));
    }

    #[test]
    fn test_expired_certificate_is_error() {
        let (cert, key) = pem_pair(10);
        let mut config = ListenerConfiguration::new("static", ListenerMode::StaticTls);
        config.cert = cert;
        config.key = key;

        let result = validate_at(&config, Utc::now() + Duration::days(20));
        assert!(result
            .errors
            .iter()
            .any(|e| e.message.contains("certificate expired")));
    }

    #[test]
    fn test_garbage_pem() {
        let mut config = ListenerConfiguration::new("static", ListenerMode::StaticTls);
        config.cert = "not a certificate".to_string();
        config.key = "not a key".to_string();

        let result = validate_listener_configuration(&config);
        assert_eq!(result.errors.len(), 2);
        assert!(result.into_result().is_err());
    }

    #[test]
    fn test_acme_requires_domains() {
        let config = ListenerConfiguration::new("acme", ListenerMode::Acme);
        let result = validate_listener_configuration(&config);
        assert_eq!(result.errors[0].category, ErrorCategory::Logic);
    }

    #[test]
    fn test_known_ips_and_generated_certs() {
        let mut config = ListenerConfiguration::new("static", ListenerMode::StaticTls);
        config.known_ips = vec!["10.0.0.1".to_string(), "fe80::1".to_string()];
        config
            .generated_certs
            .insert("local/0".to_string(), "QUJD#REVG".to_string());
        assert!(validate_listener_configuration(&config).is_valid());

        config.known_ips.push("not-an-ip".to_string());
        config
            .generated_certs
            .insert("example.com".to_string(), "no-separator".to_string());
        let result = validate_listener_configuration(&config);
        assert_eq!(result.errors.len(), 2);
    }

    #[test]
    fn test_ca_key_without_cert_warns() {
        let (_, key) = pem_pair(365);
        let mut config = ListenerConfiguration::new("static", ListenerMode::StaticTls);
        config.ca_key = key;

        let result = validate_listener_configuration(&config);
        assert!(result.is_valid());
        assert!(result.warnings[0].message.contains("cacerts"));
    }

    #[test]
    fn test_derive_metadata() {
        let (cert, key) = pem_pair(365);
        let mut config = ListenerConfiguration::new("static", ListenerMode::StaticTls);
        config.cert = cert.clone();
        config.key = key;
        config.ca_cert = cert;
        config.refresh_metadata();

        let metadata = &config.metadata;
        assert_eq!(metadata.cert_fingerprint.as_ref().map(|f| f.len()), Some(64));
        assert_eq!(metadata.cert_fingerprint, metadata.ca_fingerprint);
        assert!(metadata.cert_serial.is_some());
        assert!(metadata.cert_expires_at.unwrap() > Utc::now() + Duration::days(300));
    }

    #[test]
    fn test_derive_metadata_ignores_garbage() {
        let mut config = ListenerConfiguration::new("static", ListenerMode::StaticTls);
        config.cert = "garbage".to_string();
        assert_eq!(derive_metadata(&config), CertificateMetadata::default());
    }
}
