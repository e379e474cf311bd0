//! Generated leaf certificates and their persisted string form.
//!
//! A persisted certificate is `base64(DER certificate) + "#" +
//! base64(PKCS#1 DER RSA key)` using the standard alphabet with padding.

use std::fmt;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Duration, Utc};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs1KeyDer};
use rustls::sign::CertifiedKey;

use crate::error::IssuanceError;
use crate::tls::load_signing_key;

const SEPARATOR: char = '#';

/// A leaf certificate held in the certificate cache.
#[derive(Clone)]
pub struct LeafCertificate {
    cert_der: CertificateDer<'static>,
    pkcs1_key: Vec<u8>,
    certified: Arc<CertifiedKey>,
    not_after: DateTime<Utc>,
    serial: String,
}

impl LeafCertificate {
    /// Assemble from a DER certificate and a PKCS#1 DER RSA key.
    pub fn from_der(cert_der: Vec<u8>, pkcs1_key: Vec<u8>) -> Result<Self, IssuanceError> {
        let (not_after, serial) = {
            let (_, parsed) = x509_parser::parse_x509_certificate(&cert_der)
                .map_err(|e| IssuanceError::InvalidCertificate(e.to_string()))?;
            let timestamp = parsed.validity().not_after.timestamp();
            let not_after = DateTime::from_timestamp(timestamp, 0).ok_or_else(|| {
                IssuanceError::InvalidCertificate(format!("invalid expiry timestamp {}", timestamp))
            })?;
            (not_after, hex::encode(parsed.raw_serial()))
        };

        let signing_key = load_signing_key(PrivateKeyDer::Pkcs1(PrivatePkcs1KeyDer::from(
            pkcs1_key.clone(),
        )))?;
        let cert_der = CertificateDer::from(cert_der);
        let certified = Arc::new(CertifiedKey::new(vec![cert_der.clone()], signing_key));

        Ok(Self {
            cert_der,
            pkcs1_key,
            certified,
            not_after,
            serial,
        })
    }

    /// Parse the persisted `cert#key` form.
    pub fn decode(persisted: &str) -> Result<Self, IssuanceError> {
        let (cert, key) = persisted
            .split_once(SEPARATOR)
            .ok_or_else(|| IssuanceError::Malformed("missing '#' separator".to_string()))?;
        if key.contains(SEPARATOR) {
            return Err(IssuanceError::Malformed(
                "more than one '#' separator".to_string(),
            ));
        }

        let key = STANDARD
            .decode(key)
            .map_err(|e| IssuanceError::Malformed(format!("key: {}", e)))?;
        let cert = STANDARD
            .decode(cert)
            .map_err(|e| IssuanceError::Malformed(format!("certificate: {}", e)))?;

        Self::from_der(cert, key)
    }

    /// The persisted `cert#key` form
    pub fn encode(&self) -> String {
        format!(
            "{}{}{}",
            STANDARD.encode(self.cert_der.as_ref()),
            SEPARATOR,
            STANDARD.encode(&self.pkcs1_key)
        )
    }

    pub fn certified_key(&self) -> Arc<CertifiedKey> {
        Arc::clone(&self.certified)
    }

    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    pub fn pkcs1_key(&self) -> &[u8] {
        &self.pkcs1_key
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    /// Hex encoded certificate serial number
    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// Whether the remaining lifetime at `now` is more than `threshold`.
    pub fn valid_beyond(&self, threshold: Duration, now: DateTime<Utc>) -> bool {
        self.not_after - now > threshold
    }
}

impl fmt::Debug for LeafCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeafCertificate")
            .field("serial", &self.serial)
            .field("not_after", &self.not_after)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certs::issuer::tests::test_ca;

    #[test]
    fn test_persisted_form_round_trips() {
        let leaf = test_ca().issue(Some("example.com"), &[]).unwrap();

        let decoded = LeafCertificate::decode(&leaf.encode()).unwrap();

        assert_eq!(decoded.cert_der(), leaf.cert_der());
        assert_eq!(decoded.pkcs1_key(), leaf.pkcs1_key());
        assert_eq!(decoded.serial(), leaf.serial());
        assert_eq!(decoded.not_after(), leaf.not_after());
        assert_eq!(decoded.encode(), leaf.encode());
    }

    #[test]
    fn test_decoded_key_signs_identically() {
        use rustls::SignatureScheme;

        let leaf = test_ca().issue(Some("example.com"), &[]).unwrap();
        let decoded = LeafCertificate::decode(&leaf.encode()).unwrap();

        // PKCS#1 v1.5 signatures are deterministic
        let scheme = [SignatureScheme::RSA_PKCS1_SHA256];
        let a = leaf.certified_key().key.choose_scheme(&scheme).unwrap();
        let b = decoded.certified_key().key.choose_scheme(&scheme).unwrap();
        assert_eq!(a.sign(b"payload").unwrap(), b.sign(b"payload").unwrap());
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert!(matches!(
            LeafCertificate::decode("no-separator"),
            Err(IssuanceError::Malformed(_))
        ));
        assert!(matches!(
            LeafCertificate::decode("a#b#c"),
            Err(IssuanceError::Malformed(_))
        ));
        assert!(matches!(
            LeafCertificate::decode("!!!#QUJD"),
            Err(IssuanceError::Malformed(_))
        ));
        assert!(LeafCertificate::decode("QUJD#QUJD").is_err());
    }

    #[test]
    fn test_valid_beyond() {
        let leaf = test_ca().issue(Some("example.com"), &[]).unwrap();
        let now = Utc::now();

        assert!(leaf.valid_beyond(Duration::days(7), now));
        assert!(!leaf.valid_beyond(Duration::days(400), now));
    }
}
