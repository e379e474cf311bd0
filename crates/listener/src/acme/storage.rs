//! Directory cache for ACME account credentials and issued certificates.
//!
//! ```text
//! certs-cache/
//! ├── credentials.json      # instant-acme AccountCredentials
//! └── domains/
//!     └── example.com/
//!         ├── cert.pem      # certificate chain
//!         ├── key.pem       # private key (0600)
//!         └── meta.json     # expiry and issue time
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

use super::error::StorageError;

const CREDENTIALS_FILE: &str = "credentials.json";
const DOMAINS_DIR: &str = "domains";

/// Metadata written next to each certificate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateMeta {
    pub expires: DateTime<Utc>,
    pub issued: DateTime<Utc>,
    pub domain: String,
    /// Directory URL of the issuing CA
    #[serde(default)]
    pub directory: Option<String>,
}

/// A certificate read back from the cache
#[derive(Debug, Clone)]
pub struct StoredCertificate {
    pub cert_pem: String,
    pub key_pem: String,
    pub meta: CertificateMeta,
}

impl StoredCertificate {
    /// Whether the certificate expires within `renew_before_days`
    pub fn needs_renewal(&self, renew_before_days: u32, now: DateTime<Utc>) -> bool {
        self.meta.expires <= now + chrono::Duration::days(i64::from(renew_before_days))
    }
}

/// Filesystem certificate cache with owner-only permissions.
#[derive(Debug)]
pub struct CertificateStorage {
    base_path: PathBuf,
}

impl CertificateStorage {
    /// Open the cache at `base_path`, creating it (mode 0700) if needed.
    pub fn new(base_path: &Path) -> Result<Self, StorageError> {
        let domains_path = base_path.join(DOMAINS_DIR);
        fs::create_dir_all(&domains_path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o700);
            fs::set_permissions(base_path, perms.clone())?;
            fs::set_permissions(&domains_path, perms)?;
        }

        info!(path = %base_path.display(), "Opened ACME certificate cache");

        Ok(Self {
            base_path: base_path.to_path_buf(),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn load_credentials_json(&self) -> Result<Option<String>, StorageError> {
        let path = self.base_path.join(CREDENTIALS_FILE);
        if !path.exists() {
            trace!("No cached ACME account credentials");
            return Ok(None);
        }
        Ok(Some(fs::read_to_string(path)?))
    }

    pub fn save_credentials_json(&self, json: &str) -> Result<(), StorageError> {
        let path = self.base_path.join(CREDENTIALS_FILE);
        write_private(&path, json)?;
        info!("Saved ACME account credentials");
        Ok(())
    }

    fn domain_path(&self, domain: &str) -> Result<PathBuf, StorageError> {
        let valid = !domain.is_empty()
            && domain != "."
            && domain != ".."
            && !domain.contains(['/', '\\', '\0']);
        if !valid {
            return Err(StorageError::InvalidDomain(domain.to_string()));
        }
        Ok(self.base_path.join(DOMAINS_DIR).join(domain))
    }

    pub fn load_certificate(&self, domain: &str) -> Result<Option<StoredCertificate>, StorageError> {
        let dir = self.domain_path(domain)?;
        let cert_path = dir.join("cert.pem");
        if !cert_path.exists() {
            trace!(domain = %domain, "No cached certificate");
            return Ok(None);
        }

        let cert_pem = fs::read_to_string(&cert_path)?;
        let key_pem = fs::read_to_string(dir.join("key.pem"))?;
        let meta: CertificateMeta = serde_json::from_str(&fs::read_to_string(dir.join("meta.json"))?)?;

        debug!(domain = %domain, expires = %meta.expires, "Loaded cached certificate");
        Ok(Some(StoredCertificate {
            cert_pem,
            key_pem,
            meta,
        }))
    }

    pub fn save_certificate(
        &self,
        domain: &str,
        cert_pem: &str,
        key_pem: &str,
        expires: DateTime<Utc>,
        directory: Option<&str>,
    ) -> Result<(), StorageError> {
        let dir = self.domain_path(domain)?;
        fs::create_dir_all(&dir)?;

        fs::write(dir.join("cert.pem"), cert_pem)?;
        write_private(&dir.join("key.pem"), key_pem)?;

        let meta = CertificateMeta {
            expires,
            issued: Utc::now(),
            domain: domain.to_string(),
            directory: directory.map(str::to_string),
        };
        fs::write(dir.join("meta.json"), serde_json::to_string_pretty(&meta)?)?;

        info!(domain = %domain, expires = %expires, "Cached issued certificate");
        Ok(())
    }

    /// True when no certificate is cached or it expires within
    /// `renew_before_days`.
    pub fn needs_renewal(&self, domain: &str, renew_before_days: u32) -> Result<bool, StorageError> {
        Ok(match self.load_certificate(domain)? {
            Some(cert) => cert.needs_renewal(renew_before_days, Utc::now()),
            None => true,
        })
    }
}

fn write_private(path: &Path, content: &str) -> Result<(), StorageError> {
    fs::write(path, content)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup_storage() -> (TempDir, CertificateStorage) {
        let temp_dir = TempDir::new().unwrap();
        let storage = CertificateStorage::new(&temp_dir.path().join("certs-cache")).unwrap();
        (temp_dir, storage)
    }

    #[test]
    fn test_creates_layout() {
        let (_dir, storage) = setup_storage();
        assert!(storage.base_path().join("domains").is_dir());
        assert!(storage.load_certificate("example.com").unwrap().is_none());
    }

    #[test]
    fn test_credentials_round_trip() {
        let (_dir, storage) = setup_storage();
        assert!(storage.load_credentials_json().unwrap().is_none());

        storage.save_credentials_json(r#"{"id":"acct"}"#).unwrap();
        assert_eq!(
            storage.load_credentials_json().unwrap().as_deref(),
            Some(r#"{"id":"acct"}"#)
        );
    }

    #[test]
    fn test_certificate_round_trip() {
        let (_dir, storage) = setup_storage();
        let expires = Utc::now() + chrono::Duration::days(90);

        storage
            .save_certificate("example.com", "CERT", "KEY", expires, None)
            .unwrap();

        let loaded = storage.load_certificate("example.com").unwrap().unwrap();
        assert_eq!(loaded.cert_pem, "CERT");
        assert_eq!(loaded.key_pem, "KEY");
        assert_eq!(loaded.meta.domain, "example.com");
        assert!(storage.base_path().join("domains/example.com").is_dir());
    }

    #[test]
    fn test_needs_renewal() {
        let (_dir, storage) = setup_storage();
        assert!(storage.needs_renewal("missing.com", 30).unwrap());

        storage
            .save_certificate(
                "soon.com",
                "c",
                "k",
                Utc::now() + chrono::Duration::days(15),
                None,
            )
            .unwrap();
        storage
            .save_certificate(
                "later.com",
                "c",
                "k",
                Utc::now() + chrono::Duration::days(60),
                None,
            )
            .unwrap();

        assert!(storage.needs_renewal("soon.com", 30).unwrap());
        assert!(!storage.needs_renewal("later.com", 30).unwrap());
    }

    #[test]
    fn test_rejects_path_like_domains() {
        let (_dir, storage) = setup_storage();
        for domain in ["", "..", "a/b", "..\\x"] {
            assert!(matches!(
                storage.load_certificate(domain),
                Err(StorageError::InvalidDomain(_))
            ));
        }
    }
}
