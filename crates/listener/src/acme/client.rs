//! ACME protocol operations on top of instant-acme.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, Order, OrderStatus,
};
use tokio::sync::RwLock;
use tracing::{debug, error, info, trace};

use super::challenge::ChallengeManager;
use super::error::AcmeError;
use super::manager::AcmePolicy;
use super::storage::CertificateStorage;

/// Time allowed for the CA to validate challenges
const CHALLENGE_TIMEOUT: Duration = Duration::from_secs(120);
/// Time allowed for the CA to issue after finalization
const ISSUE_TIMEOUT: Duration = Duration::from_secs(60);
/// Time allowed for fetching the directory document
const DIRECTORY_TIMEOUT: Duration = Duration::from_secs(30);

/// A certificate returned by the CA
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    pub cert_pem: String,
    pub key_pem: String,
    pub expires: DateTime<Utc>,
}

/// ACME account holder able to order single-domain certificates.
pub struct AcmeClient {
    account: RwLock<Option<Account>>,
    directory_url: String,
    email: Option<String>,
    storage: Arc<CertificateStorage>,
    http: reqwest::Client,
}

impl AcmeClient {
    pub fn new(
        directory_url: impl Into<String>,
        email: Option<String>,
        storage: Arc<CertificateStorage>,
    ) -> Self {
        Self {
            account: RwLock::new(None),
            directory_url: directory_url.into(),
            email,
            storage,
            http: reqwest::Client::new(),
        }
    }

    pub fn directory_url(&self) -> &str {
        &self.directory_url
    }

    /// The `meta.termsOfService` URL advertised by the directory, if any.
    pub async fn terms_of_service(&self) -> Result<Option<String>, AcmeError> {
        let directory_error = |message: String| AcmeError::Directory {
            url: self.directory_url.clone(),
            message,
        };

        let directory: serde_json::Value = self
            .http
            .get(&self.directory_url)
            .timeout(DIRECTORY_TIMEOUT)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| directory_error(e.to_string()))?
            .json()
            .await
            .map_err(|e| directory_error(e.to_string()))?;

        Ok(directory
            .pointer("/meta/termsOfService")
            .and_then(|v| v.as_str())
            .map(str::to_string))
    }

    /// Load the cached account, or register a new one once `policy`
    /// accepts the directory's terms of service.
    pub async fn init_account(&self, policy: &dyn AcmePolicy) -> Result<(), AcmeError> {
        let mut slot = self.account.write().await;
        if slot.is_some() {
            return Ok(());
        }

        if let Some(json) = self.storage.load_credentials_json()? {
            let credentials: AccountCredentials = serde_json::from_str(&json).map_err(|e| {
                AcmeError::AccountCreation(format!("Failed to deserialize credentials: {}", e))
            })?;
            let account = Account::builder()
                .map_err(|e| AcmeError::AccountCreation(e.to_string()))?
                .from_credentials(credentials)
                .await
                .map_err(|e| AcmeError::AccountCreation(e.to_string()))?;

            info!(directory = %self.directory_url, "Loaded ACME account from cache");
            *slot = Some(account);
            return Ok(());
        }

        if let Some(tos) = self.terms_of_service().await? {
            if !policy.accepts_tos(&tos).await {
                return Err(AcmeError::TermsNotAccepted(tos));
            }
            debug!(terms_of_service = %tos, "Terms of service accepted");
        }

        info!(
            directory = %self.directory_url,
            email = ?self.email,
            "Registering ACME account"
        );

        let contact = self.email.as_ref().map(|email| format!("mailto:{}", email));
        let contact: Vec<&str> = contact.iter().map(String::as_str).collect();

        let (account, credentials) = Account::builder()
            .map_err(|e| AcmeError::AccountCreation(e.to_string()))?
            .create(
                &NewAccount {
                    contact: &contact,
                    terms_of_service_agreed: true,
                    only_return_existing: false,
                },
                self.directory_url.clone(),
                None,
            )
            .await
            .map_err(|e| AcmeError::AccountCreation(e.to_string()))?;

        let json = serde_json::to_string_pretty(&credentials).map_err(|e| {
            AcmeError::AccountCreation(format!("Failed to serialize credentials: {}", e))
        })?;
        self.storage.save_credentials_json(&json)?;

        *slot = Some(account);
        Ok(())
    }

    /// Order, validate and download a certificate for `domain`, publishing
    /// HTTP-01 tokens through `challenges` while the order is pending.
    pub async fn issue(
        &self,
        domain: &str,
        challenges: &ChallengeManager,
    ) -> Result<IssuedCertificate, AcmeError> {
        let guard = self.account.read().await;
        let account = guard.as_ref().ok_or(AcmeError::NoAccount)?;

        info!(domain = %domain, "Ordering certificate");
        let identifiers = [Identifier::Dns(domain.to_string())];
        let mut order = account
            .new_order(&NewOrder::new(&identifiers))
            .await
            .map_err(|e| AcmeError::OrderCreation(e.to_string()))?;

        let mut tokens = Vec::new();
        let published = self
            .publish_challenges(&mut order, domain, challenges, &mut tokens)
            .await;

        let result = match published {
            Ok(()) => self.complete_order(&mut order, domain).await,
            Err(e) => Err(e),
        };

        for token in &tokens {
            challenges.remove_challenge(token);
        }
        result
    }

    async fn publish_challenges(
        &self,
        order: &mut Order,
        domain: &str,
        challenges: &ChallengeManager,
        tokens: &mut Vec<String>,
    ) -> Result<(), AcmeError> {
        let mut authorizations = order.authorizations();
        while let Some(result) = authorizations.next().await {
            let mut authz = result.map_err(|e| AcmeError::ChallengeValidation {
                domain: domain.to_string(),
                message: format!("Failed to get authorization: {}", e),
            })?;

            if authz.status == AuthorizationStatus::Valid {
                debug!(domain = %domain, "Authorization already valid");
                continue;
            }

            let mut challenge = authz
                .challenge(ChallengeType::Http01)
                .ok_or_else(|| AcmeError::NoHttp01Challenge(domain.to_string()))?;

            let key_authorization = challenge.key_authorization();
            challenges.add_challenge(&challenge.token, key_authorization.as_str());
            tokens.push(challenge.token.clone());

            challenge
                .set_ready()
                .await
                .map_err(|e| AcmeError::ChallengeValidation {
                    domain: domain.to_string(),
                    message: e.to_string(),
                })?;
        }
        Ok(())
    }

    async fn complete_order(
        &self,
        order: &mut Order,
        domain: &str,
    ) -> Result<IssuedCertificate, AcmeError> {
        let deadline = tokio::time::Instant::now() + CHALLENGE_TIMEOUT;
        loop {
            let state = order
                .refresh()
                .await
                .map_err(|e| AcmeError::OrderCreation(format!("Failed to refresh order: {}", e)))?;

            match state.status {
                OrderStatus::Ready | OrderStatus::Valid => break,
                OrderStatus::Invalid => {
                    error!(domain = %domain, "Order became invalid");
                    return Err(AcmeError::ChallengeValidation {
                        domain: domain.to_string(),
                        message: "order became invalid".to_string(),
                    });
                }
                OrderStatus::Pending | OrderStatus::Processing => {
                    if tokio::time::Instant::now() > deadline {
                        return Err(AcmeError::Timeout(format!(
                            "challenge validation for {}",
                            domain
                        )));
                    }
                    trace!(domain = %domain, status = ?state.status, "Waiting for validation");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }

        let cert_key = rcgen::KeyPair::generate()
            .map_err(|e| AcmeError::Finalization(format!("Failed to generate key: {}", e)))?;
        let csr = rcgen::CertificateParams::new(vec![domain.to_string()])
            .and_then(|params| params.serialize_request(&cert_key))
            .map_err(|e| AcmeError::Finalization(format!("Failed to build CSR: {}", e)))?;

        order
            .finalize_csr(csr.der())
            .await
            .map_err(|e| AcmeError::Finalization(format!("Failed to finalize order: {}", e)))?;

        let deadline = tokio::time::Instant::now() + ISSUE_TIMEOUT;
        let cert_pem = loop {
            let state = order
                .refresh()
                .await
                .map_err(|e| AcmeError::Finalization(format!("Failed to refresh order: {}", e)))?;

            match state.status {
                OrderStatus::Valid => {
                    let chain = order.certificate().await.map_err(|e| {
                        AcmeError::Finalization(format!("Failed to download certificate: {}", e))
                    })?;
                    break chain.ok_or_else(|| {
                        AcmeError::Finalization("No certificate in response".to_string())
                    })?;
                }
                OrderStatus::Invalid => {
                    return Err(AcmeError::Finalization("Order became invalid".to_string()));
                }
                _ => {
                    if tokio::time::Instant::now() > deadline {
                        return Err(AcmeError::Timeout(format!("issuance for {}", domain)));
                    }
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        };

        let expires = certificate_expiry(&cert_pem)?;
        info!(domain = %domain, expires = %expires, "Certificate issued");

        Ok(IssuedCertificate {
            cert_pem,
            key_pem: cert_key.serialize_pem(),
            expires,
        })
    }
}

/// Expiry of the first certificate in a PEM chain
pub fn certificate_expiry(cert_pem: &str) -> Result<DateTime<Utc>, AcmeError> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(cert_pem.as_bytes())
        .map_err(|e| AcmeError::CertificateParse(format!("Failed to parse PEM: {}", e)))?;
    let cert = pem
        .parse_x509()
        .map_err(|e| AcmeError::CertificateParse(format!("Failed to parse certificate: {}", e)))?;

    let timestamp = cert.validity().not_after.timestamp();
    DateTime::from_timestamp(timestamp, 0)
        .ok_or_else(|| AcmeError::CertificateParse("Invalid expiry timestamp".to_string()))
}

impl std::fmt::Debug for AcmeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcmeClient")
            .field("directory_url", &self.directory_url)
            .field("email", &self.email)
            .field(
                "has_account",
                &self
                    .account
                    .try_read()
                    .map(|a| a.is_some())
                    .unwrap_or(false),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_certificate_expiry() {
        let mut params = rcgen::CertificateParams::new(vec!["example.com".to_string()]).unwrap();
        params.not_after = rcgen::date_time_ymd(2031, 6, 1);
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();

        let expires = certificate_expiry(&cert.pem()).unwrap();
        assert_eq!(expires.to_rfc3339(), "2031-06-01T00:00:00+00:00");
    }

    #[test]
    fn test_certificate_expiry_rejects_garbage() {
        assert!(matches!(
            certificate_expiry("not a certificate"),
            Err(AcmeError::CertificateParse(_))
        ));
    }
}
