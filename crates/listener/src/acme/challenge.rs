//! Pending HTTP-01 challenges served on the plain port.

use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, trace};

/// Path prefix the ACME server requests challenge tokens under
pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// Token to key-authorization map shared between the issuing task and the
/// plain listener. Clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct ChallengeManager {
    pending: Arc<DashMap<String, String>>,
}

impl ChallengeManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `key_authorization` under `token` until removed.
    pub fn add_challenge(&self, token: &str, key_authorization: &str) {
        debug!(token = %token, "Publishing HTTP-01 challenge");
        self.pending
            .insert(token.to_string(), key_authorization.to_string());
    }

    pub fn remove_challenge(&self, token: &str) {
        if self.pending.remove(token).is_some() {
            debug!(token = %token, "Withdrew HTTP-01 challenge");
        }
    }

    /// The key authorization for a request path, if it names a pending token
    pub fn respond(&self, path: &str) -> Option<String> {
        let token = Self::extract_token(path)?;
        let response = self.pending.get(token).map(|v| v.value().clone());
        trace!(token = %token, found = response.is_some(), "HTTP-01 challenge lookup");
        response
    }

    /// The token part of a challenge path
    pub fn extract_token(path: &str) -> Option<&str> {
        path.strip_prefix(ACME_CHALLENGE_PREFIX)
            .filter(|token| !token.is_empty() && !token.contains('/'))
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
