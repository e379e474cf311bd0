//! In-memory certificate cache and the known client IP set.

use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroUsize;

use chrono::Duration;
use lru::LruCache;
use sha2::{Digest, Sha256};
use tracing::{debug, error, warn};

use certgate_config::{Setting, SettingsProvider};

use super::codec::LeafCertificate;

/// Maximum number of client IPs remembered
pub const KNOWN_IPS_CAPACITY: usize = 20;

/// Rotation threshold used when the setting is missing or invalid
pub const DEFAULT_ROTATION_DAYS: i64 = 7;

/// Above this many addresses the IP key is hashed
const MAX_LISTED_IPS: usize = 5;

/// Cache key for a certificate covering `ips` (order does not matter).
///
/// - no addresses: `local/0`
/// - one address: `local/<ip>`
/// - up to five: `local/[<ip> <ip> ...]`, sorted
/// - more: `local/<sha256 hex of the sorted addresses concatenated>`
///
/// Persisted entries keyed by an MD5 digest of the addresses never match
/// these keys, so each such leaf is issued again once under the new key.
pub fn ip_key<S: AsRef<str>>(ips: &[S]) -> String {
    let mut sorted: Vec<&str> = ips.iter().map(AsRef::as_ref).collect();
    sorted.sort_unstable();

    match sorted.len() {
        0 => "local/0".to_string(),
        1 => format!("local/{}", sorted[0]),
        n if n <= MAX_LISTED_IPS => format!("local/[{}]", sorted.join(" ")),
        _ => {
            let mut hasher = Sha256::new();
            for ip in &sorted {
                hasher.update(ip.as_bytes());
            }
            format!("local/{}", hex::encode(hasher.finalize()))
        }
    }
}

/// Rotation threshold from `rotate-certs-if-expiring-in-days`.
pub fn rotation_threshold(settings: &dyn SettingsProvider) -> Duration {
    let raw = settings.value(Setting::RotateCertsIfExpiringInDays);
    match raw.trim().parse::<i64>() {
        Ok(days) if days >= 0 => Duration::days(days),
        _ => {
            error!(
                setting = %Setting::RotateCertsIfExpiringInDays,
                value = %raw,
                default_days = DEFAULT_ROTATION_DAYS,
                "Invalid rotation threshold, using default"
            );
            Duration::days(DEFAULT_ROTATION_DAYS)
        }
    }
}

/// Bounded set of client IP addresses seen on the listeners.
///
/// Re-adding a known address does not refresh its position; once full the
/// least recently added address is dropped.
#[derive(Debug)]
pub struct KnownIps {
    ips: LruCache<String, ()>,
}

impl KnownIps {
    pub fn new() -> Self {
        let capacity = NonZeroUsize::new(KNOWN_IPS_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Self {
            ips: LruCache::new(capacity),
        }
    }

    /// Record an address. Returns true if it was not already known.
    pub fn add(&mut self, ip: &str) -> bool {
        if self.ips.contains(ip) {
            return false;
        }
        self.ips.put(ip.to_string(), ());
        true
    }

    pub fn contains(&self, ip: &str) -> bool {
        self.ips.contains(ip)
    }

    pub fn len(&self) -> usize {
        self.ips.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ips.is_empty()
    }

    /// Replace the contents with `ips`, oldest first.
    pub fn load<S: AsRef<str>>(&mut self, ips: &[S]) {
        self.ips.clear();
        for ip in ips {
            self.add(ip.as_ref());
        }
    }

    /// Known addresses, sorted
    pub fn addresses(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self.ips.iter().map(|(ip, _)| ip.clone()).collect();
        addresses.sort_unstable();
        addresses
    }

    pub fn key(&self) -> String {
        ip_key(&self.addresses())
    }
}

impl Default for KnownIps {
    fn default() -> Self {
        Self::new()
    }
}

/// Generated leaf certificates keyed by SNI hostname or IP key.
///
/// Entries are replaced on rotation but never evicted.
#[derive(Debug, Default)]
pub struct CertificateCache {
    entries: HashMap<String, LeafCertificate>,
}

impl CertificateCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&LeafCertificate> {
        self.entries.get(key)
    }

    /// The entry for `key` if it stays valid for longer than `threshold`
    pub fn get_fresh(
        &self,
        key: &str,
        threshold: Duration,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Option<&LeafCertificate> {
        let leaf = self.entries.get(key)?;
        if leaf.valid_beyond(threshold, now) {
            debug!(key = %key, serial = %leaf.serial(), "Certificate cache hit");
            Some(leaf)
        } else {
            debug!(
                key = %key,
                serial = %leaf.serial(),
                expires = %leaf.not_after(),
                "Cached certificate is due for rotation"
            );
            None
        }
    }

    pub fn insert(&mut self, key: String, leaf: LeafCertificate) {
        self.entries.insert(key, leaf);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Load persisted `generated_certs` entries. Undecodable entries are
    /// skipped with a warning. Returns the number loaded.
    pub fn load_persisted(&mut self, persisted: &BTreeMap<String, String>) -> usize {
        let mut loaded = 0;
        for (key, value) in persisted {
            match LeafCertificate::decode(value) {
                Ok(leaf) => {
                    self.entries.insert(key.clone(), leaf);
                    loaded += 1;
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Skipping unreadable persisted certificate");
                }
            }
        }
        loaded
    }

    /// The persisted form of every entry
    pub fn serialize(&self) -> BTreeMap<String, String> {
        self.entries
            .iter()
            .map(|(key, leaf)| (key.clone(), leaf.encode()))
            .collect()
    }
}
