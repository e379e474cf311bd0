//! String settings consulted on every reload and certificate generation.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::ConfigError;

/// Default allowed cipher suites (Go naming, comma separated).
pub const DEFAULT_TLS_CIPHERS: &str = "TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,\
TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,\
TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,\
TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,\
TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305,\
TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305";

/// Settings known to the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Setting {
    /// PEM CA bundle, used when a configuration has a CA key but no CA cert
    CaCerts,
    TlsMinVersion,
    TlsCiphers,
    RotateCertsIfExpiringInDays,
}

impl Setting {
    pub const ALL: [Setting; 4] = [
        Setting::CaCerts,
        Setting::TlsMinVersion,
        Setting::TlsCiphers,
        Setting::RotateCertsIfExpiringInDays,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Setting::CaCerts => "cacerts",
            Setting::TlsMinVersion => "tls-min-version",
            Setting::TlsCiphers => "tls-ciphers",
            Setting::RotateCertsIfExpiringInDays => "rotate-certs-if-expiring-in-days",
        }
    }

    pub fn default_value(self) -> &'static str {
        match self {
            Setting::CaCerts => "",
            Setting::TlsMinVersion => "1.2",
            Setting::TlsCiphers => DEFAULT_TLS_CIPHERS,
            Setting::RotateCertsIfExpiringInDays => "7",
        }
    }

    /// Environment variable read by [`EnvSettings`], e.g. `CERTGATE_TLS_MIN_VERSION`
    pub fn env_var(self) -> String {
        format!(
            "CERTGATE_{}",
            self.name().to_ascii_uppercase().replace('-', "_")
        )
    }
}

impl fmt::Display for Setting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Setting {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Setting::ALL
            .into_iter()
            .find(|setting| setting.name() == s)
            .ok_or_else(|| ConfigError::UnknownSetting(s.to_string()))
    }
}

/// Source of string settings.
///
/// Implementations are read at call time, so a changed value takes effect on
/// the next reload or certificate generation.
pub trait SettingsProvider: Send + Sync {
    /// The configured value, if any
    fn get(&self, setting: Setting) -> Option<String>;

    /// The configured value, or the setting's default when unset or empty
    fn value(&self, setting: Setting) -> String {
        self.get(setting)
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| setting.default_value().to_string())
    }
}

/// In-memory settings.
#[derive(Debug, Default)]
pub struct StaticSettings {
    values: RwLock<HashMap<Setting, String>>,
}

impl StaticSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, setting: Setting, value: impl Into<String>) -> Self {
        self.set(setting, value);
        self
    }

    pub fn set(&self, setting: Setting, value: impl Into<String>) {
        self.values.write().insert(setting, value.into());
    }

    pub fn unset(&self, setting: Setting) {
        self.values.write().remove(&setting);
    }
}

impl From<HashMap<Setting, String>> for StaticSettings {
    fn from(values: HashMap<Setting, String>) -> Self {
        Self {
            values: RwLock::new(values),
        }
    }
}

impl SettingsProvider for StaticSettings {
    fn get(&self, setting: Setting) -> Option<String> {
        self.values.read().get(&setting).cloned()
    }
}

/// Settings from `CERTGATE_*` environment variables, falling back to a
/// second provider for anything not set in the environment.
#[derive(Debug, Default)]
pub struct EnvSettings<F = StaticSettings> {
    fallback: F,
}

impl EnvSettings<StaticSettings> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<F: SettingsProvider> EnvSettings<F> {
    pub fn with_fallback(fallback: F) -> Self {
        Self { fallback }
    }
}

impl<F: SettingsProvider> SettingsProvider for EnvSettings<F> {
    fn get(&self, setting: Setting) -> Option<String> {
        std::env::var(setting.env_var())
            .ok()
            .or_else(|| self.fallback.get(setting))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = StaticSettings::new();

        assert_eq!(settings.value(Setting::TlsMinVersion), "1.2");
        assert_eq!(settings.value(Setting::RotateCertsIfExpiringInDays), "7");
        assert_eq!(settings.value(Setting::TlsCiphers).split(',').count(), 6);
        assert!(settings.value(Setting::CaCerts).is_empty());
        assert!(settings.get(Setting::TlsMinVersion).is_none());
    }

    #[test]
    fn test_static_set_and_unset() {
        let settings = StaticSettings::new().with(Setting::TlsMinVersion, "1.3");
        assert_eq!(settings.value(Setting::TlsMinVersion), "1.3");

        settings.set(Setting::TlsMinVersion, "");
        assert_eq!(settings.value(Setting::TlsMinVersion), "1.2");

        settings.set(Setting::TlsMinVersion, "1.3");
        settings.unset(Setting::TlsMinVersion);
        assert!(settings.get(Setting::TlsMinVersion).is_none());
    }

    #[test]
    fn test_setting_names_round_trip() {
        for setting in Setting::ALL {
            assert_eq!(setting.name().parse::<Setting>().unwrap(), setting);
        }
        assert!("tls-max-version".parse::<Setting>().is_err());
    }

    #[test]
    fn test_env_var_names() {
        assert_eq!(
            Setting::RotateCertsIfExpiringInDays.env_var(),
            "CERTGATE_ROTATE_CERTS_IF_EXPIRING_IN_DAYS"
        );
        assert_eq!(Setting::CaCerts.env_var(), "CERTGATE_CACERTS");
    }

    #[test]
    fn test_env_settings_fall_back() {
        let settings = EnvSettings::with_fallback(
            StaticSettings::new().with(Setting::CaCerts, "-----BEGIN CERTIFICATE-----"),
        );
        // CERTGATE_CACERTS is not set in the test environment
        assert_eq!(
            settings.value(Setting::CaCerts),
            "-----BEGIN CERTIFICATE-----"
        );
    }
}
