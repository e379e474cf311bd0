//! `server`, `acme` and `settings` block parsing.

use anyhow::Result;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::trace;

use crate::server::*;
use crate::settings::Setting;

use super::helpers::{get_bool_entry, get_int_entry, get_string_entry, value_to_string};

fn port(node: &kdl::KdlNode, name: &str, default: u16) -> Result<u16> {
    match get_int_entry(node, name) {
        None => Ok(default),
        Some(v) => u16::try_from(v)
            .map_err(|_| anyhow::anyhow!("'{}' must be a port number (0-65535), got {}", name, v)),
    }
}

/// Parse server configuration block
pub fn parse_server_config(node: &kdl::KdlNode) -> Result<ServerConfig> {
    trace!("Parsing server configuration block");

    let reconcile_interval_secs = match get_int_entry(node, "reconcile-interval-secs") {
        None => default_reconcile_interval(),
        Some(v) if v > 0 => v as u64,
        Some(v) => {
            return Err(anyhow::anyhow!(
                "'reconcile-interval-secs' must be positive, got {}",
                v
            ))
        }
    };

    let config = ServerConfig {
        http_port: port(node, "http-port", default_http_port())?,
        https_port: port(node, "https-port", default_https_port())?,
        bind_loopback: get_bool_entry(node, "bind-loopback").unwrap_or(false),
        reconcile_interval_secs,
        store: get_string_entry(node, "store")
            .map(PathBuf::from)
            .unwrap_or_else(default_store_path),
    };

    trace!(
        http_port = config.http_port,
        https_port = config.https_port,
        bind_loopback = config.bind_loopback,
        store = %config.store.display(),
        "Parsed server configuration"
    );

    Ok(config)
}

/// Parse acme configuration block
pub fn parse_acme_config(node: &kdl::KdlNode) -> Result<AcmeConfig> {
    trace!("Parsing acme configuration block");

    let renew_before_days = match get_int_entry(node, "renew-before-days") {
        None => default_renew_before_days(),
        Some(v) if (1..=89).contains(&v) => v as u32,
        Some(v) => {
            return Err(anyhow::anyhow!(
                "'renew-before-days' must be between 1 and 89, got {}",
                v
            ))
        }
    };

    let config = AcmeConfig {
        email: get_string_entry(node, "email"),
        staging: get_bool_entry(node, "staging").unwrap_or(false),
        directory_url: get_string_entry(node, "directory-url"),
        cache_dir: get_string_entry(node, "cache-dir")
            .map(PathBuf::from)
            .unwrap_or_else(default_cache_dir),
        renew_before_days,
    };

    trace!(
        staging = config.staging,
        cache_dir = %config.cache_dir.display(),
        renew_before_days = config.renew_before_days,
        "Parsed acme configuration"
    );

    Ok(config)
}

/// Parse settings block. Each child is `<setting-name> <value>`.
pub fn parse_settings(node: &kdl::KdlNode) -> Result<HashMap<String, String>> {
    trace!("Parsing settings block");
    let mut settings = HashMap::new();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            let name = child.name().value();
            let setting: Setting = name.parse().map_err(|_| {
                anyhow::anyhow!(
                    "Unknown setting '{}'. Valid settings: {}",
                    name,
                    Setting::ALL.map(|s| s.name()).join(", ")
                )
            })?;

            let value = child
                .entries()
                .first()
                .and_then(|e| value_to_string(e.value()))
                .ok_or_else(|| {
                    anyhow::anyhow!(
                        "Setting '{}' requires a value, e.g., {} \"{}\"",
                        name,
                        name,
                        setting.default_value()
                    )
                })?;

            trace!(setting = %setting, value = %value, "Parsed setting");
            settings.insert(setting.name().to_string(), value);
        }
    }

    Ok(settings)
}
