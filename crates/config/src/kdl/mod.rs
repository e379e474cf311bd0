//! KDL server file parsing.
//!
//! - `helpers`: common value extraction functions
//! - `server`: `server`, `acme` and `settings` blocks

mod helpers;
mod server;

pub use helpers::{get_bool_entry, get_int_entry, get_string_entry, offset_to_line_col};
pub use server::{parse_acme_config, parse_server_config, parse_settings};

use anyhow::Result;
use tracing::debug;

use crate::CertgateConfig;

/// Parse KDL text into a document, rendering parser diagnostics with
/// line/column context.
pub fn parse_document(content: &str) -> std::result::Result<kdl::KdlDocument, String> {
    content.parse().map_err(|e: kdl::KdlError| {
        use miette::Diagnostic;

        let mut error_msg = String::from("KDL configuration parse error:\n\n");
        let lines: Vec<&str> = content.lines().collect();
        let mut found_details = false;

        if let Some(related) = e.related() {
            for diagnostic in related {
                error_msg.push_str(&format!("  {}\n", diagnostic));
                found_details = true;

                if let Some(labels) = diagnostic.labels() {
                    for label in labels {
                        let (line, col) = offset_to_line_col(content, label.offset());
                        error_msg.push_str(&format!("\n  --> at line {}, column {}\n", line, col));

                        if let Some(line_content) = lines.get(line.saturating_sub(1)) {
                            error_msg.push_str(&format!("{:>4} | {}\n", line, line_content));
                            error_msg.push_str(&format!(
                                "     | {}^",
                                " ".repeat(col.saturating_sub(1))
                            ));
                            if let Some(label_msg) = label.label() {
                                error_msg.push_str(&format!(" {}", label_msg));
                            }
                            error_msg.push('\n');
                        }
                    }
                }

                if let Some(help) = diagnostic.help() {
                    error_msg.push_str(&format!("\n  Help: {}\n", help));
                }
            }
        }

        if !found_details {
            error_msg.push_str(&format!("  {}\n", e));
        }

        error_msg
    })
}

/// Convert a parsed KDL document to a [`CertgateConfig`]
pub fn parse_kdl_document(doc: kdl::KdlDocument) -> Result<CertgateConfig> {
    let mut config = CertgateConfig::default();

    for node in doc.nodes() {
        match node.name().value() {
            "server" => config.server = parse_server_config(node)?,
            "acme" => config.acme = parse_acme_config(node)?,
            "settings" => config.settings = parse_settings(node)?,
            other => {
                return Err(anyhow::anyhow!(
                    "Unknown top-level configuration block '{}'. Valid blocks: server, acme, settings",
                    other
                ));
            }
        }
    }

    debug!(
        http_port = config.server.http_port,
        https_port = config.server.https_port,
        settings = config.settings.len(),
        "Loaded certgate configuration"
    );

    Ok(config)
}
