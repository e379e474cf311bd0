//! Listener configuration validation
//!
//! Checks certificate material, addresses and mode-specific requirements of
//! a [`ListenerConfiguration`](crate::ListenerConfiguration) before it is
//! handed to the listener.

pub mod certs;

pub use certs::{derive_metadata, validate_listener_configuration};

use std::fmt;

/// Validation error category
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Certificate or key material
    Certificate,
    /// Known IPs and other addresses
    Network,
    /// Configuration logic error
    Logic,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Certificate => write!(f, "Certificate"),
            ErrorCategory::Network => write!(f, "Network"),
            ErrorCategory::Logic => write!(f, "Logic"),
        }
    }
}

/// Validation error
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub category: ErrorCategory,
    pub message: String,
}

impl ValidationError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.category, self.message)
    }
}

/// Validation warning
#[derive(Debug, Clone)]
pub struct ValidationWarning {
    pub message: String,
}

impl ValidationWarning {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Validation result containing errors and warnings
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: ValidationWarning) {
        self.warnings.push(warning);
    }

    /// Check if validation passed (no errors)
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }

    /// Convert into a [`ConfigError::Invalid`](crate::ConfigError::Invalid)
    /// listing every error, or `Ok` when there are none.
    pub fn into_result(self) -> crate::Result<Vec<ValidationWarning>> {
        if self.is_valid() {
            return Ok(self.warnings);
        }
        let listing = self
            .errors
            .iter()
            .map(|e| format!("  - {}", e))
            .collect::<Vec<_>>()
            .join("\n");
        Err(crate::ConfigError::Invalid(listing))
    }
}
