//! Error types for the lock bridge
//!
//! Transport and session failures are recovered inside the bridges; the
//! errors here surface at the edges (startup, configuration, supervisor
//! bookkeeping) and in logs.

use crate::device::session::SessionError;
use crate::transport::mqtt::MqttError;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Main error type for bridge operations
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Configuration error: {0}")]
    ConfigError(#[from] crate::config::ConfigError),

    #[error("Bus error: {0}")]
    BusError(#[from] MqttError),

    #[error("Device session error: {0}")]
    SessionError(#[from] SessionError),

    #[error("Duplicate device identity: {0}")]
    DuplicateDevice(String),

    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    #[error("Bridge for {device} is closed")]
    BridgeClosed { device: String },

    #[error("Internal error: {message}")]
    InternalError { message: String },
}

impl BridgeError {
    /// Create internal error
    pub fn internal_error<S: Into<String>>(message: S) -> Self {
        Self::InternalError {
            message: message.into(),
        }
    }

    /// Error text safe to write to logs
    pub fn sanitized(&self) -> String {
        sanitize_error_message(&self.to_string())
    }
}

static SECRET_ASSIGNMENT: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)(password|token|key|secret)[=:]\s*\S+").ok());

static HEX_KEY: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"\b[0-9A-Fa-f]{32}\b").ok());

/// Remove credentials and 128-bit hex keys from a message
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = message.to_string();

    if let Some(re) = SECRET_ASSIGNMENT.as_ref() {
        sanitized = re.replace_all(&sanitized, "${1}=***").to_string();
    }

    // Device secret keys are 16 bytes hex encoded
    if let Some(re) = HEX_KEY.as_ref() {
        sanitized = re.replace_all(&sanitized, "***").to_string();
    }

    if sanitized.len() > 500 {
        let truncate_suffix = "...[truncated]";
        let mut cut = 500 - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_credentials() {
        let sanitized = sanitize_error_message("auth failed: password=hunter2 token: abc456");
        assert!(!sanitized.contains("hunter2"));
        assert!(!sanitized.contains("abc456"));
        assert!(sanitized.contains("password=***"));
    }

    #[test]
    fn test_sanitize_device_key() {
        let sanitized =
            sanitize_error_message("login rejected for 00112233445566778899aabbccddeeff");
        assert_eq!(sanitized, "login rejected for ***");
    }

    #[test]
    fn test_uuid_is_not_mistaken_for_key() {
        let message = "device 6a1f2c3e-0b4d-4a5e-9f60-7182a3b4c5d6 lost";
        assert_eq!(sanitize_error_message(message), message);
    }

    #[test]
    fn test_long_message_truncation() {
        let sanitized = sanitize_error_message(&"x".repeat(600));
        assert!(sanitized.len() <= 500);
        assert!(sanitized.ends_with("...[truncated]"));
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        let sanitized = sanitize_error_message(&"é".repeat(400));
        assert!(sanitized.len() <= 500);
        assert!(sanitized.ends_with("...[truncated]"));
    }

    #[test]
    fn test_constructor_and_display() {
        let error = BridgeError::internal_error("unexpected state");
        assert!(matches!(error, BridgeError::InternalError { .. }));
        assert_eq!(error.to_string(), "Internal error: unexpected state");

        let error = BridgeError::BridgeClosed {
            device: "front".to_string(),
        };
        assert_eq!(error.to_string(), "Bridge for front is closed");
    }

    #[test]
    fn test_sanitized_error_hides_secret() {
        let error = BridgeError::SessionError(SessionError::AuthenticationFailed(
            "key=00112233445566778899aabbccddeeff".to_string(),
        ));
        assert!(!error.sanitized().contains("00112233"));
    }
}
