//! Error types for tailtray-core operations.

use std::path::PathBuf;

use tailtray_localapi::LocalApiError;

/// All errors that can occur while talking to the daemon or loading config.
///
/// Reconciliation treats every variant the same way: log, keep the previous
/// snapshot, return to idle. The distinction matters for the CLI and for logs.
#[derive(Debug, thiserror::Error)]
pub enum TrayError {
    // ─────────────────────────────────────────────────────────────────────
    // Transport Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Daemon transport failed: {context}: {source}")]
    Transport {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Daemon request timed out after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Command execution failed: {command}: {details}")]
    CommandFailed { command: String, details: String },

    #[error("LocalAPI returned HTTP {status} for {path}: {body}")]
    HttpStatus {
        path: String,
        status: u16,
        body: String,
    },

    #[error("LocalAPI HTTP error: {context}: {source}")]
    Http {
        context: String,
        #[source]
        source: hyper::Error,
    },

    #[error("Could not build LocalAPI request: {context}: {source}")]
    Request {
        context: String,
        #[source]
        source: hyper::http::Error,
    },

    #[error("LocalAPI protocol error: {0}")]
    Protocol(#[from] LocalApiError),

    // ─────────────────────────────────────────────────────────────────────
    // Payload Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Malformed daemon payload: {0}")]
    MalformedPayload(String),

    #[error("Malformed peer entry: {0}")]
    MalformedPeer(String),

    #[error("JSON encoding error: {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    // ─────────────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Configuration file malformed: {path}: {details}")]
    ConfigMalformed { path: PathBuf, details: String },

    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // ─────────────────────────────────────────────────────────────────────
    // Runtime Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("No async runtime available: {0}")]
    NoRuntime(String),
}

impl TrayError {
    pub fn transport(context: impl Into<String>, source: std::io::Error) -> Self {
        TrayError::Transport {
            context: context.into(),
            source,
        }
    }

    pub fn timeout(operation: impl Into<String>, timeout: std::time::Duration) -> Self {
        TrayError::Timeout {
            operation: operation.into(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    /// True when the daemon refused the request for lack of privileges.
    pub fn is_access_denied(&self) -> bool {
        match self {
            TrayError::CommandFailed { details, .. } => {
                details.to_ascii_lowercase().contains("access denied")
            }
            TrayError::HttpStatus { status, .. } => *status == 403,
            _ => false,
        }
    }
}

/// Convenience type alias for Results using TrayError.
pub type Result<T> = std::result::Result<T, TrayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_denied_detected_case_insensitively() {
        let err = TrayError::CommandFailed {
            command: "tailscale up".to_string(),
            details: "Access Denied: prefs write access denied".to_string(),
        };
        assert!(err.is_access_denied());

        let other = TrayError::MalformedPayload("x".to_string());
        assert!(!other.is_access_denied());
    }

    #[test]
    fn timeout_reports_milliseconds() {
        let err = TrayError::timeout("fetch status", std::time::Duration::from_secs(3));
        assert_eq!(
            err.to_string(),
            "Daemon request timed out after 3000ms: fetch status"
        );
    }
}
