// ── Core error types ──
//
// User-facing errors from dispatch-core. Consumers never see HTTP status
// codes or JSON parse failures directly: the `From<dispatch_api::Error>`
// impl translates transport-layer errors into domain variants.

use thiserror::Error;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Connection errors ────────────────────────────────────────────
    #[error("Cannot reach dispatch backend at {url}: {reason}")]
    ConnectionFailed { url: String, reason: String },

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Event stream disconnected: {reason}")]
    StreamDisconnected { reason: String },

    #[error("Backend request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    // ── Data errors ──────────────────────────────────────────────────
    #[error("Entity not found: {entity_type} with id {identifier}")]
    NotFound {
        entity_type: String,
        identifier: String,
    },

    #[error("Invalid `{event}` payload: {message}")]
    InvalidPayload { event: String, message: String },

    // ── API errors (wrapped, not exposed raw) ────────────────────────
    #[error("API error: {message}")]
    Api {
        message: String,
        /// HTTP status code (if applicable).
        status: Option<u16>,
    },

    // ── Configuration errors ─────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },

    // ── Internal errors ──────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub(crate) fn invalid_payload(event: &str, err: impl std::fmt::Display) -> Self {
        Self::InvalidPayload {
            event: event.to_owned(),
            message: err.to_string(),
        }
    }
}

// ── Conversion from transport-layer errors ───────────────────────────

impl From<dispatch_api::Error> for CoreError {
    fn from(err: dispatch_api::Error) -> Self {
        match err {
            dispatch_api::Error::Authentication { message } => {
                CoreError::AuthenticationFailed { message }
            }
            dispatch_api::Error::Forbidden { message } => CoreError::AuthenticationFailed {
                message: format!("forbidden: {message}"),
            },
            dispatch_api::Error::Transport(ref e) => {
                if e.is_timeout() {
                    CoreError::Timeout { timeout_secs: 0 }
                } else if e.is_connect() {
                    CoreError::ConnectionFailed {
                        url: e
                            .url()
                            .map_or_else(|| "<unknown>".into(), ToString::to_string),
                        reason: e.to_string(),
                    }
                } else if e.status().map(|s| s.as_u16()) == Some(404) {
                    CoreError::NotFound {
                        entity_type: "resource".into(),
                        identifier: e.url().map(|u| u.path().to_string()).unwrap_or_default(),
                    }
                } else {
                    CoreError::Api {
                        message: e.to_string(),
                        status: e.status().map(|s| s.as_u16()),
                    }
                }
            }
            dispatch_api::Error::InvalidUrl(e) => CoreError::Config {
                message: format!("Invalid URL: {e}"),
            },
            dispatch_api::Error::InvalidHeader(e) => CoreError::Config {
                message: format!("Invalid credentials: {e}"),
            },
            dispatch_api::Error::Timeout { timeout_secs } => CoreError::Timeout { timeout_secs },
            dispatch_api::Error::Tls(msg) => CoreError::ConnectionFailed {
                url: String::new(),
                reason: format!("TLS error: {msg}"),
            },
            dispatch_api::Error::Api { status: 404, message } => CoreError::NotFound {
                entity_type: "resource".into(),
                identifier: message,
            },
            dispatch_api::Error::Api { status, message } => CoreError::Api {
                message,
                status: Some(status),
            },
            dispatch_api::Error::Deserialization { message, body: _ } => {
                CoreError::Internal(format!("Deserialization error: {message}"))
            }
            dispatch_api::Error::StreamConnect(reason)
            | dispatch_api::Error::StreamInterrupted(reason) => {
                CoreError::StreamDisconnected { reason }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_404_becomes_not_found() {
        let err = CoreError::from(dispatch_api::Error::Api {
            status: 404,
            message: "no such incident".into(),
        });
        assert!(matches!(err, CoreError::NotFound { .. }));
    }

    #[test]
    fn stream_failures_become_disconnects() {
        let err = CoreError::from(dispatch_api::Error::StreamInterrupted("reset".into()));
        assert_eq!(err.to_string(), "Event stream disconnected: reset");
    }

    #[test]
    fn forbidden_is_an_auth_failure() {
        let err = CoreError::from(dispatch_api::Error::Forbidden {
            message: "role".into(),
        });
        assert!(matches!(err, CoreError::AuthenticationFailed { .. }));
    }
}
