use thiserror::Error;

/// Top-level error type for the `dispatch-api` crate.
///
/// Covers every failure mode of the backend surfaces this crate talks to:
/// authentication, HTTP transport, REST status errors, payload decoding,
/// and the server-sent-event push stream. `dispatch-core` maps these into
/// domain-level variants.
#[derive(Debug, Error)]
pub enum Error {
    // ── Authentication ──────────────────────────────────────────────
    /// The backend rejected the bearer token (HTTP 401).
    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    /// The token is valid but lacks permission for the resource (HTTP 403).
    #[error("Forbidden: {message}")]
    Forbidden { message: String },

    // ── Transport ───────────────────────────────────────────────────
    /// HTTP transport error (connection refused, DNS failure, etc.)
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Request timed out.
    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    /// TLS handshake or certificate error.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Token could not be encoded as an HTTP header value.
    #[error("Invalid credential header: {0}")]
    InvalidHeader(String),

    // ── REST ────────────────────────────────────────────────────────
    /// Non-success HTTP status from a REST endpoint.
    #[error("API error (HTTP {status}): {message}")]
    Api { status: u16, message: String },

    // ── Data ────────────────────────────────────────────────────────
    /// JSON deserialization failed, with the raw body for debugging.
    #[error("Deserialization error: {message}")]
    Deserialization { message: String, body: String },

    // ── Push stream ─────────────────────────────────────────────────
    /// The push stream could not be opened.
    #[error("Event stream connection failed: {0}")]
    StreamConnect(String),

    /// The push stream failed after it was opened.
    #[error("Event stream interrupted: {0}")]
    StreamInterrupted(String),
}

impl Error {
    /// Returns `true` if this error indicates the token has expired
    /// and re-authentication might resolve it.
    pub fn is_auth_expired(&self) -> bool {
        matches!(self, Self::Authentication { .. })
    }

    /// Returns `true` if this is a transient error worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_timeout() || e.is_connect(),
            Self::Timeout { .. } | Self::StreamConnect(_) | Self::StreamInterrupted(_) => true,
            Self::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Returns `true` if this is a "not found" error.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Transport(e) => e.status() == Some(reqwest::StatusCode::NOT_FOUND),
            Self::Api { status: 404, .. } => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_are_transient() {
        let err = Error::Api {
            status: 503,
            message: "unavailable".into(),
        };
        assert!(err.is_transient());
        assert!(!err.is_not_found());
    }

    #[test]
    fn not_found_is_detected_from_status() {
        let err = Error::Api {
            status: 404,
            message: "missing".into(),
        };
        assert!(err.is_not_found());
        assert!(!err.is_transient());
    }

    #[test]
    fn auth_errors_report_expiry() {
        let err = Error::Authentication {
            message: "token expired".into(),
        };
        assert!(err.is_auth_expired());
        assert!(!Error::Tls("bad cert".into()).is_auth_expired());
    }
}
