// ── Runtime console configuration ──
//
// These types describe *how* a console talks to the backend and how its
// live pipeline is tuned. They never touch disk: `dispatch-config` (or any
// embedding application) constructs a `ConsoleConfig` and hands it in.

use std::time::Duration;

use url::Url;

use crate::error::CoreError;
use crate::interpolate::InterpolatorConfig;

/// Default coalescing window for store publications.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(100);

/// Default path of the server-sent-event endpoint, relative to the base URL.
pub const DEFAULT_STREAM_PATH: &str = "api/events/stream";

/// TLS verification strategy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TlsVerification {
    /// System CA store (strict).
    #[default]
    SystemDefaults,
    /// Custom CA certificate file.
    CustomCa(std::path::PathBuf),
    /// Skip verification (development backends with self-signed certs).
    DangerAcceptInvalid,
}

/// Configuration for one console session.
#[derive(Debug, Clone)]
pub struct ConsoleConfig {
    /// Backend base URL (e.g., `https://dispatch.example.org`).
    pub url: Url,
    /// Event-stream endpoint path, relative to `url`.
    pub stream_path: String,
    /// TLS verification strategy.
    pub tls: TlsVerification,
    /// REST request timeout; also the stream connect timeout.
    pub timeout: Duration,
    /// Coalescing window for incident and vehicle publications.
    pub debounce: Duration,
    /// Position smoothing parameters.
    pub interpolation: InterpolatorConfig,
}

impl ConsoleConfig {
    /// Configuration with default tuning for the given backend.
    pub fn new(url: Url) -> Self {
        Self {
            url,
            stream_path: DEFAULT_STREAM_PATH.into(),
            tls: TlsVerification::default(),
            timeout: Duration::from_secs(30),
            debounce: DEFAULT_DEBOUNCE,
            interpolation: InterpolatorConfig::default(),
        }
    }

    /// Absolute URL of the event-stream endpoint.
    pub fn stream_url(&self) -> Result<Url, CoreError> {
        let mut url = self.url.clone();
        let mut segments = url.path_segments_mut().map_err(|()| CoreError::Config {
            message: format!("base URL cannot carry a path: {}", self.url),
        })?;
        segments
            .pop_if_empty()
            .extend(self.stream_path.split('/').filter(|s| !s.is_empty()));
        drop(segments);
        Ok(url)
    }

    pub(crate) fn transport(&self) -> dispatch_api::TransportConfig {
        dispatch_api::TransportConfig {
            tls: match &self.tls {
                TlsVerification::SystemDefaults => dispatch_api::TlsMode::System,
                TlsVerification::CustomCa(path) => dispatch_api::TlsMode::CustomCa(path.clone()),
                TlsVerification::DangerAcceptInvalid => dispatch_api::TlsMode::DangerAcceptInvalid,
            },
            timeout: self.timeout,
        }
    }
}
