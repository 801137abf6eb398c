//! Server-sent-event push connection.
//!
//! Opens one long-lived `text/event-stream` request against the backend and
//! forwards every decoded [`RawMessage`] through an `mpsc` channel as a
//! [`StreamSignal`]. There is no reconnect loop here: a
//! transport failure is reported once as [`StreamSignal::Failed`] and the
//! task exits. Recovery is triggered from outside (re-authentication or a
//! fresh console mount).
//!
//! # Example
//!
//! ```rust,ignore
//! use dispatch_api::stream::{SseConnector, StreamConnector, StreamSignal};
//! use tokio_util::sync::CancellationToken;
//!
//! let connector = SseConnector::new(stream_url, TransportConfig::default());
//! let cancel = CancellationToken::new();
//! let mut rx = connector.open(&token, cancel.clone());
//!
//! while let Some(signal) = rx.recv().await {
//!     if let StreamSignal::Message(msg) = signal {
//!         println!("{:?}: {}", msg.event_type, msg.data);
//!     }
//! }
//! ```

use bytes::Bytes;
use futures_core::Stream;
use futures_util::StreamExt;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, CACHE_CONTROL, HeaderValue};
use secrecy::SecretString;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::auth::bearer_headers;
use crate::error::Error;
use crate::sse::{RawMessage, SseDecoder};
use crate::transport::TransportConfig;

// ── Signal channel capacity ──────────────────────────────────────────

const SIGNAL_CHANNEL_CAPACITY: usize = 1024;

// ── StreamSignal ─────────────────────────────────────────────────────

/// Lifecycle and payload notifications from a push connection.
#[derive(Debug)]
pub enum StreamSignal {
    /// The server accepted the request; messages follow.
    Opened,
    /// One decoded message.
    Message(RawMessage),
    /// The connection failed to open or broke mid-stream. Terminal.
    Failed(Error),
    /// The server ended the stream cleanly. Terminal.
    Closed,
}

// ── StreamConnector ──────────────────────────────────────────────────

/// Opens push connections on behalf of the stream multiplexer.
///
/// Implemented by [`SseConnector`] for the real backend; tests substitute
/// a channel-backed fake.
pub trait StreamConnector: Send + Sync + 'static {
    /// Start a connection authenticated with `token`.
    ///
    /// Returns immediately; the connection is driven by a background task
    /// that stops when `cancel` fires or the returned receiver is dropped.
    fn open(&self, token: &SecretString, cancel: CancellationToken) -> mpsc::Receiver<StreamSignal>;
}

// ── SseConnector ─────────────────────────────────────────────────────

/// [`StreamConnector`] for the backend's `text/event-stream` endpoint.
#[derive(Debug, Clone)]
pub struct SseConnector {
    url: Url,
    transport: TransportConfig,
}

impl SseConnector {
    pub fn new(url: Url, transport: TransportConfig) -> Self {
        Self { url, transport }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl StreamConnector for SseConnector {
    fn open(&self, token: &SecretString, cancel: CancellationToken) -> mpsc::Receiver<StreamSignal> {
        let (tx, rx) = mpsc::channel(SIGNAL_CHANNEL_CAPACITY);

        let client = match bearer_headers(token).and_then(|h| self.transport.build_stream_client(h)) {
            Ok(c) => c,
            Err(e) => {
                // Channel is fresh, so there is room for the single signal.
                let _ = tx.try_send(StreamSignal::Failed(e));
                return rx;
            }
        };

        let url = self.url.clone();
        tokio::spawn(async move {
            run_connection(client, url, tx, cancel).await;
        });

        rx
    }
}

// ── Single connection lifecycle ──────────────────────────────────────

async fn run_connection(
    client: reqwest::Client,
    url: Url,
    tx: mpsc::Sender<StreamSignal>,
    cancel: CancellationToken,
) {
    tokio::select! {
        biased;
        () = cancel.cancelled() => {
            debug!("event stream cancelled");
        }
        result = read_stream(&client, &url, &tx) => {
            match result {
                Ok(()) => {
                    info!("event stream ended");
                    let _ = tx.send(StreamSignal::Closed).await;
                }
                Err(e) => {
                    warn!(error = %e, "event stream failed");
                    let _ = tx.send(StreamSignal::Failed(e)).await;
                }
            }
        }
    }
}

/// Issue the stream request and forward messages until the body ends.
async fn read_stream(
    client: &reqwest::Client,
    url: &Url,
    tx: &mpsc::Sender<StreamSignal>,
) -> Result<(), Error> {
    info!(url = %url, "opening event stream");

    let resp = client
        .get(url.clone())
        .header(ACCEPT, HeaderValue::from_static("text/event-stream"))
        .header(CACHE_CONTROL, HeaderValue::from_static("no-cache"))
        .send()
        .await
        .map_err(|e| Error::StreamConnect(e.to_string()))?;

    let status = resp.status();
    if status == StatusCode::UNAUTHORIZED {
        return Err(Error::Authentication {
            message: "event stream rejected the session token".into(),
        });
    }
    if !status.is_success() {
        return Err(Error::StreamConnect(format!("HTTP {status}")));
    }

    if tx.send(StreamSignal::Opened).await.is_err() {
        return Ok(());
    }
    info!("event stream connected");

    let messages = sse_messages(resp.bytes_stream());
    futures_util::pin_mut!(messages);

    while let Some(item) = messages.next().await {
        let msg = item?;
        if tx.send(StreamSignal::Message(msg)).await.is_err() {
            // Receiver gone: the multiplexer closed this session.
            return Ok(());
        }
    }

    Ok(())
}

/// Adapt a body byte stream into a stream of decoded SSE messages.
fn sse_messages<S>(bytes: S) -> impl Stream<Item = Result<RawMessage, Error>>
where
    S: Stream<Item = reqwest::Result<Bytes>>,
{
    async_stream::try_stream! {
        let mut decoder = SseDecoder::new();
        for await chunk in bytes {
            let chunk = chunk.map_err(|e| Error::StreamInterrupted(e.to_string()))?;
            for message in decoder.feed(&chunk) {
                yield message;
            }
        }
    }
}
