// dispatch-api: Async HTTP + server-sent-event transport for the dispatch backend

pub mod auth;
pub mod client;
pub mod error;
pub mod sse;
pub mod stream;
pub mod transport;

pub use auth::Credentials;
pub use client::DispatchClient;
pub use error::Error;
pub use sse::RawMessage;
pub use stream::{SseConnector, StreamConnector, StreamSignal};
pub use transport::{TlsMode, TransportConfig};
