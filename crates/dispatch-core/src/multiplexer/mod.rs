// ── Stream multiplexer ──
//
// Owns the single push connection of an authenticated session and fans
// normalized events out to per-name and any-event handlers. Listener
// registrations outlive connections: a new session re-attaches every
// registered name.

mod normalize;
mod registry;

use std::collections::HashSet;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::{DateTime, Utc};
use dispatch_api::{RawMessage, StreamConnector, StreamSignal};
use secrecy::SecretString;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::model::StreamEvent;

pub use normalize::normalize;
pub use registry::EventHandler;
use registry::{SubscriptionRegistry, same_handler};

// ── Status ───────────────────────────────────────────────────────────

/// Push connection state observable by consumers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Connection state plus the latest diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamStatus {
    pub state: ConnectionState,
    /// Last transport failure or unparsable message.
    pub last_error: Option<String>,
    /// Receipt time of the last message delivered to handlers.
    pub last_event_at: Option<DateTime<Utc>>,
}

// ── Internal state ───────────────────────────────────────────────────

struct ActiveSession {
    cancel: CancellationToken,
    pump: JoinHandle<()>,
    generation: u64,
}

#[derive(Default)]
struct MuxState {
    registry: SubscriptionRegistry,
    /// Names attached to the live connection.
    attached: HashSet<String>,
    session: Option<ActiveSession>,
    generation: u64,
}

impl MuxState {
    fn is_current(&self, generation: u64) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.generation == generation)
    }
}

struct MuxInner {
    connector: Arc<dyn StreamConnector>,
    state: Mutex<MuxState>,
    status: watch::Sender<StreamStatus>,
}

impl MuxInner {
    fn lock(&self) -> MutexGuard<'_, MuxState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns `false` once the pump should stop.
    fn handle_signal(&self, signal: StreamSignal, generation: u64) -> bool {
        match signal {
            StreamSignal::Opened => {
                let mut state = self.lock();
                if !state.is_current(generation) {
                    return false;
                }
                let names: HashSet<String> = state.registry.names().map(str::to_owned).collect();
                info!(names = names.len(), "event stream open, attaching registered names");
                state.attached = names;
                self.status.send_modify(|s| {
                    s.state = ConnectionState::Connected;
                    s.last_error = None;
                });
                true
            }
            StreamSignal::Message(raw) => {
                if !self.lock().is_current(generation) {
                    return false;
                }
                self.deliver(&raw);
                true
            }
            StreamSignal::Failed(err) => {
                self.end_session(generation, Some(err.to_string()));
                false
            }
            StreamSignal::Closed => {
                self.end_session(generation, None);
                false
            }
        }
    }

    fn deliver(&self, raw: &RawMessage) {
        let received_at = Utc::now();
        let event = match normalize(raw, received_at) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, event_type = ?raw.event_type, "dropping unparsable stream message");
                self.status
                    .send_modify(|s| s.last_error = Some(format!("unparsable stream message: {e}")));
                return;
            }
        };

        self.status.send_modify(|s| s.last_event_at = Some(received_at));
        self.dispatch(&event);
    }

    fn dispatch(&self, event: &StreamEvent) -> usize {
        // Snapshot the handler list so handlers may (un)subscribe.
        let handlers = self.lock().registry.handlers_for(&event.name);
        trace!(event = %event.name, handlers = handlers.len(), "dispatching stream event");

        for handler in &handlers {
            match panic::catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(event = %event.name, error = %e, "stream handler failed"),
                Err(_) => error!(event = %event.name, "stream handler panicked"),
            }
        }
        handlers.len()
    }

    /// Tear down the session `generation` if it is still the live one.
    fn end_session(&self, generation: u64, failure: Option<String>) {
        let mut state = self.lock();
        if !state.is_current(generation) {
            return;
        }
        if let Some(session) = state.session.take() {
            session.cancel.cancel();
        }
        state.attached.clear();
        drop(state);

        match &failure {
            Some(reason) => warn!(reason = %reason, "event stream disconnected"),
            None => info!("event stream closed by server"),
        }
        self.status.send_modify(|s| {
            s.state = ConnectionState::Disconnected;
            if failure.is_some() {
                s.last_error = failure;
            }
        });
    }
}

impl Drop for MuxInner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(session) = state.session.take() {
            session.cancel.cancel();
            session.pump.abort();
        }
    }
}

async fn pump(inner: Weak<MuxInner>, mut rx: mpsc::Receiver<StreamSignal>, generation: u64) {
    while let Some(signal) = rx.recv().await {
        let Some(mux) = inner.upgrade() else {
            return;
        };
        if !mux.handle_signal(signal, generation) {
            return;
        }
    }
    // Connector went away without a terminal signal.
    if let Some(mux) = inner.upgrade() {
        mux.end_session(generation, Some("event stream ended unexpectedly".into()));
    }
}

// ── StreamMultiplexer ────────────────────────────────────────────────

/// Demultiplexes one push connection into named handler sets.
///
/// Cheap to clone; clones share the connection and the registry.
#[derive(Clone)]
pub struct StreamMultiplexer {
    inner: Arc<MuxInner>,
}

impl fmt::Debug for StreamMultiplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamMultiplexer")
            .field("status", &*self.inner.status.borrow())
            .finish_non_exhaustive()
    }
}

impl StreamMultiplexer {
    pub fn new(connector: Arc<dyn StreamConnector>) -> Self {
        let (status, _) = watch::channel(StreamStatus::default());
        Self {
            inner: Arc::new(MuxInner {
                connector,
                state: Mutex::new(MuxState::default()),
                status,
            }),
        }
    }

    // ── Registration ─────────────────────────────────────────────────

    /// Register `handler` for events named `name`.
    ///
    /// The first handler for a name attaches it to the live connection.
    pub fn subscribe(&self, name: &str, handler: EventHandler) -> Subscription {
        let mut state = self.inner.lock();
        let first = state.registry.add(name, Arc::clone(&handler));
        if first && state.session.is_some() && self.is_connected() {
            state.attached.insert(name.to_owned());
            debug!(event = %name, "attached event name");
        }
        Subscription {
            mux: Arc::downgrade(&self.inner),
            target: Target::Name(name.to_owned()),
            handler,
        }
    }

    /// Register `handler` for every event regardless of name.
    pub fn subscribe_any(&self, handler: EventHandler) -> Subscription {
        self.inner.lock().registry.add_any(Arc::clone(&handler));
        Subscription {
            mux: Arc::downgrade(&self.inner),
            target: Target::Any,
            handler,
        }
    }

    // ── Session lifecycle ────────────────────────────────────────────

    /// Open a connection for `token`, replacing any current one, or close
    /// the connection when `token` is `None`.
    ///
    /// Handler registrations survive both. Must be called inside a Tokio
    /// runtime when opening.
    pub fn set_session(&self, token: Option<&SecretString>) {
        let mut state = self.inner.lock();
        if let Some(old) = state.session.take() {
            old.cancel.cancel();
            old.pump.abort();
            debug!(generation = old.generation, "closed previous event stream session");
        }
        state.attached.clear();

        let Some(token) = token else {
            drop(state);
            self.inner.status.send_modify(|s| s.state = ConnectionState::Disconnected);
            info!("event stream session closed");
            return;
        };

        state.generation += 1;
        let generation = state.generation;
        self.inner.status.send_modify(|s| {
            s.state = ConnectionState::Connecting;
            s.last_error = None;
        });

        let cancel = CancellationToken::new();
        let rx = self.inner.connector.open(token, cancel.clone());
        let pump = tokio::spawn(pump(Arc::downgrade(&self.inner), rx, generation));
        state.session = Some(ActiveSession {
            cancel,
            pump,
            generation,
        });
        debug!(generation, "event stream session opening");
    }

    /// Close the connection. Same as `set_session(None)`.
    pub fn close(&self) {
        self.set_session(None);
    }

    // ── Delivery ─────────────────────────────────────────────────────

    /// Deliver a locally produced event to the registered handlers.
    ///
    /// Returns the number of handlers invoked.
    pub fn dispatch(&self, event: &StreamEvent) -> usize {
        self.inner.dispatch(event)
    }

    // ── Observation ──────────────────────────────────────────────────

    pub fn status(&self) -> StreamStatus {
        self.inner.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<StreamStatus> {
        self.inner.status.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.status.borrow().state == ConnectionState::Connected
    }

    pub fn is_attached(&self, name: &str) -> bool {
        self.inner.lock().attached.contains(name)
    }

    /// Attached names, sorted.
    pub fn attached_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.lock().attached.iter().cloned().collect();
        names.sort_unstable();
        names
    }

    pub fn handler_count(&self, name: &str) -> usize {
        self.inner.lock().registry.handler_count(name)
    }
}

// ── Subscription ─────────────────────────────────────────────────────

enum Target {
    Name(String),
    Any,
}

/// Handle returned by [`StreamMultiplexer::subscribe`].
///
/// Dropping it leaves the handler registered.
#[must_use = "call `unsubscribe` to remove the handler"]
pub struct Subscription {
    mux: Weak<MuxInner>,
    target: Target,
    handler: EventHandler,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let target = match &self.target {
            Target::Name(n) => n.as_str(),
            Target::Any => "*",
        };
        f.debug_struct("Subscription").field("target", &target).finish_non_exhaustive()
    }
}

impl Subscription {
    /// Remove the handler. The last handler for a name detaches it.
    ///
    /// Returns `false` when the handler was already gone.
    pub fn unsubscribe(self) -> bool {
        let Some(mux) = self.mux.upgrade() else {
            return false;
        };
        let mut state = mux.lock();
        match &self.target {
            Target::Any => state.registry.remove_any(&self.handler),
            Target::Name(name) => match state.registry.remove(name, &self.handler) {
                Some(true) => {
                    if state.attached.remove(name) {
                        debug!(event = %name, "detached event name");
                    }
                    true
                }
                Some(false) => true,
                None => false,
            },
        }
    }

    pub fn is_for(&self, handler: &EventHandler) -> bool {
        same_handler(&self.handler, handler)
    }
}
