// ── Dispatch console ──
//
// Screen-scoped service object. Owns one of each live component, wires
// stream events into the stores, and runs the mount / refresh / teardown
// lifecycle. Consumers get it injected; there is no global state.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use dispatch_api::{Credentials, DispatchClient, SseConnector, StreamConnector};
use secrecy::SecretString;
use serde_json::Value;
use strum::IntoEnumIterator;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ConsoleConfig;
use crate::convert::entities_from_json;
use crate::error::CoreError;
use crate::interpolate::{InterpolationHandle, PositionMap, spawn_interpolation_loop};
use crate::model::{EventName, Incident, Proposal, StreamEvent, Vehicle};
use crate::multiplexer::{EventHandler, StreamMultiplexer, StreamStatus, Subscription};
use crate::resolve::{ReferenceCache, ReferenceFetcher};
use crate::router::EventRouter;
use crate::store::{ProposalAggregator, ReconciliationStore};

/// Per-collection outcome of a bulk load. `None` marks a failed load; the
/// collection kept its previous contents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub incidents: Option<usize>,
    pub vehicles: Option<usize>,
    pub proposals: Option<usize>,
}

impl RefreshReport {
    pub fn is_complete(&self) -> bool {
        self.incidents.is_some() && self.vehicles.is_some() && self.proposals.is_some()
    }
}

/// The console's REST client. Clones share one slot, so a client swapped
/// in on re-authentication is seen by refreshes and reference lookups.
#[derive(Debug, Clone)]
pub struct SessionClient {
    current: Arc<RwLock<DispatchClient>>,
}

impl SessionClient {
    fn new(client: DispatchClient) -> Self {
        Self {
            current: Arc::new(RwLock::new(client)),
        }
    }

    /// The client in use right now.
    pub fn current(&self) -> DispatchClient {
        self.current.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn replace(&self, client: DispatchClient) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = client;
    }
}

impl ReferenceFetcher for SessionClient {
    async fn fetch(&self, resource_type: &str, id: &str) -> Result<Option<Value>, CoreError> {
        let client = self.current();
        client.fetch(resource_type, id).await
    }
}

#[derive(Default)]
struct Lifecycle {
    subscriptions: Vec<Subscription>,
    animation: Option<InterpolationHandle>,
    torn_down: bool,
}

struct ConsoleInner {
    config: ConsoleConfig,
    client: SessionClient,
    incidents: ReconciliationStore<Incident>,
    vehicles: ReconciliationStore<Vehicle>,
    proposals: ProposalAggregator,
    references: ReferenceCache<SessionClient>,
    stream: StreamMultiplexer,
    router: EventRouter,
    cancel: CancellationToken,
    lifecycle: Mutex<Lifecycle>,
    warnings: Mutex<Vec<String>>,
}

impl Drop for ConsoleInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// The live operational state behind one dispatch console screen.
///
/// Cheaply cloneable via `Arc<ConsoleInner>`. Create it, [`mount`](Self::mount)
/// it with the session token, read snapshots, and [`teardown`](Self::teardown)
/// when the screen goes away.
#[derive(Clone)]
pub struct DispatchConsole {
    inner: Arc<ConsoleInner>,
}

impl std::fmt::Debug for DispatchConsole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchConsole")
            .field("url", &self.inner.config.url.as_str())
            .field("incidents", &self.inner.incidents.len())
            .field("vehicles", &self.inner.vehicles.len())
            .field("stream", &self.inner.stream.status().state)
            .finish_non_exhaustive()
    }
}

impl DispatchConsole {
    /// Assemble a console from prebuilt transport parts. Does not touch the
    /// network; call [`mount`](Self::mount).
    pub fn new(
        config: ConsoleConfig,
        client: DispatchClient,
        connector: Arc<dyn StreamConnector>,
    ) -> Self {
        let incidents = ReconciliationStore::new("incidents", config.debounce);
        let vehicles = ReconciliationStore::new("vehicles", config.debounce);
        let proposals = ProposalAggregator::new();
        let client = SessionClient::new(client);
        let references = ReferenceCache::new(Arc::new(client.clone()));
        let stream = StreamMultiplexer::new(connector);
        let router = EventRouter::new(incidents.clone(), vehicles.clone(), proposals.clone());

        Self {
            inner: Arc::new(ConsoleInner {
                config,
                client,
                incidents,
                vehicles,
                proposals,
                references,
                stream,
                router,
                cancel: CancellationToken::new(),
                lifecycle: Mutex::new(Lifecycle::default()),
                warnings: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Build the HTTP client and SSE connector from `config`.
    pub fn connect(config: ConsoleConfig, credentials: &Credentials) -> Result<Self, CoreError> {
        let transport = config.transport();
        let client = DispatchClient::new(config.url.clone(), credentials, &transport)?;
        let connector = SseConnector::new(config.stream_url()?, transport);
        Ok(Self::new(config, client, Arc::new(connector)))
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.inner.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Load the three collections, subscribe to every consumed event,
    /// open the push stream and start the interpolation loop.
    ///
    /// Load failures are logged and recorded as warnings; the affected
    /// collection stays empty until the next refresh or event.
    pub async fn mount(&self, token: &SecretString) -> Result<RefreshReport, CoreError> {
        if self.lifecycle().torn_down {
            return Err(CoreError::Internal("console has been torn down".into()));
        }

        let report = self.refresh().await;

        let mut lifecycle = self.lifecycle();
        if lifecycle.torn_down {
            return Err(CoreError::Internal("console torn down during mount".into()));
        }
        if lifecycle.subscriptions.is_empty() {
            let router = self.inner.router.clone();
            let handler: EventHandler = Arc::new(move |event: &StreamEvent| -> Result<(), CoreError> {
                router.route(event).map(|_| ())
            });
            lifecycle.subscriptions = EventName::iter()
                .map(|name| self.inner.stream.subscribe(name.as_ref(), Arc::clone(&handler)))
                .collect();
        }

        self.inner.stream.set_session(Some(token));

        if lifecycle.animation.is_none() {
            lifecycle.animation = Some(spawn_interpolation_loop(
                self.inner.vehicles.subscribe(),
                self.inner.config.interpolation,
                self.inner.cancel.child_token(),
            ));
        }
        drop(lifecycle);

        info!(
            incidents = ?report.incidents,
            vehicles = ?report.vehicles,
            proposals = ?report.proposals,
            "console mounted"
        );
        Ok(report)
    }

    /// Re-snapshot incidents, vehicles and proposals in parallel.
    pub async fn refresh(&self) -> RefreshReport {
        let client = self.inner.client.current();
        let (incidents, vehicles, proposals) = tokio::join!(
            client.list_incidents(),
            client.list_vehicles(),
            client.list_proposals(),
        );

        RefreshReport {
            incidents: self.apply_load("incidents", incidents, |items| {
                self.inner
                    .incidents
                    .load_snapshot(entities_from_json::<Incident>("incidents", items))
            }),
            vehicles: self.apply_load("vehicles", vehicles, |items| {
                self.inner
                    .vehicles
                    .load_snapshot(entities_from_json::<Vehicle>("vehicles", items))
            }),
            proposals: self.apply_load("proposals", proposals, |items| {
                self.inner
                    .proposals
                    .load_snapshot(entities_from_json::<Proposal>("proposals", items))
            }),
        }
    }

    fn apply_load(
        &self,
        kind: &'static str,
        result: Result<Vec<Value>, dispatch_api::Error>,
        apply: impl FnOnce(Vec<Value>) -> usize,
    ) -> Option<usize> {
        match result {
            Ok(items) => {
                let count = apply(items);
                debug!(kind, count, "bulk load applied");
                Some(count)
            }
            Err(e) => {
                let err = CoreError::from(e);
                warn!(kind, error = %err, "bulk load failed, keeping current data");
                self.inner
                    .warnings
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(format!("{kind}: {err}"));
                None
            }
        }
    }

    /// Re-authenticate with a new token, or close the stream when `None`.
    ///
    /// A new token rebuilds the REST client so later refreshes and
    /// reference lookups send it, then reopens the push stream.
    /// Subscriptions are kept.
    pub fn set_session(&self, token: Option<&SecretString>) {
        if self.lifecycle().torn_down {
            return;
        }
        if let Some(token) = token {
            let credentials = Credentials::bearer(token.clone());
            match DispatchClient::new(
                self.inner.config.url.clone(),
                &credentials,
                &self.inner.config.transport(),
            ) {
                Ok(client) => {
                    self.inner.client.replace(client);
                    debug!("rest client re-authenticated");
                }
                Err(e) => warn!(error = %e, "could not rebuild rest client, keeping the previous one"),
            }
        }
        self.inner.stream.set_session(token);
    }

    /// Close the stream, cancel pending publications, the animation loop
    /// and in-flight resolutions. Idempotent.
    pub fn teardown(&self) {
        let mut lifecycle = self.lifecycle();
        if lifecycle.torn_down {
            return;
        }
        lifecycle.torn_down = true;
        let subscriptions = std::mem::take(&mut lifecycle.subscriptions);
        lifecycle.animation = None;
        drop(lifecycle);

        self.inner.stream.close();
        for subscription in subscriptions {
            subscription.unsubscribe();
        }
        self.inner.cancel.cancel();
        self.inner.incidents.teardown();
        self.inner.vehicles.teardown();
        self.inner.references.teardown();
        info!("console torn down");
    }

    pub fn is_torn_down(&self) -> bool {
        self.lifecycle().torn_down
    }

    // ── Accessors ────────────────────────────────────────────────────

    pub fn config(&self) -> &ConsoleConfig {
        &self.inner.config
    }

    /// The REST client currently in use.
    pub fn client(&self) -> DispatchClient {
        self.inner.client.current()
    }

    pub fn incidents(&self) -> &ReconciliationStore<Incident> {
        &self.inner.incidents
    }

    pub fn vehicles(&self) -> &ReconciliationStore<Vehicle> {
        &self.inner.vehicles
    }

    pub fn proposals(&self) -> &ProposalAggregator {
        &self.inner.proposals
    }

    pub fn references(&self) -> &ReferenceCache<SessionClient> {
        &self.inner.references
    }

    pub fn stream(&self) -> &StreamMultiplexer {
        &self.inner.stream
    }

    pub fn router(&self) -> &EventRouter {
        &self.inner.router
    }

    pub fn stream_status(&self) -> StreamStatus {
        self.inner.stream.status()
    }

    /// Smoothed vehicle positions; empty before mount.
    pub fn positions(&self) -> PositionMap {
        self.lifecycle()
            .animation
            .as_ref()
            .map(InterpolationHandle::positions)
            .unwrap_or_default()
    }

    pub fn watch_positions(&self) -> Option<watch::Receiver<PositionMap>> {
        self.lifecycle().animation.as_ref().map(InterpolationHandle::subscribe)
    }

    /// Drain degraded-load messages for display.
    pub fn take_warnings(&self) -> Vec<String> {
        std::mem::take(
            &mut *self
                .inner
                .warnings
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }
}
