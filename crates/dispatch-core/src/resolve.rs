// ── Reference resolution cache ──
//
// Renderers show foreign ids (a vehicle's home station, an incident's
// category) as labels. `resolve` never blocks: a cold key starts exactly
// one background fetch and answers `None` until it lands. Failures are
// terminal for the key until someone invalidates it.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use dispatch_api::DispatchClient;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::CoreError;

/// Record fields tried, in order, by [`display_label`].
const LABEL_FIELDS: [&str; 4] = ["label", "name", "immatriculation", "code"];

/// Fetches one reference record.
pub trait ReferenceFetcher: Send + Sync + 'static {
    /// `Ok(None)` when the backend does not know the id.
    fn fetch(
        &self,
        resource_type: &str,
        id: &str,
    ) -> impl Future<Output = Result<Option<Value>, CoreError>> + Send;
}

impl ReferenceFetcher for DispatchClient {
    async fn fetch(&self, resource_type: &str, id: &str) -> Result<Option<Value>, CoreError> {
        let mut records = self.resolve_reference(resource_type, id).await?;
        Ok(records.remove(id))
    }
}

/// Human-readable label of a reference record, if it has one.
pub fn display_label(record: &Value) -> Option<&str> {
    LABEL_FIELDS
        .iter()
        .find_map(|field| record.get(field).and_then(Value::as_str))
}

// ── Cache state ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    resource_type: String,
    id: String,
}

impl CacheKey {
    fn new(resource_type: &str, id: &str) -> Self {
        Self {
            resource_type: resource_type.to_owned(),
            id: id.to_owned(),
        }
    }
}

enum CacheEntry {
    InFlight,
    Resolved(Arc<Value>),
    Failed,
}

/// Observable state of one cache key.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolutionState {
    Absent,
    InFlight,
    Resolved(Arc<Value>),
    Failed,
}

struct CacheInner<F> {
    fetcher: Arc<F>,
    entries: DashMap<CacheKey, CacheEntry>,
    /// Bumped every time a fetch settles.
    settled: watch::Sender<u64>,
    cancel: CancellationToken,
}

impl<F: ReferenceFetcher> CacheInner<F> {
    fn settle(&self, key: &CacheKey, outcome: Result<Option<Value>, CoreError>) {
        let entry = match outcome {
            Ok(Some(record)) => {
                trace!(resource = %key.resource_type, id = %key.id, "reference resolved");
                CacheEntry::Resolved(Arc::new(record))
            }
            Ok(None) => {
                debug!(resource = %key.resource_type, id = %key.id, "reference unknown to backend");
                CacheEntry::Failed
            }
            Err(e) => {
                warn!(resource = %key.resource_type, id = %key.id, error = %e, "reference resolution failed");
                CacheEntry::Failed
            }
        };

        if let Some(mut slot) = self.entries.get_mut(key) {
            if matches!(*slot, CacheEntry::InFlight) {
                *slot = entry;
            }
        }
        self.settled.send_modify(|n| *n += 1);
    }
}

// ── ReferenceCache ───────────────────────────────────────────────────

/// Deduplicating `(resource_type, id) -> record` cache.
///
/// Cheap to clone; share one per screen.
pub struct ReferenceCache<F> {
    inner: Arc<CacheInner<F>>,
}

impl<F> Clone for ReferenceCache<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F> fmt::Debug for ReferenceCache<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReferenceCache")
            .field("entries", &self.inner.entries.len())
            .field("torn_down", &self.inner.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl<F: ReferenceFetcher> ReferenceCache<F> {
    pub fn new(fetcher: Arc<F>) -> Self {
        let (settled, _) = watch::channel(0);
        Self {
            inner: Arc::new(CacheInner {
                fetcher,
                entries: DashMap::new(),
                settled,
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Cached record for the key, starting a fetch when the key is cold.
    ///
    /// Never blocks. At most one fetch per key is ever in flight, and a
    /// failed key is not retried until [`invalidate`](Self::invalidate)d.
    pub fn resolve(&self, resource_type: &str, id: &str) -> Option<Arc<Value>> {
        if id.is_empty() {
            return None;
        }
        if self.inner.cancel.is_cancelled() {
            return self.get(resource_type, id);
        }

        let key = CacheKey::new(resource_type, id);
        match self.inner.entries.entry(key.clone()) {
            Entry::Occupied(e) => {
                return match e.get() {
                    CacheEntry::Resolved(record) => Some(Arc::clone(record)),
                    CacheEntry::InFlight | CacheEntry::Failed => None,
                };
            }
            Entry::Vacant(e) => {
                e.insert(CacheEntry::InFlight);
            }
        }

        self.spawn_fetch(key);
        None
    }

    /// Label of the record for the key, starting a fetch when cold.
    pub fn resolve_label(&self, resource_type: &str, id: &str) -> Option<String> {
        let record = self.resolve(resource_type, id)?;
        display_label(&record).map(str::to_owned)
    }

    /// Cached record without triggering a fetch.
    pub fn get(&self, resource_type: &str, id: &str) -> Option<Arc<Value>> {
        match self.inner.entries.get(&CacheKey::new(resource_type, id))?.value() {
            CacheEntry::Resolved(record) => Some(Arc::clone(record)),
            CacheEntry::InFlight | CacheEntry::Failed => None,
        }
    }

    pub fn state(&self, resource_type: &str, id: &str) -> ResolutionState {
        match self.inner.entries.get(&CacheKey::new(resource_type, id)) {
            None => ResolutionState::Absent,
            Some(entry) => match entry.value() {
                CacheEntry::InFlight => ResolutionState::InFlight,
                CacheEntry::Resolved(record) => ResolutionState::Resolved(Arc::clone(record)),
                CacheEntry::Failed => ResolutionState::Failed,
            },
        }
    }

    /// Forget a resolved or failed key so the next `resolve` refetches.
    ///
    /// In-flight keys are left alone. Returns whether anything was removed.
    pub fn invalidate(&self, resource_type: &str, id: &str) -> bool {
        self.inner
            .entries
            .remove_if(&CacheKey::new(resource_type, id), |_, entry| {
                !matches!(entry, CacheEntry::InFlight)
            })
            .is_some()
    }

    /// Forget every settled key.
    pub fn clear(&self) {
        self.inner
            .entries
            .retain(|_, entry| matches!(entry, CacheEntry::InFlight));
    }

    /// Receiver bumped each time a fetch settles; renderers re-query on
    /// change.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.settled.subscribe()
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Abandon in-flight fetches. Later `resolve` calls only read.
    pub fn teardown(&self) {
        self.inner.cancel.cancel();
        debug!("reference cache torn down");
    }

    fn spawn_fetch(&self, key: CacheKey) {
        let Ok(handle) = Handle::try_current() else {
            warn!(resource = %key.resource_type, id = %key.id, "no runtime for reference fetch");
            self.inner.entries.remove(&key);
            return;
        };

        let fetcher = Arc::clone(&self.inner.fetcher);
        let cancel = self.inner.cancel.clone();
        let weak: Weak<CacheInner<F>> = Arc::downgrade(&self.inner);
        handle.spawn(async move {
            let outcome = tokio::select! {
                biased;
                () = cancel.cancelled() => return,
                outcome = fetcher.fetch(&key.resource_type, &key.id) => outcome,
            };
            if let Some(inner) = weak.upgrade() {
                inner.settle(&key, outcome);
            }
        });
    }
}
