// ── Debounced entity reconciliation ──
//
// One authoritative id-keyed map per collection. Mutations land in the map
// immediately; publication is coalesced. The first change after a flush
// arms a one-shot timer, later changes ride along without re-arming it,
// and the timer publishes a single immutable snapshot.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use indexmap::IndexMap;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::model::{Entity, EntityPatch};
use crate::stream::EntityStream;

type Snapshot<T> = Arc<Vec<Arc<T>>>;

/// A narrow, high-frequency update to one entity (a position fix, a
/// status change).
pub trait FieldUpdate<T>: Send {
    /// `true` when applying would change neither the values nor their
    /// associated timestamp.
    fn is_noop(&self, current: &T) -> bool;

    fn apply_to(self, current: &mut T);
}

/// Addresses an entity by primary id, or failing that by secondary key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LookupKey<'a> {
    pub id: Option<&'a str>,
    pub secondary: Option<&'a str>,
}

impl<'a> LookupKey<'a> {
    pub fn new(id: Option<&'a str>, secondary: Option<&'a str>) -> Self {
        Self { id, secondary }
    }

    pub fn id(id: &'a str) -> Self {
        Self::new(Some(id), None)
    }

    pub fn secondary(key: &'a str) -> Self {
        Self::new(None, Some(key))
    }
}

// ── Internal state ───────────────────────────────────────────────────

enum FlushState {
    Idle,
    Scheduled(JoinHandle<()>),
    TornDown,
}

struct StoreState<T> {
    /// Insertion-ordered; re-inserting an existing id keeps its slot.
    entities: IndexMap<String, Arc<T>>,
    /// Secondary key -> primary id.
    by_secondary: HashMap<String, String>,
    flush: FlushState,
}

impl<T: Entity> StoreState<T> {
    fn put(&mut self, entity: T) {
        let id = entity.id().to_owned();
        if let Some(old_key) = self.entities.get(&id).and_then(|old| old.secondary_key()) {
            if Some(old_key) != entity.secondary_key() {
                self.by_secondary.remove(old_key);
            }
        }
        if let Some(key) = entity.secondary_key() {
            self.by_secondary.insert(key.to_owned(), id.clone());
        }
        self.entities.insert(id, Arc::new(entity));
    }

    fn resolve(&self, key: LookupKey<'_>) -> Option<String> {
        key.id
            .filter(|id| self.entities.contains_key(*id))
            .map(str::to_owned)
            .or_else(|| {
                key.secondary
                    .and_then(|k| self.by_secondary.get(k))
                    .cloned()
            })
    }
}

struct StoreInner<T> {
    name: &'static str,
    delay: Duration,
    state: Mutex<StoreState<T>>,
    snapshot: watch::Sender<Snapshot<T>>,
    version: watch::Sender<u64>,
}

impl<T: Entity> StoreInner<T> {
    fn lock(&self) -> MutexGuard<'_, StoreState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Timer callback. A store torn down in the meantime stays silent.
    fn flush(&self) {
        let mut state = self.lock();
        if !matches!(state.flush, FlushState::Scheduled(_)) {
            return;
        }
        state.flush = FlushState::Idle;
        self.publish(&state);
    }

    /// Publish the current map while the caller holds the lock.
    fn publish(&self, state: &StoreState<T>) {
        let values: Vec<Arc<T>> = state.entities.values().cloned().collect();
        let count = values.len();
        self.snapshot.send_replace(Arc::new(values));
        self.version.send_modify(|v| *v += 1);
        debug!(store = self.name, count, "published snapshot");
    }
}

// ── ReconciliationStore ──────────────────────────────────────────────

/// Authoritative id-keyed collection with debounced snapshot publication.
///
/// Cheap to clone; clones share the same map and channels. Consumers only
/// ever see snapshots published by the coalescing timer, never the live
/// map, so a burst of updates inside one window is observed once, fully
/// merged.
pub struct ReconciliationStore<T: Entity> {
    inner: Arc<StoreInner<T>>,
}

impl<T: Entity> Clone for ReconciliationStore<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Entity> fmt::Debug for ReconciliationStore<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconciliationStore")
            .field("name", &self.inner.name)
            .field("delay", &self.inner.delay)
            .field("len", &self.len())
            .field("version", &self.version())
            .finish_non_exhaustive()
    }
}

impl<T: Entity> ReconciliationStore<T> {
    /// A store named `name` (used in logs) coalescing over `delay`.
    pub fn new(name: &'static str, delay: Duration) -> Self {
        let (snapshot, _) = watch::channel(Arc::new(Vec::new()));
        let (version, _) = watch::channel(0u64);
        Self {
            inner: Arc::new(StoreInner {
                name,
                delay,
                state: Mutex::new(StoreState {
                    entities: IndexMap::new(),
                    by_secondary: HashMap::new(),
                    flush: FlushState::Idle,
                }),
                snapshot,
                version,
            }),
        }
    }

    // ── Mutations ────────────────────────────────────────────────────

    /// Replace the whole map. Items without an id are dropped.
    ///
    /// Returns the number of entities kept.
    pub fn load_snapshot<I>(&self, items: I) -> usize
    where
        I: IntoIterator<Item = T>,
    {
        let mut state = self.inner.lock();
        if matches!(state.flush, FlushState::TornDown) {
            return 0;
        }

        state.entities.clear();
        state.by_secondary.clear();
        let mut dropped = 0usize;
        for item in items {
            if item.id().is_empty() {
                dropped += 1;
                continue;
            }
            state.put(item);
        }
        if dropped > 0 {
            debug!(store = self.inner.name, dropped, "ignored items without id");
        }

        let kept = state.entities.len();
        self.schedule_flush(&mut state);
        kept
    }

    /// Shallow-merge `patch` over the entity with the same id.
    ///
    /// Patches for entities the store does not hold are dropped; only
    /// [`insert_new`](Self::insert_new) creates entities. A patch that
    /// leaves the entity unchanged schedules no publish.
    pub fn apply_patch(&self, patch: T::Patch) -> bool {
        let mut state = self.inner.lock();
        if matches!(state.flush, FlushState::TornDown) {
            return false;
        }

        let Some(current) = state.entities.get(patch.id()) else {
            trace!(store = self.inner.name, id = patch.id(), "patch for unknown entity dropped");
            return false;
        };
        let mut merged = T::clone(current);
        merged.merge(patch);
        if merged == **current {
            trace!(store = self.inner.name, id = merged.id(), "patch changed nothing");
            return false;
        }
        state.put(merged);
        self.schedule_flush(&mut state);
        true
    }

    /// Insert a complete entity, replacing any prior version.
    pub fn insert_new(&self, entity: T) -> bool {
        if entity.id().is_empty() {
            return false;
        }
        let mut state = self.inner.lock();
        if matches!(state.flush, FlushState::TornDown) {
            return false;
        }
        state.put(entity);
        self.schedule_flush(&mut state);
        true
    }

    /// Apply a narrow update to an existing entity.
    ///
    /// Returns `false` without scheduling a publish when the entity is
    /// unknown or the update would change nothing.
    pub fn apply_field_update<U>(&self, key: LookupKey<'_>, update: U) -> bool
    where
        U: FieldUpdate<T>,
    {
        let mut state = self.inner.lock();
        if matches!(state.flush, FlushState::TornDown) {
            return false;
        }

        let Some(id) = state.resolve(key) else {
            trace!(store = self.inner.name, ?key, "field update for unknown entity dropped");
            return false;
        };
        let Some(entry) = state.entities.get_mut(&id) else {
            return false;
        };
        if update.is_noop(entry) {
            trace!(store = self.inner.name, id = %id, "field update is a no-op");
            return false;
        }
        update.apply_to(Arc::make_mut(entry));
        self.schedule_flush(&mut state);
        true
    }

    /// Cancel any pending publish. Later mutations are ignored.
    pub fn teardown(&self) {
        let mut state = self.inner.lock();
        if let FlushState::Scheduled(task) =
            std::mem::replace(&mut state.flush, FlushState::TornDown)
        {
            task.abort();
        }
        debug!(store = self.inner.name, "store torn down");
    }

    // ── Live reads (for event handlers) ──────────────────────────────

    pub fn get(&self, id: &str) -> Option<Arc<T>> {
        self.inner.lock().entities.get(id).cloned()
    }

    pub fn get_by_secondary(&self, key: &str) -> Option<Arc<T>> {
        let state = self.inner.lock();
        let id = state.by_secondary.get(key)?;
        state.entities.get(id).cloned()
    }

    /// Primary id for `key`, following the same rules as
    /// [`apply_field_update`](Self::apply_field_update).
    pub fn resolve_id(&self, key: LookupKey<'_>) -> Option<String> {
        self.inner.lock().resolve(key)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ── Published view ───────────────────────────────────────────────

    /// Last published snapshot (cheap `Arc` clone).
    pub fn snapshot(&self) -> Snapshot<T> {
        self.inner.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> EntityStream<T> {
        EntityStream::new(self.inner.snapshot.subscribe())
    }

    /// Number of snapshots published so far.
    pub fn version(&self) -> u64 {
        *self.inner.version.borrow()
    }

    pub fn is_flush_scheduled(&self) -> bool {
        matches!(self.inner.lock().flush, FlushState::Scheduled(_))
    }

    // ── Coalescing ───────────────────────────────────────────────────

    fn schedule_flush(&self, state: &mut StoreState<T>) {
        if !matches!(state.flush, FlushState::Idle) {
            return;
        }

        match Handle::try_current() {
            Ok(handle) => {
                let weak = Arc::downgrade(&self.inner);
                let delay = self.inner.delay;
                let task = handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(inner) = weak.upgrade() {
                        inner.flush();
                    }
                });
                state.flush = FlushState::Scheduled(task);
            }
            // Outside a runtime there is no timer to coalesce on.
            Err(_) => self.inner.publish(state),
        }
    }
}
