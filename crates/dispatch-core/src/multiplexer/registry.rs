// ── Subscription registry ──
//
// Event name -> handler list, plus the any-event list. Handler identity is
// the `Arc` data pointer, so registering the same handler twice is a no-op
// while distinct closures with identical code stay distinct.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::CoreError;
use crate::model::StreamEvent;

/// A stream event handler. Runs synchronously in the delivery turn.
pub type EventHandler = Arc<dyn Fn(&StreamEvent) -> Result<(), CoreError> + Send + Sync>;

pub(crate) fn same_handler(a: &EventHandler, b: &EventHandler) -> bool {
    std::ptr::eq(Arc::as_ptr(a).cast::<()>(), Arc::as_ptr(b).cast::<()>())
}

#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    by_name: HashMap<String, Vec<EventHandler>>,
    any: Vec<EventHandler>,
}

impl SubscriptionRegistry {
    /// Register `handler` for `name`. Returns `true` when `name` had no
    /// handlers before.
    pub(crate) fn add(&mut self, name: &str, handler: EventHandler) -> bool {
        let handlers = self.by_name.entry(name.to_owned()).or_default();
        let first = handlers.is_empty();
        if !handlers.iter().any(|h| same_handler(h, &handler)) {
            handlers.push(handler);
        }
        first
    }

    /// Unregister `handler` from `name`. Returns `Some(true)` when it was
    /// the last one, `None` when it was not registered.
    pub(crate) fn remove(&mut self, name: &str, handler: &EventHandler) -> Option<bool> {
        let handlers = self.by_name.get_mut(name)?;
        let pos = handlers.iter().position(|h| same_handler(h, handler))?;
        handlers.remove(pos);
        let last = handlers.is_empty();
        if last {
            self.by_name.remove(name);
        }
        Some(last)
    }

    pub(crate) fn add_any(&mut self, handler: EventHandler) {
        if !self.any.iter().any(|h| same_handler(h, &handler)) {
            self.any.push(handler);
        }
    }

    pub(crate) fn remove_any(&mut self, handler: &EventHandler) -> bool {
        let before = self.any.len();
        self.any.retain(|h| !same_handler(h, handler));
        self.any.len() != before
    }

    pub(crate) fn names(&self) -> impl Iterator<Item = &str> {
        self.by_name.keys().map(String::as_str)
    }

    pub(crate) fn handler_count(&self, name: &str) -> usize {
        self.by_name.get(name).map_or(0, Vec::len)
    }

    /// Handlers for `name` followed by the any-event handlers.
    pub(crate) fn handlers_for(&self, name: &str) -> Vec<EventHandler> {
        self.by_name
            .get(name)
            .into_iter()
            .flatten()
            .chain(&self.any)
            .cloned()
            .collect()
    }
}
