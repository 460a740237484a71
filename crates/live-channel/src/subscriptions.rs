use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::events::{EventKind, LiveEvent};

/// Listener callback. Identity is the allocation, so registering the same
/// `Listener` twice is a no-op.
pub type Listener = Arc<dyn Fn(&LiveEvent) + Send + Sync>;

pub fn listener<F>(f: F) -> Listener
where
    F: Fn(&LiveEvent) + Send + Sync + 'static,
{
    Arc::new(f)
}

fn same_listener(a: &Listener, b: &Listener) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// Event kind to ordered listeners.
#[derive(Default)]
pub struct SubscriptionTable {
    entries: RwLock<HashMap<EventKind, Vec<Listener>>>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` when the listener was not already registered for `kind`.
    pub fn on(&self, kind: EventKind, listener: &Listener) -> bool {
        let mut guard = self.entries.write();
        let listeners = guard.entry(kind).or_default();
        if listeners.iter().any(|l| same_listener(l, listener)) {
            return false;
        }
        listeners.push(Arc::clone(listener));
        true
    }

    /// Returns `true` when a registration was removed.
    pub fn off(&self, kind: EventKind, listener: &Listener) -> bool {
        let mut guard = self.entries.write();
        let Some(listeners) = guard.get_mut(&kind) else {
            return false;
        };
        let before = listeners.len();
        listeners.retain(|l| !same_listener(l, listener));
        let removed = listeners.len() != before;
        if listeners.is_empty() {
            guard.remove(&kind);
        }
        removed
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.entries.read().get(&kind).map(Vec::len).unwrap_or(0)
    }

    pub fn total_registrations(&self) -> usize {
        self.entries.read().values().map(Vec::len).sum()
    }

    /// Calls every listener for the event's kind in registration order and
    /// returns how many were invoked. The table lock is released before any
    /// listener runs, so listeners may call `on`/`off`.
    pub fn dispatch(&self, event: &LiveEvent) -> usize {
        let snapshot: Vec<Listener> = self
            .entries
            .read()
            .get(&event.kind())
            .cloned()
            .unwrap_or_default();
        for listener in &snapshot {
            listener(event);
        }
        snapshot.len()
    }
}
