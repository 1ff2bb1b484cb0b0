use super::messages::{EventKind, ServerEvent};
use std::collections::HashMap;
use std::sync::Arc;

/// Callback invoked with every received event of the kind it was registered for.
///
/// Listener identity is the `Arc` allocation: registering a clone of the same
/// `Arc` twice is a no-op.
pub type Listener = Arc<dyn Fn(&ServerEvent) + Send + Sync>;

/// Dispatch table from event kind to its listeners.
#[derive(Default)]
pub struct ListenerTable {
    by_kind: HashMap<EventKind, Vec<Listener>>,
}

impl ListenerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if this exact listener was already registered for `kind`.
    pub fn insert(&mut self, kind: EventKind, listener: Listener) -> bool {
        let listeners = self.by_kind.entry(kind).or_default();
        if listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            return false;
        }
        listeners.push(listener);
        true
    }

    /// Returns false if the listener was not registered for `kind`.
    pub fn remove(&mut self, kind: EventKind, listener: &Listener) -> bool {
        let Some(listeners) = self.by_kind.get_mut(&kind) else {
            return false;
        };
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        let removed = listeners.len() != before;
        if listeners.is_empty() {
            self.by_kind.remove(&kind);
        }
        removed
    }

    /// Snapshot of the listeners for `kind`, so callbacks run without the
    /// table borrowed and may register or remove listeners themselves.
    pub fn listeners_for(&self, kind: EventKind) -> Vec<Listener> {
        self.by_kind.get(&kind).cloned().unwrap_or_default()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.by_kind.get(&kind).map(Vec::len).unwrap_or(0)
    }
}
