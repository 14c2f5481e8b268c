// Listener plumbing
//
// Fire-and-forget broadcasts with no back-pressure: listeners must not block
// the broadcaster for long.

use std::sync::Arc;

use parking_lot::RwLock;

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// A callback list guarded by a lock.
///
/// Broadcasters call `notify_listeners`; the callbacks run synchronously on
/// the broadcasting task, in registration order.
pub struct Listenable<T> {
    listeners: RwLock<Vec<Listener<T>>>,
}

impl<T> Listenable<T> {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn add_listener(&self, listener: Listener<T>) {
        self.listeners.write().push(listener);
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn notify_listeners(&self, data: &T) {
        // Snapshot so a listener registering another listener cannot deadlock.
        let snapshot: Vec<Listener<T>> = self.listeners.read().clone();
        for listener in snapshot {
            listener(data);
        }
    }
}

impl<T> Default for Listenable<T> {
    fn default() -> Self {
        Self::new()
    }
}
