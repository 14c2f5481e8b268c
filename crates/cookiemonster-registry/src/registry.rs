// Registry snapshots
//
// Two populations feed a registry: statically registered objects (wired by
// the host at startup) and dynamically loaded objects (from a plug-in
// directory). Consumers only ever see the combined, ordered snapshot.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use cookiemonster_core::Registrable;

pub struct Registry<T: Registrable> {
    statics: Mutex<Vec<T>>,
    dynamic: Mutex<Vec<T>>,
    snapshot: RwLock<Arc<Vec<T>>>,
}

impl<T: Registrable> Registry<T> {
    pub fn new() -> Self {
        Self {
            statics: Mutex::new(Vec::new()),
            dynamic: Mutex::new(Vec::new()),
            snapshot: RwLock::new(Arc::new(Vec::new())),
        }
    }

    /// The current snapshot, ordered by descending priority with ties
    /// broken by stable id.
    pub fn get_all(&self) -> Arc<Vec<T>> {
        Arc::clone(&self.snapshot.read())
    }

    pub fn is_empty(&self) -> bool {
        self.get_all().is_empty()
    }

    /// Register an object for the lifetime of the registry.
    pub fn register_static(&self, item: T) {
        self.statics.lock().push(item);
        self.rebuild();
    }

    /// Replace the dynamically loaded population.
    pub(crate) fn set_dynamic(&self, items: Vec<T>) {
        *self.dynamic.lock() = items;
        self.rebuild();
    }

    fn rebuild(&self) {
        let mut combined: Vec<T> = Vec::new();
        combined.extend(self.statics.lock().iter().cloned());
        combined.extend(self.dynamic.lock().iter().cloned());
        combined.sort_by(|a, b| {
            b.priority()
                .cmp(&a.priority())
                .then_with(|| a.stable_id().cmp(b.stable_id()))
        });
        *self.snapshot.write() = Arc::new(combined);
    }
}

impl<T: Registrable> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}
