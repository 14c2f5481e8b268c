// Named lock pool
//
// Per-document write serialization: one async mutex per in-use name,
// reference counted so idle locks do not accumulate.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Default)]
pub(crate) struct LockPool {
    locks: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

pub(crate) struct NamedLockGuard {
    name: String,
    locks: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl LockPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, name: &str) -> NamedLockGuard {
        let lock = {
            let mut locks = self.locks.lock();
            Arc::clone(locks.entry(name.to_string()).or_default())
        };
        let guard = lock.lock_owned().await;
        NamedLockGuard {
            name: name.to_string(),
            locks: Arc::clone(&self.locks),
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }
}

impl Drop for NamedLockGuard {
    fn drop(&mut self) {
        // Release the mutex before deciding whether the entry is idle.
        self.guard.take();
        let mut locks = self.locks.lock();
        if let Some(lock) = locks.get(&self.name) {
            if Arc::strong_count(lock) == 1 {
                locks.remove(&self.name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn serializes_same_name() {
        let pool = Arc::new(LockPool::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let guard = pool.acquire("doc").await;
        let task = {
            let pool = Arc::clone(&pool);
            let order = Arc::clone(&order);
            tokio::spawn(async move {
                let _guard = pool.acquire("doc").await;
                order.lock().push("second");
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        order.lock().push("first");
        drop(guard);

        task.await.unwrap();
        assert_eq!(*order.lock(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn idle_locks_are_collected() {
        let pool = LockPool::new();
        {
            let _a = pool.acquire("a").await;
            let _b = pool.acquire("b").await;
            assert_eq!(pool.len(), 2);
        }
        assert_eq!(pool.len(), 0);
    }

    #[tokio::test]
    async fn distinct_names_do_not_block() {
        let pool = LockPool::new();
        let _a = pool.acquire("a").await;
        // Must not deadlock.
        let _b = pool.acquire("b").await;
    }
}
