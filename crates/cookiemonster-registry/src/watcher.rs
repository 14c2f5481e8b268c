// Directory-backed registries
//
// Watches a plug-in directory and reloads matching files on create, modify
// and delete. Loads for a given registrable type are serialized by a
// type-scoped lock; a file that fails to load is skipped with a warning and
// its previously registered objects survive until a successful reload
// supersedes them.

use std::any::TypeId;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use cookiemonster_core::{Context, Registrable};

use crate::error::RegistryError;
use crate::loader::{PluginLoader, Registrar};
use crate::registry::Registry;

/// One load at a time per registrable type, across all registries.
static LOAD_LOCKS: Lazy<Mutex<HashMap<TypeId, Arc<Mutex<()>>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

fn load_lock<T: 'static>() -> Arc<Mutex<()>> {
    Arc::clone(
        LOAD_LOCKS
            .lock()
            .entry(TypeId::of::<T>())
            .or_default(),
    )
}

struct WatchInner<T: Registrable> {
    registry: Arc<Registry<T>>,
    loader: Arc<dyn PluginLoader<T>>,
    ctx: Arc<Context>,
    pattern: Regex,
    by_file: Mutex<HashMap<PathBuf, Vec<T>>>,
}

impl<T: Registrable> WatchInner<T> {
    fn matches(&self, path: &Path) -> bool {
        path.to_str()
            .map(|p| self.pattern.is_match(p))
            .unwrap_or(false)
    }

    fn load_file(&self, path: &Path) {
        let lock = load_lock::<T>();
        let _guard = lock.lock();

        let mut registrar = Registrar::new();
        match self.loader.load(path, &mut registrar, &self.ctx) {
            Ok(()) => {
                let objects = registrar.into_registered();
                info!(path = %path.display(), count = objects.len(), "loaded plug-in file");
                self.by_file.lock().insert(path.to_path_buf(), objects);
                self.publish();
            }
            Err(err) => {
                warn!(path = %path.display(), %err, "failed to load plug-in file, keeping previous objects");
            }
        }
    }

    fn remove_file(&self, path: &Path) {
        let lock = load_lock::<T>();
        let _guard = lock.lock();

        if self.by_file.lock().remove(path).is_some() {
            info!(path = %path.display(), "removed plug-in file");
            self.publish();
        }
    }

    fn publish(&self) {
        let combined: Vec<T> = self
            .by_file
            .lock()
            .values()
            .flat_map(|objects| objects.iter().cloned())
            .collect();
        self.registry.set_dynamic(combined);
    }
}

/// A registry populated from a watched directory of plug-in files.
pub struct DirectoryRegistry<T: Registrable> {
    inner: Arc<WatchInner<T>>,
    directory: PathBuf,
    // Dropping the watcher stops event delivery.
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl<T: Registrable> DirectoryRegistry<T> {
    /// Watch `directory` for files whose path matches `pattern`, loading
    /// them with `loader`. Performs an initial scan before returning.
    pub fn start(
        registry: Arc<Registry<T>>,
        directory: impl Into<PathBuf>,
        pattern: &str,
        loader: Arc<dyn PluginLoader<T>>,
        ctx: Arc<Context>,
    ) -> Result<Self, RegistryError> {
        let directory = directory.into();
        let inner = Arc::new(WatchInner {
            registry,
            loader,
            ctx,
            pattern: Regex::new(pattern)?,
            by_file: Mutex::new(HashMap::new()),
        });

        let (events_tx, events_rx) = mpsc::unbounded_channel::<Event>();
        let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
            match result {
                Ok(event) => {
                    let _ = events_tx.send(event);
                }
                Err(err) => warn!(%err, "plug-in directory watch error"),
            }
        })?;
        watcher.watch(&directory, RecursiveMode::NonRecursive)?;

        let registry = Self {
            inner: Arc::clone(&inner),
            directory,
            _watcher: watcher,
            task: tokio::spawn(event_loop(inner, events_rx)),
        };
        registry.rescan()?;
        Ok(registry)
    }

    /// Synchronously reload every matching file currently in the directory.
    pub fn rescan(&self) -> Result<(), RegistryError> {
        for entry in std::fs::read_dir(&self.directory)? {
            let path = entry?.path();
            if path.is_file() && self.inner.matches(&path) {
                self.inner.load_file(&path);
            }
        }
        Ok(())
    }
}

impl<T: Registrable> Drop for DirectoryRegistry<T> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn event_loop<T: Registrable>(
    inner: Arc<WatchInner<T>>,
    mut events: mpsc::UnboundedReceiver<Event>,
) {
    while let Some(event) = events.recv().await {
        for path in &event.paths {
            if !inner.matches(path) {
                continue;
            }
            debug!(path = %path.display(), kind = ?event.kind, "plug-in directory event");
            match event.kind {
                EventKind::Create(_) | EventKind::Modify(_) => {
                    if path.is_file() {
                        inner.load_file(path);
                    } else {
                        inner.remove_file(path);
                    }
                }
                EventKind::Remove(_) => inner.remove_file(path),
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::FnLoader;
    use cookiemonster_core::{Rule, RuleAction};
    use cookiemonster_jar::MemoryCookieJar;
    use std::time::Duration;

    /// Parses "id priority" plug-in files, one rule per line.
    fn line_loader() -> Arc<dyn PluginLoader<Rule>> {
        Arc::new(FnLoader::new(
            |path: &Path, registrar: &mut Registrar<Rule>, _ctx: &Arc<Context>| {
                let contents = std::fs::read_to_string(path)?;
                for line in contents.lines().filter(|l| !l.trim().is_empty()) {
                    let (id, priority) = line
                        .split_once(' ')
                        .ok_or_else(|| anyhow::anyhow!("malformed rule line: {line}"))?;
                    let priority: i32 = priority.trim().parse()?;
                    registrar.register(Rule::new(
                        id.trim(),
                        priority,
                        |_, _| Ok(false),
                        |_, _| Ok(RuleAction::new(Vec::new(), false)),
                    ));
                }
                Ok(())
            },
        ))
    }

    fn ctx() -> Arc<Context> {
        Arc::new(Context::new(Arc::new(MemoryCookieJar::new())))
    }

    fn ids(registry: &Registry<Rule>) -> Vec<String> {
        registry
            .get_all()
            .iter()
            .map(|r| r.stable_id().to_string())
            .collect()
    }

    #[tokio::test]
    async fn initial_scan_loads_matching_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("match.rule"), "high 9\nlow 1\n").unwrap();
        std::fs::write(dir.path().join("ignored.txt"), "nope 5\n").unwrap();

        let registry = Arc::new(Registry::new());
        let _watcher = DirectoryRegistry::start(
            Arc::clone(&registry),
            dir.path(),
            r"\.rule$",
            line_loader(),
            ctx(),
        )
        .unwrap();

        assert_eq!(ids(&registry), vec!["high", "low"]);
    }

    #[tokio::test]
    async fn broken_file_keeps_previous_objects() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.rule");
        std::fs::write(&file, "good 5\n").unwrap();

        let registry = Arc::new(Registry::new());
        let watcher = DirectoryRegistry::start(
            Arc::clone(&registry),
            dir.path(),
            r"\.rule$",
            line_loader(),
            ctx(),
        )
        .unwrap();
        assert_eq!(ids(&registry), vec!["good"]);

        std::fs::write(&file, "this is not parseable\n").unwrap();
        watcher.rescan().unwrap();
        assert_eq!(ids(&registry), vec!["good"]);

        std::fs::write(&file, "better 7\n").unwrap();
        watcher.rescan().unwrap();
        assert_eq!(ids(&registry), vec!["better"]);
    }

    #[tokio::test]
    async fn watcher_picks_up_new_files() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(Registry::new());
        let _watcher = DirectoryRegistry::start(
            Arc::clone(&registry),
            dir.path(),
            r"\.rule$",
            line_loader(),
            ctx(),
        )
        .unwrap();
        assert!(registry.is_empty());

        std::fs::write(dir.path().join("late.rule"), "late 3\n").unwrap();

        // Allow the filesystem event to propagate.
        for _ in 0..50 {
            if !registry.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(ids(&registry), vec!["late"]);
    }

    #[tokio::test]
    async fn removed_files_drop_their_objects() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.rule");
        std::fs::write(&file, "gone 5\n").unwrap();

        let registry = Arc::new(Registry::new());
        let _watcher = DirectoryRegistry::start(
            Arc::clone(&registry),
            dir.path(),
            r"\.rule$",
            line_loader(),
            ctx(),
        )
        .unwrap();
        assert_eq!(ids(&registry), vec!["gone"]);

        std::fs::remove_file(&file).unwrap();
        for _ in 0..50 {
            if registry.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(registry.is_empty());
    }
}
