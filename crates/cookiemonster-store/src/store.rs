// Document store backends
//
// The `DocumentStore` trait is the revisionable-store contract the rest of
// the system consumes. `Store<B>` carries the revision bookkeeping, the
// design registry and the materialized view indexes; backends only move raw
// bytes. Conflict detection relies on this process being the single writer,
// which is an explicit deployment assumption.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;

use crate::design::{Design, DesignHandle, QueryParams, View, ViewIndexes, ViewRow};
use crate::document::{next_revision, Document};
use crate::error::StoreError;

/// How many superseded revisions are retained per document.
const REVISION_HISTORY_LIMIT: usize = 10;

/// One row of a bulk lookup: the revision is `None` for unknown keys.
#[derive(Debug, Clone)]
pub struct AllRow {
    pub id: String,
    pub rev: Option<String>,
    pub doc: Option<Document>,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Point read of the current revision.
    async fn get(&self, key: &str) -> Result<Option<Document>, StoreError>;

    /// Bulk point read; every requested key yields a row.
    async fn all(&self, keys: &[String], include_docs: bool) -> Result<Vec<AllRow>, StoreError>;

    /// Insert or update one document; the revision must match the current
    /// one (or be absent for a new document).
    async fn save(&self, doc: Document) -> Result<Document, StoreError>;

    /// Bulk save. With `transaction` set, a revision conflict anywhere fails
    /// the whole batch before anything is written.
    async fn save_bulk(
        &self,
        docs: Vec<Document>,
        transaction: bool,
    ) -> Result<Vec<Document>, StoreError>;

    /// Delete the current revision. Unknown keys are a no-op.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    async fn delete_bulk(&self, keys: &[String]) -> Result<(), StoreError>;

    /// Query a committed view.
    async fn query(
        &self,
        design: &str,
        view: &str,
        params: QueryParams,
    ) -> Result<Vec<ViewRow>, StoreError>;

    /// Current revision first, then retained superseded revisions.
    async fn revisions(&self, key: &str) -> Result<Vec<Document>, StoreError>;

    /// Register a new in-memory design document.
    fn create_design(&self, name: &str) -> DesignHandle;

    fn get_design(&self, name: &str) -> Option<DesignHandle>;

    /// Commit registered designs and (re)build their view indexes. Designs
    /// whose signature is unchanged are not rewritten.
    async fn commit_designs(&self) -> Result<(), StoreError>;
}

/// Raw byte persistence beneath a `Store`.
#[async_trait]
pub trait RawBackend: Send + Sync + 'static {
    async fn read(&self, id: &str) -> Result<Option<Vec<u8>>, StoreError>;
    async fn write(&self, id: &str, bytes: Vec<u8>) -> Result<(), StoreError>;
    async fn remove(&self, id: &str) -> Result<(), StoreError>;
    async fn list(&self) -> Result<Vec<String>, StoreError>;
}

struct State {
    indexes: ViewIndexes,
    /// Views whose indexes are live, as (design name, view) pairs.
    committed_views: Vec<(String, View)>,
    history: HashMap<String, Vec<Document>>,
}

pub struct Store<B> {
    backend: B,
    designs: Mutex<Vec<DesignHandle>>,
    state: AsyncMutex<State>,
}

impl<B: RawBackend> Store<B> {
    fn with_backend(backend: B) -> Self {
        Self {
            backend,
            designs: Mutex::new(Vec::new()),
            state: AsyncMutex::new(State {
                indexes: ViewIndexes::default(),
                committed_views: Vec::new(),
                history: HashMap::new(),
            }),
        }
    }

    async fn read_doc(&self, key: &str) -> Result<Option<Document>, StoreError> {
        match self.backend.read(key).await? {
            Some(bytes) => Ok(Some(Document::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn save_locked(
        &self,
        state: &mut State,
        mut doc: Document,
    ) -> Result<Document, StoreError> {
        let current = self.read_doc(&doc.id).await?;
        let current_rev = current.as_ref().and_then(|d| d.rev.clone());
        if doc.rev != current_rev {
            return Err(StoreError::Conflict(doc.id));
        }

        doc.rev = Some(next_revision(current_rev.as_deref()));
        self.backend.write(&doc.id, doc.to_bytes()?).await?;

        if let Some(previous) = current {
            let history = state.history.entry(doc.id.clone()).or_default();
            history.push(previous);
            if history.len() > REVISION_HISTORY_LIMIT {
                history.remove(0);
            }
        }
        state
            .indexes
            .apply(&state.committed_views, &doc.id, Some(&doc));
        Ok(doc)
    }

    async fn delete_locked(&self, state: &mut State, key: &str) -> Result<(), StoreError> {
        if let Some(current) = self.read_doc(key).await? {
            self.backend.remove(key).await?;
            let history = state.history.entry(key.to_string()).or_default();
            history.push(current);
            if history.len() > REVISION_HISTORY_LIMIT {
                history.remove(0);
            }
            state.indexes.apply(&state.committed_views, key, None);
        }
        Ok(())
    }

    fn find_view(&self, design: &str, view: &str) -> Result<(), StoreError> {
        let designs = self.designs.lock();
        let found = designs.iter().any(|handle| {
            let guard = handle.inner.lock();
            guard.name == design && guard.view(view).is_some()
        });
        if found {
            Ok(())
        } else {
            Err(StoreError::NotFound(format!("{design}/{view}")))
        }
    }
}

#[async_trait]
impl<B: RawBackend> DocumentStore for Store<B> {
    async fn get(&self, key: &str) -> Result<Option<Document>, StoreError> {
        self.read_doc(key).await
    }

    async fn all(&self, keys: &[String], include_docs: bool) -> Result<Vec<AllRow>, StoreError> {
        let mut rows = Vec::with_capacity(keys.len());
        for key in keys {
            let doc = self.read_doc(key).await?;
            rows.push(AllRow {
                id: key.clone(),
                rev: doc.as_ref().and_then(|d| d.rev.clone()),
                doc: if include_docs { doc } else { None },
            });
        }
        Ok(rows)
    }

    async fn save(&self, doc: Document) -> Result<Document, StoreError> {
        if doc.id.starts_with('_') {
            return Err(StoreError::InvalidKey(doc.id));
        }
        let mut state = self.state.lock().await;
        self.save_locked(&mut state, doc).await
    }

    async fn save_bulk(
        &self,
        docs: Vec<Document>,
        transaction: bool,
    ) -> Result<Vec<Document>, StoreError> {
        for doc in &docs {
            if doc.id.starts_with('_') {
                return Err(StoreError::InvalidKey(doc.id.clone()));
            }
        }
        let mut state = self.state.lock().await;

        if transaction {
            for doc in &docs {
                let current_rev = self
                    .read_doc(&doc.id)
                    .await?
                    .and_then(|current| current.rev);
                if doc.rev != current_rev {
                    return Err(StoreError::Conflict(doc.id.clone()));
                }
            }
        }

        let mut saved = Vec::with_capacity(docs.len());
        for doc in docs {
            saved.push(self.save_locked(&mut state, doc).await?);
        }
        Ok(saved)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        self.delete_locked(&mut state, key).await
    }

    async fn delete_bulk(&self, keys: &[String]) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        for key in keys {
            self.delete_locked(&mut state, key).await?;
        }
        Ok(())
    }

    async fn query(
        &self,
        design: &str,
        view: &str,
        params: QueryParams,
    ) -> Result<Vec<ViewRow>, StoreError> {
        self.find_view(design, view)?;
        let state = self.state.lock().await;
        let rows = state.indexes.scan(design, view, &params);

        if params.reduce {
            let count = rows.len();
            return Ok(vec![ViewRow {
                key: crate::design::ViewKey::Null,
                value: Value::from(count),
                id: String::new(),
                doc: None,
            }]);
        }

        let mut out = Vec::with_capacity(rows.len());
        for (key, id, value) in rows {
            let doc = if params.include_docs {
                self.read_doc(&id).await?
            } else {
                None
            };
            out.push(ViewRow {
                key,
                value,
                id,
                doc,
            });
        }
        Ok(out)
    }

    async fn revisions(&self, key: &str) -> Result<Vec<Document>, StoreError> {
        let state = self.state.lock().await;
        let mut revisions = Vec::new();
        if let Some(current) = self.read_doc(key).await? {
            revisions.push(current);
        }
        if let Some(history) = state.history.get(key) {
            revisions.extend(history.iter().rev().cloned());
        }
        Ok(revisions)
    }

    fn create_design(&self, name: &str) -> DesignHandle {
        let mut designs = self.designs.lock();
        if let Some(existing) = designs.iter().find(|handle| handle.name() == name) {
            return existing.clone();
        }
        let handle = DesignHandle {
            inner: Arc::new(Mutex::new(Design::new(name))),
        };
        designs.push(handle.clone());
        handle
    }

    fn get_design(&self, name: &str) -> Option<DesignHandle> {
        self.designs
            .lock()
            .iter()
            .find(|handle| handle.name() == name)
            .cloned()
    }

    async fn commit_designs(&self) -> Result<(), StoreError> {
        let handles: Vec<DesignHandle> = self.designs.lock().clone();
        for handle in handles {
            let (name, signature, views, dirty) = {
                let guard = handle.inner.lock();
                (
                    guard.name.clone(),
                    guard.signature(),
                    guard
                        .views()
                        .map(|view| (guard.name.clone(), view.clone()))
                        .collect::<Vec<_>>(),
                    guard.dirty,
                )
            };
            if !dirty {
                continue;
            }

            // Persist the design metadata only when its signature changed.
            let design_id = format!("_design/{name}");
            let current = self.backend.read(&design_id).await?;
            let current_signature: Option<Value> = current
                .as_deref()
                .and_then(|bytes| serde_json::from_slice(bytes).ok());
            if current_signature.as_ref() != Some(&signature) {
                self.backend
                    .write(&design_id, serde_json::to_vec(&signature)?)
                    .await?;
            }

            // Rebuild the design's indexes from a full scan.
            let doc_ids = self.backend.list().await?;
            let mut state = self.state.lock().await;
            for (design_name, view) in &views {
                state.indexes.clear_view(design_name, &view.name);
                state
                    .committed_views
                    .retain(|(d, v)| !(d == design_name && v.name == view.name));
            }
            state.committed_views.extend(views.clone());
            for id in doc_ids {
                if id.starts_with('_') {
                    continue;
                }
                if let Some(bytes) = self.backend.read(&id).await? {
                    let doc = Document::from_bytes(&bytes)?;
                    state.indexes.apply(&views, &id, Some(&doc));
                }
            }
            drop(state);

            handle.inner.lock().dirty = false;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory backend

#[derive(Default)]
pub struct MemoryBackend {
    docs: Mutex<HashMap<String, Vec<u8>>>,
    offline: std::sync::atomic::AtomicBool,
}

impl MemoryBackend {
    fn check_online(&self) -> Result<(), StoreError> {
        if self.offline.load(std::sync::atomic::Ordering::SeqCst) {
            Err(StoreError::Unavailable("memory store offline".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RawBackend for MemoryBackend {
    async fn read(&self, id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.check_online()?;
        Ok(self.docs.lock().get(id).cloned())
    }

    async fn write(&self, id: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        self.check_online()?;
        self.docs.lock().insert(id.to_string(), bytes);
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), StoreError> {
        self.check_online()?;
        self.docs.lock().remove(id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>, StoreError> {
        self.check_online()?;
        Ok(self.docs.lock().keys().cloned().collect())
    }
}

pub type MemoryStore = Store<MemoryBackend>;

impl Store<MemoryBackend> {
    pub fn new() -> Self {
        Self::with_backend(MemoryBackend::default())
    }

    /// Simulate the store becoming unreachable; used to exercise the
    /// transient-unavailability paths.
    pub fn set_offline(&self, offline: bool) {
        self.backend
            .offline
            .store(offline, std::sync::atomic::Ordering::SeqCst);
    }
}

impl Default for Store<MemoryBackend> {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Filesystem backend (opendal)

pub struct FsBackend {
    operator: opendal::Operator,
}

fn map_opendal(err: opendal::Error) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

#[async_trait]
impl RawBackend for FsBackend {
    async fn read(&self, id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match self.operator.read(&format!("{id}.json")).await {
            Ok(buffer) => Ok(Some(buffer.to_vec())),
            Err(err) if err.kind() == opendal::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(map_opendal(err)),
        }
    }

    async fn write(&self, id: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        self.operator
            .write(&format!("{id}.json"), bytes)
            .await
            .map_err(map_opendal)?;
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), StoreError> {
        match self.operator.delete(&format!("{id}.json")).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == opendal::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(map_opendal(err)),
        }
    }

    async fn list(&self) -> Result<Vec<String>, StoreError> {
        let entries = self
            .operator
            .list_with("")
            .recursive(true)
            .await
            .map_err(map_opendal)?;
        Ok(entries
            .into_iter()
            .filter_map(|entry| {
                entry
                    .path()
                    .strip_suffix(".json")
                    .map(|path| path.to_string())
            })
            .collect())
    }
}

pub type FsStore = Store<FsBackend>;

impl Store<FsBackend> {
    /// Open (creating if necessary) a database directory under `root`.
    pub fn open(root: &str, database: &str) -> Result<Self, StoreError> {
        let service = opendal::services::Fs::default().root(&format!("{root}/{database}"));
        let operator = opendal::Operator::new(service)
            .map_err(map_opendal)?
            .finish();
        Ok(Self::with_backend(FsBackend { operator }))
    }
}
