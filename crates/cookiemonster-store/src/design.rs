// Designs and views
//
// A design is a named set of views. A view maps documents to keyed rows and
// may carry a count-reduce. Where CouchDB evaluates javascript map
// functions, here the map is a typed Rust function; the store maintains a
// materialized index per view so queries are an ordered range scan rather
// than a table walk.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::document::Document;

/// View keys sort null < integers < strings, each kind internally ordered.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum ViewKey {
    Null,
    Int(i64),
    Str(String),
}

impl ViewKey {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ViewKey::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ViewKey::Str(value) => Some(value),
            _ => None,
        }
    }
}

pub type MapFn = Arc<dyn Fn(&Document) -> Vec<(ViewKey, Value)> + Send + Sync>;

#[derive(Clone)]
pub struct View {
    pub name: String,
    pub map: MapFn,
    /// When set, `reduce = true` queries return a single count row.
    pub reduce_count: bool,
}

/// An in-memory design document, built up view by view and committed to the
/// database as one.
pub struct Design {
    pub name: String,
    views: BTreeMap<String, View>,
    pub(crate) dirty: bool,
}

impl Design {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            views: BTreeMap::new(),
            dirty: true,
        }
    }

    pub fn define_view<F>(&mut self, name: impl Into<String>, map: F, reduce_count: bool)
    where
        F: Fn(&Document) -> Vec<(ViewKey, Value)> + Send + Sync + 'static,
    {
        let name = name.into();
        self.views.insert(
            name.clone(),
            View {
                name,
                map: Arc::new(map),
                reduce_count,
            },
        );
        self.dirty = true;
    }

    pub fn views(&self) -> impl Iterator<Item = &View> {
        self.views.values()
    }

    pub fn view(&self, name: &str) -> Option<&View> {
        self.views.get(name)
    }

    /// Stable signature persisted in the design's metadata document; commits
    /// are skipped when the signature is unchanged.
    pub(crate) fn signature(&self) -> Value {
        let views: Vec<Value> = self
            .views
            .values()
            .map(|view| json!({ "name": view.name, "reduce": view.reduce_count }))
            .collect();
        json!({ "language": "rust", "views": views })
    }
}

/// Shared handle to a design registered on a store.
#[derive(Clone)]
pub struct DesignHandle {
    pub(crate) inner: Arc<Mutex<Design>>,
}

impl DesignHandle {
    pub fn define_view<F>(&self, name: impl Into<String>, map: F, reduce_count: bool)
    where
        F: Fn(&Document) -> Vec<(ViewKey, Value)> + Send + Sync + 'static,
    {
        self.inner.lock().define_view(name, map, reduce_count);
    }

    pub fn name(&self) -> String {
        self.inner.lock().name.clone()
    }
}

/// Query options for a view, CouchDB style.
#[derive(Debug, Clone, Default)]
pub struct QueryParams {
    pub key: Option<ViewKey>,
    pub start_key: Option<ViewKey>,
    pub end_key: Option<ViewKey>,
    pub limit: Option<usize>,
    pub descending: bool,
    pub reduce: bool,
    pub include_docs: bool,
}

impl QueryParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key(mut self, key: ViewKey) -> Self {
        self.key = Some(key);
        self
    }

    pub fn end_key(mut self, key: ViewKey) -> Self {
        self.end_key = Some(key);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn reduce(mut self) -> Self {
        self.reduce = true;
        self
    }

    pub fn include_docs(mut self) -> Self {
        self.include_docs = true;
        self
    }
}

#[derive(Debug, Clone)]
pub struct ViewRow {
    pub key: ViewKey,
    pub value: Value,
    pub id: String,
    pub doc: Option<Document>,
}

/// Materialized view entries for every committed view, plus the reverse map
/// needed to retract a document's rows when it changes.
#[derive(Default)]
pub(crate) struct ViewIndexes {
    entries: HashMap<(String, String), BTreeMap<(ViewKey, String), Value>>,
    emitted: HashMap<String, Vec<(String, String, ViewKey)>>,
}

impl ViewIndexes {
    pub fn clear_view(&mut self, design: &str, view: &str) {
        self.entries
            .remove(&(design.to_string(), view.to_string()));
        for rows in self.emitted.values_mut() {
            rows.retain(|(d, v, _)| !(d == design && v == view));
        }
    }

    /// Re-map one document across the given views, retracting whatever it
    /// previously emitted into them.
    pub fn apply(
        &mut self,
        views: &[(String, View)],
        doc_id: &str,
        doc: Option<&Document>,
    ) {
        if let Some(rows) = self.emitted.remove(doc_id) {
            let mut kept = Vec::new();
            for (design, view, key) in rows {
                let in_scope = views.iter().any(|(d, v)| *d == design && v.name == view);
                if in_scope {
                    if let Some(index) = self.entries.get_mut(&(design.clone(), view.clone())) {
                        index.remove(&(key.clone(), doc_id.to_string()));
                    }
                } else {
                    kept.push((design, view, key));
                }
            }
            if !kept.is_empty() {
                self.emitted.insert(doc_id.to_string(), kept);
            }
        }

        let doc = match doc {
            Some(doc) => doc,
            None => return,
        };
        if doc.id.starts_with('_') {
            return;
        }

        for (design, view) in views {
            for (key, value) in (view.map)(doc) {
                self.entries
                    .entry((design.clone(), view.name.clone()))
                    .or_default()
                    .insert((key.clone(), doc.id.clone()), value);
                self.emitted
                    .entry(doc_id.to_string())
                    .or_default()
                    .push((design.clone(), view.name.clone(), key));
            }
        }
    }

    pub fn scan(&self, design: &str, view: &str, params: &QueryParams) -> Vec<(ViewKey, String, Value)> {
        let index = match self
            .entries
            .get(&(design.to_string(), view.to_string()))
        {
            Some(index) => index,
            None => return Vec::new(),
        };

        let (start, end) = match &params.key {
            Some(key) => (Some(key.clone()), Some(key.clone())),
            None => (params.start_key.clone(), params.end_key.clone()),
        };

        let lower = match &start {
            Some(key) => Bound::Included((key.clone(), String::new())),
            None => Bound::Unbounded,
        };

        let mut rows: Vec<(ViewKey, String, Value)> = index
            .range((lower, Bound::Unbounded))
            .take_while(|((key, _), _)| match &end {
                Some(end) => key <= end,
                None => true,
            })
            .map(|((key, id), value)| (key.clone(), id.clone(), value.clone()))
            .collect();

        if params.descending {
            rows.reverse();
        }
        if let Some(limit) = params.limit {
            rows.truncate(limit);
        }
        rows
    }
}
