// Plug-in context
//
// A read-only bag of references handed to rules, enrichment loaders and
// notification receivers. Loaders typically need the cookie jar; anything
// else goes in as named JSON values.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use crate::jar::CookieJar;

#[derive(Clone)]
pub struct Context {
    cookie_jar: Arc<dyn CookieJar>,
    values: BTreeMap<String, Value>,
}

impl Context {
    pub fn new(cookie_jar: Arc<dyn CookieJar>) -> Self {
        Self {
            cookie_jar,
            values: BTreeMap::new(),
        }
    }

    pub fn with_value(mut self, key: impl Into<String>, value: Value) -> Self {
        self.values.insert(key.into(), value);
        self
    }

    pub fn cookie_jar(&self) -> &Arc<dyn CookieJar> {
        &self.cookie_jar
    }

    pub fn value(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("values", &self.values)
            .finish_non_exhaustive()
    }
}
