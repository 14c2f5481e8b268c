// Core data model
//
// Updates arrive from an external source, become enrichments once they are
// attached to a cookie, and cookies accumulate enrichments until the rule
// pipeline disposes of them.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Free-form metadata carried by updates and enrichments.
pub type Metadata = std::collections::BTreeMap<String, Value>;

/// A change reported by the external storage system about a single target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Update {
    pub target: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Update {
    pub fn new(target: impl Into<String>, timestamp: DateTime<Utc>, metadata: Metadata) -> Self {
        Self {
            target: target.into(),
            timestamp,
            metadata,
        }
    }
}

/// An immutable addition to a cookie's history, tagged by source and time.
///
/// Enrichments are totally ordered within a cookie by timestamp; ties keep
/// insertion order (sorting is always stable).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Enrichment {
    pub source: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Enrichment {
    pub fn new(source: impl Into<String>, timestamp: DateTime<Utc>, metadata: Metadata) -> Self {
        Self {
            source: source.into(),
            timestamp,
            metadata,
        }
    }
}

/// The accumulated metadata record for a single file.
///
/// The identifier is opaque to the core; in practice it is a path in the
/// external storage system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cookie {
    pub identifier: String,
    #[serde(default)]
    pub enrichments: Vec<Enrichment>,
}

impl Cookie {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            enrichments: Vec::new(),
        }
    }

    /// Append an enrichment, keeping the history in chronological order.
    pub fn enrich(&mut self, enrichment: Enrichment) {
        self.enrichments.push(enrichment);
        self.enrichments.sort_by_key(|e| e.timestamp);
    }

    /// Latest metadata value recorded by `source` under `key`, if any.
    ///
    /// The history is chronological, so the scan runs newest-first.
    pub fn metadata_by_source(&self, source: &str, key: &str) -> Option<&Value> {
        self.enrichments
            .iter()
            .rev()
            .find_map(|e| (e.source == source).then(|| e.metadata.get(key)).flatten())
    }

    /// Distinct enrichment sources for which metadata exists.
    pub fn metadata_sources(&self) -> BTreeSet<&str> {
        self.enrichments.iter().map(|e| e.source.as_str()).collect()
    }
}

/// A message for downstream consumers, produced by the rule pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub about: String,
    pub sender: String,
    #[serde(default)]
    pub data: Value,
}

impl Notification {
    pub fn new(about: impl Into<String>, sender: impl Into<String>, data: Value) -> Self {
        Self {
            about: about.into(),
            sender: sender.into(),
            data,
        }
    }
}
