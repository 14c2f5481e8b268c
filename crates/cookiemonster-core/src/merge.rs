// Same-target update merging
//
// A retrieval batch may report several updates for one target (e.g. a data
// modification and a metadata modification observed in the same window).
// These collapse into a single update before anything downstream sees them.

use serde_json::Value;

use crate::models::Update;

/// Merge updates that share a target into one update each.
///
/// The combined timestamp is the maximum of the merged timestamps. Scalar
/// metadata keys are last-write-wins; array-valued keys are unioned
/// element-wise. Updates are pre-sorted by (timestamp, serialized form) so
/// the arrival order within a batch cannot affect the result.
pub fn merge_updates(mut updates: Vec<Update>) -> Vec<Update> {
    updates.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| serialized(a).cmp(&serialized(b)))
    });

    let mut merged: Vec<Update> = Vec::with_capacity(updates.len());
    for update in updates {
        match merged.iter_mut().find(|u| u.target == update.target) {
            None => merged.push(update),
            Some(existing) => {
                if update.timestamp > existing.timestamp {
                    existing.timestamp = update.timestamp;
                }
                for (key, value) in update.metadata {
                    match (existing.metadata.get_mut(&key), value) {
                        (Some(Value::Array(current)), Value::Array(incoming)) => {
                            for element in incoming {
                                if !current.contains(&element) {
                                    current.push(element);
                                }
                            }
                        }
                        (_, value) => {
                            existing.metadata.insert(key, value);
                        }
                    }
                }
            }
        }
    }
    merged
}

fn serialized(update: &Update) -> String {
    serde_json::to_string(update).unwrap_or_default()
}

/// Updates in `updates` carrying the most recent timestamp.
pub fn most_recent(updates: &[Update]) -> Vec<&Update> {
    let newest = match updates.iter().map(|u| u.timestamp).max() {
        Some(ts) => ts,
        None => return Vec::new(),
    };
    updates.iter().filter(|u| u.timestamp == newest).collect()
}

/// Updates relating to a single target.
pub fn updates_for_target<'a>(updates: &'a [Update], target: &str) -> Vec<&'a Update> {
    updates.iter().filter(|u| u.target == target).collect()
}
