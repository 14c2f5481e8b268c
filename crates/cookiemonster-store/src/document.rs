// Document model
//
// A document is a JSON object with a string key and an opaque revision
// token. Revision tokens are "{generation}-{nonce}"; the generation grows on
// every write so stale writers can be rejected.

use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::StoreError;

#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub rev: Option<String>,
    pub data: Map<String, Value>,
}

impl Document {
    pub fn new(id: impl Into<String>, data: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            rev: None,
            data,
        }
    }

    /// A document with a freshly generated key.
    pub fn with_generated_id(data: Map<String, Value>) -> Self {
        Self::new(Uuid::new_v4().simple().to_string(), data)
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn bool_field(&self, key: &str) -> bool {
        self.data.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    pub fn int_field(&self, key: &str) -> Option<i64> {
        self.data.get(key).and_then(Value::as_i64)
    }

    /// Serialize to the wire form, with `_id` and `_rev` folded in.
    pub fn to_bytes(&self) -> Result<Vec<u8>, StoreError> {
        let mut object = self.data.clone();
        object.insert("_id".to_string(), Value::String(self.id.clone()));
        if let Some(rev) = &self.rev {
            object.insert("_rev".to_string(), Value::String(rev.clone()));
        }
        Ok(serde_json::to_vec(&Value::Object(object))?)
    }

    /// Parse the wire form produced by `to_bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StoreError> {
        let value: Value = serde_json::from_slice(bytes)?;
        let mut object = match value {
            Value::Object(object) => object,
            other => {
                return Err(StoreError::Serialization(serde_json::Error::io(
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("document is not an object: {other}"),
                    ),
                )))
            }
        };
        let id = object
            .remove("_id")
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        let rev = object
            .remove("_rev")
            .and_then(|v| v.as_str().map(str::to_string));
        Ok(Self {
            id,
            rev,
            data: object,
        })
    }
}

/// Next revision token after `current`.
pub fn next_revision(current: Option<&str>) -> String {
    let generation = current
        .and_then(|rev| rev.split_once('-'))
        .and_then(|(gen, _)| gen.parse::<u64>().ok())
        .unwrap_or(0);
    format!("{}-{}", generation + 1, Uuid::new_v4().simple())
}
