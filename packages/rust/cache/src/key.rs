//! Content-addressed cache keys.
//!
//! A key is `"{category}:{sha256}"` over the canonical JSON of the payload:
//! object keys sorted at every depth, no insignificant whitespace. Two payloads
//! with the same fields and values always produce the same key regardless of
//! the order their fields were inserted in.

use serde_json::Value;
use sha2::{Digest, Sha256};

use updaterelay_shared::{Category, Payload, Result, UpdateRelayError};

/// Deterministic fingerprint of a `(category, payload)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Compute the key for `payload` under `category`.
    pub fn compute(category: Category, payload: &Payload) -> Result<Self> {
        let canonical = canonicalize(&Value::Object(payload.clone()));
        let bytes = serde_json::to_vec(&canonical)
            .map_err(|e| UpdateRelayError::parse(format!("payload is not serializable: {e}")))?;

        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Ok(Self(format!("{category}:{:x}", hasher.finalize())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Rebuild `value` with every object's keys in sorted order.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut fields: Vec<(&String, &Value)> = map.iter().collect();
            fields.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                fields
                    .into_iter()
                    .map(|(k, v)| (k.clone(), canonicalize(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}
