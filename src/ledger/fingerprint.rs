//! Canonical JSON and content fingerprints.
//!
//! A fingerprint is `sha256(tool + "|" + canonical_args + "|" + context_hash)`
//! rendered as lowercase hex. Canonical args have object keys sorted at every
//! depth and the volatile keys removed at every depth.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};

/// Keys dropped before hashing when no explicit list is configured.
pub const DEFAULT_VOLATILE_KEYS: [&str; 3] = ["timestamp", "requestId", "nonce"];

/// Serialize a JSON value with sorted object keys and no whitespace.
pub fn to_canonical_json(value: &Value) -> String {
    canonicalize(value, &HashSet::new())
}

/// Same as [`to_canonical_json`] but skipping `ignore` keys in every object.
pub fn canonicalize(value: &Value, ignore: &HashSet<String>) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => Value::String(s.clone()).to_string(),
        Value::Array(arr) => {
            let items: Vec<String> = arr.iter().map(|v| canonicalize(v, ignore)).collect();
            format!("[{}]", items.join(","))
        }
        Value::Object(map) => {
            let tree: BTreeMap<&String, String> = map
                .iter()
                .filter(|(k, _)| !ignore.contains(k.as_str()))
                .map(|(k, v)| (k, canonicalize(v, ignore)))
                .collect();
            let items: Vec<String> = tree
                .into_iter()
                .map(|(k, v)| format!("{}:{}", Value::String(k.clone()), v))
                .collect();
            format!("{{{}}}", items.join(","))
        }
    }
}

/// Lowercase hex sha256 of a string.
pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Computes tool fingerprints with a fixed set of volatile keys.
#[derive(Debug, Clone)]
pub struct Fingerprinter {
    ignore: HashSet<String>,
}

impl Default for Fingerprinter {
    fn default() -> Self {
        Self::new(DEFAULT_VOLATILE_KEYS.iter().map(|k| k.to_string()))
    }
}

impl Fingerprinter {
    /// Build a fingerprinter that strips the given keys.
    pub fn new<I, S>(ignore: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ignore: ignore.into_iter().map(Into::into).collect(),
        }
    }

    /// Stable argument rendering used for fingerprints and in-step dedup keys.
    pub fn stable_args(&self, args: &Value) -> String {
        canonicalize(args, &self.ignore)
    }

    /// `toolName::stableArgs`, the in-step dedup key.
    pub fn executed_key(&self, tool: &str, args: &Value) -> String {
        format!("{}::{}", tool, self.stable_args(args))
    }

    /// Content fingerprint scoped to a context version.
    pub fn fingerprint(&self, tool: &str, args: &Value, context_hash: &str) -> String {
        sha256_hex(&format!(
            "{}|{}|{}",
            tool,
            self.stable_args(args),
            context_hash
        ))
    }
}
