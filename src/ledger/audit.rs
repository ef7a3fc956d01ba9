//! Append-only audit chain for recorded tool results.
//!
//! Each scope (typically `userId:conversationId`) owns one chain. A record's
//! hash is `sha256(prev_hash + canonical)`, where `canonical` is the canonical
//! JSON of the record body. Memory keeps a bounded window of each chain; the
//! JSONL mirror, when configured, holds the full history.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use super::fingerprint::{sha256_hex, to_canonical_json};
use super::{LedgerError, LedgerResult};

/// One link in an audit chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Unique record id
    pub record_id: String,
    /// Chain owner
    pub scope: String,
    /// Tool that produced the result
    pub tool: String,
    /// Fingerprint the result is stored under
    pub fingerprint: String,
    /// Arguments as executed
    pub args: Value,
    /// sha256 of the canonical result data
    pub data_hash: String,
    /// Position in the scope chain, starting at 1
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
    /// Hash of the previous record in this scope, empty for the first
    pub prev_hash: String,
    pub hash: String,
}

impl AuditRecord {
    /// Canonical body covered by the chain hash.
    pub fn canonical(&self) -> String {
        to_canonical_json(&json!({
            "scope": self.scope,
            "tool": self.tool,
            "fingerprint": self.fingerprint,
            "args": self.args,
            "dataHash": self.data_hash,
            "sequence": self.sequence,
            "createdAt": self.created_at.to_rfc3339(),
        }))
    }

    /// Recompute the chain hash from `prev_hash` and the body.
    pub fn expected_hash(&self) -> String {
        link(&self.prev_hash, &self.canonical())
    }

    /// Serialize to JSON line (no newline)
    pub fn to_json_line(&self) -> LedgerResult<String> {
        serde_json::to_string(self)
            .map_err(|e| LedgerError::audit(format!("Failed to serialize audit record: {}", e)))
    }
}

/// `sha256(prev + canonical)`.
pub fn link(prev: &str, canonical: &str) -> String {
    sha256_hex(&format!("{}{}", prev, canonical))
}

/// Hash of a result payload as stored in `data_hash`.
pub fn compute_data_hash(data: &Value) -> String {
    sha256_hex(&to_canonical_json(data))
}

/// A broken link found by [`AuditLog::verify_chain`].
#[derive(Debug, Clone, PartialEq)]
pub struct AuditIssue {
    pub sequence: u64,
    pub expected_hash: String,
    pub actual_hash: String,
    pub reason: String,
}

/// Records kept in memory per scope unless overridden.
pub const DEFAULT_RETENTION: usize = 256;

/// In-memory audit chain windows with an optional JSONL mirror.
#[derive(Debug)]
pub struct AuditLog {
    chains: DashMap<String, VecDeque<AuditRecord>>,
    sink: Option<PathBuf>,
    retention: usize,
}

impl Default for AuditLog {
    fn default() -> Self {
        Self {
            chains: DashMap::new(),
            sink: None,
            retention: DEFAULT_RETENTION,
        }
    }
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mirror every appended record to `path` as one JSON line.
    pub fn with_sink(path: impl Into<PathBuf>) -> Self {
        Self {
            sink: Some(path.into()),
            ..Self::default()
        }
    }

    /// Keep at most `records` per scope in memory. The newest record always
    /// stays so the chain can be extended.
    pub fn with_retention(mut self, records: usize) -> Self {
        self.retention = records.max(1);
        self
    }

    /// Per-scope in-memory record limit.
    pub fn retention(&self) -> usize {
        self.retention
    }

    /// Append a record to the scope chain and return it.
    ///
    /// The chain entry is held for the whole append so two records for the
    /// same scope can never share a predecessor.
    pub fn append(
        &self,
        scope: &str,
        tool: &str,
        fingerprint: &str,
        args: &Value,
        data: &Value,
    ) -> LedgerResult<AuditRecord> {
        let mut chain = self.chains.entry(scope.to_string()).or_default();
        let (prev_hash, sequence) = chain
            .back()
            .map(|r| (r.hash.clone(), r.sequence + 1))
            .unwrap_or_else(|| (String::new(), 1));

        let mut record = AuditRecord {
            record_id: uuid::Uuid::new_v4().to_string(),
            scope: scope.to_string(),
            tool: tool.to_string(),
            fingerprint: fingerprint.to_string(),
            args: args.clone(),
            data_hash: compute_data_hash(data),
            sequence,
            created_at: Utc::now(),
            prev_hash,
            hash: String::new(),
        };
        record.hash = record.expected_hash();

        if let Some(path) = &self.sink {
            Self::write_line(path, &record)?;
        }
        chain.push_back(record.clone());
        while chain.len() > self.retention {
            chain.pop_front();
        }
        Ok(record)
    }

    fn write_line(path: &Path, record: &AuditRecord) -> LedgerResult<()> {
        let line = record.to_json_line()?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| {
                LedgerError::audit(format!(
                    "Failed to open audit log {}: {}",
                    path.display(),
                    e
                ))
            })?;
        writeln!(file, "{}", line)
            .map_err(|e| LedgerError::audit(format!("Failed to write audit record: {}", e)))?;
        Ok(())
    }

    /// Retained records for one (scope, tool, fingerprint) key, oldest first.
    pub fn records_for(&self, scope: &str, tool: &str, fingerprint: &str) -> Vec<AuditRecord> {
        self.chains
            .get(scope)
            .map(|chain| {
                chain
                    .iter()
                    .filter(|r| r.tool == tool && r.fingerprint == fingerprint)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Retained window of a scope chain, oldest first.
    pub fn chain(&self, scope: &str) -> Vec<AuditRecord> {
        self.chains
            .get(scope)
            .map(|c| c.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Walk the retained window of a scope chain and report the first broken
    /// link. Use [`AuditLog::read_sink`] with [`verify_records`] to audit the
    /// full history.
    pub fn verify_chain(&self, scope: &str) -> Result<(), AuditIssue> {
        let window = self.chain(scope);
        let anchor = window
            .first()
            .map(|r| r.prev_hash.clone())
            .unwrap_or_default();
        verify_from(anchor, &window)
    }

    /// Read every record from a JSONL mirror.
    pub fn read_sink(path: &Path) -> LedgerResult<Vec<AuditRecord>> {
        let file = std::fs::File::open(path).map_err(|e| {
            LedgerError::audit(format!("Failed to open audit log {}: {}", path.display(), e))
        })?;
        let mut records = Vec::new();
        for (line_num, line) in std::io::BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| {
                LedgerError::audit(format!("Failed to read line {}: {}", line_num + 1, e))
            })?;
            if line.trim().is_empty() {
                continue;
            }
            let record: AuditRecord = serde_json::from_str(&line).map_err(|e| {
                LedgerError::audit(format!(
                    "Failed to parse audit record at line {}: {}",
                    line_num + 1,
                    e
                ))
            })?;
            records.push(record);
        }
        Ok(records)
    }
}

/// Check that records form an unbroken chain from the first link on.
pub fn verify_records(records: &[AuditRecord]) -> Result<(), AuditIssue> {
    verify_from(String::new(), records)
}

fn verify_from(mut prev: String, records: &[AuditRecord]) -> Result<(), AuditIssue> {
    for record in records {
        if record.prev_hash != prev {
            return Err(AuditIssue {
                sequence: record.sequence,
                expected_hash: prev,
                actual_hash: record.prev_hash.clone(),
                reason: "prev_hash does not match predecessor".to_string(),
            });
        }
        let expected = record.expected_hash();
        if expected != record.hash {
            return Err(AuditIssue {
                sequence: record.sequence,
                expected_hash: expected,
                actual_hash: record.hash.clone(),
                reason: "hash does not match record body".to_string(),
            });
        }
        prev = record.hash.clone();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_chain_links_records() {
        let log = AuditLog::new();
        let first = log
            .append("u1:c1", "search", "fp1", &json!({"q": "a"}), &json!({"hits": 1}))
            .unwrap();
        let second = log
            .append("u1:c1", "search", "fp2", &json!({"q": "b"}), &json!({"hits": 2}))
            .unwrap();

        assert_eq!(first.prev_hash, "");
        assert_eq!(first.sequence, 1);
        assert_eq!(second.prev_hash, first.hash);
        assert_eq!(second.sequence, 2);
        assert!(log.verify_chain("u1:c1").is_ok());
    }

    #[test]
    fn test_scopes_are_independent() {
        let log = AuditLog::new();
        log.append("a", "t", "fp", &json!({}), &json!(1)).unwrap();
        let other = log.append("b", "t", "fp", &json!({}), &json!(1)).unwrap();
        assert_eq!(other.sequence, 1);
        assert_eq!(other.prev_hash, "");
    }

    #[test]
    fn test_tampering_is_detected() {
        let log = AuditLog::new();
        log.append("s", "t", "fp1", &json!({"x": 1}), &json!("r1")).unwrap();
        log.append("s", "t", "fp2", &json!({"x": 2}), &json!("r2")).unwrap();

        let mut records = log.chain("s");
        records[0].args = json!({"x": 99});
        let issue = verify_records(&records).unwrap_err();
        assert_eq!(issue.sequence, 1);
    }

    #[test]
    fn test_records_for_key_in_creation_order() {
        let log = AuditLog::new();
        log.append("s", "t", "fp", &json!({"n": 1}), &json!(1)).unwrap();
        log.append("s", "other", "fp", &json!({}), &json!(0)).unwrap();
        log.append("s", "t", "fp", &json!({"n": 2}), &json!(2)).unwrap();

        let records = log.records_for("s", "t", "fp");
        assert_eq!(records.len(), 2);
        assert!(records[0].created_at <= records[1].created_at);
        assert_eq!(records[1].args, json!({"n": 2}));
    }

    #[test]
    fn test_jsonl_sink_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let log = AuditLog::with_sink(&path);
        log.append("s", "t", "fp1", &json!({}), &json!(1)).unwrap();
        log.append("s", "t", "fp2", &json!({}), &json!(2)).unwrap();

        let records = AuditLog::read_sink(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert!(verify_records(&records).is_ok());
    }

    #[test]
    fn test_memory_keeps_a_bounded_window() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let log = AuditLog::with_sink(&path).with_retention(3);
        for n in 1..=10 {
            log.append("s", "t", &format!("fp{}", n), &json!({"n": n}), &json!(n))
                .unwrap();
        }

        let window = log.chain("s");
        let sequences: Vec<u64> = window.iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, vec![8, 9, 10]);
        assert!(log.verify_chain("s").is_ok());
        assert!(log.records_for("s", "t", "fp1").is_empty());

        let next = log.append("s", "t", "fp11", &json!({}), &json!(11)).unwrap();
        assert_eq!(next.sequence, 11);
        assert_eq!(next.prev_hash, window[2].hash);
        assert_eq!(log.chain("s").len(), 3);

        // the mirror still holds the whole chain
        let history = AuditLog::read_sink(&path).unwrap();
        assert_eq!(history.len(), 11);
        assert!(verify_records(&history).is_ok());
        // a window on its own does not start at the origin
        assert!(verify_records(&window).is_err());
    }

    #[test]
    fn test_retention_never_drops_the_chain_tail() {
        let log = AuditLog::new().with_retention(0);
        assert_eq!(log.retention(), 1);
        let first = log.append("s", "t", "fp1", &json!({}), &json!(1)).unwrap();
        let second = log.append("s", "t", "fp2", &json!({}), &json!(2)).unwrap();
        assert_eq!(second.prev_hash, first.hash);
        assert_eq!(log.chain("s"), vec![second]);
    }
}
