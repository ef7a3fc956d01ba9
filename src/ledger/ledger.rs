//! Fingerprint-keyed result ledger.

use dashmap::DashMap;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::audit::AuditLog;
use super::fingerprint::Fingerprinter;

/// A caller's share of the per-fingerprint lock.
///
/// Dropping it, on completion or when the execution future is dropped,
/// removes the map entry once no other caller holds the lock.
struct InflightSlot<'a> {
    map: &'a DashMap<String, Arc<Mutex<()>>>,
    fingerprint: &'a str,
    lock: Arc<Mutex<()>>,
}

impl<'a> InflightSlot<'a> {
    fn claim(map: &'a DashMap<String, Arc<Mutex<()>>>, fingerprint: &'a str) -> Self {
        let lock = map
            .entry(fingerprint.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        Self {
            map,
            fingerprint,
            lock,
        }
    }
}

impl Drop for InflightSlot<'_> {
    fn drop(&mut self) {
        // Only the map and this slot hold the lock: nobody else is waiting.
        self.map
            .remove_if(self.fingerprint, |_, l| Arc::strong_count(l) <= 2);
    }
}

/// A stored successful result.
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub tool: String,
    pub args: Value,
    pub data: Value,
    pub recorded_at: Instant,
    pub expires_at: Option<Instant>,
}

impl LedgerEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map(|at| now >= at).unwrap_or(false)
    }
}

/// Identity of one tool invocation inside the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerKey {
    /// Audit chain owner, usually `userId:conversationId`
    pub scope: String,
    pub tool: String,
    pub fingerprint: String,
}

impl LedgerKey {
    pub fn new(
        scope: impl Into<String>,
        tool: impl Into<String>,
        fingerprint: impl Into<String>,
    ) -> Self {
        Self {
            scope: scope.into(),
            tool: tool.into(),
            fingerprint: fingerprint.into(),
        }
    }
}

/// Outcome of [`IdempotencyLedger::execute_once`].
#[derive(Debug, Clone, PartialEq)]
pub struct Execution {
    pub data: Value,
    /// True when the data came from a stored record
    pub reused: bool,
}

/// Per-call overrides.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecuteOptions {
    /// Skip reuse and execute; a success still records
    pub force: bool,
    /// Replaces the ledger's default TTL
    pub ttl: Option<Duration>,
}

/// Maps fingerprints to previously computed tool results.
///
/// At most one execution per fingerprint runs at a time. Concurrent callers
/// for the same fingerprint wait on a per-fingerprint lock and then observe
/// the stored result. Failed executions are never stored.
#[derive(Debug)]
pub struct IdempotencyLedger {
    entries: DashMap<String, LedgerEntry>,
    inflight: DashMap<String, Arc<Mutex<()>>>,
    audit: AuditLog,
    fingerprinter: Fingerprinter,
    enabled: bool,
    default_ttl: Option<Duration>,
}

impl Default for IdempotencyLedger {
    fn default() -> Self {
        Self::new(Fingerprinter::default(), Some(Duration::from_secs(600)))
    }
}

impl IdempotencyLedger {
    pub fn new(fingerprinter: Fingerprinter, default_ttl: Option<Duration>) -> Self {
        Self {
            entries: DashMap::new(),
            inflight: DashMap::new(),
            audit: AuditLog::new(),
            fingerprinter,
            enabled: true,
            default_ttl,
        }
    }

    /// Build a ledger from the `[ledger]` configuration section.
    #[cfg(feature = "config")]
    pub fn from_config(config: &crate::config::LedgerConfig) -> Self {
        let ttl = match config.default_ttl_seconds {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        let mut ledger = Self::new(Fingerprinter::new(config.ignore_args.clone()), ttl);
        ledger.enabled = config.enabled;
        let audit = match &config.audit_log {
            Some(path) => AuditLog::with_sink(path),
            None => AuditLog::new(),
        };
        ledger.audit = audit.with_retention(config.audit_retention);
        ledger
    }

    /// Replace the audit log.
    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = audit;
        self
    }

    /// Turn reuse off; every call executes and nothing is recorded.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn fingerprinter(&self) -> &Fingerprinter {
        &self.fingerprinter
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Stored result for a fingerprint, `None` if never recorded or expired.
    pub fn try_reuse(&self, fingerprint: &str) -> Option<LedgerEntry> {
        if !self.enabled {
            return None;
        }
        let now = Instant::now();
        if self
            .entries
            .remove_if(fingerprint, |_, e| e.is_expired(now))
            .is_some()
        {
            debug!(fingerprint, "ledger entry expired");
            return None;
        }
        self.entries.get(fingerprint).map(|e| e.value().clone())
    }

    /// Store a successful result and chain it into the audit log.
    ///
    /// `ttl` of `None` falls back to the default TTL; a default of `None`
    /// keeps the record until it is purged explicitly.
    pub fn record_success(
        &self,
        key: &LedgerKey,
        args: &Value,
        data: &Value,
        ttl: Option<Duration>,
    ) {
        if !self.enabled {
            return;
        }
        let now = Instant::now();
        let ttl = ttl.or(self.default_ttl);
        self.entries.insert(
            key.fingerprint.clone(),
            LedgerEntry {
                tool: key.tool.clone(),
                args: args.clone(),
                data: data.clone(),
                recorded_at: now,
                expires_at: ttl.map(|t| now + t),
            },
        );
        if let Err(e) = self
            .audit
            .append(&key.scope, &key.tool, &key.fingerprint, args, data)
        {
            warn!(tool = %key.tool, error = %e, "audit append failed");
        }
    }

    /// Run `run` unless a live record exists for the key's fingerprint.
    ///
    /// Errors from `run` are returned unchanged and leave the ledger untouched.
    pub async fn execute_once<F, Fut, E>(
        &self,
        key: &LedgerKey,
        args: &Value,
        options: ExecuteOptions,
        run: F,
    ) -> Result<Execution, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, E>>,
    {
        if !self.enabled {
            return run().await.map(|data| Execution { data, reused: false });
        }

        if !options.force {
            if let Some(hit) = self.try_reuse(&key.fingerprint) {
                debug!(tool = %key.tool, fingerprint = %key.fingerprint, "reusing ledger result");
                return Ok(Execution {
                    data: hit.data,
                    reused: true,
                });
            }
        }

        let slot = InflightSlot::claim(&self.inflight, &key.fingerprint);
        let _guard = slot.lock.lock().await;
        match self.try_reuse(&key.fingerprint).filter(|_| !options.force) {
            Some(hit) => Ok(Execution {
                data: hit.data,
                reused: true,
            }),
            None => match run().await {
                Ok(data) => {
                    self.record_success(key, args, &data, options.ttl);
                    Ok(Execution {
                        data,
                        reused: false,
                    })
                }
                Err(e) => Err(e),
            },
        }
    }

    /// Drop every expired record, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.is_expired(now));
        self.inflight.retain(|_, lock| Arc::strong_count(lock) > 1);
        before.saturating_sub(self.entries.len())
    }

    /// Fingerprints with an execution running or waiting.
    pub fn inflight_len(&self) -> usize {
        self.inflight.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
