//! Idempotent tool execution.
//!
//! The ledger deduplicates tool invocations by content fingerprint and keeps
//! an append-only audit chain of every stored result.
//!
//! # Example
//!
//! ```no_run
//! use stepflow::ledger::{ExecuteOptions, IdempotencyLedger, LedgerKey};
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), String> {
//! let ledger = IdempotencyLedger::default();
//! let args = json!({"q": "rust"});
//! let fp = ledger.fingerprinter().fingerprint("search", &args, "ctx-hash");
//! let key = LedgerKey::new("user:conv", "search", fp);
//!
//! let out = ledger
//!     .execute_once(&key, &args, ExecuteOptions::default(), || async {
//!         Ok::<_, String>(json!({"hits": 3}))
//!     })
//!     .await?;
//! assert!(!out.reused);
//! # Ok(())
//! # }
//! ```

pub mod audit;
pub mod fingerprint;
#[allow(clippy::module_inception)]
pub mod ledger;

pub use audit::{AuditIssue, AuditLog, AuditRecord};
pub use fingerprint::{canonicalize, sha256_hex, to_canonical_json, Fingerprinter};
pub use ledger::{ExecuteOptions, Execution, IdempotencyLedger, LedgerEntry, LedgerKey};

use thiserror::Error;

/// Ledger error types
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Audit log error: {0}")]
    Audit(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LedgerError {
    pub fn audit<S: Into<String>>(message: S) -> Self {
        Self::Audit(message.into())
    }
}

/// Result type for ledger operations
pub type LedgerResult<T> = Result<T, LedgerError>;
