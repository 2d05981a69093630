//! Contains common, primitive types shared across the event core.
//!
//! This module defines the identifier types and the small enums (phase, mode,
//! outcome) that the registry, the bus, and the scheduler all agree on. Using
//! distinct types improves type safety and keeps the dispatch table explicit.

use serde::{Deserialize, Serialize};
use slotmap::new_key_type;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// A prelude module for convenient importing of the most common types.
///
/// # Example
/// ```
/// use txevents::common::prelude::*;
/// ```
pub mod prelude {
    pub use super::{ListenerId, ListenerMode, Outcome, Phase, TransactionId};
    pub use crate::bus::EventBus;
    pub use crate::config::BusConfig;
}

new_key_type! {
    /// Uniquely and safely identifies a registered listener.
    ///
    /// This key is returned by `subscribe` and acts as the registration
    /// handle. It is never reused, so a stale handle cannot alias a newer
    /// registration.
    pub struct ListenerId;
}

static NEXT_TRANSACTION_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies one unit of work for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(pub u64);

impl TransactionId {
    /// Allocates the next process-wide transaction id.
    pub(crate) fn next() -> Self {
        Self(NEXT_TRANSACTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx-{}", self.0)
    }
}

/// When, relative to the enclosing transaction, a listener runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Runs inline at publish time, only when no transaction is active.
    Immediate,
    /// Runs while the transaction is still open; failures force a rollback.
    BeforeCommit,
    /// Runs once the underlying resource has committed.
    AfterCommit,
    /// Runs once the unit of work has rolled back.
    AfterRollback,
    /// Runs last, whatever the outcome.
    AfterCompletion,
}

impl Phase {
    /// Every phase, in the order a committed transaction visits them.
    pub const ALL: [Phase; 5] = [
        Phase::Immediate,
        Phase::BeforeCommit,
        Phase::AfterCommit,
        Phase::AfterRollback,
        Phase::AfterCompletion,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Immediate => "IMMEDIATE",
            Phase::BeforeCommit => "BEFORE_COMMIT",
            Phase::AfterCommit => "AFTER_COMMIT",
            Phase::AfterRollback => "AFTER_ROLLBACK",
            Phase::AfterCompletion => "AFTER_COMPLETION",
        }
    }

    /// Whether ASYNC listeners may be registered for this phase.
    ///
    /// The transaction cannot wait on background work before it commits.
    pub fn permits_async(&self) -> bool {
        !matches!(self, Phase::BeforeCommit)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a listener's handler is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenerMode {
    /// Runs on the caller's thread; the caller waits for it.
    Sync,
    /// Handed to the worker pool; nobody waits for it.
    Async,
}

/// The final outcome of a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Committed,
    RolledBack,
}

impl Outcome {
    /// The outcome-specific phase that runs before `AfterCompletion`.
    pub fn phase(&self) -> Phase {
        match self {
            Outcome::Committed => Phase::AfterCommit,
            Outcome::RolledBack => Phase::AfterRollback,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Committed => f.write_str("COMMITTED"),
            Outcome::RolledBack => f.write_str("ROLLED_BACK"),
        }
    }
}
