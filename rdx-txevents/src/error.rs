//! Error types for the event core.

use crate::common::{ListenerId, Phase, TransactionId};
use crate::transaction::TxState;
use thiserror::Error;

/// Misconfiguration detected during the startup window. Fatal at startup.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    /// `subscribe` was called after the registry was sealed.
    #[error("listener registry is sealed; `{0}` cannot be registered")]
    RegistrySealed(String),

    /// `seal` was called a second time.
    #[error("listener registry is already sealed")]
    AlreadySealed,

    /// The bus was used before `seal` closed the startup window.
    #[error("listener registry has not been sealed yet")]
    RegistryNotSealed,

    /// Two registrations share the same name.
    #[error("duplicate listener registration: {0}")]
    DuplicateListener(String),

    /// ASYNC listeners cannot hold a transaction open.
    #[error("listener `{0}` is ASYNC but BEFORE_COMMIT only accepts SYNC listeners")]
    AsyncBeforeCommit(String),

    /// ASYNC listeners were registered but there is no tokio runtime to run them.
    #[error("ASYNC listeners require a tokio runtime at seal time")]
    NoAsyncRuntime,

    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// An illegal operation on a transaction's state machine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransactionStateError {
    /// `begin` while a transaction is already current.
    #[error("transaction {0} is already active in this execution context")]
    AlreadyActive(TransactionId),

    /// The requested transition is not forward along the state machine.
    #[error("transaction {id}: invalid transition {from} -> {to}")]
    InvalidTransition {
        id: TransactionId,
        from: TxState,
        to: TxState,
    },

    /// A boundary hook was invoked with no transaction in scope.
    #[error("no transaction is active in this execution context")]
    NoActiveTransaction,

    /// BEFORE_COMMIT rejected the transaction; it must roll back.
    #[error("transaction {0} was vetoed in BEFORE_COMMIT and can only roll back")]
    Vetoed(TransactionId),

    /// Events can only be enqueued while the transaction is ACTIVE.
    #[error("transaction {id} no longer accepts events (state {state})")]
    NotAccepting { id: TransactionId, state: TxState },
}

/// A single listener invocation failed.
#[derive(Debug, Error)]
#[error("listener `{listener}` failed in {phase} for `{event_type}`: {source}")]
pub struct ListenerError {
    pub listener: String,
    pub listener_id: ListenerId,
    pub phase: Phase,
    pub event_type: String,
    pub source: anyhow::Error,
}

/// One or more BEFORE_COMMIT listeners failed; the unit of work must roll back.
#[derive(Debug, Error)]
#[error("transaction {transaction}: {} BEFORE_COMMIT listener(s) failed", .failures.len())]
pub struct BeforeCommitRejected {
    pub transaction: TransactionId,
    pub failures: Vec<ListenerError>,
}

/// Umbrella error for the public API.
#[derive(Debug, Error)]
pub enum EventCoreError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    TransactionState(#[from] TransactionStateError),

    #[error(transparent)]
    BeforeCommit(#[from] BeforeCommitRejected),
}
