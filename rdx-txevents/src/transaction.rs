//! Per-unit-of-work state and the execution context that carries it.
//!
//! There is no hidden "current transaction" global. The caller owns an
//! [`ExecutionContext`] and passes it by reference through the call chain;
//! at most one [`TransactionContext`] lives inside it at a time.

use crate::common::TransactionId;
use crate::error::TransactionStateError;
use crate::events::Event;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// The transaction state machine.
///
/// ```text
/// ACTIVE ─► COMMITTING ─► COMMITTED ───┐
///   │           │                      ├─► COMPLETED
///   └───────────┴─► ROLLING_BACK ─► ROLLED_BACK
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxState {
    Active,
    Committing,
    Committed,
    RollingBack,
    RolledBack,
    Completed,
}

impl TxState {
    /// Whether `self -> next` moves forward along the state machine.
    pub fn can_transition_to(&self, next: TxState) -> bool {
        use TxState::*;
        matches!(
            (self, next),
            (Active, Committing)
                | (Active, RollingBack)
                | (Committing, Committed)
                | (Committing, RollingBack)
                | (RollingBack, RolledBack)
                | (Committed, Completed)
                | (RolledBack, Completed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TxState::Active => "ACTIVE",
            TxState::Committing => "COMMITTING",
            TxState::Committed => "COMMITTED",
            TxState::RollingBack => "ROLLING_BACK",
            TxState::RolledBack => "ROLLED_BACK",
            TxState::Completed => "COMPLETED",
        }
    }
}

impl fmt::Display for TxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event waiting for its transaction to reach an outcome.
#[derive(Debug, Clone)]
pub struct PendingEvent {
    pub event: Arc<Event>,
    pub enqueued_at: DateTime<Utc>,
}

/// State of one unit of work: where it is in the state machine and which
/// events are waiting on its outcome.
#[derive(Debug)]
pub struct TransactionContext {
    id: TransactionId,
    state: TxState,
    pending: VecDeque<PendingEvent>,
    begun_at: DateTime<Utc>,
    vetoed: bool,
}

impl TransactionContext {
    pub(crate) fn new() -> Self {
        Self {
            id: TransactionId::next(),
            state: TxState::Active,
            pending: VecDeque::new(),
            begun_at: Utc::now(),
            vetoed: false,
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    pub fn begun_at(&self) -> DateTime<Utc> {
        self.begun_at
    }

    /// Whether BEFORE_COMMIT rejected this transaction. A vetoed
    /// transaction can only roll back.
    pub fn is_vetoed(&self) -> bool {
        self.vetoed
    }

    /// Events waiting for delivery, in publish order.
    pub fn pending(&self) -> impl Iterator<Item = &PendingEvent> {
        self.pending.iter()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Appends an event to the pending queue. Only legal while ACTIVE.
    pub fn enqueue(&mut self, event: Event) -> Result<(), TransactionStateError> {
        if self.state != TxState::Active {
            return Err(TransactionStateError::NotAccepting {
                id: self.id,
                state: self.state,
            });
        }
        self.pending.push_back(PendingEvent {
            event: Arc::new(event.within(self.id)),
            enqueued_at: Utc::now(),
        });
        Ok(())
    }

    pub(crate) fn take_pending(&mut self) -> VecDeque<PendingEvent> {
        std::mem::take(&mut self.pending)
    }

    pub(crate) fn veto(&mut self) {
        self.vetoed = true;
    }

    // State changes are driven by the scheduler only.

    pub(crate) fn mark_committing(&mut self) -> Result<(), TransactionStateError> {
        self.transition(TxState::Committing)
    }

    pub(crate) fn mark_committed(&mut self) -> Result<(), TransactionStateError> {
        if self.vetoed {
            return Err(TransactionStateError::Vetoed(self.id));
        }
        self.transition(TxState::Committed)
    }

    pub(crate) fn mark_rolling_back(&mut self) -> Result<(), TransactionStateError> {
        self.transition(TxState::RollingBack)
    }

    pub(crate) fn mark_rolled_back(&mut self) -> Result<(), TransactionStateError> {
        self.transition(TxState::RolledBack)
    }

    pub(crate) fn mark_completed(&mut self) -> Result<(), TransactionStateError> {
        self.transition(TxState::Completed)
    }

    fn transition(&mut self, next: TxState) -> Result<(), TransactionStateError> {
        if !self.state.can_transition_to(next) {
            return Err(TransactionStateError::InvalidTransition {
                id: self.id,
                from: self.state,
                to: next,
            });
        }
        trace!(transaction = %self.id, from = %self.state, to = %next, "Transaction state change");
        self.state = next;
        Ok(())
    }
}

/// One logical execution context (a request, a job, a thread of work).
///
/// Holds at most one current transaction and, optionally, the caller's
/// cancellation handle, which is passed through to every delivery.
#[derive(Debug, Default)]
pub struct ExecutionContext {
    current: Option<TransactionContext>,
    cancellation: Option<CancellationToken>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancellation(cancellation: CancellationToken) -> Self {
        Self {
            current: None,
            cancellation: Some(cancellation),
        }
    }

    pub fn current(&self) -> Option<&TransactionContext> {
        self.current.as_ref()
    }

    pub(crate) fn current_mut(&mut self) -> Result<&mut TransactionContext, TransactionStateError> {
        self.current
            .as_mut()
            .ok_or(TransactionStateError::NoActiveTransaction)
    }

    /// Whether a transaction is current.
    pub fn in_transaction(&self) -> bool {
        self.current.is_some()
    }

    /// Fails if a transaction is current but no longer accepts events.
    pub(crate) fn ensure_accepting(&self) -> Result<(), TransactionStateError> {
        match &self.current {
            Some(tx) if tx.state() != TxState::Active => Err(TransactionStateError::NotAccepting {
                id: tx.id(),
                state: tx.state(),
            }),
            _ => Ok(()),
        }
    }

    pub fn cancellation(&self) -> Option<&CancellationToken> {
        self.cancellation.as_ref()
    }

    /// Installs a fresh transaction. Nesting is not supported.
    pub(crate) fn begin(&mut self) -> Result<&TransactionContext, TransactionStateError> {
        if let Some(active) = &self.current {
            return Err(TransactionStateError::AlreadyActive(active.id()));
        }
        Ok(&*self.current.insert(TransactionContext::new()))
    }

    /// Removes the current transaction once it has reached COMPLETED.
    pub(crate) fn finish(&mut self) -> Option<TransactionContext> {
        if self
            .current
            .as_ref()
            .is_some_and(|tx| tx.state() == TxState::Completed)
        {
            self.current.take()
        } else {
            None
        }
    }
}
