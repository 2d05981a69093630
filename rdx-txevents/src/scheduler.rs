//! Drives a transaction's pending events through the commit phases.
//!
//! The unit-of-work boundary (a database transaction manager, typically)
//! owns the commit. It calls [`PhaseScheduler::on_before_commit`] while the
//! transaction is still open, commits or rolls back its resource, and then
//! calls [`PhaseScheduler::on_after_outcome`] with the result. The scheduler
//! never commits or rolls back anything itself.
//!
//! ```text
//! pending: [E1, E2]
//!
//! BEFORE_COMMIT     E1 ─► L(p0) ─► L(p1)     E2 ─► ...   (SYNC only, failures propagate)
//!       │
//!   resource commit
//!       │
//! AFTER_COMMIT      E1 ─► ...   E2 ─► ...                (or AFTER_ROLLBACK)
//! AFTER_COMPLETION  E1 ─► ...   E2 ─► ...                (always, last)
//! ```

use crate::bus::{EventBus, FailurePolicy};
use crate::common::{Outcome, Phase, TransactionId};
use crate::error::{BeforeCommitRejected, EventCoreError};
use crate::events::{Delivery, SystemEvent};
use crate::transaction::ExecutionContext;
use tracing::{debug, error, info, warn};

/// The storage side of a unit of work, as seen by the scheduler.
///
/// Implemented by the persistence collaborator. The scheduler only calls it
/// from [`PhaseScheduler::complete`] and [`PhaseScheduler::rollback`].
pub trait TransactionalResource {
    fn commit(&mut self) -> anyhow::Result<()>;
    fn rollback(&mut self) -> anyhow::Result<()>;
}

/// Summary of a completed transaction.
#[derive(Debug)]
pub struct CompletionReport {
    pub transaction: TransactionId,
    pub outcome: Outcome,
    /// Events that were pending when the outcome was reached.
    pub events: usize,
    /// Listener invocations across the outcome and completion phases.
    pub invocations: usize,
    /// Set when BEFORE_COMMIT listeners forced the rollback.
    pub rejection: Option<BeforeCommitRejected>,
    /// Set when the resource itself failed to commit.
    pub commit_error: Option<anyhow::Error>,
}

impl CompletionReport {
    pub fn committed(&self) -> bool {
        self.outcome == Outcome::Committed
    }
}

/// Delivers a transaction's pending events once its outcome is known.
#[derive(Clone)]
pub struct PhaseScheduler {
    bus: EventBus,
}

impl PhaseScheduler {
    pub fn new(bus: EventBus) -> Self {
        Self { bus }
    }

    /// Runs BEFORE_COMMIT listeners for every pending event and moves the
    /// transaction to COMMITTING.
    ///
    /// Every listener runs even if an earlier one failed; if any failed, the
    /// aggregate comes back as [`EventCoreError::BeforeCommit`] and the
    /// caller must roll back. The veto is recorded on the transaction, so a
    /// later `on_after_outcome(Outcome::Committed)` fails with
    /// [`TransactionStateError::Vetoed`](crate::error::TransactionStateError::Vetoed).
    pub fn on_before_commit(&self, ctx: &mut ExecutionContext) -> Result<(), EventCoreError> {
        let registry = self.bus.registry()?;
        let cancellation = ctx.cancellation().cloned();
        let tx = ctx.current_mut()?;
        tx.mark_committing()?;
        let id = tx.id();

        let mut failures = Vec::new();
        for pending in tx.pending() {
            let delivery = Delivery::new(
                pending.event.clone(),
                Phase::BeforeCommit,
                None,
                cancellation.clone(),
            );
            let (_, mut rejected) =
                self.bus.deliver(registry, &delivery, FailurePolicy::Collect);
            failures.append(&mut rejected);
        }

        if failures.is_empty() {
            debug!(transaction = %id, events = tx.pending_len(), "BEFORE_COMMIT phase passed");
            Ok(())
        } else {
            tx.veto();
            warn!(
                transaction = %id,
                failures = failures.len(),
                "BEFORE_COMMIT phase rejected the transaction"
            );
            Err(BeforeCommitRejected {
                transaction: id,
                failures,
            }
            .into())
        }
    }

    /// Records the final outcome and delivers the pending events: the
    /// outcome phase first (AFTER_COMMIT or AFTER_ROLLBACK), then
    /// AFTER_COMPLETION. The transaction ends COMPLETED and is removed from
    /// `ctx`.
    ///
    /// Listener failures here are reported to the error observer only.
    pub fn on_after_outcome(
        &self,
        ctx: &mut ExecutionContext,
        outcome: Outcome,
    ) -> Result<CompletionReport, EventCoreError> {
        self.finish(ctx, outcome, None, None)
    }

    /// Runs the whole boundary against `resource`: BEFORE_COMMIT, commit,
    /// and the after phases. A BEFORE_COMMIT rejection or a failed commit
    /// rolls the resource back and completes the transaction as ROLLED_BACK.
    pub fn complete(
        &self,
        ctx: &mut ExecutionContext,
        resource: &mut impl TransactionalResource,
    ) -> Result<CompletionReport, EventCoreError> {
        match self.on_before_commit(ctx) {
            Ok(()) => {}
            Err(EventCoreError::BeforeCommit(rejection)) => {
                roll_back(resource);
                return self.finish(ctx, Outcome::RolledBack, Some(rejection), None);
            }
            Err(other) => return Err(other),
        }

        match resource.commit() {
            Ok(()) => self.finish(ctx, Outcome::Committed, None, None),
            Err(commit_error) => {
                warn!(error = %commit_error, "Resource commit failed, rolling back");
                roll_back(resource);
                self.finish(ctx, Outcome::RolledBack, None, Some(commit_error))
            }
        }
    }

    /// Rolls `resource` back and completes the transaction as ROLLED_BACK.
    pub fn rollback(
        &self,
        ctx: &mut ExecutionContext,
        resource: &mut impl TransactionalResource,
    ) -> Result<CompletionReport, EventCoreError> {
        roll_back(resource);
        self.finish(ctx, Outcome::RolledBack, None, None)
    }

    fn finish(
        &self,
        ctx: &mut ExecutionContext,
        outcome: Outcome,
        rejection: Option<BeforeCommitRejected>,
        commit_error: Option<anyhow::Error>,
    ) -> Result<CompletionReport, EventCoreError> {
        let registry = self.bus.registry()?;
        let cancellation = ctx.cancellation().cloned();
        let tx = ctx.current_mut()?;
        match outcome {
            Outcome::Committed => tx.mark_committed()?,
            Outcome::RolledBack => {
                tx.mark_rolling_back()?;
                tx.mark_rolled_back()?;
            }
        }
        let id = tx.id();
        let pending = tx.take_pending();

        let mut invocations = 0;
        for phase in [outcome.phase(), Phase::AfterCompletion] {
            for entry in &pending {
                let delivery =
                    Delivery::new(entry.event.clone(), phase, Some(outcome), cancellation.clone());
                let (invoked, _) = self.bus.deliver(registry, &delivery, FailurePolicy::Report);
                invocations += invoked;
            }
        }

        tx.mark_completed()?;
        ctx.finish();

        info!(
            transaction = %id,
            %outcome,
            events = pending.len(),
            invocations,
            "Transaction completed"
        );
        self.bus.emit(SystemEvent::TransactionCompleted {
            id,
            outcome,
            events: pending.len(),
        });

        Ok(CompletionReport {
            transaction: id,
            outcome,
            events: pending.len(),
            invocations,
            rejection,
            commit_error,
        })
    }
}

fn roll_back(resource: &mut impl TransactionalResource) {
    if let Err(e) = resource.rollback() {
        error!(error = %e, "Resource rollback failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::listener::{EventTypeMatcher, Listener};
    use crate::error::TransactionStateError;
    use crate::events::Event;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct FakeStore {
        commits: usize,
        rollbacks: usize,
        fail_commit: bool,
    }

    impl TransactionalResource for FakeStore {
        fn commit(&mut self) -> anyhow::Result<()> {
            if self.fail_commit {
                anyhow::bail!("disk full");
            }
            self.commits += 1;
            Ok(())
        }

        fn rollback(&mut self) -> anyhow::Result<()> {
            self.rollbacks += 1;
            Ok(())
        }
    }

    fn tracing_bus(log: &Arc<Mutex<Vec<String>>>) -> EventBus {
        let bus = EventBus::default();
        for phase in Phase::ALL {
            let log = log.clone();
            bus.subscribe(Listener::sync(
                format!("trace-{phase}"),
                EventTypeMatcher::Any,
                phase,
                move |delivery| {
                    log.lock().unwrap().push(format!(
                        "{}:{}",
                        delivery.phase(),
                        delivery.event().event_type()
                    ));
                    Ok(())
                },
            ))
            .unwrap();
        }
        bus
    }

    #[test]
    fn commit_visits_phases_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let bus = tracing_bus(&log);
        bus.seal().unwrap();

        let mut ctx = ExecutionContext::new();
        bus.begin(&mut ctx).unwrap();
        bus.publish(&mut ctx, Event::new("e1", ())).unwrap();
        bus.publish(&mut ctx, Event::new("e2", ())).unwrap();

        let mut store = FakeStore::default();
        let report = bus.scheduler().complete(&mut ctx, &mut store).unwrap();

        assert!(report.committed());
        assert_eq!(report.events, 2);
        assert_eq!(store.commits, 1);
        assert!(!ctx.in_transaction());
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "BEFORE_COMMIT:e1",
                "BEFORE_COMMIT:e2",
                "AFTER_COMMIT:e1",
                "AFTER_COMMIT:e2",
                "AFTER_COMPLETION:e1",
                "AFTER_COMPLETION:e2",
            ]
        );
    }

    #[test]
    fn failed_resource_commit_rolls_back() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let bus = tracing_bus(&log);
        bus.seal().unwrap();

        let mut ctx = ExecutionContext::new();
        bus.begin(&mut ctx).unwrap();
        bus.publish(&mut ctx, Event::new("e1", ())).unwrap();

        let mut store = FakeStore {
            fail_commit: true,
            ..Default::default()
        };
        let report = bus.scheduler().complete(&mut ctx, &mut store).unwrap();

        assert_eq!(report.outcome, Outcome::RolledBack);
        assert!(report.commit_error.is_some());
        assert_eq!(store.rollbacks, 1);
        let log = log.lock().unwrap();
        assert!(log.contains(&"AFTER_ROLLBACK:e1".to_string()));
        assert!(!log.iter().any(|entry| entry.starts_with("AFTER_COMMIT")));
    }

    #[test]
    fn completion_listeners_see_the_outcome() {
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let seen = outcomes.clone();
        let bus = EventBus::default();
        bus.subscribe(Listener::sync(
            "completion",
            EventTypeMatcher::Any,
            Phase::AfterCompletion,
            move |delivery| {
                seen.lock().unwrap().push(delivery.outcome());
                Ok(())
            },
        ))
        .unwrap();
        bus.seal().unwrap();
        let scheduler = bus.scheduler();

        let mut ctx = ExecutionContext::new();
        bus.begin(&mut ctx).unwrap();
        bus.publish(&mut ctx, Event::new("e", ())).unwrap();
        scheduler.rollback(&mut ctx, &mut FakeStore::default()).unwrap();

        assert_eq!(*outcomes.lock().unwrap(), vec![Some(Outcome::RolledBack)]);
    }

    #[test]
    fn outcome_without_transaction_is_an_error() {
        let bus = EventBus::default();
        bus.seal().unwrap();
        let mut ctx = ExecutionContext::new();
        let err = bus
            .scheduler()
            .on_after_outcome(&mut ctx, Outcome::Committed)
            .unwrap_err();
        assert!(matches!(
            err,
            EventCoreError::TransactionState(TransactionStateError::NoActiveTransaction)
        ));
    }

    #[test]
    fn committing_without_before_commit_is_an_invalid_transition() {
        let bus = EventBus::default();
        bus.seal().unwrap();
        let mut ctx = ExecutionContext::new();
        bus.begin(&mut ctx).unwrap();

        let err = bus
            .scheduler()
            .on_after_outcome(&mut ctx, Outcome::Committed)
            .unwrap_err();
        assert!(matches!(
            err,
            EventCoreError::TransactionState(TransactionStateError::InvalidTransition { .. })
        ));
        assert!(ctx.in_transaction());
    }

    #[test]
    fn context_is_reusable_after_completion() {
        let bus = EventBus::default();
        bus.seal().unwrap();
        let scheduler = bus.scheduler();
        let mut ctx = ExecutionContext::new();

        let first = bus.begin(&mut ctx).unwrap();
        scheduler.complete(&mut ctx, &mut FakeStore::default()).unwrap();
        let second = bus.begin(&mut ctx).unwrap();
        assert_ne!(first, second);
    }
}
