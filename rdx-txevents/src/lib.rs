//! # txevents
//!
//! An in-process, transaction-aware event bus.
//!
//! Application code publishes domain events while it works; listeners react to
//! them at a phase of the surrounding unit of work that they choose at
//! registration time. Side effects that must only happen once data is durable
//! (emails, cache invalidation, outbound messages) subscribe to
//! `AFTER_COMMIT`; validation that must be able to veto a commit subscribes to
//! `BEFORE_COMMIT`.
//!
//! ## Core Concepts
//!
//! - **Phases**: `IMMEDIATE`, `BEFORE_COMMIT`, `AFTER_COMMIT`,
//!   `AFTER_ROLLBACK` and `AFTER_COMPLETION`. Events published inside a
//!   transaction are buffered and delivered to each phase's listeners as the
//!   transaction crosses that boundary.
//! - **Startup window**: listeners are registered with
//!   [`EventBus::subscribe`](bus::EventBus::subscribe) and the registry is then
//!   sealed. The sealed dispatch table is immutable and shared without locks.
//! - **Explicit context**: the current transaction lives in an
//!   [`ExecutionContext`](transaction::ExecutionContext) that callers pass
//!   down, not in ambient thread state.
//! - **Isolation**: a failing listener never stops the others. Failures are
//!   routed to an [`ErrorObserver`](observer::ErrorObserver), except in
//!   `BEFORE_COMMIT` where they are handed back to the caller to roll back.
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use txevents::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let bus = EventBus::new(BusConfig::default())?;
//!
//!     bus.subscribe(Listener::asynchronous(
//!         "welcome-mailer",
//!         "user.created",
//!         Phase::AfterCommit,
//!         |delivery| async move {
//!             println!("sending welcome mail for {:?}", delivery.event().source());
//!             anyhow::Ok(())
//!         },
//!     ))?;
//!     bus.seal()?;
//!
//!     let mut ctx = ExecutionContext::new();
//!     bus.begin(&mut ctx)?;
//!     bus.publish(&mut ctx, Event::new("user.created", 42_u64))?;
//!     bus.scheduler().on_before_commit(&mut ctx)?;
//!     // ... commit the storage transaction here ...
//!     bus.scheduler().on_after_outcome(&mut ctx, Outcome::Committed)?;
//!
//!     Ok(())
//! }
//! ```

pub const ENGINE_NAME: &str = "txevents";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod bus;
pub mod common;
pub mod components;
pub mod config;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod observer;
pub mod registry;
pub mod scheduler;
pub mod transaction;

/// A prelude module for easy importing of the most common txevents types.
pub mod prelude {
    pub use crate::bus::EventBus;
    pub use crate::common::{ListenerId, ListenerMode, Outcome, Phase, TransactionId};
    pub use crate::components::listener::{EventTypeMatcher, Listener};
    pub use crate::config::BusConfig;
    pub use crate::error::{
        BeforeCommitRejected, ConfigurationError, EventCoreError, ListenerError,
        TransactionStateError,
    };
    pub use crate::events::{Delivery, Event, SourceRef, SystemEvent};
    pub use crate::lifecycle::{
        Entity, EntityChanged, EntityLifecycleDispatcher, HookRejection, LifecycleError,
        Operation, Timestamped,
    };
    pub use crate::observer::{ErrorObserver, TracingObserver};
    pub use crate::scheduler::{CompletionReport, PhaseScheduler, TransactionalResource};
    pub use crate::transaction::{ExecutionContext, TransactionContext, TxState};
}
