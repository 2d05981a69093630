//! Defines the event value published through the bus, the delivery envelope
//! handed to listeners, and the system events the bus broadcasts about itself.

use crate::common::{ListenerId, Outcome, Phase, TransactionId};
use chrono::{DateTime, Utc};
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Identity of whatever produced an event.
///
/// This is a non-owning back-reference: it names the source by kind and id
/// and never holds the source object itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceRef {
    pub kind: String,
    pub id: String,
}

impl SourceRef {
    pub fn new(kind: impl Into<String>, id: impl ToString) -> Self {
        Self {
            kind: kind.into(),
            id: id.to_string(),
        }
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.kind, self.id)
    }
}

/// An immutable record of something that happened.
///
/// Constructed via [`Event::new`] and enriched with
/// [`with_source`](Event::with_source) before it is published. Once the bus
/// has it, it is shared behind an `Arc` and never changes again.
#[derive(Clone)]
pub struct Event {
    event_type: String,
    payload: Arc<dyn Any + Send + Sync>,
    source: Option<SourceRef>,
    occurred_at: DateTime<Utc>,
    transaction_id: Option<TransactionId>,
}

impl Event {
    /// Create a new event with a dot-separated type tag, e.g. `"user.created"`.
    pub fn new(event_type: impl Into<String>, payload: impl Any + Send + Sync) -> Self {
        Self {
            event_type: event_type.into(),
            payload: Arc::new(payload),
            source: None,
            occurred_at: Utc::now(),
            transaction_id: None,
        }
    }

    /// Attach the identity of the producer.
    pub fn with_source(mut self, source: SourceRef) -> Self {
        self.source = Some(source);
        self
    }

    pub(crate) fn within(mut self, transaction_id: TransactionId) -> Self {
        self.transaction_id = Some(transaction_id);
        self
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn source(&self) -> Option<&SourceRef> {
        self.source.as_ref()
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    /// The transaction this event was published in, if any.
    pub fn transaction_id(&self) -> Option<TransactionId> {
        self.transaction_id
    }

    /// Downcast the payload. Returns `None` if `T` is not the payload's type.
    pub fn payload<T: Any>(&self) -> Option<&T> {
        self.payload.downcast_ref::<T>()
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("event_type", &self.event_type)
            .field("source", &self.source)
            .field("occurred_at", &self.occurred_at)
            .field("transaction_id", &self.transaction_id)
            .finish_non_exhaustive()
    }
}

/// What a listener receives: the event plus the phase it is being delivered in.
#[derive(Debug, Clone)]
pub struct Delivery {
    event: Arc<Event>,
    phase: Phase,
    outcome: Option<Outcome>,
    cancellation: Option<CancellationToken>,
}

impl Delivery {
    pub(crate) fn new(
        event: Arc<Event>,
        phase: Phase,
        outcome: Option<Outcome>,
        cancellation: Option<CancellationToken>,
    ) -> Self {
        Self {
            event,
            phase,
            outcome,
            cancellation,
        }
    }

    pub fn event(&self) -> &Event {
        &self.event
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// The final transaction outcome. Set for the after-outcome phases and
    /// `AfterCompletion`; `None` for `Immediate` and `BeforeCommit`.
    pub fn outcome(&self) -> Option<Outcome> {
        self.outcome
    }

    /// The caller's cancellation handle, passed through untouched.
    pub fn cancellation(&self) -> Option<&CancellationToken> {
        self.cancellation.as_ref()
    }
}

/// Events describing the bus itself.
#[derive(Debug, Clone)]
pub enum SystemEvent {
    /// A listener was registered during the startup window.
    ListenerAdded { id: ListenerId, name: String },
    /// The startup window closed; the registry is now read-only.
    RegistrySealed { listeners: usize },
    /// A unit of work began.
    TransactionBegun { id: TransactionId },
    /// A unit of work reached COMPLETED.
    TransactionCompleted {
        id: TransactionId,
        outcome: Outcome,
        events: usize,
    },
    /// A listener invocation failed and was isolated.
    ListenerFailed {
        id: ListenerId,
        name: String,
        phase: Phase,
        event_type: String,
    },
}
