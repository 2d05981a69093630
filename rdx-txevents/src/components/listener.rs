//! Defines listener registrations: what a listener matches, when it runs,
//! and the handler that does the work.

use crate::common::{ListenerMode, Phase};
use crate::events::Delivery;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// A boxed future returned by an ASYNC handler.
pub type BoxFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'static>>;

/// A handler that runs on the publisher's (or the scheduler's) thread.
pub type SyncHandler = Arc<dyn Fn(&Delivery) -> anyhow::Result<()> + Send + Sync>;

/// A handler whose future is executed by the worker pool.
pub type AsyncHandler = Arc<dyn Fn(Delivery) -> BoxFuture + Send + Sync>;

/// The executable part of a registration.
#[derive(Clone)]
pub enum Handler {
    Sync(SyncHandler),
    Async(AsyncHandler),
}

impl Handler {
    pub fn mode(&self) -> ListenerMode {
        match self {
            Handler::Sync(_) => ListenerMode::Sync,
            Handler::Async(_) => ListenerMode::Async,
        }
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handler::{:?}", self.mode())
    }
}

/// Selects the event types a listener is interested in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventTypeMatcher {
    /// Exactly this type tag.
    Exact(String),
    /// Every type tag starting with this prefix, e.g. `"user."`.
    Prefix(String),
    /// Every event.
    Any,
}

impl EventTypeMatcher {
    pub fn exact(event_type: impl Into<String>) -> Self {
        EventTypeMatcher::Exact(event_type.into())
    }

    pub fn prefix(prefix: impl Into<String>) -> Self {
        EventTypeMatcher::Prefix(prefix.into())
    }

    pub fn matches(&self, event_type: &str) -> bool {
        match self {
            EventTypeMatcher::Exact(expected) => expected == event_type,
            EventTypeMatcher::Prefix(prefix) => event_type.starts_with(prefix.as_str()),
            EventTypeMatcher::Any => true,
        }
    }
}

impl From<&str> for EventTypeMatcher {
    fn from(event_type: &str) -> Self {
        EventTypeMatcher::exact(event_type)
    }
}

/// A listener registration, built with [`Listener::sync`] or
/// [`Listener::asynchronous`] and handed to `EventBus::subscribe`.
///
/// Lower `priority` runs earlier. Listeners that never call
/// [`priority`](Listener::priority) get the bus's configured default.
#[derive(Debug, Clone)]
pub struct Listener {
    pub(crate) name: String,
    pub(crate) matcher: EventTypeMatcher,
    pub(crate) phase: Phase,
    pub(crate) priority: Option<i32>,
    pub(crate) handler: Handler,
}

impl Listener {
    /// A listener that runs inline and is waited for.
    pub fn sync(
        name: impl Into<String>,
        matcher: impl Into<EventTypeMatcher>,
        phase: Phase,
        handler: impl Fn(&Delivery) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            matcher: matcher.into(),
            phase,
            priority: None,
            handler: Handler::Sync(Arc::new(handler)),
        }
    }

    /// A listener handed to the worker pool and never waited for.
    pub fn asynchronous<F, Fut>(
        name: impl Into<String>,
        matcher: impl Into<EventTypeMatcher>,
        phase: Phase,
        handler: F,
    ) -> Self
    where
        F: Fn(Delivery) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            matcher: matcher.into(),
            phase,
            priority: None,
            handler: Handler::Async(Arc::new(move |delivery: Delivery| -> BoxFuture {
                Box::pin(handler(delivery))
            })),
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn mode(&self) -> ListenerMode {
        self.handler.mode()
    }

    pub fn matcher(&self) -> &EventTypeMatcher {
        &self.matcher
    }
}

/// A listener as stored in the sealed registry.
#[doc(hidden)]
#[derive(Debug, Clone)]
pub struct Registration {
    pub name: Arc<str>,
    pub matcher: EventTypeMatcher,
    pub phase: Phase,
    pub priority: i32,
    pub handler: Handler,
    /// Position in registration order; breaks priority ties.
    pub(crate) seq: u64,
}

impl Registration {
    pub(crate) fn from_listener(listener: Listener, default_priority: i32, seq: u64) -> Self {
        Self {
            name: Arc::from(listener.name),
            matcher: listener.matcher,
            phase: listener.phase,
            priority: listener.priority.unwrap_or(default_priority),
            handler: listener.handler,
            seq,
        }
    }

    pub fn mode(&self) -> ListenerMode {
        self.handler.mode()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matchers_select_by_type_tag() {
        assert!(EventTypeMatcher::exact("user.created").matches("user.created"));
        assert!(!EventTypeMatcher::exact("user.created").matches("user.updated"));
        assert!(EventTypeMatcher::prefix("user.").matches("user.updated"));
        assert!(!EventTypeMatcher::prefix("user.").matches("cart.item_added"));
        assert!(EventTypeMatcher::Any.matches("anything"));
    }

    #[test]
    fn builder_records_mode_and_priority() {
        let sync = Listener::sync("audit", "user.created", Phase::AfterCommit, |_| Ok(()))
            .priority(5);
        assert_eq!(sync.mode(), ListenerMode::Sync);
        assert_eq!(sync.priority, Some(5));

        let background =
            Listener::asynchronous("mailer", "user.created", Phase::AfterCommit, |_| async {
                anyhow::Ok(())
            });
        assert_eq!(background.mode(), ListenerMode::Async);
        assert_eq!(background.priority, None);
    }

    #[test]
    fn default_priority_applies_when_unset() {
        let listener = Listener::sync("a", EventTypeMatcher::Any, Phase::Immediate, |_| Ok(()));
        let registration = Registration::from_listener(listener, 3, 0);
        assert_eq!(registration.priority, 3);
        assert_eq!(&*registration.name, "a");
    }
}
