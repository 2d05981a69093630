//! Where isolated listener failures go.
//!
//! Failures in every phase except BEFORE_COMMIT never reach the publisher.
//! They are handed to an [`ErrorObserver`] and announced on the
//! `SystemEvent` stream instead.

use crate::error::ListenerError;
use crate::events::SystemEvent;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::error;

/// Receives listener failures that were isolated from the publisher.
pub trait ErrorObserver: Send + Sync {
    fn on_listener_error(&self, failure: &ListenerError);
}

/// The default observer: logs every failure.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl ErrorObserver for TracingObserver {
    fn on_listener_error(&self, failure: &ListenerError) {
        error!(
            listener = %failure.listener,
            phase = %failure.phase,
            event_type = %failure.event_type,
            error = %failure.source,
            "Listener failed"
        );
    }
}

impl<F> ErrorObserver for F
where
    F: Fn(&ListenerError) + Send + Sync,
{
    fn on_listener_error(&self, failure: &ListenerError) {
        self(failure)
    }
}

/// Fans a failure out to the observer and the system event stream.
#[doc(hidden)]
#[derive(Clone)]
pub(crate) struct FailureSink {
    observer: Arc<dyn ErrorObserver>,
    system_event_sender: broadcast::Sender<SystemEvent>,
}

impl FailureSink {
    pub(crate) fn new(
        observer: Arc<dyn ErrorObserver>,
        system_event_sender: broadcast::Sender<SystemEvent>,
    ) -> Self {
        Self {
            observer,
            system_event_sender,
        }
    }

    pub(crate) fn report(&self, failure: ListenerError) {
        self.observer.on_listener_error(&failure);
        self.system_event_sender
            .send(SystemEvent::ListenerFailed {
                id: failure.listener_id,
                name: failure.listener,
                phase: failure.phase,
                event_type: failure.event_type,
            })
            .ok();
    }
}
