//! The event bus: the public publish/subscribe surface of the core.

use crate::common::{ListenerId, Phase, TransactionId};
use crate::components::listener::{Handler, Listener, Registration};
use crate::components::worker::{AsyncJob, WorkerPool};
use crate::config::BusConfig;
use crate::error::{ConfigurationError, EventCoreError, ListenerError, TransactionStateError};
use crate::events::{Delivery, Event, SystemEvent};
use crate::observer::{ErrorObserver, FailureSink, TracingObserver};
use crate::registry::{ListenerRegistry, SealedRegistry};
use crate::scheduler::PhaseScheduler;
use crate::transaction::ExecutionContext;
use anyhow::anyhow;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

/// The in-process event bus.
///
/// The bus has two lives. During startup it accepts `subscribe` calls; once
/// [`seal`](EventBus::seal) is called the listener table is frozen and the bus
/// starts accepting `publish` calls. The `EventBus` is cheap to clone and
/// every clone shares the same registry and worker pool.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    config: BusConfig,
    staging: Mutex<Option<ListenerRegistry>>,
    registry: OnceLock<SealedRegistry>,
    workers: OnceLock<WorkerPool>,
    sink: FailureSink,
    system_event_sender: broadcast::Sender<SystemEvent>,
}

/// What to do with failures collected during one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailurePolicy {
    /// Hand each failure to the observer; the caller never sees them.
    Report,
    /// Return the failures to the caller.
    Collect,
}

// Core implementation block for internal logic.
impl EventBus {
    /// Runs every listener matching the delivery's phase and event type, in
    /// priority order. SYNC listeners run inline; ASYNC listeners are queued.
    ///
    /// Returns the number of listeners invoked and, under
    /// [`FailurePolicy::Collect`], the failures.
    pub(crate) fn deliver(
        &self,
        registry: &SealedRegistry,
        delivery: &Delivery,
        policy: FailurePolicy,
    ) -> (usize, Vec<ListenerError>) {
        let mut invoked = 0;
        let mut failures = Vec::new();
        let event_type = delivery.event().event_type();

        for (id, registration) in registry.matching(delivery.phase(), event_type) {
            invoked += 1;
            match &registration.handler {
                Handler::Sync(handler) => {
                    trace!(
                        listener = %registration.name,
                        phase = %delivery.phase(),
                        event_type,
                        "Invoking listener"
                    );
                    if let Err(source) = self.invoke_sync(handler.as_ref(), delivery) {
                        let failure = listener_failure(id, registration, delivery, source);
                        warn!(
                            listener = %failure.listener,
                            phase = %failure.phase,
                            event_type,
                            error = %failure.source,
                            "Listener failed, continuing with the next one"
                        );
                        match policy {
                            FailurePolicy::Report => self.inner.sink.report(failure),
                            FailurePolicy::Collect => failures.push(failure),
                        }
                    }
                }
                Handler::Async(handler) => {
                    let job = AsyncJob {
                        listener_id: id,
                        name: registration.name.clone(),
                        handler: handler.clone(),
                        delivery: delivery.clone(),
                    };
                    match self.inner.workers.get() {
                        Some(workers) => workers.submit(job),
                        None => self.inner.sink.report(listener_failure(
                            id,
                            registration,
                            delivery,
                            anyhow!("no async worker pool is running"),
                        )),
                    }
                }
            }
        }
        (invoked, failures)
    }

    fn invoke_sync(
        &self,
        handler: &(dyn Fn(&Delivery) -> anyhow::Result<()> + Send + Sync),
        delivery: &Delivery,
    ) -> anyhow::Result<()> {
        if !self.inner.config.catch_panics {
            return handler(delivery);
        }
        match panic::catch_unwind(AssertUnwindSafe(|| handler(delivery))) {
            Ok(result) => result,
            Err(payload) => Err(anyhow!("handler panicked: {}", panic_message(&*payload))),
        }
    }

    pub(crate) fn emit(&self, event: SystemEvent) {
        self.inner.system_event_sender.send(event).ok();
    }
}

fn listener_failure(
    id: ListenerId,
    registration: &Registration,
    delivery: &Delivery,
    source: anyhow::Error,
) -> ListenerError {
    ListenerError {
        listener: registration.name.to_string(),
        listener_id: id,
        phase: delivery.phase(),
        event_type: delivery.event().event_type().to_string(),
        source,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

// Public API implementation block.
impl EventBus {
    /// Creates an unsealed bus that logs listener failures via `tracing`.
    pub fn new(config: BusConfig) -> Result<Self, ConfigurationError> {
        Self::with_observer(config, TracingObserver)
    }

    /// Creates an unsealed bus with a custom error observer.
    pub fn with_observer(
        config: BusConfig,
        observer: impl ErrorObserver + 'static,
    ) -> Result<Self, ConfigurationError> {
        config.validate()?;
        Ok(Self::build(config, Arc::new(observer)))
    }

    fn build(config: BusConfig, observer: Arc<dyn ErrorObserver>) -> Self {
        let (system_event_sender, _) = broadcast::channel(config.system_event_capacity);
        let sink = FailureSink::new(observer, system_event_sender.clone());
        Self {
            inner: Arc::new(BusInner {
                config,
                staging: Mutex::new(Some(ListenerRegistry::new())),
                registry: OnceLock::new(),
                workers: OnceLock::new(),
                sink,
                system_event_sender,
            }),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    /// Registers a listener. Only valid before [`seal`](EventBus::seal).
    ///
    /// # Returns
    /// A `ListenerId` identifying the registration.
    pub fn subscribe(&self, listener: Listener) -> Result<ListenerId, ConfigurationError> {
        let mut staging = self
            .inner
            .staging
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(registry) = staging.as_mut() else {
            warn!(listener = %listener.name(), "Subscribe rejected, registry is sealed");
            return Err(ConfigurationError::RegistrySealed(listener.name));
        };
        let name = listener.name.clone();
        let id = registry.register(listener, self.inner.config.default_priority)?;
        self.emit(SystemEvent::ListenerAdded { id, name });
        Ok(id)
    }

    /// Closes the startup window and freezes the listener table.
    ///
    /// If any ASYNC listener was registered this also starts the worker pool,
    /// which requires a tokio runtime on the calling thread.
    pub fn seal(&self) -> Result<(), ConfigurationError> {
        let mut staging = self
            .inner
            .staging
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(registry) = staging.as_ref() else {
            return Err(ConfigurationError::AlreadySealed);
        };

        if registry.has_async() {
            let handle = Handle::try_current().map_err(|_| ConfigurationError::NoAsyncRuntime)?;
            let pool = WorkerPool::spawn(
                &handle,
                self.inner.config.async_workers,
                self.inner.config.async_queue_capacity,
                self.inner.sink.clone(),
            );
            if self.inner.workers.set(pool).is_err() {
                return Err(ConfigurationError::AlreadySealed);
            }
        }

        let Some(registry) = staging.take() else {
            return Err(ConfigurationError::AlreadySealed);
        };
        let sealed = registry.seal();
        let listeners = sealed.len();
        if self.inner.registry.set(sealed).is_err() {
            return Err(ConfigurationError::AlreadySealed);
        }
        info!(listeners, "Listener registry sealed");
        self.emit(SystemEvent::RegistrySealed { listeners });
        Ok(())
    }

    pub fn is_sealed(&self) -> bool {
        self.inner.registry.get().is_some()
    }

    /// The frozen listener table.
    pub fn registry(&self) -> Result<&SealedRegistry, ConfigurationError> {
        self.inner
            .registry
            .get()
            .ok_or(ConfigurationError::RegistryNotSealed)
    }

    /// Begins a unit of work in `ctx`.
    ///
    /// Fails with `AlreadyActive` if `ctx` already has a current transaction.
    pub fn begin(
        &self,
        ctx: &mut ExecutionContext,
    ) -> Result<TransactionId, TransactionStateError> {
        let id = ctx.begin()?.id();
        debug!(transaction = %id, "Transaction begun");
        self.emit(SystemEvent::TransactionBegun { id });
        Ok(id)
    }

    /// Publishes an event.
    ///
    /// With no transaction current in `ctx`, IMMEDIATE listeners run before
    /// this returns (ASYNC ones are only queued). With a transaction current,
    /// the event is appended to its pending queue and no listener runs until
    /// the scheduler drives the transaction to an outcome.
    ///
    /// Listener failures are never returned from here; they go to the
    /// error observer.
    pub fn publish(&self, ctx: &mut ExecutionContext, event: Event) -> Result<(), EventCoreError> {
        let registry = self.registry()?;

        if let Some(tx) = ctx.current() {
            let id = tx.id();
            trace!(transaction = %id, event_type = event.event_type(), "Deferring event");
            ctx.current_mut()?.enqueue(event)?;
            return Ok(());
        }

        let delivery = Delivery::new(
            Arc::new(event),
            Phase::Immediate,
            None,
            ctx.cancellation().cloned(),
        );
        let (invoked, _) = self.deliver(registry, &delivery, FailurePolicy::Report);
        trace!(event_type = delivery.event().event_type(), invoked, "Event dispatched immediately");
        Ok(())
    }

    /// A scheduler bound to this bus, for the unit-of-work boundary to call.
    pub fn scheduler(&self) -> PhaseScheduler {
        PhaseScheduler::new(self.clone())
    }

    /// Stops the ASYNC worker pool. Queued deliveries that have not started,
    /// and ASYNC deliveries published afterwards, are reported to the error
    /// observer instead of running.
    pub fn shutdown(&self) {
        if let Some(workers) = self.inner.workers.get() {
            info!("Shutting down async workers");
            workers.shutdown();
        }
    }

    /// Subscribes to the `SystemEvent` stream.
    pub fn subscribe_system_events(&self) -> broadcast::Receiver<SystemEvent> {
        self.inner.system_event_sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::build(BusConfig::default(), Arc::new(TracingObserver))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::listener::EventTypeMatcher;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn recorder(
        log: &Arc<Mutex<Vec<String>>>,
        tag: &'static str,
    ) -> impl Fn(&Delivery) -> anyhow::Result<()> {
        let log = log.clone();
        move |delivery: &Delivery| {
            log.lock()
                .unwrap()
                .push(format!("{tag}:{}", delivery.event().event_type()));
            Ok(())
        }
    }

    #[test]
    fn publish_before_seal_is_a_configuration_error() {
        let bus = EventBus::default();
        let mut ctx = ExecutionContext::new();
        let err = bus.publish(&mut ctx, Event::new("x", ())).unwrap_err();
        assert!(matches!(
            err,
            EventCoreError::Configuration(ConfigurationError::RegistryNotSealed)
        ));
    }

    #[test]
    fn subscribe_after_seal_is_rejected() {
        let bus = EventBus::default();
        bus.seal().unwrap();
        let err = bus
            .subscribe(Listener::sync("late", "x", Phase::Immediate, |_| Ok(())))
            .unwrap_err();
        assert_eq!(err, ConfigurationError::RegistrySealed("late".to_string()));
        assert_eq!(bus.seal().unwrap_err(), ConfigurationError::AlreadySealed);
    }

    #[test]
    fn immediate_listeners_run_in_priority_order_before_publish_returns() {
        let bus = EventBus::default();
        let log = Arc::new(Mutex::new(Vec::new()));
        let second = Listener::sync("second", "ping", Phase::Immediate, recorder(&log, "second"));
        let first = Listener::sync("first", "ping", Phase::Immediate, recorder(&log, "first"));
        bus.subscribe(second.priority(2)).unwrap();
        bus.subscribe(first.priority(1)).unwrap();
        bus.seal().unwrap();

        let mut ctx = ExecutionContext::new();
        bus.publish(&mut ctx, Event::new("ping", ())).unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["first:ping", "second:ping"]);
    }

    #[test]
    fn failing_listener_does_not_block_siblings() {
        let failures = Arc::new(AtomicUsize::new(0));
        let observed = failures.clone();
        let bus = EventBus::with_observer(BusConfig::default(), move |_: &ListenerError| {
            observed.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(
            Listener::sync("broken", EventTypeMatcher::Any, Phase::Immediate, |_| {
                anyhow::bail!("boom")
            })
            .priority(0),
        )
        .unwrap();
        bus.subscribe(
            Listener::sync("panics", EventTypeMatcher::Any, Phase::Immediate, |_| {
                panic!("listener panic")
            })
            .priority(1),
        )
        .unwrap();
        bus.subscribe(
            Listener::sync(
                "healthy",
                EventTypeMatcher::Any,
                Phase::Immediate,
                recorder(&log, "healthy"),
            )
            .priority(2),
        )
        .unwrap();
        bus.seal().unwrap();

        let mut ctx = ExecutionContext::new();
        bus.publish(&mut ctx, Event::new("ping", ())).unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["healthy:ping"]);
        assert_eq!(failures.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn publish_inside_transaction_defers_everything() {
        let bus = EventBus::default();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(Listener::sync("now", "ping", Phase::Immediate, recorder(&log, "now")))
            .unwrap();
        bus.seal().unwrap();

        let mut ctx = ExecutionContext::new();
        bus.begin(&mut ctx).unwrap();
        bus.publish(&mut ctx, Event::new("ping", ())).unwrap();

        assert!(log.lock().unwrap().is_empty());
        assert_eq!(ctx.current().unwrap().pending_len(), 1);
    }

    #[test]
    fn sealing_async_listeners_without_runtime_fails() {
        let bus = EventBus::default();
        bus.subscribe(Listener::asynchronous("bg", "ping", Phase::AfterCommit, |_| async {
            anyhow::Ok(())
        }))
        .unwrap();
        assert_eq!(bus.seal().unwrap_err(), ConfigurationError::NoAsyncRuntime);
        assert!(!bus.is_sealed());
    }

    #[test]
    fn system_events_announce_registration_and_seal() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe_system_events();
        bus.subscribe(Listener::sync("a", "ping", Phase::Immediate, |_| Ok(())))
            .unwrap();
        bus.seal().unwrap();

        assert!(matches!(rx.try_recv(), Ok(SystemEvent::ListenerAdded { .. })));
        assert!(matches!(
            rx.try_recv(),
            Ok(SystemEvent::RegistrySealed { listeners: 1 })
        ));
    }
}
