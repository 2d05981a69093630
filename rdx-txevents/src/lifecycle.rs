//! Entity lifecycle hooks around persistence operations.
//!
//! Every create, update, or remove goes through three steps:
//!
//! 1. **Pre-hooks** run synchronously and may mutate the entity (stamping
//!    timestamps, normalising fields). They may also reject the operation by
//!    returning a [`HookRejection`]; nothing is persisted in that case.
//! 2. **Persist** is the caller's closure, i.e. the actual storage I/O.
//! 3. **Post-hooks** run only if persist succeeded. Each may turn the
//!    [`EntityChangeRecord`] into an [`Event`], which is published through
//!    the bus (and so deferred if a transaction is current).

use crate::bus::EventBus;
use crate::error::EventCoreError;
use crate::events::{Event, SourceRef};
use crate::transaction::ExecutionContext;
use chrono::{DateTime, Utc};
use std::fmt;
use thiserror::Error;
use tracing::{debug, trace};

/// The persistence operation being wrapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Update,
    Remove,
}

impl Operation {
    /// Suffix used in event type tags, e.g. `user.created`.
    pub fn past_tense(&self) -> &'static str {
        match self {
            Operation::Create => "created",
            Operation::Update => "updated",
            Operation::Remove => "removed",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Create => f.write_str("create"),
            Operation::Update => f.write_str("update"),
            Operation::Remove => f.write_str("remove"),
        }
    }
}

/// A persistable domain object.
pub trait Entity: Clone + Send + Sync + 'static {
    /// Short name used in event types and source references, e.g. `"user"`.
    const KIND: &'static str;

    fn entity_id(&self) -> String;

    fn source_ref(&self) -> SourceRef {
        SourceRef::new(Self::KIND, self.entity_id())
    }
}

/// Entities carrying creation and modification timestamps.
pub trait Timestamped {
    fn created_at(&self) -> Option<DateTime<Utc>>;
    fn updated_at(&self) -> Option<DateTime<Utc>>;
    fn set_created_at(&mut self, at: DateTime<Utc>);
    fn set_updated_at(&mut self, at: DateTime<Utc>);
}

/// A pre-hook declined the operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct HookRejection {
    pub reason: String,
}

impl HookRejection {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("pre-{operation} hook rejected {kind}: {rejection}")]
    Rejected {
        kind: &'static str,
        operation: Operation,
        rejection: HookRejection,
    },

    #[error("{operation} of {kind} failed: {source}")]
    Persist {
        kind: &'static str,
        operation: Operation,
        source: anyhow::Error,
    },

    #[error(transparent)]
    Publish(#[from] EventCoreError),
}

/// Snapshots handed from the operation to the post-hooks.
///
/// `before` is the entity as it was before any pre-hook ran (absent for
/// creates); `after` is the entity once persisted (absent for removes).
#[derive(Debug, Clone)]
pub struct EntityChangeRecord<E> {
    pub operation: Operation,
    pub before: Option<E>,
    pub after: Option<E>,
}

/// Payload of the events published by [`change_event`].
#[derive(Debug, Clone)]
pub struct EntityChanged<E> {
    pub entity: SourceRef,
    pub operation: Operation,
    pub before: Option<E>,
    pub after: Option<E>,
}

pub type PreHook<E> = Box<dyn Fn(&mut E, Operation) -> Result<(), HookRejection> + Send + Sync>;
pub type PostHook<E> = Box<dyn Fn(&EntityChangeRecord<E>) -> Option<Event> + Send + Sync>;

/// Wraps persistence operations on `E` with pre- and post-hooks.
pub struct EntityLifecycleDispatcher<E: Entity> {
    bus: EventBus,
    pre_hooks: Vec<PreHook<E>>,
    post_hooks: Vec<PostHook<E>>,
}

impl<E: Entity> EntityLifecycleDispatcher<E> {
    /// A dispatcher that publishes a `<kind>.<created|updated|removed>`
    /// event after every successful operation.
    pub fn new(bus: EventBus) -> Self {
        Self {
            bus,
            pre_hooks: Vec::new(),
            post_hooks: vec![Box::new(|record| Some(change_event(record)))],
        }
    }

    pub fn with_pre_hook(
        mut self,
        hook: impl Fn(&mut E, Operation) -> Result<(), HookRejection> + Send + Sync + 'static,
    ) -> Self {
        self.pre_hooks.push(Box::new(hook));
        self
    }

    pub fn with_post_hook(
        mut self,
        hook: impl Fn(&EntityChangeRecord<E>) -> Option<Event> + Send + Sync + 'static,
    ) -> Self {
        self.post_hooks.push(Box::new(hook));
        self
    }

    pub fn wrap_create<R>(
        &self,
        ctx: &mut ExecutionContext,
        entity: &mut E,
        persist: impl FnOnce(&mut E) -> anyhow::Result<R>,
    ) -> Result<R, LifecycleError> {
        self.run(ctx, Operation::Create, entity, persist)
    }

    pub fn wrap_update<R>(
        &self,
        ctx: &mut ExecutionContext,
        entity: &mut E,
        persist: impl FnOnce(&mut E) -> anyhow::Result<R>,
    ) -> Result<R, LifecycleError> {
        self.run(ctx, Operation::Update, entity, persist)
    }

    pub fn wrap_remove<R>(
        &self,
        ctx: &mut ExecutionContext,
        entity: &mut E,
        persist: impl FnOnce(&mut E) -> anyhow::Result<R>,
    ) -> Result<R, LifecycleError> {
        self.run(ctx, Operation::Remove, entity, persist)
    }

    fn run<R>(
        &self,
        ctx: &mut ExecutionContext,
        operation: Operation,
        entity: &mut E,
        persist: impl FnOnce(&mut E) -> anyhow::Result<R>,
    ) -> Result<R, LifecycleError> {
        // Nothing is persisted unless the post-hook publish will be accepted.
        self.bus.registry().map_err(EventCoreError::from)?;
        ctx.ensure_accepting().map_err(EventCoreError::from)?;

        let before = match operation {
            Operation::Create => None,
            Operation::Update | Operation::Remove => Some(entity.clone()),
        };

        for hook in &self.pre_hooks {
            hook(entity, operation).map_err(|rejection| {
                debug!(
                    kind = E::KIND,
                    %operation,
                    reason = %rejection,
                    "Pre-hook rejected operation"
                );
                LifecycleError::Rejected {
                    kind: E::KIND,
                    operation,
                    rejection,
                }
            })?;
        }

        let result = persist(entity).map_err(|source| LifecycleError::Persist {
            kind: E::KIND,
            operation,
            source,
        })?;

        let record = EntityChangeRecord {
            operation,
            before,
            after: match operation {
                Operation::Remove => None,
                Operation::Create | Operation::Update => Some(entity.clone()),
            },
        };
        for hook in &self.post_hooks {
            if let Some(event) = hook(&record) {
                trace!(kind = E::KIND, event_type = event.event_type(), "Post-hook publishing");
                self.bus.publish(ctx, event)?;
            }
        }
        Ok(result)
    }
}

impl<E: Entity + Timestamped> EntityLifecycleDispatcher<E> {
    /// Adds the timestamp pre-hook: creation sets both timestamps, updates
    /// advance `updated_at`.
    pub fn with_timestamps(self) -> Self {
        self.with_pre_hook(|entity, operation| {
            stamp_timestamps(entity, operation, Utc::now());
            Ok(())
        })
    }
}

/// Stamps `now` onto the entity's timestamps.
///
/// A create sets `created_at` and `updated_at` to the same instant. An
/// update moves `updated_at` strictly forward, by one microsecond if the
/// clock has not advanced since the previous stamp.
pub fn stamp_timestamps<E: Timestamped>(entity: &mut E, operation: Operation, now: DateTime<Utc>) {
    match operation {
        Operation::Create => {
            entity.set_created_at(now);
            entity.set_updated_at(now);
        }
        Operation::Update => {
            let next = match entity.updated_at() {
                Some(previous) if now <= previous => previous + chrono::Duration::microseconds(1),
                _ => now,
            };
            entity.set_updated_at(next);
        }
        Operation::Remove => {}
    }
}

/// Builds the default change event for a record.
pub fn change_event<E: Entity>(record: &EntityChangeRecord<E>) -> Event {
    let source = record
        .after
        .as_ref()
        .or(record.before.as_ref())
        .map(Entity::source_ref);
    let event_type = format!("{}.{}", E::KIND, record.operation.past_tense());
    let payload = EntityChanged {
        entity: source.clone().unwrap_or_else(|| SourceRef::new(E::KIND, "")),
        operation: record.operation,
        before: record.before.clone(),
        after: record.after.clone(),
    };
    let event = Event::new(event_type, payload);
    match source {
        Some(source) => event.with_source(source),
        None => event,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Phase;
    use crate::components::listener::Listener;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, Default, PartialEq)]
    struct User {
        id: u64,
        email: String,
        created_at: Option<DateTime<Utc>>,
        updated_at: Option<DateTime<Utc>>,
    }

    impl Entity for User {
        const KIND: &'static str = "user";

        fn entity_id(&self) -> String {
            self.id.to_string()
        }
    }

    impl Timestamped for User {
        fn created_at(&self) -> Option<DateTime<Utc>> {
            self.created_at
        }
        fn updated_at(&self) -> Option<DateTime<Utc>> {
            self.updated_at
        }
        fn set_created_at(&mut self, at: DateTime<Utc>) {
            self.created_at = Some(at);
        }
        fn set_updated_at(&mut self, at: DateTime<Utc>) {
            self.updated_at = Some(at);
        }
    }

    fn recording_bus(seen: &Arc<Mutex<Vec<String>>>) -> EventBus {
        let bus = EventBus::default();
        let seen = seen.clone();
        bus.subscribe(Listener::sync(
            "all-user-events",
            crate::components::listener::EventTypeMatcher::prefix("user."),
            Phase::Immediate,
            move |delivery| {
                seen.lock()
                    .unwrap()
                    .push(delivery.event().event_type().to_string());
                Ok(())
            },
        ))
        .unwrap();
        bus.seal().unwrap();
        bus
    }

    #[test]
    fn create_stamps_equal_timestamps_and_publishes() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let dispatcher =
            EntityLifecycleDispatcher::<User>::new(recording_bus(&seen)).with_timestamps();
        let mut ctx = ExecutionContext::new();
        let mut user = User {
            email: "ada@example.com".into(),
            ..Default::default()
        };

        dispatcher
            .wrap_create(&mut ctx, &mut user, |user| {
                user.id = 1;
                Ok(())
            })
            .unwrap();

        assert!(user.created_at.is_some());
        assert_eq!(user.created_at, user.updated_at);
        assert_eq!(*seen.lock().unwrap(), vec!["user.created"]);
    }

    #[test]
    fn update_moves_only_updated_at_forward() {
        let now = Utc::now();
        let mut user = User::default();
        stamp_timestamps(&mut user, Operation::Create, now);

        stamp_timestamps(&mut user, Operation::Update, now);
        assert_eq!(user.created_at, Some(now));
        assert!(user.updated_at.unwrap() > now);

        let later = now + chrono::Duration::seconds(5);
        stamp_timestamps(&mut user, Operation::Update, later);
        assert_eq!(user.updated_at, Some(later));
        assert_eq!(user.created_at, Some(now));
    }

    #[test]
    fn rejected_pre_hook_skips_persist_and_post_hooks() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = EntityLifecycleDispatcher::<User>::new(recording_bus(&seen)).with_pre_hook(
            |user, _| {
                if user.email.contains('@') {
                    Ok(())
                } else {
                    Err(HookRejection::new("email is invalid"))
                }
            },
        );
        let mut ctx = ExecutionContext::new();
        let mut user = User {
            email: "nope".into(),
            ..Default::default()
        };
        let mut persisted = false;

        let err = dispatcher
            .wrap_create(&mut ctx, &mut user, |_| {
                persisted = true;
                Ok(())
            })
            .unwrap_err();

        assert!(matches!(err, LifecycleError::Rejected { operation: Operation::Create, .. }));
        assert!(!persisted);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn committing_transaction_refuses_before_persist() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let bus = recording_bus(&seen);
        let dispatcher = EntityLifecycleDispatcher::<User>::new(bus.clone());
        let mut ctx = ExecutionContext::new();
        bus.begin(&mut ctx).unwrap();
        bus.scheduler().on_before_commit(&mut ctx).unwrap();
        let mut user = User::default();
        let mut persisted = false;

        let err = dispatcher
            .wrap_create(&mut ctx, &mut user, |_| {
                persisted = true;
                Ok(())
            })
            .unwrap_err();

        assert!(matches!(
            err,
            LifecycleError::Publish(EventCoreError::TransactionState(
                crate::error::TransactionStateError::NotAccepting { .. }
            ))
        ));
        assert!(!persisted);
        assert!(user.created_at.is_none());
    }

    #[test]
    fn failed_persist_skips_post_hooks() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = EntityLifecycleDispatcher::<User>::new(recording_bus(&seen));
        let mut ctx = ExecutionContext::new();
        let mut user = User::default();

        let err = dispatcher
            .wrap_update(&mut ctx, &mut user, |_| -> anyhow::Result<()> {
                anyhow::bail!("constraint violation")
            })
            .unwrap_err();

        assert!(matches!(err, LifecycleError::Persist { .. }));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn change_record_carries_before_and_after() {
        let captured = Arc::new(Mutex::new(None));
        let sink = captured.clone();
        let bus = EventBus::default();
        bus.seal().unwrap();
        let dispatcher = EntityLifecycleDispatcher::<User>::new(bus).with_post_hook(move |record| {
            *sink.lock().unwrap() = Some(record.clone());
            None
        });
        let mut ctx = ExecutionContext::new();
        let mut user = User {
            id: 3,
            email: "old@example.com".into(),
            ..Default::default()
        };

        dispatcher
            .wrap_update(&mut ctx, &mut user, |user| {
                user.email = "new@example.com".into();
                Ok(())
            })
            .unwrap();

        let record = captured.lock().unwrap().take().unwrap();
        assert_eq!(record.before.unwrap().email, "old@example.com");
        assert_eq!(record.after.unwrap().email, "new@example.com");
    }

    #[test]
    fn remove_event_uses_the_before_snapshot_as_source() {
        let record = EntityChangeRecord {
            operation: Operation::Remove,
            before: Some(User {
                id: 9,
                ..Default::default()
            }),
            after: None,
        };
        let event = change_event(&record);
        assert_eq!(event.event_type(), "user.removed");
        assert_eq!(event.source(), Some(&SourceRef::new("user", 9)));
        let payload = event.payload::<EntityChanged<User>>().unwrap();
        assert!(payload.after.is_none());
    }
}
