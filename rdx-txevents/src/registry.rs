//! The listener registry: written during startup, read-only once sealed.
//!
//! [`ListenerRegistry`] accepts registrations until [`seal`](ListenerRegistry::seal)
//! turns it into a [`SealedRegistry`], an explicit per-phase dispatch table
//! sorted by priority and registration order. The sealed table is never
//! mutated again, so it can be shared across threads without locks.

use crate::common::{ListenerId, ListenerMode, Phase};
use crate::components::listener::{Listener, Registration};
use crate::error::ConfigurationError;
use slotmap::SlotMap;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Registrations collected during the startup window.
#[derive(Debug, Default)]
pub struct ListenerRegistry {
    listeners: SlotMap<ListenerId, Registration>,
    names: HashSet<String>,
    next_seq: u64,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a listener. Names must be unique, and BEFORE_COMMIT listeners
    /// must be SYNC.
    pub fn register(
        &mut self,
        listener: Listener,
        default_priority: i32,
    ) -> Result<ListenerId, ConfigurationError> {
        if self.names.contains(listener.name()) {
            return Err(ConfigurationError::DuplicateListener(listener.name));
        }
        if listener.mode() == ListenerMode::Async && !listener.phase().permits_async() {
            return Err(ConfigurationError::AsyncBeforeCommit(listener.name));
        }

        self.names.insert(listener.name.clone());
        let seq = self.next_seq;
        self.next_seq += 1;
        let registration = Registration::from_listener(listener, default_priority, seq);
        debug!(
            listener = %registration.name,
            phase = %registration.phase,
            priority = registration.priority,
            mode = ?registration.mode(),
            "Listener registered"
        );
        Ok(self.listeners.insert(registration))
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Whether any staged listener needs the worker pool.
    pub fn has_async(&self) -> bool {
        self.listeners
            .values()
            .any(|registration| registration.mode() == ListenerMode::Async)
    }

    /// Closes the registry and builds the per-phase dispatch table.
    pub fn seal(self) -> SealedRegistry {
        let mut by_phase: HashMap<Phase, Vec<ListenerId>> = HashMap::new();
        for (id, registration) in self.listeners.iter() {
            by_phase.entry(registration.phase).or_default().push(id);
        }
        for ids in by_phase.values_mut() {
            ids.sort_by_key(|id| {
                let registration = &self.listeners[*id];
                (registration.priority, registration.seq)
            });
        }
        SealedRegistry {
            listeners: self.listeners,
            by_phase,
        }
    }
}

/// The immutable dispatch table built by [`ListenerRegistry::seal`].
#[derive(Debug)]
pub struct SealedRegistry {
    listeners: SlotMap<ListenerId, Registration>,
    by_phase: HashMap<Phase, Vec<ListenerId>>,
}

impl SealedRegistry {
    /// Listeners registered for `phase` whose matcher accepts `event_type`,
    /// in ascending priority with ties broken by registration order.
    pub fn matching<'a>(
        &'a self,
        phase: Phase,
        event_type: &'a str,
    ) -> impl Iterator<Item = (ListenerId, &'a Registration)> + 'a {
        self.by_phase
            .get(&phase)
            .into_iter()
            .flatten()
            .filter_map(move |id| {
                let registration = self.listeners.get(*id)?;
                registration
                    .matcher
                    .matches(event_type)
                    .then_some((*id, registration))
            })
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::listener::EventTypeMatcher;

    fn noop(name: &str, phase: Phase) -> Listener {
        Listener::sync(name, "user.created", phase, |_| Ok(()))
    }

    fn names(sealed: &SealedRegistry, phase: Phase, event_type: &str) -> Vec<String> {
        sealed
            .matching(phase, event_type)
            .map(|(_, registration)| registration.name.to_string())
            .collect()
    }

    #[test]
    fn sealed_table_orders_by_priority_then_registration() {
        let mut registry = ListenerRegistry::new();
        registry.register(noop("late", Phase::AfterCommit).priority(2), 0).unwrap();
        registry.register(noop("first", Phase::AfterCommit).priority(1), 0).unwrap();
        registry.register(noop("tie-a", Phase::AfterCommit).priority(5), 0).unwrap();
        registry.register(noop("tie-b", Phase::AfterCommit).priority(5), 0).unwrap();

        let sealed = registry.seal();
        assert_eq!(
            names(&sealed, Phase::AfterCommit, "user.created"),
            vec!["first", "late", "tie-a", "tie-b"]
        );
    }

    #[test]
    fn matching_filters_by_phase_and_type() {
        let mut registry = ListenerRegistry::new();
        registry.register(noop("commit", Phase::AfterCommit), 0).unwrap();
        registry.register(noop("rollback", Phase::AfterRollback), 0).unwrap();
        registry
            .register(
                Listener::sync("carts", EventTypeMatcher::prefix("cart."), Phase::AfterCommit, |_| {
                    Ok(())
                }),
                0,
            )
            .unwrap();

        let sealed = registry.seal();
        assert_eq!(names(&sealed, Phase::AfterCommit, "user.created"), vec!["commit"]);
        assert_eq!(names(&sealed, Phase::AfterCommit, "cart.item_added"), vec!["carts"]);
        assert!(names(&sealed, Phase::Immediate, "user.created").is_empty());
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut registry = ListenerRegistry::new();
        registry.register(noop("audit", Phase::AfterCommit), 0).unwrap();
        let err = registry.register(noop("audit", Phase::AfterRollback), 0).unwrap_err();
        assert_eq!(err, ConfigurationError::DuplicateListener("audit".to_string()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn async_before_commit_is_rejected() {
        let mut registry = ListenerRegistry::new();
        let listener =
            Listener::asynchronous("slow", "user.created", Phase::BeforeCommit, |_| async {
                anyhow::Ok(())
            });
        let err = registry.register(listener, 0).unwrap_err();
        assert_eq!(err, ConfigurationError::AsyncBeforeCommit("slow".to_string()));
        assert!(registry.is_empty());
    }

    #[test]
    fn has_async_reflects_registrations() {
        let mut registry = ListenerRegistry::new();
        registry.register(noop("sync", Phase::AfterCommit), 0).unwrap();
        registry
            .register(
                Listener::asynchronous("mailer", "user.created", Phase::AfterCommit, |_| async {
                    anyhow::Ok(())
                }),
                0,
            )
            .unwrap();
        assert!(registry.has_async());
    }
}
