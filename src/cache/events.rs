//! Record lifecycle events.
//!
//! The record layer owns persistence; it reports changes through
//! [`LifecycleHooks`]. [`EventBus`] is an in-process implementation for hosts
//! without a hook system of their own.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use crate::error::CacheError;

use super::lock::{rw_read, rw_write};
use super::resource::{ResourceId, ResourceRef};

const SOURCE: &str = "cache::events";

/// Lifecycle points the engine can bind to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LifecycleEvent {
    AfterSave,
    BeforeDestroy,
    AfterDestroy,
}

impl LifecycleEvent {
    /// Collections bind to these unless configured otherwise.
    pub const DEFAULT_TRIGGERS: [Self; 2] = [Self::AfterSave, Self::BeforeDestroy];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::AfterSave => "after_save",
            Self::BeforeDestroy => "before_destroy",
            Self::AfterDestroy => "after_destroy",
        }
    }

    pub fn is_destroy(self) -> bool {
        matches!(self, Self::BeforeDestroy | Self::AfterDestroy)
    }
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A record that was saved or destroyed, with the foreign keys it carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangedRecord {
    pub resource: ResourceRef,
    /// Current foreign-key values, by column name.
    pub foreign_keys: BTreeMap<String, ResourceId>,
    /// Values before the change, when the record layer tracks them.
    pub previous_foreign_keys: BTreeMap<String, ResourceId>,
}

impl ChangedRecord {
    pub fn new(resource: ResourceRef) -> Self {
        Self {
            resource,
            foreign_keys: BTreeMap::new(),
            previous_foreign_keys: BTreeMap::new(),
        }
    }

    pub fn with_foreign_key(mut self, column: impl Into<String>, id: impl Into<ResourceId>) -> Self {
        self.foreign_keys.insert(column.into(), id.into());
        self
    }

    pub fn with_previous_foreign_key(
        mut self,
        column: impl Into<String>,
        id: impl Into<ResourceId>,
    ) -> Self {
        self.previous_foreign_keys.insert(column.into(), id.into());
        self
    }

    pub fn foreign_key(&self, column: &str) -> Option<&ResourceId> {
        self.foreign_keys.get(column)
    }

    /// Previous value of `column` when it differs from the current one.
    pub fn moved_from(&self, column: &str) -> Option<&ResourceId> {
        let previous = self.previous_foreign_keys.get(column)?;
        (self.foreign_keys.get(column) != Some(previous)).then_some(previous)
    }
}

pub type EventCallback = Arc<dyn Fn(&ChangedRecord) -> Result<(), CacheError> + Send + Sync>;

/// Subscription interface offered by the record layer.
pub trait LifecycleHooks {
    fn on_event(&self, resource_type: &str, event: LifecycleEvent, callback: EventCallback);
}

/// In-process [`LifecycleHooks`] implementation.
///
/// Handlers for one `(type, event)` pair run in registration order; the
/// first error stops the chain and is returned to the emitter.
#[derive(Default)]
pub struct EventBus {
    handlers: RwLock<HashMap<(String, LifecycleEvent), Vec<EventCallback>>>,
    emitted: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: LifecycleEvent, record: &ChangedRecord) -> Result<(), CacheError> {
        let handlers: Vec<EventCallback> = rw_read(&self.handlers, SOURCE, "emit")
            .get(&(record.resource.resource_type().to_string(), event))
            .cloned()
            .unwrap_or_default();

        let sequence = self.emitted.fetch_add(1, Ordering::Relaxed);
        debug!(
            sequence,
            event = %event,
            resource = %record.resource,
            handlers = handlers.len(),
            "lifecycle event emitted"
        );

        for handler in handlers {
            handler(record)?;
        }
        Ok(())
    }

    /// Number of handlers bound to `(resource_type, event)`.
    pub fn handler_count(&self, resource_type: &str, event: LifecycleEvent) -> usize {
        rw_read(&self.handlers, SOURCE, "handler_count")
            .get(&(resource_type.to_string(), event))
            .map_or(0, Vec::len)
    }

    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }
}

impl LifecycleHooks for EventBus {
    fn on_event(&self, resource_type: &str, event: LifecycleEvent, callback: EventCallback) {
        rw_write(&self.handlers, SOURCE, "on_event")
            .entry((resource_type.to_string(), event))
            .or_default()
            .push(callback);
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bindings = rw_read(&self.handlers, SOURCE, "debug").len();
        f.debug_struct("EventBus")
            .field("bindings", &bindings)
            .field("emitted", &self.emitted())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    fn record(resource_type: &str, id: i64) -> ChangedRecord {
        ChangedRecord::new(ResourceRef::new(resource_type, id))
    }

    #[test]
    fn handlers_run_in_registration_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for label in ["first", "second"] {
            let seen = Arc::clone(&seen);
            bus.on_event(
                "Join",
                LifecycleEvent::AfterSave,
                Arc::new(move |_| {
                    seen.lock().expect("lock").push(label);
                    Ok(())
                }),
            );
        }

        bus.emit(LifecycleEvent::AfterSave, &record("Join", 1))
            .expect("handlers succeed");
        assert_eq!(*seen.lock().expect("lock"), vec!["first", "second"]);
        assert_eq!(bus.emitted(), 1);
    }

    #[test]
    fn emit_is_scoped_by_type_and_event() {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&calls);
        bus.on_event(
            "Join",
            LifecycleEvent::BeforeDestroy,
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        bus.emit(LifecycleEvent::AfterSave, &record("Join", 1))
            .expect("no handlers");
        bus.emit(LifecycleEvent::BeforeDestroy, &record("Other", 1))
            .expect("no handlers");
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        bus.emit(LifecycleEvent::BeforeDestroy, &record("Join", 1))
            .expect("handler succeeds");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(bus.handler_count("Join", LifecycleEvent::BeforeDestroy), 1);
    }

    #[test]
    fn first_error_stops_the_chain() {
        let bus = EventBus::new();
        let reached = Arc::new(AtomicU64::new(0));
        bus.on_event(
            "Join",
            LifecycleEvent::AfterSave,
            Arc::new(|_| Err(CacheError::validation("boom"))),
        );
        let counter = Arc::clone(&reached);
        bus.on_event(
            "Join",
            LifecycleEvent::AfterSave,
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        let err = bus
            .emit(LifecycleEvent::AfterSave, &record("Join", 1))
            .expect_err("first handler fails");
        assert!(matches!(err, CacheError::Validation { .. }));
        assert_eq!(reached.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn moved_from_reports_only_changed_keys() {
        let unchanged = record("Child", 1)
            .with_foreign_key("parent_id", 5_i64)
            .with_previous_foreign_key("parent_id", 5_i64);
        assert_eq!(unchanged.moved_from("parent_id"), None);

        let moved = record("Child", 1)
            .with_foreign_key("parent_id", 6_i64)
            .with_previous_foreign_key("parent_id", 5_i64);
        assert_eq!(moved.moved_from("parent_id"), Some(&ResourceId::Int(5)));
        assert_eq!(moved.foreign_key("parent_id"), Some(&ResourceId::Int(6)));
    }

    #[test]
    fn event_names() {
        assert_eq!(LifecycleEvent::AfterSave.to_string(), "after_save");
        assert!(LifecycleEvent::BeforeDestroy.is_destroy());
        assert!(!LifecycleEvent::AfterSave.is_destroy());
    }
}
