//! Typed event surface for tasks and the manager.
//!
//! Listeners are invoked synchronously in registration order, so a single
//! listener observes a task's events in transition order. Listeners must
//! not block; a slow listener delays the emitting task.

use crate::task::ProgressSnapshot;
use std::sync::{Arc, Mutex};

/// Handle returned by [`EventBus::on`], used to unregister the listener
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Multi-listener pub/sub with synchronous in-order dispatch
pub struct EventBus<E> {
    inner: Arc<Mutex<BusInner<E>>>,
}

struct BusInner<E> {
    next_id: u64,
    listeners: Vec<(ListenerId, Listener<E>)>,
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> EventBus<E> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(BusInner {
                next_id: 0,
                listeners: Vec::new(),
            })),
        }
    }

    /// Register a listener; it is called for every event emitted after
    /// registration, in registration order relative to other listeners.
    pub fn on<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock().expect("event bus poisoned");
        let id = ListenerId(inner.next_id);
        inner.next_id += 1;
        inner.listeners.push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener. Returns false if the id was already removed.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut inner = self.inner.lock().expect("event bus poisoned");
        let before = inner.listeners.len();
        inner.listeners.retain(|(lid, _)| *lid != id);
        inner.listeners.len() != before
    }

    /// Dispatch an event to every listener, in registration order.
    pub fn emit(&self, event: &E) {
        // Snapshot outside the lock so a listener may register/unregister
        let listeners: Vec<Listener<E>> = {
            let inner = self.inner.lock().expect("event bus poisoned");
            inner.listeners.iter().map(|(_, l)| Arc::clone(l)).collect()
        };
        for listener in listeners {
            listener(event);
        }
    }

    /// Number of registered listeners
    pub fn listener_count(&self) -> usize {
        self.inner.lock().expect("event bus poisoned").listeners.len()
    }
}

/// Per-task lifecycle events
#[derive(Debug, Clone)]
pub enum TaskEvent {
    Started {
        task_id: String,
    },
    Progress {
        task_id: String,
        progress: ProgressSnapshot,
    },
    ChunkSuccess {
        task_id: String,
        index: usize,
        hash: String,
    },
    ChunkError {
        task_id: String,
        index: usize,
        attempt: u32,
        message: String,
    },
    HashProgress {
        task_id: String,
        percent: u8,
    },
    HashComplete {
        task_id: String,
        hash: String,
    },
    Paused {
        task_id: String,
    },
    Resumed {
        task_id: String,
    },
    Cancelled {
        task_id: String,
    },
    Success {
        task_id: String,
        file_url: String,
    },
    Error {
        task_id: String,
        message: String,
        /// Non-fatal persistence failure; the task keeps running in memory
        storage: bool,
    },
}

impl TaskEvent {
    pub fn name(&self) -> &'static str {
        match self {
            TaskEvent::Started { .. } => "Started",
            TaskEvent::Progress { .. } => "Progress",
            TaskEvent::ChunkSuccess { .. } => "ChunkSuccess",
            TaskEvent::ChunkError { .. } => "ChunkError",
            TaskEvent::HashProgress { .. } => "HashProgress",
            TaskEvent::HashComplete { .. } => "HashComplete",
            TaskEvent::Paused { .. } => "Paused",
            TaskEvent::Resumed { .. } => "Resumed",
            TaskEvent::Cancelled { .. } => "Cancelled",
            TaskEvent::Success { .. } => "Success",
            TaskEvent::Error { .. } => "Error",
        }
    }

    pub fn task_id(&self) -> &str {
        match self {
            TaskEvent::Started { task_id }
            | TaskEvent::Progress { task_id, .. }
            | TaskEvent::ChunkSuccess { task_id, .. }
            | TaskEvent::ChunkError { task_id, .. }
            | TaskEvent::HashProgress { task_id, .. }
            | TaskEvent::HashComplete { task_id, .. }
            | TaskEvent::Paused { task_id }
            | TaskEvent::Resumed { task_id }
            | TaskEvent::Cancelled { task_id }
            | TaskEvent::Success { task_id, .. }
            | TaskEvent::Error { task_id, .. } => task_id,
        }
    }
}

/// Manager-level events; per-task events are forwarded as `Task`
#[derive(Debug, Clone)]
pub enum ManagerEvent {
    TaskCreated { task_id: String },
    TaskDeleted { task_id: String },
    Task(TaskEvent),
}

impl ManagerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ManagerEvent::TaskCreated { .. } => "TaskCreated",
            ManagerEvent::TaskDeleted { .. } => "TaskDeleted",
            ManagerEvent::Task(event) => event.name(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn listeners_fire_in_registration_order() {
        let bus: EventBus<u32> = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            bus.on(move |value: &u32| {
                order.lock().unwrap().push((tag, *value));
            });
        }

        bus.emit(&7);
        let seen = order.lock().unwrap().clone();
        assert_eq!(seen, vec![("first", 7), ("second", 7), ("third", 7)]);
    }

    #[test]
    fn off_unregisters_a_single_listener() {
        let bus: EventBus<u32> = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let hits_a = Arc::clone(&hits);
        let id = bus.on(move |_| {
            hits_a.fetch_add(1, Ordering::SeqCst);
        });
        let hits_b = Arc::clone(&hits);
        bus.on(move |_| {
            hits_b.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(&1);
        assert!(bus.off(id));
        assert!(!bus.off(id));
        bus.emit(&2);

        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert_eq!(bus.listener_count(), 1);
    }

    #[test]
    fn listener_may_register_during_emit() {
        let bus: EventBus<u32> = EventBus::new();
        let bus_clone = bus.clone();
        bus.on(move |_| {
            bus_clone.on(|_| {});
        });
        bus.emit(&0);
        assert_eq!(bus.listener_count(), 2);
    }
}
