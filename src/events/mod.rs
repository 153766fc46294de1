//! Fire-and-forget notifications for external listeners.
//!
//! Listeners are registered per event kind and invoked synchronously in
//! registration order when the engine emits. A listener cannot fail the
//! operation that triggered it.

use crate::core::Result;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Loaded,
    Saved,
    Rejected,
    Conflict,
}

#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// A session opened; carries a defensive copy of the loaded record.
    Loaded { key: String, record: Value },
    /// A save committed (or was a clean no-op); carries the saved snapshot.
    Saved { key: String, record: Value },
    /// A session open was rejected (lease held by a live owner).
    Rejected { key: String, reason: String },
    /// A save lost the optimistic version race. Carries the backend's
    /// current value and the snapshot this process attempted to write.
    Conflict {
        key: String,
        stored: Value,
        attempted: Value,
    },
}

impl SyncEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            SyncEvent::Loaded { .. } => EventKind::Loaded,
            SyncEvent::Saved { .. } => EventKind::Saved,
            SyncEvent::Rejected { .. } => EventKind::Rejected,
            SyncEvent::Conflict { .. } => EventKind::Conflict,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            SyncEvent::Loaded { key, .. }
            | SyncEvent::Saved { key, .. }
            | SyncEvent::Rejected { key, .. }
            | SyncEvent::Conflict { key, .. } => key,
        }
    }
}

pub type EventListener = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

#[derive(Default)]
pub struct EventHub {
    listeners: RwLock<HashMap<EventKind, Vec<EventListener>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, kind: EventKind, listener: EventListener) -> Result<()> {
        let mut listeners = self.listeners.write()?;
        listeners.entry(kind).or_default().push(listener);
        Ok(())
    }

    pub fn emit(&self, event: &SyncEvent) {
        let snapshot = {
            match self.listeners.read() {
                Ok(listeners) => listeners.get(&event.kind()).cloned().unwrap_or_default(),
                Err(poisoned) => poisoned
                    .into_inner()
                    .get(&event.kind())
                    .cloned()
                    .unwrap_or_default(),
            }
        };
        for listener in snapshot {
            listener(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_multiple_listeners_per_kind() {
        let hub = EventHub::new();
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let count = count.clone();
            hub.subscribe(
                EventKind::Saved,
                Arc::new(move |_| {
                    count.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        }

        hub.emit(&SyncEvent::Saved {
            key: "p".to_string(),
            record: json!({}),
        });
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_kinds_are_independent() {
        let hub = EventHub::new();
        let count = Arc::new(AtomicUsize::new(0));
        let listener_count = count.clone();
        hub.subscribe(
            EventKind::Conflict,
            Arc::new(move |_| {
                listener_count.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();

        hub.emit(&SyncEvent::Loaded {
            key: "p".to_string(),
            record: json!({}),
        });
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
