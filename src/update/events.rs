use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressEvent {
    pub bytes_per_second: f64,
    /// Clamped to `[0, 1]`.
    pub fraction: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEvent {
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Progress,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpdateEvent {
    Progress(ProgressEvent),
    Error(ErrorEvent),
}

impl UpdateEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            UpdateEvent::Progress(_) => EventKind::Progress,
            UpdateEvent::Error(_) => EventKind::Error,
        }
    }
}

pub type Handler = Arc<dyn Fn(&UpdateEvent) + Send + Sync>;

/// Synchronous publish/subscribe keyed by [`EventKind`].
///
/// `publish` runs every handler registered for the event's kind on the
/// caller's stack, in registration order. Handlers registered while a
/// publish is in flight only see later events.
#[derive(Default)]
pub struct EventBus {
    handlers: RwLock<HashMap<EventKind, Vec<Handler>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(&UpdateEvent) + Send + Sync + 'static,
    {
        self.handlers.write().entry(kind).or_default().push(Arc::new(handler));
    }

    pub fn publish(&self, event: &UpdateEvent) {
        let handlers = match self.handlers.read().get(&event.kind()) {
            Some(list) => list.clone(),
            None => return,
        };
        for h in handlers {
            h(event);
        }
    }

    /// Mirror every event into the tracing log.
    pub fn log_to_tracing(&self) {
        self.subscribe(EventKind::Progress, |ev| {
            if let UpdateEvent::Progress(p) = ev {
                tracing::debug!(progress = p.fraction * 100.0, bps = p.bytes_per_second, "patch tool progress");
            }
        });
        self.subscribe(EventKind::Error, |ev| {
            if let UpdateEvent::Error(e) = ev {
                tracing::error!(message = %e.message, "patch tool reported an error");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn handlers_run_in_registration_order_for_their_kind() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second"] {
            let seen = seen.clone();
            bus.subscribe(EventKind::Progress, move |_| seen.lock().push(tag));
        }
        let errors = seen.clone();
        bus.subscribe(EventKind::Error, move |_| errors.lock().push("error"));

        bus.publish(&UpdateEvent::Progress(ProgressEvent { bytes_per_second: 1.0, fraction: 0.5 }));
        assert_eq!(*seen.lock(), vec!["first", "second"]);

        bus.publish(&UpdateEvent::Error(ErrorEvent { message: "x".into() }));
        assert_eq!(*seen.lock(), vec!["first", "second", "error"]);
    }

    #[test]
    fn publish_without_subscribers_is_a_no_op() {
        let bus = EventBus::new();
        bus.publish(&UpdateEvent::Error(ErrorEvent { message: "nobody listens".into() }));
    }

    #[test]
    fn handler_may_subscribe_during_publish() {
        let bus = Arc::new(EventBus::new());
        let count = Arc::new(Mutex::new(0));

        let inner_bus = bus.clone();
        let inner_count = count.clone();
        bus.subscribe(EventKind::Error, move |_| {
            let c = inner_count.clone();
            inner_bus.subscribe(EventKind::Progress, move |_| *c.lock() += 1);
        });

        bus.publish(&UpdateEvent::Error(ErrorEvent { message: "late".into() }));
        bus.publish(&UpdateEvent::Progress(ProgressEvent { bytes_per_second: 0.0, fraction: 0.0 }));
        assert_eq!(*count.lock(), 1);
    }
}
