//! Observer registry for inbound message routing.
//!
//! Maps a message kind to an ordered list of named handlers. Handlers are
//! identified by a caller-chosen name, which makes registration idempotent
//! (same name replaces, keeping its position) and unregistration of an
//! unknown pair a no-op. Handlers run synchronously in registration order;
//! a panicking handler is isolated and does not block delivery to the rest.
//! Handlers must not block for unbounded time: long work belongs in another
//! task, fed through a channel.

use gridrun_proto::{Envelope, MessageKind};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};
use tracing::{error, trace};

/// Inbound message handler. Receives a reference to the envelope; decoding
/// is the handler's business.
pub type ObserverFn = Arc<dyn Fn(&Envelope) + Send + Sync>;

/// Routing table from message kind to ordered named handlers.
#[derive(Default)]
pub struct ObserverRegistry {
    table: RwLock<HashMap<MessageKind, Vec<(String, ObserverFn)>>>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under `name` for the given kind. Re-registering an
    /// existing name replaces the handler in place without duplicating
    /// delivery.
    pub fn register(&self, kind: MessageKind, name: impl Into<String>, handler: ObserverFn) {
        let name = name.into();
        eprintln!("DIAG register: kind={kind:?} name={name}");
        let mut table = self.table.write().unwrap();
        let handlers = table.entry(kind).or_default();
        match handlers.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = handler,
            None => handlers.push((name, handler)),
        }
    }

    /// Remove the handler registered under `name` for `kind`. Unknown pairs
    /// are a no-op.
    pub fn unregister(&self, kind: MessageKind, name: &str) {
        let mut table = self.table.write().unwrap();
        if let Some(handlers) = table.get_mut(&kind) {
            handlers.retain(|(n, _)| n != name);
        }
    }

    /// Deliver an envelope to every handler registered for its kind, in
    /// registration order.
    pub fn dispatch(&self, envelope: &Envelope) {
        let handlers: Vec<(String, ObserverFn)> = {
            let table = self.table.read().unwrap();
            eprintln!("DIAG dispatch: kind={:?} registered_kinds={:?}", envelope.kind, table.keys().collect::<Vec<_>>());
            match table.get(&envelope.kind) {
                Some(handlers) => handlers.clone(),
                None => {
                    trace!(kind = %envelope.kind, "No observers for inbound message");
                    return;
                }
            }
        };

        for (name, handler) in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(envelope))).is_err() {
                error!(kind = %envelope.kind, observer = %name, "Observer panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridrun_core::Priority;
    use gridrun_proto::JobAccept;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn envelope() -> Envelope {
        Envelope::encode(
            Priority::HIGH,
            &JobAccept {
                job_id: "j-1".into(),
            },
        )
        .unwrap()
    }

    #[test]
    fn test_dispatch_in_registration_order() {
        let registry = ObserverRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for name in ["a", "b", "c"] {
            let order = order.clone();
            registry.register(
                MessageKind::JobAccept,
                name,
                Arc::new(move |_| order.lock().unwrap().push(name)),
            );
        }

        registry.dispatch(&envelope());
        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_register_same_name_does_not_duplicate() {
        let registry = ObserverRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let count = count.clone();
            registry.register(
                MessageKind::JobAccept,
                "dup",
                Arc::new(move |_| {
                    count.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }

        registry.dispatch(&envelope());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unregister_stops_delivery() {
        let registry = ObserverRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        registry.register(
            MessageKind::JobAccept,
            "obs",
            Arc::new(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );

        registry.dispatch(&envelope());
        registry.unregister(MessageKind::JobAccept, "obs");
        registry.dispatch(&envelope());
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // Unknown pairs are a no-op, not an error.
        registry.unregister(MessageKind::JobAccept, "never-registered");
        registry.unregister(MessageKind::Heartbeat, "obs");
    }

    #[test]
    fn test_panicking_observer_is_isolated() {
        let registry = ObserverRegistry::new();
        registry.register(
            MessageKind::JobAccept,
            "bad",
            Arc::new(|_| panic!("observer failure")),
        );
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        registry.register(
            MessageKind::JobAccept,
            "good",
            Arc::new(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );

        registry.dispatch(&envelope());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
