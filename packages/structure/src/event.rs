//! Event targets: a single handler slot plus a listener list.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::value::Value;

/// The event delivered to message handlers.
#[derive(Debug, Clone)]
pub struct MessageEvent {
    pub data: Value,
}

/// Identifies a registered listener so it can be removed later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// A shareable event callback.
pub type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Handlers<E> {
    slot: Option<Listener<E>>,
    listeners: Vec<(ListenerId, Listener<E>)>,
    next_id: u64,
}

/// Dispatches events of type `E` to a handler slot and a listener list.
///
/// The slot (`onmessage`, `onexit`) runs first, then each listener in
/// registration order. Handlers are snapshotted before dispatch, so a
/// handler may register or remove handlers or trigger further events.
pub struct EventTarget<E> {
    handlers: Mutex<Handlers<E>>,
}

impl<E> EventTarget<E> {
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(Handlers {
                slot: None,
                listeners: Vec::new(),
                next_id: 0,
            }),
        }
    }

    /// Install the single-slot handler, replacing any previous one.
    pub fn set_handler(&self, handler: impl Fn(&E) + Send + Sync + 'static) {
        self.handlers.lock().slot = Some(Arc::new(handler));
    }

    pub fn clear_handler(&self) {
        self.handlers.lock().slot = None;
    }

    pub fn add_listener(&self, listener: impl Fn(&E) + Send + Sync + 'static) -> ListenerId {
        let mut handlers = self.handlers.lock();
        let id = ListenerId(handlers.next_id);
        handlers.next_id += 1;
        handlers.listeners.push((id, Arc::new(listener)));
        id
    }

    /// Returns whether a listener was removed.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut handlers = self.handlers.lock();
        let before = handlers.listeners.len();
        handlers.listeners.retain(|(existing, _)| *existing != id);
        handlers.listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.handlers.lock().listeners.len()
    }

    pub fn dispatch(&self, event: &E) {
        let (slot, listeners) = {
            let handlers = self.handlers.lock();
            let listeners: Vec<Listener<E>> =
                handlers.listeners.iter().map(|(_, l)| l.clone()).collect();
            (handlers.slot.clone(), listeners)
        };
        if let Some(slot) = slot {
            slot(event);
        }
        for listener in listeners {
            listener(event);
        }
    }
}

impl<E> Default for EventTarget<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for EventTarget<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handlers = self.handlers.lock();
        f.debug_struct("EventTarget")
            .field("has_handler", &handlers.slot.is_some())
            .field("listeners", &handlers.listeners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn slot_runs_before_listeners() {
        let target = EventTarget::<u32>::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = order.clone();
        target.add_listener(move |e| o.lock().push(format!("listener {}", e)));
        let o = order.clone();
        target.set_handler(move |e| o.lock().push(format!("slot {}", e)));

        target.dispatch(&1);
        assert_eq!(*order.lock(), vec!["slot 1", "listener 1"]);
    }

    #[test]
    fn removed_listener_is_not_called() {
        let target = EventTarget::<()>::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        let id = target.add_listener(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        target.dispatch(&());
        assert!(target.remove_listener(id));
        assert!(!target.remove_listener(id));
        target.dispatch(&());

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(target.listener_count(), 0);
    }

    #[test]
    fn handler_may_reenter_target() {
        let target = Arc::new(EventTarget::<u8>::new());
        let inner = target.clone();
        target.set_handler(move |_| {
            inner.add_listener(|_| {});
        });
        target.dispatch(&0);
        assert_eq!(target.listener_count(), 1);
    }
}
