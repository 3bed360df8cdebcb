//! Observer registry used for every notification the link raises.
//!
//! Listeners come in two flavours: callbacks, invoked synchronously on the
//! emitting thread, and channels, which queue events for a consumer thread.
//! A callback is removed with [`EventBus::unsubscribe`]; a channel is removed the
//! next time an event is emitted after its receiver was dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crossbeam_channel::{Receiver, Sender};

/// Handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Registry<T> {
    callbacks: Vec<(ListenerId, Callback<T>)>,
    channels: Vec<Sender<T>>,
}

/// Cloneable multi-listener event bus. Clones share the same listeners.
pub struct EventBus<T> {
    registry: Arc<Mutex<Registry<T>>>,
    next_id: Arc<AtomicU64>,
}

impl<T> Clone for EventBus<T> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            next_id: Arc::clone(&self.next_id),
        }
    }
}

impl<T> Default for EventBus<T> {
    fn default() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                callbacks: Vec::new(),
                channels: Vec::new(),
            })),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }
}

impl<T: Clone + Send + 'static> EventBus<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Registry<T>> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a callback run on whichever thread emits.
    pub fn subscribe<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().callbacks.push((id, Arc::new(callback)));
        id
    }

    /// Remove a callback. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut registry = self.lock();
        let before = registry.callbacks.len();
        registry.callbacks.retain(|(cid, _)| *cid != id);
        registry.callbacks.len() != before
    }

    /// Open an unbounded queue that receives every subsequent event.
    pub fn channel(&self) -> Receiver<T> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.lock().channels.push(tx);
        rx
    }

    pub fn listener_count(&self) -> usize {
        let registry = self.lock();
        registry.callbacks.len() + registry.channels.len()
    }

    /// Deliver `event` to every listener.
    ///
    /// Callbacks run after the registry lock is released, so a callback may
    /// subscribe or unsubscribe without deadlocking.
    pub fn emit(&self, event: &T) {
        let callbacks: Vec<Callback<T>> = {
            let mut registry = self.lock();
            registry
                .channels
                .retain(|tx| tx.send(event.clone()).is_ok());
            registry.callbacks.iter().map(|(_, cb)| Arc::clone(cb)).collect()
        };
        for callback in callbacks {
            callback(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn callbacks_receive_events_until_unsubscribed() {
        let bus: EventBus<u32> = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let id = bus.subscribe(move |v| {
            counter.fetch_add(*v as usize, Ordering::SeqCst);
        });

        bus.emit(&2);
        bus.emit(&3);
        assert_eq!(seen.load(Ordering::SeqCst), 5);

        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.emit(&10);
        assert_eq!(seen.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn channels_queue_events_and_close_on_drop() {
        let bus: EventBus<&'static str> = EventBus::new();
        let rx = bus.channel();
        bus.emit(&"a");
        bus.emit(&"b");
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec!["a", "b"]);

        drop(rx);
        bus.emit(&"c");
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn clones_share_listeners() {
        let bus: EventBus<u8> = EventBus::new();
        let rx = bus.channel();
        bus.clone().emit(&7);
        assert_eq!(rx.try_recv(), Ok(7));
    }

    #[test]
    fn callback_may_unsubscribe_itself() {
        let bus: EventBus<()> = EventBus::new();
        let slot: Arc<Mutex<Option<ListenerId>>> = Arc::new(Mutex::new(None));
        let inner_bus = bus.clone();
        let inner_slot = Arc::clone(&slot);
        let id = bus.subscribe(move |_| {
            if let Some(id) = inner_slot.lock().unwrap().take() {
                inner_bus.unsubscribe(id);
            }
        });
        *slot.lock().unwrap() = Some(id);
        bus.emit(&());
        assert_eq!(bus.listener_count(), 0);
    }
}
