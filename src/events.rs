//! Session event surface
//!
//! Fire-and-forget notifications to embedders. Delivery happens on the
//! pump that produced the event, so subscribers must not block.

use crate::frames::{Frame, SettingsFrame};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Notifications a session delivers to its subscribers
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A SETTINGS frame was handed to the write pump
    SettingsSent(SettingsFrame),
    /// A frame was received and dispatched
    FrameReceived {
        /// Stream the frame was addressed to (0 for connection frames)
        stream_id: u32,
        /// The decoded frame
        frame: Frame,
    },
    /// A request was handed to the write pump
    RequestSent {
        /// Stream carrying the request
        stream_id: u32,
    },
    /// The session was disposed; fired exactly once
    SessionDisposed,
}

/// Token returned by [`EventBus::subscribe`], used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

type Subscriber = Box<dyn Fn(&SessionEvent) + Send + Sync>;

/// Subscriber list behind a lock
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<(u64, Subscriber)>>,
    next_id: AtomicU64,
}

impl EventBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber; the callback runs on the delivering pump
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().push((id, Box::new(callback)));
        SubscriptionId(id)
    }

    /// Remove a subscriber
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers.lock().retain(|(sid, _)| *sid != id.0);
    }

    /// Deliver an event to every subscriber
    pub fn emit(&self, event: &SessionEvent) {
        let subscribers = self.subscribers.lock();
        for (_, callback) in subscribers.iter() {
            callback(event);
        }
    }

    /// Drop every subscription
    pub fn clear(&self) {
        self.subscribers.lock().clear();
    }

    /// Number of active subscriptions
    pub fn len(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Whether there are no subscribers
    pub fn is_empty(&self) -> bool {
        self.subscribers.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn test_subscribe_and_emit() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));

        let seen = count.clone();
        bus.subscribe(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(&SessionEvent::SessionDisposed);
        bus.emit(&SessionEvent::RequestSent { stream_id: 1 });
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));

        let seen = count.clone();
        let id = bus.subscribe(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(&SessionEvent::SessionDisposed);
        bus.unsubscribe(id);
        bus.emit(&SessionEvent::SessionDisposed);

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_clear() {
        let bus = EventBus::new();
        bus.subscribe(|_| {});
        bus.subscribe(|_| {});
        assert_eq!(bus.len(), 2);

        bus.clear();
        assert!(bus.is_empty());
    }
}
