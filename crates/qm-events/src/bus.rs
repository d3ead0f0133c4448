use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tracing::trace;

use crate::model::{Event, EventKind};

/// Default per-subscriber buffer capacity.
pub const DEFAULT_BUFFER: usize = 100;

// ---------------------------------------------------------------------------
// Subscriber slot
// ---------------------------------------------------------------------------

struct SubscriberSlot {
    id: u64,
    tx: flume::Sender<Event>,
    /// Receiver clone kept bus-side so a full buffer can be drained from the
    /// oldest end without stalling the publisher.
    rx: flume::Receiver<Event>,
    dropped: Arc<AtomicU64>,
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// A broadcast-style event bus built on bounded flume channels.
///
/// Each [`subscribe`](EventBus::subscribe) call creates an independent
/// bounded buffer (default 100 events). Publishing never blocks: when a
/// subscriber's buffer is full, the oldest buffered event for that
/// subscriber is discarded and its `dropped` counter incremented. Ordering
/// per subscriber is publication order of the events it actually observes;
/// there is no cross-subscriber guarantee.
///
/// The bus is thread-safe and cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    project_id: String,
    capacity: usize,
    inner: Arc<RwLock<Vec<SubscriberSlot>>>,
    next_id: Arc<AtomicU64>,
}

impl EventBus {
    /// Create an empty bus with the default per-subscriber buffer.
    pub fn new(project_id: impl Into<String>) -> Self {
        Self::with_capacity(project_id, DEFAULT_BUFFER)
    }

    pub fn with_capacity(project_id: impl Into<String>, capacity: usize) -> Self {
        Self {
            project_id: project_id.into(),
            capacity: capacity.max(1),
            inner: Arc::new(RwLock::new(Vec::new())),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Register a new subscriber and return its receiving end.
    ///
    /// Dropping the returned [`Subscription`] unsubscribes; calling
    /// [`Subscription::unsubscribe`] early is equivalent and idempotent.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = flume::bounded(self.capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let dropped = Arc::new(AtomicU64::new(0));
        let slot = SubscriberSlot {
            id,
            tx,
            rx: rx.clone(),
            dropped: dropped.clone(),
        };
        self.inner.write().expect("event bus lock poisoned").push(slot);
        Subscription {
            id,
            receiver: rx,
            dropped,
            bus: self.inner.clone(),
            active: true,
        }
    }

    /// Publish an event to all current subscribers without ever blocking.
    pub fn publish(&self, event: Event) {
        let mut disconnected = false;
        {
            let slots = self.inner.read().expect("event bus lock poisoned");
            for slot in slots.iter() {
                match slot.tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(flume::TrySendError::Full(ev)) => {
                        // Drop the oldest buffered event for this subscriber
                        // and retry once.
                        if slot.rx.try_recv().is_ok() {
                            slot.dropped.fetch_add(1, Ordering::Relaxed);
                        }
                        if slot.tx.try_send(ev).is_err() {
                            slot.dropped.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    Err(flume::TrySendError::Disconnected(_)) => {
                        disconnected = true;
                    }
                }
            }
        }
        if disconnected {
            self.prune();
        }
        trace!(kind = %event.kind, "event published");
    }

    /// Convenience publisher for out-of-band messages: builds the envelope
    /// from this bus's project id.
    pub fn broadcast_typed(&self, kind: EventKind, payload: serde_json::Value) {
        self.publish(Event::new(self.project_id.clone(), kind, payload));
    }

    /// Number of currently registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.read().expect("event bus lock poisoned").len()
    }

    fn prune(&self) {
        self.inner
            .write()
            .expect("event bus lock poisoned")
            .retain(|slot| !slot.tx.is_disconnected());
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("project_id", &self.project_id)
            .field("capacity", &self.capacity)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// One subscriber's end of the bus: a bounded event receiver plus the
/// counter of events dropped on its behalf.
pub struct Subscription {
    id: u64,
    receiver: flume::Receiver<Event>,
    dropped: Arc<AtomicU64>,
    bus: Arc<RwLock<Vec<SubscriberSlot>>>,
    active: bool,
}

impl Subscription {
    pub fn receiver(&self) -> &flume::Receiver<Event> {
        &self.receiver
    }

    /// Receive the next event, waiting until one is published.
    pub async fn recv(&self) -> Option<Event> {
        self.receiver.recv_async().await.ok()
    }

    /// Non-blocking receive.
    pub fn try_recv(&self) -> Option<Event> {
        self.receiver.try_recv().ok()
    }

    /// Events discarded for this subscriber because its buffer was full.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Detach from the bus. Idempotent; dropping the subscription does the
    /// same thing.
    pub fn unsubscribe(&mut self) {
        if self.active {
            self.active = false;
            let id = self.id;
            self.bus
                .write()
                .expect("event bus lock poisoned")
                .retain(|slot| slot.id != id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ev(bus: &EventBus, kind: EventKind, n: u64) -> Event {
        Event::new(bus.project_id().to_string(), kind, json!({ "n": n }))
    }

    #[test]
    fn delivers_in_publication_order() {
        let bus = EventBus::new("quorum");
        let sub = bus.subscribe();
        for n in 0..5 {
            bus.publish(ev(&bus, EventKind::TaskProgress, n));
        }
        let seen: Vec<u64> = std::iter::from_fn(|| sub.try_recv())
            .map(|e| e.payload["n"].as_u64().unwrap())
            .collect();
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        assert_eq!(sub.dropped_count(), 0);
    }

    #[test]
    fn full_buffer_drops_oldest_not_publisher() {
        let bus = EventBus::with_capacity("quorum", 2);
        let sub = bus.subscribe();
        for n in 0..5 {
            bus.publish(ev(&bus, EventKind::TaskProgress, n));
        }
        // Oldest three were dropped; the two newest survive in order.
        let seen: Vec<u64> = std::iter::from_fn(|| sub.try_recv())
            .map(|e| e.payload["n"].as_u64().unwrap())
            .collect();
        assert_eq!(seen, vec![3, 4]);
        assert_eq!(sub.dropped_count(), 3);
    }

    #[test]
    fn slow_subscriber_does_not_affect_others() {
        let bus = EventBus::with_capacity("quorum", 2);
        let slow = bus.subscribe();
        let fast = bus.subscribe();
        for n in 0..4 {
            bus.publish(ev(&bus, EventKind::TaskProgress, n));
            // The fast subscriber drains as it goes.
            assert_eq!(fast.try_recv().unwrap().payload["n"], n);
        }
        assert_eq!(fast.dropped_count(), 0);
        assert!(slow.dropped_count() > 0);
    }

    #[test]
    fn unsubscribe_is_idempotent_and_reclaims_slot() {
        let bus = EventBus::new("quorum");
        let mut sub = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        sub.unsubscribe();
        sub.unsubscribe();
        assert_eq!(bus.subscriber_count(), 0);

        let sub2 = bus.subscribe();
        drop(sub2);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn broadcast_typed_fills_envelope() {
        let bus = EventBus::new("quorum");
        let sub = bus.subscribe();
        bus.broadcast_typed(EventKind::KanbanEngineStateChanged, json!({"enabled": true}));
        let got = sub.try_recv().unwrap();
        assert_eq!(got.kind, EventKind::KanbanEngineStateChanged);
        assert_eq!(got.project_id, "quorum");
    }

    #[tokio::test]
    async fn async_recv_works() {
        let bus = EventBus::new("quorum");
        let sub = bus.subscribe();
        let bus2 = bus.clone();
        tokio::spawn(async move {
            bus2.publish(Event::new("quorum", EventKind::WorkflowCreated, json!({})));
        });
        let got = sub.recv().await.unwrap();
        assert_eq!(got.kind, EventKind::WorkflowCreated);
    }
}
