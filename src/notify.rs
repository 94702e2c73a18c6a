use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use dashmap::DashMap;
use futures::Stream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use ulid::Ulid;

use crate::model::SlotEvent;
use crate::observability::{EVENTS_DROPPED_TOTAL, EVENTS_PUBLISHED_TOTAL, SUBSCRIBERS_ACTIVE};

pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 256;

/// Fan-out of slot events to every connected subscriber.
///
/// Each subscriber owns a bounded queue. `publish` never waits: when a
/// subscriber's queue is full the event is dropped for that subscriber
/// only, and subscribers whose receiving end is gone are pruned.
pub struct Broadcaster {
    subscribers: DashMap<Ulid, mpsc::Sender<SlotEvent>>,
    buffer: usize,
}

impl Broadcaster {
    pub fn new(buffer: usize) -> Self {
        Self {
            subscribers: DashMap::new(),
            buffer: buffer.max(1),
        }
    }

    /// Register a new subscriber. Dropping the returned subscription unsubscribes.
    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        let id = Ulid::new();
        let (tx, rx) = mpsc::channel(self.buffer);
        self.subscribers.insert(id, tx);
        metrics::gauge!(SUBSCRIBERS_ACTIVE).set(self.subscribers.len() as f64);
        tracing::debug!("subscriber {id} connected");
        Subscription {
            id,
            rx,
            hub: Arc::downgrade(self),
        }
    }

    pub fn unsubscribe(&self, id: Ulid) {
        if self.subscribers.remove(&id).is_some() {
            metrics::gauge!(SUBSCRIBERS_ACTIVE).set(self.subscribers.len() as f64);
            tracing::debug!("subscriber {id} disconnected");
        }
    }

    /// Deliver `event` to a snapshot of the current subscribers. Returns how
    /// many subscribers accepted it. No-op if nobody is listening.
    pub fn publish(&self, event: SlotEvent) -> usize {
        let targets: Vec<(Ulid, mpsc::Sender<SlotEvent>)> = self
            .subscribers
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        let mut delivered = 0;
        for (id, tx) in targets {
            match tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(
                        "subscriber {id} is lagging, dropped {} event",
                        event.event_type()
                    );
                    metrics::counter!(EVENTS_DROPPED_TOTAL).increment(1);
                }
                Err(TrySendError::Closed(_)) => self.unsubscribe(id),
            }
        }
        metrics::counter!(EVENTS_PUBLISHED_TOTAL, "type" => event.event_type())
            .increment(1);
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_BUFFER)
    }
}

/// Receiving end of one subscriber.
pub struct Subscription {
    id: Ulid,
    rx: mpsc::Receiver<SlotEvent>,
    hub: Weak<Broadcaster>,
}

impl Subscription {
    pub fn id(&self) -> Ulid {
        self.id
    }

    pub async fn recv(&mut self) -> Option<SlotEvent> {
        self.rx.recv().await
    }
}

impl Stream for Subscription {
    type Item = SlotEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<SlotEvent>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.unsubscribe(self.id);
        }
    }
}
