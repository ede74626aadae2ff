//! In-process broker.
//!
//! Behaves like a single MQTT broker shared by everyone holding the handle:
//! publishes are recorded and looped back to matching subscribers, and
//! connectivity, subscription failures and SUBACK timing can be driven by hand.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Notify, watch};

use super::{Broker, BrokerError, InboundMessage, MessageSink, Subscription, topic_matches};
use crate::status::Connectivity;

/// A message accepted by [`MemoryBroker::publish`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Bytes,
}

impl PublishedMessage {
    pub fn payload_str(&self) -> &str {
        std::str::from_utf8(&self.payload).unwrap_or("<non-utf8>")
    }
}

struct Route {
    id: u64,
    filter: String,
    sink: MessageSink,
}

#[derive(Default)]
struct MemoryState {
    routes: Vec<Route>,
    next_route: u64,
    published: Vec<PublishedMessage>,
    subscribe_attempts: usize,
    publish_attempts: usize,
    unsubscribes: usize,
    fail_subscriptions: bool,
    fail_publishes: bool,
}

fn lock(state: &Mutex<MemoryState>) -> MutexGuard<'_, MemoryState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct MemoryBroker {
    state: Arc<Mutex<MemoryState>>,
    status: watch::Sender<Connectivity>,
    acks_paused: watch::Sender<bool>,
    published_notify: Arc<Notify>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// Starts online.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            status: watch::Sender::new(Connectivity::Online),
            acks_paused: watch::Sender::new(false),
            published_notify: Arc::new(Notify::new()),
        }
    }

    pub fn set_connectivity(&self, connectivity: Connectivity) {
        self.status.send_if_modified(|current| {
            if *current == connectivity {
                return false;
            }
            *current = connectivity;
            true
        });
    }

    /// Deliver a message as if it arrived from the network.
    ///
    /// Returns the number of subscriptions it was delivered to.
    pub fn inject(&self, topic: &str, payload: impl Into<Bytes>) -> usize {
        let payload = payload.into();
        let state = lock(&self.state);
        deliver(&state.routes, topic, &payload)
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        lock(&self.state).published.clone()
    }

    pub fn published_to(&self, topic: &str) -> Vec<PublishedMessage> {
        lock(&self.state)
            .published
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    /// Wait until at least `count` messages have been published in total.
    pub async fn wait_for_published(&self, count: usize) -> Vec<PublishedMessage> {
        loop {
            let notified = self.published_notify.notified();
            {
                let state = lock(&self.state);
                if state.published.len() >= count {
                    return state.published.clone();
                }
            }
            notified.await;
        }
    }

    pub fn active_subscriptions(&self) -> usize {
        lock(&self.state).routes.len()
    }

    pub fn subscribe_attempts(&self) -> usize {
        lock(&self.state).subscribe_attempts
    }

    /// Every publish call, including the ones that failed.
    pub fn publish_attempts(&self) -> usize {
        lock(&self.state).publish_attempts
    }

    pub fn unsubscribe_count(&self) -> usize {
        lock(&self.state).unsubscribes
    }

    pub fn fail_subscriptions(&self, fail: bool) {
        lock(&self.state).fail_subscriptions = fail;
    }

    pub fn fail_publishes(&self, fail: bool) {
        lock(&self.state).fail_publishes = fail;
    }

    /// Hold every SUBACK until [`resume_acks`](Self::resume_acks).
    pub fn pause_acks(&self) {
        self.acks_paused.send_replace(true);
    }

    pub fn resume_acks(&self) {
        self.acks_paused.send_replace(false);
    }
}

fn deliver(routes: &[Route], topic: &str, payload: &Bytes) -> usize {
    let mut delivered = 0;
    for route in routes.iter().filter(|r| topic_matches(&r.filter, topic)) {
        if route
            .sink
            .send(InboundMessage::new(topic, payload.clone()))
            .is_ok()
        {
            delivered += 1;
        } else {
            tracing::trace!(topic, route = route.id, "Subscriber sink closed");
        }
    }
    delivered
}

fn release(state: &Weak<Mutex<MemoryState>>, id: u64) {
    if let Some(state) = state.upgrade() {
        let mut state = lock(&state);
        state.routes.retain(|route| route.id != id);
        state.unsubscribes += 1;
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn subscribe(&self, topic: &str, sink: MessageSink) -> Result<Subscription, BrokerError> {
        lock(&self.state).subscribe_attempts += 1;

        let mut gate = self.acks_paused.subscribe();
        if gate.wait_for(|paused| !*paused).await.is_err() {
            return Err(BrokerError::Closed);
        }

        if !self.status.borrow().is_online() {
            return Err(BrokerError::Unreachable("broker is offline".to_string()));
        }

        let id = {
            let mut state = lock(&self.state);
            if state.fail_subscriptions {
                return Err(BrokerError::SubscribeRejected {
                    topic: topic.to_string(),
                });
            }
            let id = state.next_route;
            state.next_route += 1;
            state.routes.push(Route {
                id,
                filter: topic.to_string(),
                sink,
            });
            id
        };

        let state = Arc::downgrade(&self.state);
        Ok(Subscription::new(topic, move || release(&state, id)))
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BrokerError> {
        {
            let mut state = lock(&self.state);
            state.publish_attempts += 1;
            if state.fail_publishes {
                return Err(BrokerError::Publish {
                    topic: topic.to_string(),
                    reason: "publish failure injected".to_string(),
                });
            }
            if !self.status.borrow().is_online() {
                return Err(BrokerError::Unreachable("broker is offline".to_string()));
            }
            state.published.push(PublishedMessage {
                topic: topic.to_string(),
                payload: payload.clone(),
            });
            deliver(&state.routes, topic, &payload);
        }
        self.published_notify.notify_waiters();
        Ok(())
    }

    fn connectivity(&self) -> watch::Receiver<Connectivity> {
        self.status.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn delivers_injected_messages_in_order() {
        let broker = MemoryBroker::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = broker.subscribe("RAMSES/GATEWAY/+/rx", tx).await.unwrap();

        assert_eq!(broker.inject("RAMSES/GATEWAY/18:123456/rx", "one"), 1);
        assert_eq!(broker.inject("RAMSES/GATEWAY/18:123456/rx", "two"), 1);
        assert_eq!(broker.inject("RAMSES/GATEWAY/18:123456/tx", "other"), 0);

        assert_eq!(rx.recv().await.unwrap().payload, Bytes::from("one"));
        assert_eq!(rx.recv().await.unwrap().payload, Bytes::from("two"));
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let broker = MemoryBroker::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut sub = broker.subscribe("a/b", tx).await.unwrap();
        assert_eq!(broker.active_subscriptions(), 1);

        sub.unsubscribe();
        sub.unsubscribe();

        assert_eq!(broker.active_subscriptions(), 0);
        assert_eq!(broker.unsubscribe_count(), 1);
        assert_eq!(broker.inject("a/b", "x"), 0);
    }

    #[tokio::test]
    async fn publish_records_and_loops_back() {
        let broker = MemoryBroker::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = broker.subscribe("a/#", tx).await.unwrap();

        broker.publish("a/b", Bytes::from("hello")).await.unwrap();

        assert_eq!(broker.published_to("a/b")[0].payload_str(), "hello");
        assert_eq!(rx.recv().await.unwrap().topic, "a/b");
    }

    #[tokio::test]
    async fn offline_broker_refuses_traffic() {
        let broker = MemoryBroker::new();
        broker.set_connectivity(Connectivity::Offline);

        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(matches!(
            broker.subscribe("a/b", tx).await,
            Err(BrokerError::Unreachable(_))
        ));
        assert!(broker.publish("a/b", Bytes::new()).await.is_err());
        assert!(broker.published().is_empty());
        assert_eq!(broker.publish_attempts(), 1);
    }

    #[tokio::test]
    async fn injected_publish_failure() {
        let broker = MemoryBroker::new();
        broker.fail_publishes(true);
        assert!(matches!(
            broker.publish("a/b", Bytes::from("lost")).await,
            Err(BrokerError::Publish { .. })
        ));

        broker.fail_publishes(false);
        broker.publish("a/b", Bytes::from("kept")).await.unwrap();

        assert_eq!(broker.publish_attempts(), 2);
        assert_eq!(broker.published_to("a/b").len(), 1);
        assert_eq!(broker.published_to("a/b")[0].payload_str(), "kept");
    }

    #[tokio::test]
    async fn injected_subscription_failure() {
        let broker = MemoryBroker::new();
        broker.fail_subscriptions(true);
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(matches!(
            broker.subscribe("a/b", tx).await,
            Err(BrokerError::SubscribeRejected { .. })
        ));
        assert_eq!(broker.subscribe_attempts(), 1);
    }

    #[tokio::test]
    async fn paused_acks_hold_subscribe() {
        let broker = Arc::new(MemoryBroker::new());
        broker.pause_acks();

        let (tx, _rx) = mpsc::unbounded_channel();
        let pending = tokio::spawn({
            let broker = Arc::clone(&broker);
            async move { broker.subscribe("a/b", tx).await.map(|_sub| ()) }
        });

        while broker.subscribe_attempts() == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(broker.active_subscriptions(), 0);
        assert!(!pending.is_finished());

        broker.resume_acks();
        pending.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn connectivity_changes_are_observable() {
        let broker = MemoryBroker::new();
        let mut status = broker.connectivity();
        assert_eq!(*status.borrow_and_update(), Connectivity::Online);

        broker.set_connectivity(Connectivity::Online);
        assert!(!status.has_changed().unwrap());

        broker.set_connectivity(Connectivity::Offline);
        status.changed().await.unwrap();
        assert_eq!(*status.borrow(), Connectivity::Offline);
    }
}
