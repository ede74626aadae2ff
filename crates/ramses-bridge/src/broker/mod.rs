//! Pub/sub broker abstraction consumed by the bridge.
//!
//! Implementations:
//! - **MqttBroker**: rumqttc client with its own event-loop task
//! - **MemoryBroker**: in-process broker for embedding and tests

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, watch};

use crate::status::Connectivity;

mod memory;
mod mqtt;

pub use memory::{MemoryBroker, PublishedMessage};
pub use mqtt::MqttBroker;

/// A message delivered by the broker on a subscribed topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Where a subscription delivers its messages, in broker order.
pub type MessageSink = mpsc::UnboundedSender<InboundMessage>;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker unreachable: {0}")]
    Unreachable(String),
    #[error("broker rejected subscription to {topic}")]
    SubscribeRejected { topic: String },
    #[error("subscription to {topic} not acknowledged within {timeout_secs}s")]
    SubscribeTimeout { topic: String, timeout_secs: u64 },
    #[error("publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },
    #[error("broker client closed")]
    Closed,
}

/// Unsubscribe handle returned by [`Broker::subscribe`].
///
/// Releasing is idempotent; a handle that is dropped without being released
/// releases itself.
pub struct Subscription {
    topic: String,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(topic: impl Into<String>, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            topic: topic.into(),
            release: Some(Box::new(release)),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn is_active(&self) -> bool {
        self.release.is_some()
    }

    /// Returns true if this call released the subscription.
    pub fn unsubscribe(&mut self) -> bool {
        match self.release.take() {
            Some(release) => {
                tracing::debug!(topic = %self.topic, "Releasing subscription");
                release();
                true
            }
            None => false,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("active", &self.is_active())
            .finish()
    }
}

/// The broker operations the bridge depends on.
///
/// Injected into the bridge so it can run against a real MQTT client or an
/// in-process double.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Subscribe `topic` and deliver its messages to `sink`.
    ///
    /// Resolves once the broker has acknowledged the subscription.
    async fn subscribe(&self, topic: &str, sink: MessageSink) -> Result<Subscription, BrokerError>;

    /// Publish at most once. Resolves when the client has accepted the message,
    /// not when the broker has.
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BrokerError>;

    /// Connectivity updates; the current value is readable immediately.
    fn connectivity(&self) -> watch::Receiver<Connectivity>;
}

/// MQTT topic filter matching with `+` (one level) and `#` (remaining levels).
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
