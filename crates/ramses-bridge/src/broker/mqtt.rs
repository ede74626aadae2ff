//! rumqttc-backed broker client.
//!
//! Flow:
//! 1. `connect` builds the client and spawns the event-loop task
//! 2. The event loop tracks CONNACK/disconnects as connectivity, routes incoming
//!    PUBLISH packets to subscriber sinks, and resolves SUBACKs by packet id
//! 3. On connection errors it backs off exponentially and polls again, which
//!    makes rumqttc reconnect
//! 4. `shutdown` stops the loop and disconnects

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    SubscribeReasonCode,
};
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;

use super::{Broker, BrokerError, InboundMessage, MessageSink, Subscription, topic_matches};
use crate::config::MqttConfig;
use crate::status::Connectivity;

struct Route {
    id: u64,
    filter: String,
    sink: MessageSink,
}

struct PendingAck {
    id: u64,
    topic: String,
    /// Assigned when the event loop sends the SUBSCRIBE packet.
    pkid: Option<u16>,
    /// `None` once the caller has given up waiting; the entry stays until its
    /// SUBACK arrives so the packet id is not handed to another request.
    ack: Option<oneshot::Sender<Result<(), BrokerError>>>,
}

impl PendingAck {
    fn new(id: u64, topic: &str, ack: oneshot::Sender<Result<(), BrokerError>>) -> Self {
        Self {
            id,
            topic: topic.to_string(),
            pkid: None,
            ack: Some(ack),
        }
    }
}

#[derive(Default)]
struct Shared {
    routes: Mutex<Vec<Route>>,
    /// SUBSCRIBE requests awaiting their SUBACK, in request order.
    pending_acks: Mutex<VecDeque<PendingAck>>,
    next_id: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn route(&self, topic: &str, payload: Bytes) {
        let routes = lock(&self.routes);
        let mut matched = false;
        for route in routes.iter().filter(|r| topic_matches(&r.filter, topic)) {
            matched = true;
            if route
                .sink
                .send(InboundMessage::new(topic, payload.clone()))
                .is_err()
            {
                tracing::trace!(topic, route = route.id, "Subscriber sink closed");
            }
        }
        if !matched {
            tracing::trace!(topic, "No subscriber for incoming publish");
        }
    }

    /// The event loop sends SUBSCRIBE packets in request order, so the packet
    /// id goes to the oldest request still without one.
    fn record_outgoing(&self, pkid: u16) {
        let mut pending = lock(&self.pending_acks);
        if pending.iter().any(|p| p.pkid == Some(pkid)) {
            tracing::debug!(pkid, "SUBSCRIBE resent");
            return;
        }
        match pending.iter_mut().find(|p| p.pkid.is_none()) {
            Some(entry) => entry.pkid = Some(pkid),
            None => tracing::debug!(pkid, "SUBSCRIBE sent with no pending subscription"),
        }
    }

    fn resolve_ack(&self, pkid: u16, return_codes: &[SubscribeReasonCode]) {
        let pending = {
            let mut pending = lock(&self.pending_acks);
            let Some(index) = pending.iter().position(|p| p.pkid == Some(pkid)) else {
                tracing::debug!(pkid, "SUBACK with no pending subscription");
                return;
            };
            pending.remove(index)
        };
        let Some(pending) = pending else {
            return;
        };
        let Some(ack) = pending.ack else {
            tracing::debug!(pkid, topic = %pending.topic, "Late SUBACK for an abandoned subscription");
            return;
        };
        let result = if return_codes
            .iter()
            .all(|code| matches!(code, SubscribeReasonCode::Success(_)))
        {
            Ok(())
        } else {
            Err(BrokerError::SubscribeRejected {
                topic: pending.topic,
            })
        };
        let _ = ack.send(result);
    }

    fn fail_pending(&self, reason: &str) {
        let pending: Vec<PendingAck> = lock(&self.pending_acks).drain(..).collect();
        for ack in pending.into_iter().filter_map(|p| p.ack) {
            let _ = ack.send(Err(BrokerError::Unreachable(reason.to_string())));
        }
    }

    /// Drop a request the caller stopped waiting for. One that reached the
    /// client queue is kept, without its waiter, until its SUBACK shows up.
    fn forget_pending(&self, id: u64, queued: bool) {
        let mut pending = lock(&self.pending_acks);
        if queued {
            if let Some(entry) = pending.iter_mut().find(|p| p.id == id) {
                entry.ack = None;
            }
        } else {
            pending.retain(|p| p.id != id);
        }
    }

    fn remove_route(&self, id: u64) -> Option<String> {
        let mut routes = lock(&self.routes);
        let index = routes.iter().position(|r| r.id == id)?;
        let route = routes.remove(index);
        let still_wanted = routes.iter().any(|r| r.filter == route.filter);
        (!still_wanted).then_some(route.filter)
    }
}

fn set_connectivity(status: &watch::Sender<Connectivity>, connectivity: Connectivity) -> bool {
    status.send_if_modified(|current| {
        if *current == connectivity {
            return false;
        }
        *current = connectivity;
        true
    })
}

/// MQTT broker client.
pub struct MqttBroker {
    client: AsyncClient,
    shared: Arc<Shared>,
    status: watch::Receiver<Connectivity>,
    shutdown: CancellationToken,
    subscribe_timeout: Duration,
}

impl MqttBroker {
    /// Create the client and start its event loop. Must be called within a
    /// Tokio runtime. Connection happens in the background; watch
    /// [`Broker::connectivity`] for the outcome.
    pub fn connect(config: &MqttConfig) -> Self {
        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(config.keep_alive);
        options.set_clean_session(config.clean_session);
        if let Some((username, password)) = &config.credentials {
            options.set_credentials(username, password);
        }

        let (client, event_loop) = AsyncClient::new(options, config.request_capacity);
        let (status_tx, status) = watch::channel(Connectivity::Offline);
        let shared = Arc::new(Shared::default());
        let shutdown = CancellationToken::new();

        tracing::info!(
            host = %config.host,
            port = config.port,
            client_id = %config.client_id,
            "Connecting to MQTT broker"
        );

        tokio::spawn(run_event_loop(
            event_loop,
            Arc::clone(&shared),
            status_tx,
            shutdown.clone(),
            config.reconnect_delay,
            config.max_reconnect_delay,
        ));

        Self {
            client,
            shared,
            status,
            shutdown,
            subscribe_timeout: config.subscribe_timeout,
        }
    }

    /// Stop the event loop and disconnect. Pending subscriptions fail.
    pub async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        if let Err(e) = self.client.disconnect().await {
            tracing::debug!(error = %e, "Disconnect request not delivered");
        }
        self.shutdown.cancel();
    }
}

impl Drop for MqttBroker {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run_event_loop(
    mut event_loop: EventLoop,
    shared: Arc<Shared>,
    status: watch::Sender<Connectivity>,
    shutdown: CancellationToken,
    initial_delay: Duration,
    max_delay: Duration,
) {
    let mut reconnect_delay = initial_delay;
    let mut consecutive_errors: u32 = 0;

    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = event_loop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    if consecutive_errors > 0 {
                        tracing::info!(consecutive_errors, "MQTT connection restored");
                    } else {
                        tracing::info!("MQTT connection established");
                    }
                    reconnect_delay = initial_delay;
                    consecutive_errors = 0;
                    set_connectivity(&status, Connectivity::Online);
                } else {
                    tracing::warn!(code = ?ack.code, "MQTT broker refused connection");
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                tracing::trace!(topic = %publish.topic, bytes = publish.payload.len(), "Incoming publish");
                shared.route(&publish.topic, publish.payload);
            }
            Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => {
                shared.record_outgoing(pkid);
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                shared.resolve_ack(ack.pkid, &ack.return_codes);
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                tracing::warn!("MQTT broker sent disconnect");
                set_connectivity(&status, Connectivity::Offline);
            }
            Ok(_) => {}
            Err(e) => {
                consecutive_errors += 1;
                if set_connectivity(&status, Connectivity::Offline) {
                    tracing::warn!(error = %e, "MQTT connection lost");
                }
                shared.fail_pending(&e.to_string());

                tracing::error!(
                    error = %e,
                    consecutive_errors,
                    retry_in_ms = reconnect_delay.as_millis() as u64,
                    "MQTT connection error, will retry"
                );

                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(reconnect_delay) => {}
                }
                reconnect_delay = std::cmp::min(reconnect_delay * 2, max_delay);
            }
        }
    }

    set_connectivity(&status, Connectivity::Offline);
    shared.fail_pending("client shut down");
    tracing::debug!("MQTT event loop stopped");
}

fn release(shared: &Weak<Shared>, client: &AsyncClient, id: u64) {
    let Some(shared) = shared.upgrade() else {
        return;
    };
    if let Some(filter) = shared.remove_route(id)
        && let Err(e) = client.try_unsubscribe(filter.as_str())
    {
        tracing::debug!(topic = %filter, error = %e, "Unsubscribe request not queued");
    }
}

#[async_trait]
impl Broker for MqttBroker {
    async fn subscribe(&self, topic: &str, sink: MessageSink) -> Result<Subscription, BrokerError> {
        if self.shutdown.is_cancelled() {
            return Err(BrokerError::Closed);
        }

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (ack_tx, ack_rx) = oneshot::channel();

        // Route first so nothing published right after the SUBACK is missed.
        lock(&self.shared.routes).push(Route {
            id,
            filter: topic.to_string(),
            sink,
        });
        lock(&self.shared.pending_acks).push_back(PendingAck::new(id, topic, ack_tx));

        let queued = self.client.subscribe(topic, QoS::AtMostOnce).await;
        let outcome = match queued {
            Err(ref e) => Err(BrokerError::Unreachable(e.to_string())),
            Ok(()) => match tokio::time::timeout(self.subscribe_timeout, ack_rx).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(BrokerError::Closed),
                Err(_) => Err(BrokerError::SubscribeTimeout {
                    topic: topic.to_string(),
                    timeout_secs: self.subscribe_timeout.as_secs(),
                }),
            },
        };

        if let Err(e) = outcome {
            self.shared.forget_pending(id, queued.is_ok());
            self.shared.remove_route(id);
            return Err(e);
        }

        tracing::debug!(topic, "Subscription acknowledged");
        let shared = Arc::downgrade(&self.shared);
        let client = self.client.clone();
        Ok(Subscription::new(topic, move || release(&shared, &client, id)))
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BrokerError> {
        self.client
            .publish(topic, QoS::AtMostOnce, false, payload.to_vec())
            .await
            .map_err(|e| BrokerError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    fn connectivity(&self) -> watch::Receiver<Connectivity> {
        self.status.clone()
    }
}
