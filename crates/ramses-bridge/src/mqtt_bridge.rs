//! The MQTT transport bridge.
//!
//! Owns the gateway's topic set and at most one live [`MqttTransport`]. Three
//! kinds of background task run per bridge:
//!
//! - **publisher**: drains the outbound queue into the broker, one publish at a
//!   time, so writes leave in the order the engine made them
//! - **dispatch**: one per transport, drains the inbound channel both
//!   subscriptions feed and calls the protocol handler
//! - **connectivity watcher**: one per transport, restores subscriptions and
//!   re-sends the handshake after the broker comes back
//!
//! ```text
//! Broker ──rx, cmd/result──► inbound channel ──► dispatch ──► ProtocolHandler
//! ProtocolHandler ──write_frame──► MqttTransport ──► outbound queue ──► publisher ──► Broker
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, watch};
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;

use crate::broker::{Broker, InboundMessage, MessageSink, Subscription};
use crate::config::BridgeConfig;
use crate::engine::{ProtocolHandler, Transport, TransportFactory, guarded};
use crate::error::BridgeError;
use crate::status::{Connectivity, TransportState};
use crate::transport::{MqttTransport, TransportOptions};
use crate::version::{self, VersionInfo};
use crate::wire::protocol::{VERSION_QUERY, decode_command_result, decode_frame};
use crate::wire::{FrameCodec, InboundRoute, Outbound, Topics, WireError};

struct OutboundMessage {
    topic: String,
    payload: Bytes,
}

/// The live transport and everything tied to its lifetime.
#[derive(Default)]
struct Attachment {
    generation: u64,
    transport: Option<MqttTransport>,
    subscriptions: Vec<Subscription>,
    tasks: Option<CancellationToken>,
}

impl Attachment {
    fn release(&mut self) -> Option<MqttTransport> {
        for subscription in &mut self.subscriptions {
            subscription.unsubscribe();
        }
        self.subscriptions.clear();
        if let Some(tasks) = self.tasks.take() {
            tasks.cancel();
        }
        self.transport.take()
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation == generation && self.transport.is_some()
    }
}

pub(crate) struct BridgeShared {
    broker: Arc<dyn Broker>,
    config: BridgeConfig,
    topics: Topics,
    outbound: mpsc::UnboundedSender<OutboundMessage>,
    connectivity: watch::Receiver<Connectivity>,
    attachment: Mutex<Attachment>,
    firmware: Mutex<Option<String>>,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl BridgeShared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Queue an outbound payload. Dropped, with a log line, when the bridge is
    /// closed or the broker is offline.
    pub(crate) fn publish(&self, outbound: Outbound) {
        let topic = outbound.topic(&self.topics);
        if self.is_closed() {
            tracing::debug!(topic, "Bridge closed, dropping outbound payload");
            return;
        }
        if !self.connectivity.borrow().is_online() {
            tracing::warn!(topic, ?outbound, "MQTT broker offline, dropping outbound payload");
            return;
        }

        let payload = match outbound.encode() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(topic, error = %e, "Failed to encode outbound payload");
                return;
            }
        };
        tracing::debug!(topic, payload = %String::from_utf8_lossy(&payload), "TX");

        let message = OutboundMessage {
            topic: topic.to_string(),
            payload,
        };
        if self.outbound.send(message).is_err() {
            tracing::debug!(topic, "Publisher stopped, dropping outbound payload");
        }
    }

    /// Split `text` into lines with [`FrameCodec`] and publish each line that
    /// holds a frame or control token.
    pub(crate) fn publish_lines(&self, text: &str) {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(text.as_bytes());
        let mut published = 0;
        loop {
            match codec.decode_eof(&mut buf) {
                Ok(Some(line)) => match Outbound::from_line(&line) {
                    Some(outbound) => {
                        self.publish(outbound);
                        published += 1;
                    }
                    None => tracing::debug!(line = ?line, "Dropping line without a frame"),
                },
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "Dropping rest of write, it does not split into frames");
                    break;
                }
            }
        }
        if published == 0 {
            tracing::debug!(payload = ?text, "Nothing to publish, dropping empty write");
        }
    }

    /// Drop the attachment if it still belongs to `generation`.
    pub(crate) fn detach(&self, generation: u64) {
        let mut attachment = lock(&self.attachment);
        if attachment.generation != generation {
            return;
        }
        if attachment.release().is_some() {
            tracing::debug!(generation, "Transport detached");
        }
    }

    async fn subscribe_inbound(&self, sink: &MessageSink) -> Result<Vec<Subscription>, BridgeError> {
        let mut subscriptions = Vec::with_capacity(2);
        for (topic, _) in self.topics.inbound() {
            let subscription = self.broker.subscribe(topic, sink.clone()).await.map_err(|source| {
                BridgeError::Subscribe {
                    topic: topic.to_string(),
                    source,
                }
            })?;
            tracing::info!(topic, "Subscribed");
            subscriptions.push(subscription);
        }
        Ok(subscriptions)
    }

    /// Swap stale subscription handles for fresh ones after a reconnect.
    async fn resubscribe(&self, generation: u64, sink: &MessageSink) -> Result<(), BridgeError> {
        {
            let mut attachment = lock(&self.attachment);
            if !attachment.is_current(generation) {
                return Ok(());
            }
            for subscription in &mut attachment.subscriptions {
                subscription.unsubscribe();
            }
            attachment.subscriptions.clear();
        }

        let subscriptions = self.subscribe_inbound(sink).await?;

        let mut attachment = lock(&self.attachment);
        if attachment.is_current(generation) && !self.is_closed() {
            attachment.subscriptions = subscriptions;
        }
        Ok(())
    }

    fn handle_inbound(&self, transport: &MqttTransport, message: InboundMessage) {
        let Some(handler) = transport.handler() else {
            tracing::debug!(topic = %message.topic, "Protocol handler gone, dropping message");
            return;
        };

        match self.topics.route(&message.topic) {
            Some(InboundRoute::Frame) => match decode_frame(&message.payload) {
                Ok(frame) => {
                    tracing::debug!(frame = frame.trim_end(), "RX");
                    deliver("data_received", || handler.data_received(frame.as_bytes()));
                }
                Err(e) => log_malformed(&message, &e),
            },
            Some(InboundRoute::CommandResult) => match decode_command_result(&message.payload) {
                Ok(Some(line)) => {
                    tracing::info!(result = line.trim_end(), "Command result");
                    self.record_firmware(&line);
                    deliver("command_result", || handler.command_result(line.as_bytes()));
                }
                Ok(None) => {
                    tracing::debug!(topic = %message.topic, "Command result without a return value");
                }
                Err(e) => log_malformed(&message, &e),
            },
            None => {
                tracing::trace!(topic = %message.topic, "Message on an unrelated topic");
            }
        }
    }

    fn record_firmware(&self, line: &str) {
        if let Some(firmware) = version::parse_firmware(line) {
            *lock(&self.firmware) = Some(firmware);
        }
    }

    fn send_handshake(&self) {
        self.publish(Outbound::Command(VERSION_QUERY.to_string()));
    }
}

fn log_malformed(message: &InboundMessage, error: &WireError) {
    let payload = String::from_utf8_lossy(&message.payload);
    match error {
        WireError::NotUtf8(_) => {
            tracing::warn!(topic = %message.topic, %payload, error = %error, "Dropping non-UTF-8 payload");
        }
        _ => {
            tracing::warn!(topic = %message.topic, %payload, error = %error, "Dropping malformed payload");
        }
    }
}

/// Run one data callback; an error or panic is logged and goes no further.
fn deliver(callback: &'static str, call: impl FnOnce() -> anyhow::Result<()>) {
    if let Some(Err(e)) = guarded(callback, call) {
        tracing::error!(callback, error = ?e, "Protocol handler failed");
    }
}

async fn run_publisher(
    broker: Arc<dyn Broker>,
    mut outbound: mpsc::UnboundedReceiver<OutboundMessage>,
    shutdown: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            message = outbound.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        if let Err(e) = broker.publish(&message.topic, message.payload).await {
            tracing::warn!(topic = %message.topic, error = %e, "Publish failed, payload dropped");
        }
    }
    tracing::debug!("Publisher task exiting");
}

async fn run_dispatch(
    shared: Arc<BridgeShared>,
    transport: MqttTransport,
    mut inbound: mpsc::UnboundedReceiver<InboundMessage>,
    tasks: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            biased;
            _ = tasks.cancelled() => break,
            message = inbound.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        if transport.is_closing() {
            break;
        }
        tracing::trace!(topic = %message.topic, bytes = message.payload.len(), "Inbound message");
        shared.handle_inbound(&transport, message);
    }
    tracing::debug!(generation = transport.generation(), "Dispatch task exiting");
}

async fn run_connectivity_watcher(
    shared: Arc<BridgeShared>,
    generation: u64,
    sink: MessageSink,
    tasks: CancellationToken,
    handshake: bool,
) {
    let mut status = shared.broker.connectivity();
    status.borrow_and_update();

    loop {
        tokio::select! {
            biased;
            _ = tasks.cancelled() => break,
            changed = status.changed() => {
                if changed.is_err() {
                    tracing::debug!("Connectivity feed closed");
                    break;
                }
            }
        }

        let current = *status.borrow_and_update();
        match current {
            Connectivity::Offline => {
                tracing::warn!(device_id = %shared.config.device_id, "MQTT broker offline, gateway traffic paused");
            }
            Connectivity::Online => {
                tracing::info!(device_id = %shared.config.device_id, "MQTT broker online, restoring gateway subscriptions");
                let restored =
                    restore_subscriptions(&shared, generation, &sink, &mut status, &tasks).await;
                if restored && handshake && !tasks.is_cancelled() {
                    shared.send_handshake();
                }
            }
        }
    }
    tracing::debug!(generation, "Connectivity watcher exiting");
}

/// Retry the resubscribe with backoff until it succeeds.
///
/// Gives up, returning false, when the transport goes away or the broker drops
/// again; the next online notification starts over.
async fn restore_subscriptions(
    shared: &BridgeShared,
    generation: u64,
    sink: &MessageSink,
    status: &mut watch::Receiver<Connectivity>,
    tasks: &CancellationToken,
) -> bool {
    let mut delay = shared.config.resubscribe_delay;
    loop {
        let error = match shared.resubscribe(generation, sink).await {
            Ok(()) => return true,
            Err(e) => e,
        };
        tracing::error!(error = %error, retry_in = ?delay, "Failed to restore gateway subscriptions");

        tokio::select! {
            biased;
            _ = tasks.cancelled() => return false,
            changed = status.changed() => {
                if changed.is_err() || !status.borrow_and_update().is_online() {
                    return false;
                }
                // Reconnected while waiting, try again straight away.
                continue;
            }
            _ = tokio::time::sleep(delay) => {}
        }
        delay = (delay * 2).min(shared.config.max_resubscribe_delay);
    }
}

/// Bridges one gateway's MQTT topics to a serial-style transport.
///
/// Closing happens on [`close`](Self::close) or on drop.
pub struct MqttBridge {
    shared: Arc<BridgeShared>,
}

impl MqttBridge {
    /// Spawns the publisher task, so this must be called inside a Tokio runtime.
    pub fn new(broker: Arc<dyn Broker>, config: BridgeConfig) -> Result<Self, BridgeError> {
        config.validate()?;
        let topics = config.topics();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let connectivity = broker.connectivity();
        let shutdown = CancellationToken::new();

        tokio::spawn(run_publisher(
            Arc::clone(&broker),
            outbound_rx,
            shutdown.clone(),
        ));

        tracing::info!(
            device_id = %config.device_id,
            topic_root = %config.topic_root,
            "MQTT bridge created"
        );

        Ok(Self {
            shared: Arc::new(BridgeShared {
                broker,
                config,
                topics,
                outbound,
                connectivity,
                attachment: Mutex::new(Attachment::default()),
                firmware: Mutex::new(None),
                closed: AtomicBool::new(false),
                shutdown,
            }),
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.shared.config
    }

    pub fn topics(&self) -> &Topics {
        &self.shared.topics
    }

    pub fn connectivity(&self) -> Connectivity {
        *self.shared.connectivity.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    pub fn version_info(&self) -> VersionInfo {
        match lock(&self.shared.firmware).clone() {
            Some(firmware) => VersionInfo::new().with_firmware(firmware),
            None => VersionInfo::new(),
        }
    }

    /// Publish frames or control tokens, one per line. Never blocks.
    pub fn publish(&self, payload: &str) {
        self.shared.publish_lines(payload);
    }

    /// Open the transport for `handler`, replacing any live one.
    ///
    /// `connection_made` runs only after both inbound subscriptions have been
    /// acknowledged.
    pub async fn create_transport(
        &self,
        handler: Arc<dyn ProtocolHandler>,
        options: TransportOptions,
    ) -> Result<MqttTransport, BridgeError> {
        let shared = &self.shared;
        if shared.is_closed() {
            return Err(BridgeError::Closed);
        }

        let handshake = options.handshake && !options.disable_sending;
        let (transport, previous) = {
            let mut attachment = lock(&shared.attachment);
            let previous = attachment.release();
            attachment.generation += 1;
            let transport = MqttTransport::new(
                attachment.generation,
                shared.config.device_id.clone(),
                Arc::downgrade(shared),
                handler,
                options,
            );
            attachment.transport = Some(transport.clone());
            (transport, previous)
        };
        if let Some(previous) = previous {
            tracing::info!("Replacing existing transport");
            previous.shutdown();
        }
        let generation = transport.generation();
        transport.advance(TransportState::Subscribing);

        let (sink, inbound) = mpsc::unbounded_channel();
        let subscriptions = match shared.subscribe_inbound(&sink).await {
            Ok(subscriptions) => subscriptions,
            Err(e) => {
                tracing::error!(error = %e, "Failed to subscribe to gateway topics");
                transport.shutdown();
                shared.detach(generation);
                return Err(e);
            }
        };

        let tasks = CancellationToken::new();
        {
            let mut attachment = lock(&shared.attachment);
            if shared.is_closed()
                || !attachment.is_current(generation)
                || !transport.advance(TransportState::Active)
            {
                drop(attachment);
                drop(subscriptions);
                transport.shutdown();
                tracing::debug!(generation, "Transport closed while subscribing");
                return Err(BridgeError::Cancelled);
            }
            attachment.subscriptions = subscriptions;
            attachment.tasks = Some(tasks.clone());
        }

        tracing::info!(
            device_id = %shared.config.device_id,
            rx = shared.topics.rx(),
            "Gateway transport ready"
        );
        if let Some(handler) = transport.handler() {
            let connected: Arc<dyn Transport> = Arc::new(transport.clone());
            guarded("connection_made", || handler.connection_made(connected));
        }

        // Messages acknowledged before this point wait in the channel.
        tokio::spawn(run_dispatch(
            Arc::clone(shared),
            transport.clone(),
            inbound,
            tasks.clone(),
        ));
        tokio::spawn(run_connectivity_watcher(
            Arc::clone(shared),
            generation,
            sink,
            tasks,
            handshake,
        ));

        if handshake && !transport.is_closing() {
            shared.send_handshake();
        }
        Ok(transport)
    }

    /// Idempotent.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!("Bridge already closed");
            return;
        }
        tracing::info!(device_id = %self.shared.config.device_id, "Closing MQTT bridge");
        let transport = lock(&self.shared.attachment).release();
        if let Some(transport) = transport {
            transport.shutdown();
        }
        self.shared.shutdown.cancel();
    }
}

impl Drop for MqttBridge {
    fn drop(&mut self) {
        self.close();
    }
}

#[async_trait]
impl TransportFactory for MqttBridge {
    async fn create_transport(
        &self,
        handler: Arc<dyn ProtocolHandler>,
        options: TransportOptions,
    ) -> Result<Arc<dyn Transport>, BridgeError> {
        let transport = MqttBridge::create_transport(self, handler, options).await?;
        Ok(Arc::new(transport))
    }
}
