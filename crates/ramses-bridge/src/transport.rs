//! Virtual transport handed to the protocol engine.
//!
//! Looks like a serial port to the engine: bytes in via [`Transport::write`],
//! bytes out via the handler's `data_received`. Underneath, every write becomes
//! an MQTT publish through the owning bridge.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::engine::{ProtocolHandler, Transport, guarded};
use crate::mqtt_bridge::BridgeShared;
use crate::status::TransportState;

/// Per-connection options supplied by the protocol engine.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Listen only: every write is dropped.
    pub disable_sending: bool,
    /// Send the `!V` version query after connecting and after every reconnect.
    pub handshake: bool,
    /// Values returned by [`Transport::extra_info`].
    pub extra: HashMap<String, String>,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            disable_sending: false,
            handshake: true,
            extra: HashMap::new(),
        }
    }
}

impl TransportOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_disable_sending(mut self, disable_sending: bool) -> Self {
        self.disable_sending = disable_sending;
        self
    }

    pub fn with_handshake(mut self, handshake: bool) -> Self {
        self.handshake = handshake;
        self
    }

    pub fn with_extra(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(name.into(), value.into());
        self
    }
}

struct TransportInner {
    generation: u64,
    device_id: String,
    bridge: Weak<BridgeShared>,
    state: Mutex<TransportState>,
    /// Dropped on close so the handler does not outlive the connection.
    handler: Mutex<Option<Arc<dyn ProtocolHandler>>>,
    options: TransportOptions,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Cheap-to-clone handle; all clones refer to the same connection.
#[derive(Clone)]
pub struct MqttTransport {
    inner: Arc<TransportInner>,
}

impl MqttTransport {
    pub(crate) fn new(
        generation: u64,
        device_id: impl Into<String>,
        bridge: Weak<BridgeShared>,
        handler: Arc<dyn ProtocolHandler>,
        options: TransportOptions,
    ) -> Self {
        let device_id = device_id.into();
        tracing::debug!(
            generation,
            device_id = %device_id,
            disable_sending = options.disable_sending,
            "Transport created"
        );
        Self {
            inner: Arc::new(TransportInner {
                generation,
                device_id,
                bridge,
                state: Mutex::new(TransportState::Unattached),
                handler: Mutex::new(Some(handler)),
                options,
            }),
        }
    }

    pub fn state(&self) -> TransportState {
        *lock(&self.inner.state)
    }

    pub fn device_id(&self) -> &str {
        &self.inner.device_id
    }

    pub fn options(&self) -> &TransportOptions {
        &self.inner.options
    }

    /// Wall-clock time for packet timestamps and expiry, as a naive local
    /// datetime like the engine's own clock.
    pub fn now(&self) -> chrono::NaiveDateTime {
        chrono::Local::now().naive_local()
    }

    pub(crate) fn generation(&self) -> u64 {
        self.inner.generation
    }

    pub(crate) fn handler(&self) -> Option<Arc<dyn ProtocolHandler>> {
        lock(&self.inner.handler).clone()
    }

    /// Returns false if the transition is not allowed from the current state.
    pub(crate) fn advance(&self, next: TransportState) -> bool {
        let mut state = lock(&self.inner.state);
        if !state.can_transition_to(next) {
            return false;
        }
        tracing::trace!(from = ?*state, to = ?next, "Transport state change");
        *state = next;
        true
    }

    /// Mark closed. Returns the handler only if it had been told the
    /// connection was up, i.e. it is owed a `connection_lost`.
    fn finish(&self) -> Option<Arc<dyn ProtocolHandler>> {
        let was_active = {
            let mut state = lock(&self.inner.state);
            if state.is_terminal() {
                return None;
            }
            let was_active = *state == TransportState::Active;
            *state = TransportState::Closed;
            was_active
        };
        let handler = lock(&self.inner.handler).take();
        if was_active { handler } else { None }
    }

    /// Close from the bridge side; the bridge has already detached us.
    pub(crate) fn shutdown(&self) {
        if let Some(handler) = self.finish() {
            tracing::debug!(generation = self.inner.generation, "Transport shut down by bridge");
            guarded("connection_lost", || handler.connection_lost(None));
        }
    }

    fn accepts_writes(&self, payload: &str) -> bool {
        let state = self.state();
        if state != TransportState::Active {
            tracing::debug!(?state, payload, "TX blocked, transport not active");
            return false;
        }
        if self.inner.options.disable_sending {
            tracing::debug!(payload, "TX blocked, sending disabled");
            return false;
        }
        true
    }
}

impl Transport for MqttTransport {
    fn write(&self, data: &[u8]) {
        match std::str::from_utf8(data) {
            Ok(text) => self.write_frame(text),
            Err(_) => {
                tracing::warn!(data = ?data, "Attempted to publish non-UTF-8 data to MQTT");
            }
        }
    }

    /// Each line of `frame` is published on its own; blank lines are dropped.
    fn write_frame(&self, frame: &str) {
        if !self.accepts_writes(frame) {
            return;
        }
        let Some(bridge) = self.inner.bridge.upgrade() else {
            tracing::debug!(frame, "TX dropped, bridge is gone");
            return;
        };
        bridge.publish_lines(frame);
    }

    fn close(&self) {
        tracing::debug!(generation = self.inner.generation, "Closing transport");
        let handler = self.finish();
        if let Some(bridge) = self.inner.bridge.upgrade() {
            bridge.detach(self.inner.generation);
        }
        if let Some(handler) = handler {
            guarded("connection_lost", || handler.connection_lost(None));
        }
    }

    fn is_closing(&self) -> bool {
        self.state().is_terminal()
    }

    fn extra_info(&self, name: &str) -> Option<String> {
        match self.inner.options.extra.get(name) {
            Some(value) => Some(value.clone()),
            None if name == "serial" => Some(self.inner.device_id.clone()),
            None => None,
        }
    }

    fn pause_reading(&self) {
        tracing::debug!("pause_reading is a no-op on the MQTT transport");
    }

    fn resume_reading(&self) {
        tracing::debug!("resume_reading is a no-op on the MQTT transport");
    }
}

impl fmt::Debug for MqttTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MqttTransport")
            .field("generation", &self.inner.generation)
            .field("device_id", &self.inner.device_id)
            .field("state", &self.state())
            .field("options", &self.inner.options)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::error::BridgeError;

    #[derive(Default)]
    struct CountingHandler {
        lost: AtomicUsize,
    }

    impl ProtocolHandler for CountingHandler {
        fn connection_made(&self, _transport: Arc<dyn Transport>) {}

        fn data_received(&self, _data: &[u8]) -> anyhow::Result<()> {
            Ok(())
        }

        fn connection_lost(&self, _error: Option<&BridgeError>) {
            self.lost.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn detached(options: TransportOptions) -> (MqttTransport, Arc<CountingHandler>) {
        let handler = Arc::new(CountingHandler::default());
        let transport = MqttTransport::new(1, "18:123456", Weak::new(), handler.clone(), options);
        (transport, handler)
    }

    #[test]
    fn close_notifies_active_handler_once() {
        let (transport, handler) = detached(TransportOptions::default());
        assert!(transport.advance(TransportState::Subscribing));
        assert!(transport.advance(TransportState::Active));

        transport.close();
        transport.close();
        transport.abort();

        assert!(transport.is_closing());
        assert_eq!(handler.lost.load(Ordering::SeqCst), 1);
        assert!(transport.handler().is_none());
    }

    #[test]
    fn close_before_active_stays_silent() {
        let (transport, handler) = detached(TransportOptions::default());
        assert!(transport.advance(TransportState::Subscribing));

        transport.close();

        assert_eq!(transport.state(), TransportState::Closed);
        assert_eq!(handler.lost.load(Ordering::SeqCst), 0);
        assert!(!transport.advance(TransportState::Active));
    }

    #[test]
    fn writes_are_refused_unless_active() {
        let (transport, _handler) = detached(TransportOptions::default());
        assert!(!transport.accepts_writes("!V"));

        transport.advance(TransportState::Subscribing);
        transport.advance(TransportState::Active);
        assert!(transport.accepts_writes("!V"));

        transport.close();
        assert!(!transport.accepts_writes("!V"));
    }

    #[test]
    fn disable_sending_blocks_writes() {
        let (transport, _handler) = detached(TransportOptions::new().with_disable_sending(true));
        transport.advance(TransportState::Subscribing);
        transport.advance(TransportState::Active);
        assert!(!transport.accepts_writes("RQ --- 18:123456 01:000000 --:------ 0005 002 0000"));
    }

    #[test]
    fn extra_info_falls_back_to_device_id_for_serial() {
        let (transport, _handler) = detached(TransportOptions::new().with_extra("port_name", "mqtt"));
        assert_eq!(transport.extra_info("port_name").as_deref(), Some("mqtt"));
        assert_eq!(transport.extra_info("serial").as_deref(), Some("18:123456"));
        assert_eq!(transport.extra_info("baudrate"), None);

        let (transport, _handler) = detached(TransportOptions::new().with_extra("serial", "override"));
        assert_eq!(transport.extra_info("serial").as_deref(), Some("override"));
    }

    #[test]
    fn options_default_to_handshake_and_sending() {
        let options = TransportOptions::default();
        assert!(options.handshake);
        assert!(!options.disable_sending);
        assert!(options.extra.is_empty());
    }
}
