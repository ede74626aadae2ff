//! Boundary with the protocol engine.
//!
//! The engine owns frame parsing and device state; the bridge only moves bytes.
//! It sees the bridge as a [`TransportFactory`] and a [`Transport`], exactly as
//! it would see a serial port, and the bridge sees the engine as a
//! [`ProtocolHandler`].

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::BridgeError;
use crate::transport::TransportOptions;

/// Duplex byte-stream transport as seen by the protocol engine.
pub trait Transport: Send + Sync {
    /// Raw bytes, one or more CRLF-terminated lines.
    fn write(&self, data: &[u8]);

    /// One frame or control token, with or without its terminator.
    ///
    /// Text holding several lines is sent as one message per line. Blank lines
    /// are dropped, as is any line with a CR that does not end it.
    fn write_frame(&self, frame: &str);

    /// Idempotent.
    fn close(&self);

    fn abort(&self) {
        self.close()
    }

    fn is_closing(&self) -> bool;

    /// Transport metadata such as `"serial"`.
    fn extra_info(&self, name: &str) -> Option<String>;

    fn pause_reading(&self) {}

    fn resume_reading(&self) {}
}

/// Connection lifecycle and data callbacks implemented by the protocol engine.
///
/// Callbacks run on the bridge's dispatch task; they must not block.
pub trait ProtocolHandler: Send + Sync {
    /// The transport is subscribed and ready for traffic.
    fn connection_made(&self, transport: Arc<dyn Transport>);

    /// One CRLF-terminated frame.
    ///
    /// Errors are logged by the bridge and do not affect later deliveries.
    fn data_received(&self, data: &[u8]) -> anyhow::Result<()>;

    /// Firmware answer to a control token, normalised to a `# ...` CRLF line.
    ///
    /// Defaults to the data path, which is where a serial gateway's answer
    /// would arrive.
    fn command_result(&self, data: &[u8]) -> anyhow::Result<()> {
        self.data_received(data)
    }

    /// The transport is closed. `None` means an orderly close.
    fn connection_lost(&self, error: Option<&BridgeError>);
}

/// Factory hook the protocol engine calls to open its transport.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create_transport(
        &self,
        handler: Arc<dyn ProtocolHandler>,
        options: TransportOptions,
    ) -> Result<Arc<dyn Transport>, BridgeError>;
}

/// Run one handler callback, catching a panic so it cannot take the bridge's
/// tasks down with it. Returns `None` if the callback panicked.
pub(crate) fn guarded<R>(callback: &'static str, call: impl FnOnce() -> R) -> Option<R> {
    match std::panic::catch_unwind(AssertUnwindSafe(call)) {
        Ok(result) => Some(result),
        Err(panic) => {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!(callback, %reason, "Protocol handler panicked");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guarded_passes_results_through() {
        assert_eq!(guarded("connection_made", || 7), Some(7));
    }

    #[test]
    fn guarded_swallows_panics() {
        assert_eq!(guarded("connection_lost", || -> u8 { panic!("gone") }), None);
        let owned = String::from("owned message");
        assert_eq!(guarded("connection_lost", move || -> u8 { panic!("{owned}") }), None);
    }
}
