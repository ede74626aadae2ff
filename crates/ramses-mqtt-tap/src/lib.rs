//! Building blocks for the `ramses-mqtt-tap` binary.
//!
//! Kept in a library so argument handling and the stdout handler can be tested
//! without a broker.

use std::io::Write;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::BytesMut;
use ramses_bridge::{
    BridgeConfig, BridgeError, ConfigError, FrameCodec, MqttConfig, ProtocolHandler, Transport,
    TransportOptions,
};
use tokio::sync::Notify;
use tokio_util::codec::Decoder;

pub const USAGE: &str = "\
Usage: ramses-mqtt-tap [options]

Options:
  --host <host>         MQTT broker host [env: RAMSES_MQTT_HOST, default: localhost]
  --port <port>         MQTT broker port [env: RAMSES_MQTT_PORT, default: 1883]
  --root <topic>        Topic root [env: RAMSES_MQTT_TOPIC, default: RAMSES/GATEWAY]
  --device-id <id>      Gateway device id, e.g. 18:123456 [env: RAMSES_GATEWAY_ID]
  --username <user>     Broker username [env: RAMSES_MQTT_USERNAME]
  --password <pass>     Broker password [env: RAMSES_MQTT_PASSWORD]
  --listen-only         Never transmit; stdin is ignored
  --no-handshake        Do not send the !V version query on connect";

/// Command-line flags. Unset flags fall back to the environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TapArgs {
    pub host: Option<String>,
    pub port: Option<String>,
    pub root: Option<String>,
    pub device_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub listen_only: bool,
    pub no_handshake: bool,
}

/// `Err("")` means help was requested.
pub fn parse_args(args: &[String]) -> Result<TapArgs, String> {
    let mut parsed = TapArgs::default();

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        let flag = args[i].as_str();
        let slot = match flag {
            "--host" => &mut parsed.host,
            "--port" => &mut parsed.port,
            "--root" => &mut parsed.root,
            "--device-id" => &mut parsed.device_id,
            "--username" => &mut parsed.username,
            "--password" => &mut parsed.password,
            "--listen-only" => {
                parsed.listen_only = true;
                i += 1;
                continue;
            }
            "--no-handshake" => {
                parsed.no_handshake = true;
                i += 1;
                continue;
            }
            "--help" | "-h" => return Err(String::new()),
            arg if arg.starts_with('-') => return Err(format!("unknown flag: {arg}")),
            arg => return Err(format!("unexpected argument: {arg}")),
        };
        i += 1;
        *slot = Some(
            args.get(i)
                .ok_or_else(|| format!("{flag} requires a value"))?
                .clone(),
        );
        i += 1;
    }

    Ok(parsed)
}

impl TapArgs {
    /// The flag standing in for an environment variable, if it was given.
    fn flag_for(&self, key: &str) -> Option<String> {
        match key {
            "RAMSES_MQTT_HOST" => self.host.clone(),
            "RAMSES_MQTT_PORT" => self.port.clone(),
            "RAMSES_MQTT_TOPIC" => self.root.clone(),
            "RAMSES_GATEWAY_ID" => self.device_id.clone(),
            "RAMSES_MQTT_USERNAME" => self.username.clone(),
            "RAMSES_MQTT_PASSWORD" => self.password.clone(),
            _ => None,
        }
    }

    pub fn bridge_config(
        &self,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<BridgeConfig, ConfigError> {
        BridgeConfig::from_lookup(|key| self.flag_for(key).or_else(|| env(key)))
    }

    pub fn mqtt_config(&self, env: impl Fn(&str) -> Option<String>) -> Result<MqttConfig, ConfigError> {
        MqttConfig::from_lookup(|key| self.flag_for(key).or_else(|| env(key)))
    }

    pub fn transport_options(&self) -> TransportOptions {
        TransportOptions::new()
            .with_disable_sending(self.listen_only)
            .with_handshake(!self.no_handshake)
            .with_extra("port_name", "mqtt")
    }
}

struct LineBuffer {
    codec: FrameCodec,
    pending: BytesMut,
}

/// Protocol handler that prints every received line.
///
/// The delivered byte stream is reassembled into lines with [`FrameCodec`], the
/// same way a serial reader would see it.
pub struct PrintHandler<W> {
    out: Mutex<W>,
    lines: Mutex<LineBuffer>,
    lost: Notify,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<W: Write + Send> PrintHandler<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
            lines: Mutex::new(LineBuffer {
                codec: FrameCodec::new(),
                pending: BytesMut::new(),
            }),
            lost: Notify::new(),
        }
    }

    pub fn output(&self) -> MutexGuard<'_, W> {
        lock(&self.out)
    }

    /// Resolves once the transport has reported `connection_lost`, including
    /// when that happened before the call.
    pub async fn closed(&self) {
        self.lost.notified().await;
    }

    fn print(&self, data: &[u8]) -> anyhow::Result<()> {
        let mut lines = lock(&self.lines);
        let LineBuffer { codec, pending } = &mut *lines;
        pending.extend_from_slice(data);

        let mut out = lock(&self.out);
        while let Some(line) = codec.decode(pending)? {
            writeln!(out, "{line}")?;
        }
        out.flush()?;
        Ok(())
    }
}

impl<W: Write + Send> ProtocolHandler for PrintHandler<W> {
    fn connection_made(&self, transport: Arc<dyn Transport>) {
        tracing::info!(
            serial = transport.extra_info("serial").as_deref().unwrap_or("unknown"),
            "Tapping gateway"
        );
    }

    fn data_received(&self, data: &[u8]) -> anyhow::Result<()> {
        self.print(data)
    }

    fn connection_lost(&self, error: Option<&BridgeError>) {
        match error {
            Some(e) => tracing::warn!(error = %e, "Gateway connection lost"),
            None => tracing::info!("Gateway connection closed"),
        }
        self.lost.notify_one();
    }
}
