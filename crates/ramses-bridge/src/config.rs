//! Bridge and broker client configuration.
//!
//! Both structs follow the same pattern: defaults, `with_*` builders, and an
//! environment overlay. Environment reads go through a lookup function so
//! callers (and tests) can supply their own source.

use std::fmt;
use std::time::Duration;

use crate::wire::Topics;

/// Topic root used by ramses_esp out of the box.
pub const DEFAULT_TOPIC_ROOT: &str = "RAMSES/GATEWAY";

pub const DEFAULT_MQTT_PORT: u16 = 1883;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Identity of the gateway on the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    pub topic_root: String,
    pub device_id: String,
    /// First wait before retrying a failed resubscribe after a reconnect.
    pub resubscribe_delay: Duration,
    pub max_resubscribe_delay: Duration,
}

impl BridgeConfig {
    pub fn new(topic_root: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            topic_root: topic_root.into(),
            device_id: device_id.into(),
            resubscribe_delay: Duration::from_secs(1),
            max_resubscribe_delay: Duration::from_secs(30),
        }
    }

    /// Gateway under the default topic root.
    pub fn for_device(device_id: impl Into<String>) -> Self {
        Self::new(DEFAULT_TOPIC_ROOT, device_id)
    }

    pub fn with_topic_root(mut self, topic_root: impl Into<String>) -> Self {
        self.topic_root = topic_root.into();
        self
    }

    /// Backoff for resubscribe retries; the delay doubles up to `max`.
    pub fn with_resubscribe_delay(mut self, initial: Duration, max: Duration) -> Self {
        self.resubscribe_delay = initial;
        self.max_resubscribe_delay = max.max(initial);
        self
    }

    /// `RAMSES_MQTT_TOPIC` (optional) and `RAMSES_GATEWAY_ID` (required).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let device_id = lookup("RAMSES_GATEWAY_ID").ok_or(ConfigError::Missing("RAMSES_GATEWAY_ID"))?;
        let topic_root = lookup("RAMSES_MQTT_TOPIC").unwrap_or_else(|| DEFAULT_TOPIC_ROOT.to_string());
        let config = Self::new(topic_root, device_id);
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let root = self.topic_root.trim_end_matches('/');
        if root.is_empty() {
            return Err(ConfigError::Invalid {
                field: "topic_root",
                reason: "must not be empty".to_string(),
            });
        }
        if root.contains(['+', '#']) {
            return Err(ConfigError::Invalid {
                field: "topic_root",
                reason: format!("'{root}' contains an MQTT wildcard"),
            });
        }
        if self.device_id.is_empty() {
            return Err(ConfigError::Invalid {
                field: "device_id",
                reason: "must not be empty".to_string(),
            });
        }
        if self.device_id.contains(['+', '#', '/']) {
            return Err(ConfigError::Invalid {
                field: "device_id",
                reason: format!("'{}' must be a single topic level", self.device_id),
            });
        }
        Ok(())
    }

    pub fn topics(&self) -> Topics {
        Topics::new(&self.topic_root, &self.device_id)
    }
}

/// Connection settings for [`crate::broker::MqttBroker`].
#[derive(Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    /// Username and password.
    pub credentials: Option<(String, String)>,
    pub keep_alive: Duration,
    pub clean_session: bool,
    /// How long `subscribe` waits for the broker's SUBACK.
    pub subscribe_timeout: Duration,
    /// Capacity of the client's request queue.
    pub request_capacity: usize,
    pub reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_MQTT_PORT,
            client_id: format!("ramses-bridge-{}", uuid::Uuid::new_v4().simple()),
            credentials: None,
            keep_alive: Duration::from_secs(60),
            clean_session: true,
            subscribe_timeout: Duration::from_secs(10),
            request_capacity: 100,
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
        }
    }
}

impl fmt::Debug for MqttConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MqttConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("client_id", &self.client_id)
            .field(
                "credentials",
                &self.credentials.as_ref().map(|(user, _)| (user, "<redacted>")),
            )
            .field("keep_alive", &self.keep_alive)
            .field("clean_session", &self.clean_session)
            .field("subscribe_timeout", &self.subscribe_timeout)
            .field("request_capacity", &self.request_capacity)
            .field("reconnect_delay", &self.reconnect_delay)
            .field("max_reconnect_delay", &self.max_reconnect_delay)
            .finish()
    }
}

impl MqttConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Defaults overlaid with `RAMSES_MQTT_HOST`, `RAMSES_MQTT_PORT`,
    /// `RAMSES_MQTT_USERNAME` and `RAMSES_MQTT_PASSWORD`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(host) = lookup("RAMSES_MQTT_HOST") {
            config.host = host;
        }
        if let Some(port) = lookup("RAMSES_MQTT_PORT") {
            config.port = port.parse().map_err(|_| ConfigError::Invalid {
                field: "RAMSES_MQTT_PORT",
                reason: format!("'{port}' is not a port number"),
            })?;
        }
        if let Some(username) = lookup("RAMSES_MQTT_USERNAME") {
            let password = lookup("RAMSES_MQTT_PASSWORD").unwrap_or_default();
            config.credentials = Some((username, password));
        }

        Ok(config)
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some((username.into(), password.into()));
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_clean_session(mut self, clean_session: bool) -> Self {
        self.clean_session = clean_session;
        self
    }

    pub fn with_subscribe_timeout(mut self, timeout: Duration) -> Self {
        self.subscribe_timeout = timeout;
        self
    }

    pub fn with_reconnect_delay(mut self, initial: Duration, max: Duration) -> Self {
        self.reconnect_delay = initial;
        self.max_reconnect_delay = max;
        self
    }
}
