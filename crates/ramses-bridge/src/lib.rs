//! ramses-bridge: MQTT transport bridge for RAMSES II gateways.
//!
//! Makes a gateway that talks JSON over MQTT look like a serial port to a
//! RAMSES protocol engine.

mod version;

pub mod broker;
pub mod config;
pub mod engine;
pub mod error;
pub mod mqtt_bridge;
pub mod status;
pub mod transport;
pub mod wire;

pub use broker::{Broker, BrokerError, MemoryBroker, MqttBroker, Subscription};
pub use config::{BridgeConfig, ConfigError, MqttConfig};
pub use engine::{ProtocolHandler, Transport, TransportFactory};
pub use error::BridgeError;
pub use mqtt_bridge::MqttBridge;
pub use status::{Connectivity, TransportState};
pub use transport::{MqttTransport, TransportOptions};
pub use version::{BRIDGE_VERSION, VersionInfo};
pub use wire::FrameCodec;
