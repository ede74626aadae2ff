use thiserror::Error;

use crate::broker::BrokerError;
use crate::config::ConfigError;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("failed to subscribe to {topic}: {source}")]
    Subscribe {
        topic: String,
        #[source]
        source: BrokerError,
    },

    #[error("transport closed while its subscriptions were being set up")]
    Cancelled,

    #[error("bridge is closed")]
    Closed,

    #[error("invalid bridge configuration: {0}")]
    Config(#[from] ConfigError),
}
