//! Connectivity and lifecycle status types.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Broker connectivity as reported by the broker client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Connectivity {
    /// Not connected (also the state before the first CONNACK)
    #[default]
    Offline,
    /// Connected and accepting traffic
    Online,
}

impl Connectivity {
    pub fn is_online(&self) -> bool {
        matches!(self, Self::Online)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Offline => "offline",
            Self::Online => "online",
        }
    }
}

impl fmt::Display for Connectivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown connectivity status: {0}")]
pub struct UnknownStatus(String);

impl FromStr for Connectivity {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(Self::Online),
            "offline" => Ok(Self::Offline),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// Lifecycle of a virtual transport.
///
/// Moves forward only: `Unattached → Subscribing → Active`, and any state may
/// end in `Closed`, which is terminal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportState {
    /// Created, no subscriptions requested yet
    #[default]
    Unattached,
    /// Waiting for the broker to acknowledge inbound subscriptions
    Subscribing,
    /// Subscribed, the protocol handler has been told the connection is up
    Active,
    /// Closed by the engine or the bridge
    Closed,
}

impl TransportState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed)
    }

    pub fn can_transition_to(&self, next: TransportState) -> bool {
        matches!(
            (self, next),
            (Self::Unattached, Self::Subscribing)
                | (Self::Subscribing, Self::Active)
                | (Self::Unattached | Self::Subscribing | Self::Active, Self::Closed)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connectivity_default_is_offline() {
        assert_eq!(Connectivity::default(), Connectivity::Offline);
    }

    #[test]
    fn connectivity_serializes_lowercase() {
        insta::assert_json_snapshot!(
            [Connectivity::Online, Connectivity::Offline],
            @r#"
        [
          "online",
          "offline"
        ]
        "#
        );
    }

    #[test]
    fn connectivity_parses_status_strings() {
        assert_eq!("online".parse::<Connectivity>().unwrap(), Connectivity::Online);
        assert_eq!(
            "offline".parse::<Connectivity>().unwrap(),
            Connectivity::Offline
        );
        assert!("ONLINE".parse::<Connectivity>().is_err());
    }

    #[test]
    fn transport_state_moves_forward_only() {
        use TransportState::*;

        assert!(Unattached.can_transition_to(Subscribing));
        assert!(Subscribing.can_transition_to(Active));
        assert!(Active.can_transition_to(Closed));
        assert!(Subscribing.can_transition_to(Closed));
        assert!(Unattached.can_transition_to(Closed));

        assert!(!Active.can_transition_to(Subscribing));
        assert!(!Subscribing.can_transition_to(Unattached));
        assert!(!Unattached.can_transition_to(Active));
        assert!(!Closed.can_transition_to(Active));
        assert!(!Closed.can_transition_to(Closed));
    }

    #[test]
    fn transport_state_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&TransportState::Subscribing).unwrap(),
            "\"subscribing\""
        );
    }
}
