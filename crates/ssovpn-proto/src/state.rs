//! Externally visible VPN service lifecycle states

use serde::{Deserialize, Serialize};

/// Lifecycle state of the VPN service as reported to the host daemon.
///
/// Exactly one value is current at any time; every transition is announced
/// through a `StateChanged` notification. Re-authentication retries keep the
/// external state at `Starting` so observers see one continuous reconnection
/// instead of a flapping disconnect/connect cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Init,
    Starting,
    Started,
    Stopping,
    Stopped,
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceState::Init => write!(f, "init"),
            ServiceState::Starting => write!(f, "starting"),
            ServiceState::Started => write!(f, "started"),
            ServiceState::Stopping => write!(f, "stopping"),
            ServiceState::Stopped => write!(f, "stopped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_serialization() {
        let json = serde_json::to_string(&ServiceState::Starting).unwrap();
        assert_eq!(json, r#""starting""#);

        let state: ServiceState = serde_json::from_str(r#""stopped""#).unwrap();
        assert_eq!(state, ServiceState::Stopped);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ServiceState::Started.to_string(), "started");
        assert_eq!(ServiceState::Init.to_string(), "init");
    }
}
