//! Control-protocol requests, responses and notifications
//!
//! The host daemon drives the supervisor with requests; the supervisor
//! answers each request and pushes asynchronous notifications to subscribed
//! connections. The tunnel binary's helper reports its configuration through
//! the same request vocabulary (`set_config`, `set_ip4_config`, ...).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::description::ConnectionDescription;
use crate::state::ServiceState;

/// Key/value configuration set reported by the tunnel helper.
pub type ConfigMap = HashMap<String, serde_json::Value>;

/// Inbound control request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlRequest {
    /// Non-interactive connect; launches browser authentication itself when
    /// no cookie is present
    Connect { connection: ConnectionDescription },

    /// Interactive connect; the caller may still supply secrets
    /// asynchronously via `new_secrets`
    ConnectInteractive {
        connection: ConnectionDescription,
        #[serde(default)]
        details: HashMap<String, String>,
    },

    /// Ask which secrets the supervisor needs; always answered with the
    /// empty string because authentication is handled internally
    NeedSecrets { connection: ConnectionDescription },

    /// Secrets collected by an upstream credential-request path
    NewSecrets { connection: ConnectionDescription },

    /// Tear the connection down and stop the service
    Disconnect,

    /// General VPN configuration from the tunnel helper
    SetConfig { config: ConfigMap },

    /// IPv4 configuration from the tunnel helper; signals the tunnel is up
    SetIp4Config { config: ConfigMap },

    /// IPv6 configuration from the tunnel helper
    SetIp6Config { config: ConfigMap },

    /// Failure reported by the tunnel helper
    SetFailure { reason: String },

    /// Query the current lifecycle state
    GetState,

    /// Liveness check
    Ping,

    /// Switch this connection into notification streaming mode
    Subscribe,
}

/// Response to a single control request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlResponse {
    /// Request accepted
    Ok,

    /// Answer to `need_secrets`; an empty string means no secrets are needed
    /// from the host's agent system
    Secrets { needed: String },

    /// Answer to `get_state`
    State { state: ServiceState },

    /// Answer to `ping`
    Pong,

    /// Notification streaming acknowledged; notifications follow on this
    /// connection
    Subscribed,

    /// Request rejected
    Error { message: String },
}

/// Asynchronous notification toward the host daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    /// Lifecycle state transition
    StateChanged { state: ServiceState },

    /// General VPN configuration
    Config { config: ConfigMap },

    /// IPv4 configuration; the tunnel is established
    Ip4Config { config: ConfigMap },

    /// IPv6 configuration
    Ip6Config { config: ConfigMap },

    /// Human-readable failure reason
    Failure { reason: String },

    /// Secrets are required from the caller of an interactive connect
    SecretsRequired { message: String, secrets: Vec<String> },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::description::ConnectionSecrets;

    #[test]
    fn test_request_serialization() {
        let req = ControlRequest::Connect {
            connection: ConnectionDescription {
                gateway: "vpn.example.com".to_string(),
                secrets: ConnectionSecrets {
                    cookie: Some("abc123".to_string()),
                    gwcert: None,
                },
            },
        };
        let json = serde_json::to_string(&req).unwrap();
        assert_eq!(
            json,
            r#"{"type":"connect","connection":{"gateway":"vpn.example.com","secrets":{"cookie":"abc123"}}}"#
        );

        let req = ControlRequest::Disconnect;
        let json = serde_json::to_string(&req).unwrap();
        assert_eq!(json, r#"{"type":"disconnect"}"#);

        let req = ControlRequest::Ping;
        let json = serde_json::to_string(&req).unwrap();
        assert_eq!(json, r#"{"type":"ping"}"#);
    }

    #[test]
    fn test_request_deserialization() {
        let json = r#"{"type":"connect_interactive","connection":{"gateway":"vpn.example.com"}}"#;
        let req: ControlRequest = serde_json::from_str(json).unwrap();
        assert_eq!(
            req,
            ControlRequest::ConnectInteractive {
                connection: ConnectionDescription::new("vpn.example.com"),
                details: HashMap::new(),
            }
        );

        let json = r#"{"type":"set_failure","reason":"tunnel down"}"#;
        let req: ControlRequest = serde_json::from_str(json).unwrap();
        assert_eq!(
            req,
            ControlRequest::SetFailure {
                reason: "tunnel down".to_string()
            }
        );
    }

    #[test]
    fn test_helper_config_roundtrip() {
        let mut config = ConfigMap::new();
        config.insert("address".to_string(), serde_json::json!("10.0.0.2"));
        config.insert("prefix".to_string(), serde_json::json!(24));

        let req = ControlRequest::SetIp4Config {
            config: config.clone(),
        };
        let json = serde_json::to_string(&req).unwrap();
        let parsed: ControlRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, ControlRequest::SetIp4Config { config });
    }

    #[test]
    fn test_response_serialization() {
        let resp = ControlResponse::Secrets {
            needed: String::new(),
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert_eq!(json, r#"{"type":"secrets","needed":""}"#);

        let resp = ControlResponse::State {
            state: ServiceState::Starting,
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert_eq!(json, r#"{"type":"state","state":"starting"}"#);

        let resp = ControlResponse::Error {
            message: "No gateway".to_string(),
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert_eq!(json, r#"{"type":"error","message":"No gateway"}"#);
    }

    #[test]
    fn test_notification_serialization() {
        let n = Notification::StateChanged {
            state: ServiceState::Started,
        };
        let json = serde_json::to_string(&n).unwrap();
        assert_eq!(json, r#"{"type":"state_changed","state":"started"}"#);

        let n = Notification::SecretsRequired {
            message: "VPN session cookie required".to_string(),
            secrets: vec!["cookie".to_string()],
        };
        let json = serde_json::to_string(&n).unwrap();
        assert_eq!(
            json,
            r#"{"type":"secrets_required","message":"VPN session cookie required","secrets":["cookie"]}"#
        );

        let n = Notification::Failure {
            reason: "Authentication failed repeatedly".to_string(),
        };
        let json = serde_json::to_string(&n).unwrap();
        let parsed: Notification = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, n);
    }
}
