//! Typed connection description validated at the adapter boundary
//!
//! The host daemon hands the supervisor a connection description with the
//! gateway in its data section and the session cookie in its secrets section.
//! Validation and gateway normalization happen here so the state machine
//! never touches untyped maps or schemeless URLs.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Errors produced while validating a connection description.
#[derive(Debug, Error, PartialEq)]
pub enum DescriptionError {
    #[error("No gateway specified in VPN configuration")]
    MissingGateway,

    #[error("Invalid gateway URL '{gateway}': {reason}")]
    InvalidGateway { gateway: String, reason: String },
}

/// Secrets attached to a connection description.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionSecrets {
    /// Opaque SSO session cookie, absent until authentication has run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cookie: Option<String>,

    /// Pinned gateway certificate digest, advisory only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gwcert: Option<String>,
}

/// A VPN connection request as supplied by the host daemon.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionDescription {
    /// VPN endpoint, host or absolute URL
    #[serde(default)]
    pub gateway: String,

    #[serde(default)]
    pub secrets: ConnectionSecrets,
}

impl ConnectionDescription {
    /// Create a description with a gateway and no secrets.
    pub fn new(gateway: impl Into<String>) -> Self {
        Self {
            gateway: gateway.into(),
            secrets: ConnectionSecrets::default(),
        }
    }

    /// The cookie, treating an empty string the same as absent.
    pub fn cookie(&self) -> Option<&str> {
        self.secrets.cookie.as_deref().filter(|c| !c.is_empty())
    }

    /// Validate the description for a connect request.
    ///
    /// A connect without a gateway is a configuration error and is rejected
    /// synchronously, before the supervisor ever enters `Starting`.
    pub fn validate(&self) -> Result<(), DescriptionError> {
        self.normalized_gateway().map(|_| ())
    }

    /// The gateway with a scheme, defaulting to `https://` when none is given.
    ///
    /// The tunnel binary requires a full URL; host daemons routinely store
    /// bare hostnames.
    pub fn normalized_gateway(&self) -> Result<String, DescriptionError> {
        normalize_gateway(&self.gateway)
    }
}

/// Normalize a gateway string to an absolute URL carrying a scheme.
pub fn normalize_gateway(gateway: &str) -> Result<String, DescriptionError> {
    let gateway = gateway.trim();
    if gateway.is_empty() {
        return Err(DescriptionError::MissingGateway);
    }

    let with_scheme = if gateway.starts_with("http://") || gateway.starts_with("https://") {
        gateway.to_string()
    } else {
        format!("https://{}", gateway)
    };

    Url::parse(&with_scheme).map_err(|e| DescriptionError::InvalidGateway {
        gateway: gateway.to_string(),
        reason: e.to_string(),
    })?;

    Ok(with_scheme)
}
