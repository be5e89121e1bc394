//! Service configuration
//!
//! A JSON config file supplies the external program paths and the IPC socket
//! location; a separate `KEY=VALUE` flag file toggles the DTLS/ESP transport
//! because that switch is managed by the host's system configuration, not by
//! this service.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::SupervisorError;

/// Supervisor service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Tunnel binary establishing the actual network tunnel
    pub tunnel_binary: PathBuf,

    /// VPN protocol name passed to the tunnel binary
    pub vpn_protocol: String,

    /// Browser authentication agent program
    pub auth_agent: PathBuf,

    /// Command line the tunnel binary invokes as its configuration script
    pub helper_command: String,

    /// Unix socket the control protocol listens on; `None` uses the
    /// per-user default
    pub socket_path: Option<PathBuf>,

    /// Flag file read at tunnel-start time for `ENABLE_DTLS=true|false`
    pub dtls_flag_file: PathBuf,

    /// Upper bound on one browser authentication run, in seconds
    pub agent_timeout_secs: u64,

    /// Optional command run on disconnect or fatal failure to invalidate the
    /// cookie cached by the upstream credential store
    pub secrets_clear_command: Option<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            tunnel_binary: PathBuf::from("openconnect"),
            vpn_protocol: "pulse".to_string(),
            auth_agent: PathBuf::from("ssovpn-auth-agent"),
            helper_command: "ssovpnd helper".to_string(),
            socket_path: None,
            dtls_flag_file: PathBuf::from("/etc/ssovpn/dtls"),
            agent_timeout_secs: 300,
            secrets_clear_command: None,
        }
    }
}

impl ServiceConfig {
    /// Load the configuration from a JSON file, falling back to defaults
    /// when the file does not exist.
    pub fn load(path: &Path) -> Result<Self, SupervisorError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let json = std::fs::read_to_string(path).map_err(|e| {
            SupervisorError::Config(format!("Failed to read config file {:?}: {}", path, e))
        })?;

        serde_json::from_str(&json).map_err(|e| {
            SupervisorError::Config(format!("Failed to parse config file {:?}: {}", path, e))
        })
    }

    /// Whether the DTLS/ESP transport is enabled.
    ///
    /// Read once per tunnel start. With DTLS disabled the tunnel runs
    /// SSL-only (`--no-dtls`) and reconnects after suspend with a lightweight
    /// signal; with DTLS enabled reconnection is a full restart. Defaults to
    /// disabled when the flag file is missing or unreadable.
    pub fn dtls_enabled(&self) -> bool {
        read_dtls_flag(&self.dtls_flag_file)
    }
}

fn read_dtls_flag(path: &Path) -> bool {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            if path.exists() {
                warn!("Failed to read DTLS flag file {:?}: {}", path, e);
            }
            return false;
        }
    };

    for line in content.lines() {
        let line = line.trim();
        if let Some(value) = line.strip_prefix("ENABLE_DTLS=") {
            return value.trim().eq_ignore_ascii_case("true");
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = ServiceConfig::default();
        assert_eq!(config.tunnel_binary, PathBuf::from("openconnect"));
        assert_eq!(config.vpn_protocol, "pulse");
        assert_eq!(config.agent_timeout_secs, 300);
        assert!(config.secrets_clear_command.is_none());
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let config = ServiceConfig::load(Path::new("/nonexistent/ssovpn.json")).unwrap();
        assert_eq!(config.vpn_protocol, "pulse");
    }

    #[test]
    fn test_load_partial_config() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.json");
        std::fs::write(&path, r#"{"vpn_protocol":"gp","agent_timeout_secs":60}"#).unwrap();

        let config = ServiceConfig::load(&path).unwrap();
        assert_eq!(config.vpn_protocol, "gp");
        assert_eq!(config.agent_timeout_secs, 60);
        // Untouched fields keep their defaults
        assert_eq!(config.tunnel_binary, PathBuf::from("openconnect"));
    }

    #[test]
    fn test_load_invalid_json_is_an_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.json");
        std::fs::write(&path, "not json").unwrap();

        assert!(ServiceConfig::load(&path).is_err());
    }

    #[test]
    fn test_dtls_flag_parsing() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("dtls");

        std::fs::write(&path, "ENABLE_DTLS=true\n").unwrap();
        assert!(read_dtls_flag(&path));

        std::fs::write(&path, "ENABLE_DTLS=false\n").unwrap();
        assert!(!read_dtls_flag(&path));

        std::fs::write(&path, "# comment\n  ENABLE_DTLS=TRUE  \n").unwrap();
        assert!(read_dtls_flag(&path));

        std::fs::write(&path, "OTHER_KEY=true\n").unwrap();
        assert!(!read_dtls_flag(&path));
    }

    #[test]
    fn test_dtls_flag_defaults_to_disabled_when_missing() {
        assert!(!read_dtls_flag(Path::new("/nonexistent/dtls")));
    }
}
