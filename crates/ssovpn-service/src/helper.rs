//! Tunnel helper side channel
//!
//! The tunnel binary invokes this program as its configuration script once
//! the link is up (and again on teardown), passing everything through the
//! vpnc-script environment convention. The helper translates that environment
//! into `set_config` / `set_ip4_config` / `set_ip6_config` requests on the
//! control socket.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, info};

use ssovpn_proto::{ConfigMap, ControlRequest, ControlResponse};

use crate::ipc::IpcClient;

/// Environment variable naming the control socket for the helper.
pub const SOCKET_ENV: &str = "SSOVPN_SOCKET";

/// Run the helper against `socket`: read the process environment, build the
/// configuration reports and deliver them.
pub async fn run(socket: &Path) -> Result<()> {
    let env: HashMap<String, String> = std::env::vars().collect();
    let reason = env.get("reason").map(String::as_str).unwrap_or("");
    info!("Tunnel helper invoked, reason '{}'", reason);

    let requests = requests_from_env(&env);
    if requests.is_empty() {
        debug!("Nothing to report for reason '{}'", reason);
        return Ok(());
    }

    let mut client = IpcClient::connect(socket)
        .await
        .context("Helper could not reach the supervisor")?;

    for request in requests {
        match client.request(&request).await? {
            ControlResponse::Ok => {}
            ControlResponse::Error { message } => {
                anyhow::bail!("Supervisor rejected helper report: {}", message)
            }
            other => anyhow::bail!("Unexpected response to helper report: {:?}", other),
        }
    }

    Ok(())
}

/// Build the configuration reports for a vpnc-script environment.
///
/// Only the connect reason produces reports; teardown is observed through the
/// tunnel process exit, and a helper failure is reported as `set_failure`.
pub fn requests_from_env(env: &HashMap<String, String>) -> Vec<ControlRequest> {
    match env.get("reason").map(String::as_str) {
        Some("connect") => {}
        Some("reconnect") => {}
        _ => return Vec::new(),
    }

    let Some(address) = non_empty(env, "INTERNAL_IP4_ADDRESS") else {
        return vec![ControlRequest::SetFailure {
            reason: "Tunnel came up without an IPv4 address".to_string(),
        }];
    };

    let mut requests = Vec::new();

    let mut config = ConfigMap::new();
    if let Some(gateway) = non_empty(env, "VPNGATEWAY") {
        config.insert("gateway".to_string(), serde_json::json!(gateway));
    }
    if let Some(tundev) = non_empty(env, "TUNDEV") {
        config.insert("tundev".to_string(), serde_json::json!(tundev));
    }
    if let Some(mtu) = non_empty(env, "INTERNAL_IP4_MTU").and_then(|v| v.parse::<u32>().ok()) {
        config.insert("mtu".to_string(), serde_json::json!(mtu));
    }
    if let Some(banner) = non_empty(env, "CISCO_BANNER") {
        config.insert("banner".to_string(), serde_json::json!(banner));
    }
    requests.push(ControlRequest::SetConfig { config });

    let mut ip4 = ConfigMap::new();
    ip4.insert("address".to_string(), serde_json::json!(address));
    if let Some(netmask) = non_empty(env, "INTERNAL_IP4_NETMASK") {
        if let Some(prefix) = netmask_to_prefix(&netmask) {
            ip4.insert("prefix".to_string(), serde_json::json!(prefix));
        }
    }
    if let Some(dns) = non_empty(env, "INTERNAL_IP4_DNS") {
        let servers: Vec<&str> = dns.split_whitespace().collect();
        ip4.insert("dns".to_string(), serde_json::json!(servers));
    }
    if let Some(domain) = non_empty(env, "CISCO_DEF_DOMAIN") {
        ip4.insert("domain".to_string(), serde_json::json!(domain));
    }
    requests.push(ControlRequest::SetIp4Config { config: ip4 });

    if let Some(address) = non_empty(env, "INTERNAL_IP6_ADDRESS") {
        let mut ip6 = ConfigMap::new();
        ip6.insert("address".to_string(), serde_json::json!(address));
        if let Some(netmask) = non_empty(env, "INTERNAL_IP6_NETMASK") {
            ip6.insert("netmask".to_string(), serde_json::json!(netmask));
        }
        requests.push(ControlRequest::SetIp6Config { config: ip6 });
    }

    requests
}

fn non_empty(env: &HashMap<String, String>, key: &str) -> Option<String> {
    env.get(key).filter(|v| !v.is_empty()).cloned()
}

/// Dotted-quad netmask to prefix length, `None` for non-contiguous masks.
fn netmask_to_prefix(netmask: &str) -> Option<u32> {
    let addr: std::net::Ipv4Addr = netmask.parse().ok()?;
    let bits = u32::from(addr);
    let prefix = bits.leading_ones();
    // Contiguous masks only: the remaining bits must all be zero.
    if bits.checked_shl(prefix).unwrap_or(0) == 0 {
        Some(prefix)
    } else {
        None
    }
}
