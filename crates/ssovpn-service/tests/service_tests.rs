//! End-to-end service tests
//!
//! Drive the supervisor through the control socket with stand-in tunnel and
//! auth-agent scripts, the way the host network-management daemon would.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::TempDir;
use tokio::time::timeout;

use ssovpn_proto::{
    ConnectionDescription, ConnectionSecrets, ControlRequest, ControlResponse, Notification,
    ServiceState,
};
use ssovpn_service::{adapter, ipc::IpcClient, ipc::IpcServer};
use ssovpn_supervisor::{ServiceConfig, Supervisor, SupervisorHandle};

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

async fn start_service(
    config: ServiceConfig,
    socket: &Path,
) -> (SupervisorHandle, tokio::task::JoinHandle<()>) {
    let (supervisor, handle) = Supervisor::new(config);
    let run = tokio::spawn(supervisor.run());

    let server = IpcServer::bind_to(socket).await.unwrap();
    tokio::spawn(adapter::serve(server, handle.clone()));

    (handle, run)
}

fn connect_request(gateway: &str, cookie: Option<&str>) -> ControlRequest {
    ControlRequest::Connect {
        connection: ConnectionDescription {
            gateway: gateway.to_string(),
            secrets: ConnectionSecrets {
                cookie: cookie.map(str::to_string),
                gwcert: None,
            },
        },
    }
}

#[tokio::test]
async fn test_established_connection_lifecycle() {
    let temp = TempDir::new().unwrap();
    let socket = temp.path().join("ctl.sock");

    let config = ServiceConfig {
        // Stays up until terminated, like a healthy tunnel.
        tunnel_binary: write_script(temp.path(), "tunnel", "sleep 30"),
        dtls_flag_file: temp.path().join("dtls"),
        ..ServiceConfig::default()
    };
    let (handle, run) = start_service(config, &socket).await;

    let mut subscriber = IpcClient::connect(&socket).await.unwrap();
    assert_eq!(
        subscriber.request(&ControlRequest::Subscribe).await.unwrap(),
        ControlResponse::Subscribed
    );

    let mut client = IpcClient::connect(&socket).await.unwrap();
    assert_eq!(
        client
            .request(&connect_request("vpn.example.com", Some("abc123")))
            .await
            .unwrap(),
        ControlResponse::Ok
    );

    assert_eq!(
        timeout(Duration::from_secs(5), subscriber.next_notification())
            .await
            .unwrap()
            .unwrap(),
        Notification::StateChanged {
            state: ServiceState::Starting
        }
    );

    // The tunnel helper reports the link is up.
    let config_map =
        ssovpn_proto::ConfigMap::from([("address".to_string(), serde_json::json!("10.0.0.2"))]);
    assert_eq!(
        client
            .request(&ControlRequest::SetIp4Config {
                config: config_map.clone()
            })
            .await
            .unwrap(),
        ControlResponse::Ok
    );

    assert_eq!(
        timeout(Duration::from_secs(5), subscriber.next_notification())
            .await
            .unwrap()
            .unwrap(),
        Notification::StateChanged {
            state: ServiceState::Started
        }
    );
    assert_eq!(
        timeout(Duration::from_secs(5), subscriber.next_notification())
            .await
            .unwrap()
            .unwrap(),
        Notification::Ip4Config { config: config_map }
    );
    assert_eq!(
        client.request(&ControlRequest::GetState).await.unwrap(),
        ControlResponse::State {
            state: ServiceState::Started
        }
    );

    // Disconnect tears everything down and ends the run loop.
    assert_eq!(
        client.request(&ControlRequest::Disconnect).await.unwrap(),
        ControlResponse::Ok
    );
    timeout(Duration::from_secs(10), run).await.unwrap().unwrap();
    assert_eq!(handle.state(), ServiceState::Stopped);
}

#[tokio::test]
async fn test_repeated_credential_rejection_becomes_fatal() {
    let temp = TempDir::new().unwrap();
    let socket = temp.path().join("ctl.sock");

    let config = ServiceConfig {
        // The gateway refuses every cookie.
        tunnel_binary: write_script(temp.path(), "tunnel", "exit 2"),
        // The browser agent hands out a fresh cookie each run.
        auth_agent: write_script(
            temp.path(),
            "agent",
            "cat > /dev/null; printf 'cookie\\nfresh-%s\\n' $$",
        ),
        dtls_flag_file: temp.path().join("dtls"),
        ..ServiceConfig::default()
    };
    let (handle, _run) = start_service(config, &socket).await;

    let mut subscriber = IpcClient::connect(&socket).await.unwrap();
    subscriber.request(&ControlRequest::Subscribe).await.unwrap();

    let mut client = IpcClient::connect(&socket).await.unwrap();
    assert_eq!(
        client
            .request(&connect_request("vpn.example.com", Some("abc123")))
            .await
            .unwrap(),
        ControlResponse::Ok
    );

    // Three rejections re-authenticate; the fourth gives up.
    let reason = loop {
        let notification = timeout(Duration::from_secs(30), subscriber.next_notification())
            .await
            .expect("service should reach a fatal failure")
            .unwrap();
        if let Notification::Failure { reason } = notification {
            break reason;
        }
    };
    assert!(reason.contains("repeatedly"), "unexpected reason: {}", reason);

    assert_eq!(
        timeout(Duration::from_secs(5), subscriber.next_notification())
            .await
            .unwrap()
            .unwrap(),
        Notification::StateChanged {
            state: ServiceState::Stopped
        }
    );
    assert_eq!(handle.state(), ServiceState::Stopped);
}

#[tokio::test]
async fn test_transient_tunnel_exit_is_retried() {
    let temp = TempDir::new().unwrap();
    let socket = temp.path().join("ctl.sock");

    let log = temp.path().join("runs.log");
    let marker = temp.path().join("first-run-done");
    // First invocation fails transiently, the retry stays up.
    let body = format!(
        "echo run >> {log}\nif [ -f {marker} ]; then sleep 30; fi\ntouch {marker}\nexit 1",
        log = log.display(),
        marker = marker.display(),
    );

    let config = ServiceConfig {
        tunnel_binary: write_script(temp.path(), "tunnel", &body),
        dtls_flag_file: temp.path().join("dtls"),
        ..ServiceConfig::default()
    };
    let (handle, _run) = start_service(config, &socket).await;

    let mut client = IpcClient::connect(&socket).await.unwrap();
    assert_eq!(
        client
            .request(&connect_request("vpn.example.com", Some("abc123")))
            .await
            .unwrap(),
        ControlResponse::Ok
    );

    // Exit, 2s backoff, restart with the same cookie.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        let runs = std::fs::read_to_string(&log).unwrap_or_default().lines().count();
        if runs >= 2 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "tunnel was not restarted, {} run(s)",
            runs
        );
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    // Observers saw one continuous connection attempt throughout.
    assert_eq!(handle.state(), ServiceState::Starting);

    client.request(&ControlRequest::Disconnect).await.unwrap();
}
