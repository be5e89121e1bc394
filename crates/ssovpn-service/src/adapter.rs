//! Control-protocol adapter
//!
//! Translates inbound control requests into supervisor events and streams
//! outbound notifications to subscribed connections. Requests that need no
//! state-machine transition (ping, state query, secrets query) are answered
//! synchronously here; everything else is forwarded and acknowledged.

use anyhow::Result;
use tracing::{debug, info, warn};

use ssovpn_proto::{ControlRequest, ControlResponse};
use ssovpn_supervisor::{Event, SupervisorHandle};

use crate::ipc::{IpcConnection, IpcServer};

/// Accept control connections until the listener or supervisor goes away.
pub async fn serve(server: IpcServer, handle: SupervisorHandle) {
    info!("Control protocol listening on {:?}", server.path());
    loop {
        match server.accept().await {
            Ok(conn) => {
                let handle = handle.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(conn, handle).await {
                        debug!("Control connection ended: {}", e);
                    }
                });
            }
            Err(e) => {
                warn!("Failed to accept control connection: {}", e);
                return;
            }
        }
    }
}

/// Serve one control connection until the client hangs up.
pub async fn handle_connection(
    mut conn: IpcConnection,
    handle: SupervisorHandle,
) -> Result<()> {
    while let Some(request) = conn.recv().await? {
        match request {
            ControlRequest::Ping => {
                conn.send(&ControlResponse::Pong).await?;
            }
            ControlRequest::GetState => {
                conn.send(&ControlResponse::State {
                    state: handle.state(),
                })
                .await?;
            }
            ControlRequest::NeedSecrets { .. } => {
                // Authentication is handled internally; the host's agent
                // system is never asked for credentials.
                conn.send(&ControlResponse::Secrets {
                    needed: String::new(),
                })
                .await?;
            }
            ControlRequest::Subscribe => {
                conn.send(&ControlResponse::Subscribed).await?;
                return stream_notifications(conn, handle).await;
            }
            ControlRequest::Connect { ref connection }
            | ControlRequest::ConnectInteractive { ref connection, .. } => {
                // Configuration errors are rejected here, before the machine
                // ever enters Starting.
                if let Err(e) = connection.validate() {
                    conn.send(&ControlResponse::Error {
                        message: e.to_string(),
                    })
                    .await?;
                    continue;
                }
                forward(&mut conn, &handle, request).await?;
            }
            request => {
                forward(&mut conn, &handle, request).await?;
            }
        }
    }
    Ok(())
}

async fn forward(
    conn: &mut IpcConnection,
    handle: &SupervisorHandle,
    request: ControlRequest,
) -> Result<()> {
    match handle.send(Event::Control(request)) {
        Ok(()) => conn.send(&ControlResponse::Ok).await,
        Err(e) => {
            conn.send(&ControlResponse::Error {
                message: e.to_string(),
            })
            .await
        }
    }
}

/// Push notifications to the client until it disconnects.
async fn stream_notifications(mut conn: IpcConnection, handle: SupervisorHandle) -> Result<()> {
    let mut notifications = handle.subscribe();
    loop {
        match notifications.recv().await {
            Ok(notification) => conn.notify(&notification).await?,
            // A lagged subscriber loses messages but keeps streaming; the
            // state query recovers the current picture.
            Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                warn!("Notification subscriber lagged, {} messages dropped", missed);
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ssovpn_proto::{ConnectionDescription, Notification, ServiceState};
    use ssovpn_supervisor::{ServiceConfig, Supervisor};
    use tempfile::TempDir;

    use crate::ipc::IpcClient;

    async fn start_service(socket: &std::path::Path) -> (SupervisorHandle, tokio::task::JoinHandle<()>) {
        let (supervisor, handle) = Supervisor::new(ServiceConfig::default());
        let run = tokio::spawn(supervisor.run());

        let server = IpcServer::bind_to(socket).await.unwrap();
        let serve_handle = handle.clone();
        tokio::spawn(serve(server, serve_handle));

        (handle, run)
    }

    #[tokio::test]
    async fn test_ping_and_state_are_answered_synchronously() {
        let temp = TempDir::new().unwrap();
        let socket = temp.path().join("ctl.sock");
        let (_handle, _run) = start_service(&socket).await;

        let mut client = IpcClient::connect(&socket).await.unwrap();
        assert_eq!(
            client.request(&ControlRequest::Ping).await.unwrap(),
            ControlResponse::Pong
        );
        assert_eq!(
            client.request(&ControlRequest::GetState).await.unwrap(),
            ControlResponse::State {
                state: ServiceState::Init
            }
        );
    }

    #[tokio::test]
    async fn test_need_secrets_always_answers_empty() {
        let temp = TempDir::new().unwrap();
        let socket = temp.path().join("ctl.sock");
        let (_handle, _run) = start_service(&socket).await;

        let mut client = IpcClient::connect(&socket).await.unwrap();
        let response = client
            .request(&ControlRequest::NeedSecrets {
                connection: ConnectionDescription::new("vpn.example.com"),
            })
            .await
            .unwrap();
        assert_eq!(
            response,
            ControlResponse::Secrets {
                needed: String::new()
            }
        );
    }

    #[tokio::test]
    async fn test_connect_without_gateway_is_rejected_at_the_boundary() {
        let temp = TempDir::new().unwrap();
        let socket = temp.path().join("ctl.sock");
        let (handle, _run) = start_service(&socket).await;

        let mut client = IpcClient::connect(&socket).await.unwrap();
        let response = client
            .request(&ControlRequest::Connect {
                connection: ConnectionDescription::new(""),
            })
            .await
            .unwrap();
        assert!(matches!(response, ControlResponse::Error { .. }));
        // The machine never saw the request.
        assert_eq!(handle.state(), ServiceState::Init);
    }

    #[tokio::test]
    async fn test_subscriber_receives_notifications() {
        let temp = TempDir::new().unwrap();
        let socket = temp.path().join("ctl.sock");
        let (_handle, _run) = start_service(&socket).await;

        let mut subscriber = IpcClient::connect(&socket).await.unwrap();
        assert_eq!(
            subscriber.request(&ControlRequest::Subscribe).await.unwrap(),
            ControlResponse::Subscribed
        );

        // The tunnel helper reports configuration on a separate connection.
        let mut helper = IpcClient::connect(&socket).await.unwrap();
        let config =
            ssovpn_proto::ConfigMap::from([("banner".to_string(), serde_json::json!("hello"))]);
        assert_eq!(
            helper
                .request(&ControlRequest::SetConfig {
                    config: config.clone()
                })
                .await
                .unwrap(),
            ControlResponse::Ok
        );

        assert_eq!(
            subscriber.next_notification().await.unwrap(),
            Notification::Config { config }
        );
    }

    #[tokio::test]
    async fn test_disconnect_stops_the_supervisor() {
        let temp = TempDir::new().unwrap();
        let socket = temp.path().join("ctl.sock");
        let (handle, run) = start_service(&socket).await;

        let mut client = IpcClient::connect(&socket).await.unwrap();
        assert_eq!(
            client.request(&ControlRequest::Disconnect).await.unwrap(),
            ControlResponse::Ok
        );

        run.await.unwrap();
        assert_eq!(handle.state(), ServiceState::Stopped);
    }
}
