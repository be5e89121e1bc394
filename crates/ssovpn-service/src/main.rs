//! ssovpnd - SSO-VPN connection supervisor daemon

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ssovpn_proto::{ControlRequest, ControlResponse};
use ssovpn_service::{adapter, helper, ipc};
use ssovpn_supervisor::{Event, ServiceConfig, Supervisor};

/// Keep a corporate SSL-VPN tunnel alive with browser SSO re-authentication
#[derive(Parser, Debug)]
#[command(name = "ssovpnd")]
#[command(about = "SSO-VPN connection supervisor", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Control socket path
    #[arg(long, env = "SSOVPN_SOCKET")]
    socket: Option<PathBuf>,

    /// Service configuration file
    #[arg(long, default_value = "/etc/ssovpn/config.json")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the supervisor service (the default)
    Run,

    /// Print the running service's lifecycle state
    Status,

    /// Tear the connection down and stop the service
    Disconnect,

    /// Invoked by the tunnel binary as its configuration script
    #[command(hide = true)]
    Helper,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let socket = cli.socket.clone();
    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_service(&cli.config, socket).await,
        Commands::Status => status(socket).await,
        Commands::Disconnect => disconnect(socket).await,
        Commands::Helper => helper::run(&socket.unwrap_or_else(ipc::default_socket_path)).await,
    }
}

async fn run_service(config_path: &Path, socket: Option<PathBuf>) -> Result<()> {
    let config = ServiceConfig::load(config_path)?;
    let socket_path = socket
        .or_else(|| config.socket_path.clone())
        .unwrap_or_else(ipc::default_socket_path);

    // The tunnel child inherits the environment; this is how the helper
    // invocation finds its way back to the control socket.
    std::env::set_var(helper::SOCKET_ENV, &socket_path);

    let server = ipc::IpcServer::bind_to(&socket_path).await?;
    let (supervisor, handle) = Supervisor::new(config);
    let mut run = tokio::spawn(supervisor.run());
    tokio::spawn(adapter::serve(server, handle.clone()));

    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    // The host's suspend hook pokes SIGUSR1 after resume so the tunnel
    // re-establishes promptly instead of waiting for a dead-peer timeout.
    let mut sigusr1 =
        signal(SignalKind::user_defined1()).context("Failed to install SIGUSR1 handler")?;

    loop {
        tokio::select! {
            result = &mut run => {
                result.context("Supervisor task failed")?;
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, disconnecting");
                let _ = handle.send(Event::Control(ControlRequest::Disconnect));
            }
            _ = sigint.recv() => {
                info!("Received SIGINT, disconnecting");
                let _ = handle.send(Event::Control(ControlRequest::Disconnect));
            }
            _ = sigusr1.recv() => {
                info!("Received resume-from-suspend signal");
                let _ = handle.send(Event::ResumeFromSuspend);
            }
        }
    }

    info!("Service stopped");
    Ok(())
}

async fn status(socket: Option<PathBuf>) -> Result<()> {
    let path = socket.unwrap_or_else(ipc::default_socket_path);
    let mut client = ipc::IpcClient::connect(&path).await?;
    match client.request(&ControlRequest::GetState).await? {
        ControlResponse::State { state } => {
            println!("{}", state);
            Ok(())
        }
        other => anyhow::bail!("Unexpected response: {:?}", other),
    }
}

async fn disconnect(socket: Option<PathBuf>) -> Result<()> {
    let path = socket.unwrap_or_else(ipc::default_socket_path);
    let mut client = ipc::IpcClient::connect(&path).await?;
    match client.request(&ControlRequest::Disconnect).await? {
        ControlResponse::Ok => {
            println!("Disconnected");
            Ok(())
        }
        ControlResponse::Error { message } => anyhow::bail!("{}", message),
        other => anyhow::bail!("Unexpected response: {:?}", other),
    }
}
