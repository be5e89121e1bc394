//! Runtime driver
//!
//! Owns the event queue, the timer registry, the tunnel process and the
//! browser-auth coordinator, and executes the actions the state machine
//! returns. This is the only place where transitions meet the outside world;
//! the machine itself stays pure.

use std::process::Stdio;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use ssovpn_proto::{Notification, ServiceState};

use crate::agent::AuthAgent;
use crate::config::ServiceConfig;
use crate::error::SupervisorError;
use crate::event::{Event, EventSender};
use crate::machine::{Action, SupervisorContext};
use crate::process::{TunnelProcess, TunnelSettings};
use crate::timer::TimerRegistry;

const NOTIFICATION_CAPACITY: usize = 64;

/// Cloneable handle for feeding events in and observing the supervisor.
#[derive(Clone)]
pub struct SupervisorHandle {
    events: EventSender,
    notifications: broadcast::Sender<Notification>,
    state: watch::Receiver<ServiceState>,
}

impl SupervisorHandle {
    pub fn send(&self, event: Event) -> Result<(), SupervisorError> {
        self.events.send(event).map_err(|_| SupervisorError::QueueClosed)
    }

    pub fn events(&self) -> EventSender {
        self.events.clone()
    }

    /// Subscribe to outbound notifications. Slow subscribers may miss
    /// messages; the control protocol carries no history.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    pub fn state(&self) -> ServiceState {
        *self.state.borrow()
    }

    /// Completes when the lifecycle state changes.
    pub async fn state_changed(&mut self) -> Result<ServiceState, SupervisorError> {
        self.state
            .changed()
            .await
            .map_err(|_| SupervisorError::QueueClosed)?;
        Ok(*self.state.borrow())
    }
}

/// The supervisor runtime. `run` consumes events until a disconnect ends the
/// run loop.
pub struct Supervisor {
    context: SupervisorContext,
    events: mpsc::UnboundedReceiver<Event>,
    timers: TimerRegistry,
    tunnel: TunnelProcess,
    agent: AuthAgent,
    config: ServiceConfig,
    notifications: broadcast::Sender<Notification>,
    state_tx: watch::Sender<ServiceState>,
}

impl Supervisor {
    pub fn new(config: ServiceConfig) -> (Self, SupervisorHandle) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ServiceState::Init);

        let timers = TimerRegistry::new(events_tx.clone());
        let tunnel = TunnelProcess::new(events_tx.clone());
        let agent = AuthAgent::new(
            events_tx.clone(),
            config.auth_agent.clone(),
            Duration::from_secs(config.agent_timeout_secs),
        );

        let handle = SupervisorHandle {
            events: events_tx,
            notifications: notifications.clone(),
            state: state_rx,
        };

        let supervisor = Self {
            context: SupervisorContext::new(),
            events: events_rx,
            timers,
            tunnel,
            agent,
            config,
            notifications,
            state_tx,
        };

        (supervisor, handle)
    }

    /// Consume events until a disconnect quits the run loop or every sender
    /// is gone.
    pub async fn run(mut self) {
        info!("Supervisor run loop started");
        while let Some(event) = self.events.recv().await {
            // Keep process tracking in step with the exit the machine is
            // about to consume; stale generations are a no-op here too.
            if let Event::TunnelExited { generation, .. } = &event {
                self.tunnel.acknowledge_exit(*generation);
            }
            let actions = self.context.handle_event(event);
            if self.execute(actions) {
                break;
            }
        }
        info!("Supervisor run loop ended");
    }

    /// Execute actions in order. Returns true when the run loop should end.
    fn execute(&mut self, actions: Vec<Action>) -> bool {
        for action in actions {
            match action {
                Action::Notify(notification) => {
                    if let Notification::StateChanged { state } = &notification {
                        self.state_tx.send_replace(*state);
                    }
                    // No subscribers is fine; notifications are advisory.
                    let _ = self.notifications.send(notification);
                }
                Action::StartTunnel {
                    generation,
                    gateway,
                    cookie,
                } => {
                    let settings = TunnelSettings {
                        binary: self.config.tunnel_binary.clone(),
                        protocol: self.config.vpn_protocol.clone(),
                        helper_command: self.config.helper_command.clone(),
                        dtls_enabled: self.config.dtls_enabled(),
                    };
                    if let Err(e) = self.tunnel.start(generation, &settings, &gateway, &cookie) {
                        warn!("Failed to start tunnel: {}", e);
                        self.tunnel.report_spawn_failure(generation);
                    }
                }
                Action::TerminateTunnel { grace } => self.tunnel.terminate(grace),
                Action::ResumeTunnel => self.tunnel.resume_reconnect(),
                Action::Schedule { timer, delay } => self.timers.schedule(timer, delay),
                Action::Cancel(timer) => self.timers.cancel(timer),
                Action::RequestAuth { gateway } => self.agent.request(gateway),
                Action::ClearSecretsStore => self.clear_secrets_store(),
                Action::Quit => {
                    self.agent.cancel();
                    self.timers.cancel_all();
                    return true;
                }
            }
        }
        false
    }

    /// Ask the upstream credential store to drop its cached cookie so the
    /// next connect does not replay a dead session.
    fn clear_secrets_store(&self) {
        let Some(command) = self.config.secrets_clear_command.clone() else {
            debug!("No secrets-clear command configured");
            return;
        };

        info!("Invalidating cached credentials");
        tokio::spawn(async move {
            let result = tokio::process::Command::new("/bin/sh")
                .arg("-c")
                .arg(&command)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;
            match result {
                Ok(status) if !status.success() => {
                    warn!("Secrets-clear command exited with {}", status);
                }
                Err(e) => warn!("Failed to run secrets-clear command: {}", e),
                _ => {}
            }
        });
    }
}
