//! Connection state machine
//!
//! The single authority over the externally visible lifecycle state. It
//! consumes every event in the system and answers with a list of actions for
//! the runtime driver to execute. Transitions never touch subprocesses,
//! timers or sockets directly, so tests drive the machine with synthetic
//! events and assert on the returned actions.
//!
//! External state stays at `Starting` throughout the retry loop; observers
//! see one continuous reconnection instead of flapping disconnect/connect.

use std::time::Duration;

use tracing::{debug, info, warn};

use ssovpn_proto::{ConfigMap, ConnectionDescription, ControlRequest, Notification, ServiceState};

use crate::agent::AuthCredentials;
use crate::event::{Event, TimerName, TunnelExit};

/// Consecutive credential-rejected tunnel exits tolerated before giving up.
pub const MAX_AUTH_FAILURES: u32 = 3;
/// Browser-agent attempts tolerated before giving up.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Delay before restarting the tunnel after a transient exit.
pub const RESTART_BACKOFF: Duration = Duration::from_secs(2);
/// Delay between browser-agent attempts after an agent failure.
pub const DIRECT_AUTH_RETRY_INTERVAL: Duration = Duration::from_secs(3);
/// Grace period for an upstream credential-request path to answer before
/// falling back to direct browser authentication.
pub const SECRETS_WAIT: Duration = Duration::from_secs(5);
/// Short pause before re-authenticating after the gateway rejected a cookie.
pub const REAUTH_DELAY: Duration = Duration::from_secs(1);
/// How long a terminated tunnel gets to exit before it is killed.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// An effect the runtime driver must carry out.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Push a notification to subscribed control connections
    Notify(Notification),

    /// Launch the tunnel binary under a fresh generation
    StartTunnel {
        generation: u64,
        gateway: String,
        cookie: String,
    },

    /// Terminate the tracked tunnel process
    TerminateTunnel { grace: Duration },

    /// Ask the running tunnel to re-establish after resume-from-suspend
    ResumeTunnel,

    /// Schedule a named timer, replacing any pending instance
    Schedule { timer: TimerName, delay: Duration },

    /// Cancel a named timer
    Cancel(TimerName),

    /// Invoke the browser authentication agent
    RequestAuth { gateway: String },

    /// Invalidate the cookie cached by the upstream credential store
    ClearSecretsStore,

    /// End the service run loop; the host restarts the service fresh
    Quit,
}

/// Re-authentication bookkeeping, part of the session and sharing its
/// lifetime.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetryLedger {
    /// Tunnel exits classified as credential-rejected since the last
    /// successful IPv4 configuration
    pub consecutive_auth_failures: u32,
    /// Browser-agent attempts since the last success
    pub reconnection_attempt: u32,
    /// The most recent cookie the gateway refused; never offered to the
    /// tunnel again
    pub last_rejected_cookie: Option<String>,
}

impl RetryLedger {
    /// True iff `cookie` equals the last cookie the gateway rejected.
    pub fn is_stale(&self, cookie: &str) -> bool {
        self.last_rejected_cookie.as_deref() == Some(cookie)
    }

    pub fn record_rejection(&mut self, cookie: String) {
        self.last_rejected_cookie = Some(cookie);
    }

    pub fn clear_rejection(&mut self) {
        self.last_rejected_cookie = None;
    }

    /// Zero both counters. Called when the tunnel reports IPv4
    /// configuration, the proof the current credentials work.
    pub fn reset_counters(&mut self) {
        self.consecutive_auth_failures = 0;
        self.reconnection_attempt = 0;
    }
}

/// One VPN attempt: endpoint, credentials and retry bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    /// Absolute gateway URL, always carrying a scheme
    pub gateway: String,
    pub cookie: Option<String>,
    pub gwcert: Option<String>,
    pub ledger: RetryLedger,
}

/// The inbound connect request currently awaiting a cookie.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingRequest {
    pub description: ConnectionDescription,
    pub interactive: bool,
}

/// Sub-state of `Starting`; not externally visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartingPhase {
    /// No retry path live; a tunnel may be launching or running
    Idle,
    /// Waiting for a credential (browser agent or upstream secrets)
    AwaitingCredential,
    /// Waiting out the restart backoff after a transient exit
    Backoff,
    /// Waiting out the delay before the next authentication attempt
    Retrying,
}

/// All mutable supervisor state. Owned exclusively by the control task.
pub struct SupervisorContext {
    state: ServiceState,
    phase: StartingPhase,
    disconnect_requested: bool,
    session: Option<Session>,
    pending: Option<PendingRequest>,
    tunnel_generation: Option<u64>,
    next_generation: u64,
}

impl Default for SupervisorContext {
    fn default() -> Self {
        Self::new()
    }
}

impl SupervisorContext {
    pub fn new() -> Self {
        Self {
            state: ServiceState::Init,
            phase: StartingPhase::Idle,
            disconnect_requested: false,
            session: None,
            pending: None,
            tunnel_generation: None,
            next_generation: 1,
        }
    }

    pub fn state(&self) -> ServiceState {
        self.state
    }

    pub fn phase(&self) -> StartingPhase {
        self.phase
    }

    pub fn disconnect_requested(&self) -> bool {
        self.disconnect_requested
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Dispatch one event, returning the actions the driver must execute.
    pub fn handle_event(&mut self, event: Event) -> Vec<Action> {
        match event {
            Event::Control(request) => self.handle_control(request),
            Event::TunnelExited { generation, exit } => self.handle_tunnel_exit(generation, exit),
            Event::TimerFired(name) => self.handle_timer(name),
            Event::AgentCompleted { gateway, result } => self.handle_agent(gateway, result),
            Event::ResumeFromSuspend => self.handle_resume(),
        }
    }

    fn handle_control(&mut self, request: ControlRequest) -> Vec<Action> {
        match request {
            ControlRequest::Connect { connection } => self.handle_connect(connection, false),
            ControlRequest::ConnectInteractive { connection, .. } => {
                self.handle_connect(connection, true)
            }
            ControlRequest::NewSecrets { connection } => self.handle_new_secrets(connection),
            ControlRequest::Disconnect => self.handle_disconnect(),
            ControlRequest::SetConfig { config } => self.handle_tunnel_config(config),
            ControlRequest::SetIp4Config { config } => self.handle_ip4_config(config),
            ControlRequest::SetIp6Config { config } => {
                vec![Action::Notify(Notification::Ip6Config { config })]
            }
            ControlRequest::SetFailure { reason } => {
                warn!("Tunnel helper reported failure: {}", reason);
                vec![Action::Notify(Notification::Failure { reason })]
            }
            // Answered synchronously by the adapter; nothing to transition.
            ControlRequest::NeedSecrets { .. }
            | ControlRequest::GetState
            | ControlRequest::Ping
            | ControlRequest::Subscribe => Vec::new(),
        }
    }

    fn handle_connect(&mut self, connection: ConnectionDescription, interactive: bool) -> Vec<Action> {
        let mut actions = Vec::new();

        let gateway = match connection.normalized_gateway() {
            Ok(gateway) => gateway,
            Err(e) => {
                warn!("Rejecting connect request: {}", e);
                actions.push(Action::Notify(Notification::Failure {
                    reason: e.to_string(),
                }));
                return actions;
            }
        };

        // Rejection bookkeeping survives re-connects within one service run
        // so a caller re-offering a refused cookie is caught below.
        let ledger = self
            .session
            .take()
            .map(|session| session.ledger)
            .unwrap_or_default();
        let mut session = Session {
            gateway: gateway.clone(),
            cookie: None,
            gwcert: connection.secrets.gwcert.clone(),
            ledger,
        };

        let cookie = connection.cookie().map(str::to_string);
        match cookie {
            Some(cookie) if !session.ledger.is_stale(&cookie) => {
                info!("Connect request for {} with session cookie", gateway);
                session.ledger.clear_rejection();
                session.cookie = Some(cookie);
                self.session = Some(session);
                self.pending = None;
                self.set_state(ServiceState::Starting, &mut actions);
                if self.tunnel_generation.take().is_some() {
                    actions.push(Action::TerminateTunnel {
                        grace: TERMINATE_GRACE,
                    });
                }
                self.start_tunnel(&mut actions);
            }
            Some(_) => {
                // The gateway already refused this cookie; offering it again
                // would loop. Re-authenticate right away instead.
                info!(
                    "Connect request for {} re-offers a rejected cookie, re-authenticating",
                    gateway
                );
                self.session = Some(session);
                self.pending = Some(PendingRequest {
                    description: connection,
                    interactive,
                });
                self.set_state(ServiceState::Starting, &mut actions);
                if self.tunnel_generation.take().is_some() {
                    actions.push(Action::TerminateTunnel {
                        grace: TERMINATE_GRACE,
                    });
                }
                self.request_auth(gateway, &mut actions);
            }
            None => {
                info!("Connect request for {} without a cookie", gateway);
                self.session = Some(session);
                self.pending = Some(PendingRequest {
                    description: connection,
                    interactive,
                });
                self.set_state(ServiceState::Starting, &mut actions);
                if self.tunnel_generation.take().is_some() {
                    actions.push(Action::TerminateTunnel {
                        grace: TERMINATE_GRACE,
                    });
                }
                self.phase = StartingPhase::AwaitingCredential;
                if interactive {
                    // Give the host's credential-request path a chance first;
                    // some integrations silently fail for this VPN type, so a
                    // short timer falls back to direct browser auth.
                    actions.push(Action::Notify(Notification::SecretsRequired {
                        message: "VPN session cookie required".to_string(),
                        secrets: vec!["cookie".to_string()],
                    }));
                    actions.push(Action::Schedule {
                        timer: TimerName::SecretsWait,
                        delay: SECRETS_WAIT,
                    });
                } else {
                    actions.push(Action::RequestAuth { gateway });
                }
            }
        }

        actions
    }

    fn handle_new_secrets(&mut self, connection: ConnectionDescription) -> Vec<Action> {
        if self.disconnect_requested {
            return self.finalize_disconnect();
        }

        let mut actions = vec![Action::Cancel(TimerName::SecretsWait)];

        let gateway = match connection.normalized_gateway() {
            Ok(gateway) => Some(gateway),
            Err(_) => self
                .session
                .as_ref()
                .map(|session| session.gateway.clone())
                .or_else(|| {
                    self.pending
                        .as_ref()
                        .and_then(|p| p.description.normalized_gateway().ok())
                }),
        };
        let Some(gateway) = gateway else {
            warn!("Secrets supplied without any known gateway, ignoring");
            return actions;
        };

        let cookie = connection.cookie().map(str::to_string);
        let is_stale = match (&cookie, &self.session) {
            (Some(cookie), Some(session)) => session.ledger.is_stale(cookie),
            _ => false,
        };

        match cookie {
            Some(cookie) if !is_stale => {
                info!("Secrets supplied for {}, completing pending connect", gateway);
                let ledger = self
                    .session
                    .take()
                    .map(|session| session.ledger)
                    .unwrap_or_default();
                self.session = Some(Session {
                    gateway,
                    cookie: Some(cookie),
                    gwcert: connection.secrets.gwcert.clone(),
                    ledger,
                });
                self.pending = None;
                self.set_state(ServiceState::Starting, &mut actions);
                self.start_tunnel(&mut actions);
            }
            _ => {
                // Empty or stale cookie from upstream. Fall back to direct
                // browser authentication.
                info!("Supplied secrets unusable, requesting browser authentication");
                if self.session.is_none() {
                    self.session = Some(Session {
                        gateway: gateway.clone(),
                        cookie: None,
                        gwcert: None,
                        ledger: RetryLedger::default(),
                    });
                }
                self.set_state(ServiceState::Starting, &mut actions);
                self.request_auth(gateway, &mut actions);
            }
        }

        actions
    }

    fn handle_disconnect(&mut self) -> Vec<Action> {
        // A disconnect can race an in-flight re-authentication. Tearing down
        // here would pull state out from under the agent completion, so the
        // flag defers teardown to the next transition check.
        if self.state == ServiceState::Starting && self.phase == StartingPhase::AwaitingCredential {
            info!("Disconnect during re-authentication, deferring teardown");
            self.disconnect_requested = true;
            let mut actions = Vec::new();
            self.set_state(ServiceState::Stopped, &mut actions);
            return actions;
        }

        info!("Disconnect requested, tearing down");
        self.disconnect_requested = true;
        let mut actions = Vec::new();
        self.set_state(ServiceState::Stopping, &mut actions);
        actions.extend(self.finalize_disconnect());
        actions
    }

    /// Teardown shared by the direct disconnect path and the deferred
    /// disconnect-requested flag path.
    fn finalize_disconnect(&mut self) -> Vec<Action> {
        let mut actions = vec![
            Action::Cancel(TimerName::RestartBackoff),
            Action::Cancel(TimerName::DirectAuthRetry),
            Action::Cancel(TimerName::SecretsWait),
        ];
        if self.tunnel_generation.take().is_some() {
            actions.push(Action::TerminateTunnel {
                grace: TERMINATE_GRACE,
            });
        }
        self.session = None;
        self.pending = None;
        self.phase = StartingPhase::Idle;
        actions.push(Action::ClearSecretsStore);
        self.set_state(ServiceState::Stopped, &mut actions);
        actions.push(Action::Quit);
        actions
    }

    fn handle_tunnel_config(&mut self, config: ConfigMap) -> Vec<Action> {
        debug!("Tunnel reported general configuration ({} keys)", config.len());
        vec![Action::Notify(Notification::Config { config })]
    }

    fn handle_ip4_config(&mut self, config: ConfigMap) -> Vec<Action> {
        info!("Tunnel reported IPv4 configuration, connection established");
        let mut actions = vec![Action::Cancel(TimerName::RestartBackoff)];
        if let Some(session) = self.session.as_mut() {
            session.ledger.reset_counters();
        }
        self.phase = StartingPhase::Idle;
        self.set_state(ServiceState::Started, &mut actions);
        actions.push(Action::Notify(Notification::Ip4Config { config }));
        actions
    }

    fn handle_tunnel_exit(&mut self, generation: u64, exit: TunnelExit) -> Vec<Action> {
        if self.tunnel_generation != Some(generation) {
            debug!("Discarding exit of superseded tunnel generation {}", generation);
            return Vec::new();
        }
        self.tunnel_generation = None;

        if self.disconnect_requested {
            return self.finalize_disconnect();
        }

        if exit.is_credential_rejected() {
            return self.handle_credential_rejected();
        }

        warn!("Tunnel exited ({}), scheduling restart", exit);
        match &self.session {
            Some(session) if session.cookie.is_some() => {
                let mut actions = Vec::new();
                self.set_state(ServiceState::Starting, &mut actions);
                self.phase = StartingPhase::Backoff;
                actions.push(Action::Schedule {
                    timer: TimerName::RestartBackoff,
                    delay: RESTART_BACKOFF,
                });
                actions
            }
            _ => self.fatal("VPN tunnel exited and no credentials remain to reconnect"),
        }
    }

    fn handle_credential_rejected(&mut self) -> Vec<Action> {
        let Some(session) = self.session.as_mut() else {
            return self.fatal("VPN gateway rejected the session with no active connection");
        };

        if let Some(cookie) = session.cookie.take() {
            session.ledger.record_rejection(cookie);
        }
        session.ledger.consecutive_auth_failures += 1;
        let failures = session.ledger.consecutive_auth_failures;

        if failures > MAX_AUTH_FAILURES {
            return self.fatal("VPN authentication failed repeatedly; giving up");
        }

        warn!(
            "Gateway rejected the session cookie ({}/{}), re-authenticating",
            failures, MAX_AUTH_FAILURES
        );
        let mut actions = Vec::new();
        self.set_state(ServiceState::Starting, &mut actions);
        self.phase = StartingPhase::Retrying;
        actions.push(Action::Schedule {
            timer: TimerName::DirectAuthRetry,
            delay: REAUTH_DELAY,
        });
        actions
    }

    fn handle_timer(&mut self, name: TimerName) -> Vec<Action> {
        if self.disconnect_requested {
            debug!("{} timer fired after disconnect, aborting retry", name);
            return self.finalize_disconnect();
        }

        match name {
            TimerName::RestartBackoff => {
                if self.phase != StartingPhase::Backoff {
                    debug!("Stale restart-backoff firing in phase {:?}, ignoring", self.phase);
                    return Vec::new();
                }
                let mut actions = Vec::new();
                self.start_tunnel(&mut actions);
                actions
            }
            TimerName::DirectAuthRetry => {
                if self.phase != StartingPhase::Retrying {
                    debug!("Stale auth-retry firing in phase {:?}, ignoring", self.phase);
                    return Vec::new();
                }
                let Some(gateway) = self.session.as_ref().map(|s| s.gateway.clone()) else {
                    return Vec::new();
                };
                let mut actions = Vec::new();
                self.request_auth(gateway, &mut actions);
                actions
            }
            TimerName::SecretsWait => {
                // Fires only when no credential response arrived and no
                // tunnel is running yet.
                if self.phase != StartingPhase::AwaitingCredential || self.tunnel_generation.is_some()
                {
                    return Vec::new();
                }
                let Some(gateway) = self.session.as_ref().map(|s| s.gateway.clone()) else {
                    return Vec::new();
                };
                info!("No credential response from the host, falling back to browser auth");
                let mut actions = Vec::new();
                self.request_auth(gateway, &mut actions);
                actions
            }
        }
    }

    fn handle_agent(
        &mut self,
        gateway: String,
        result: Result<AuthCredentials, String>,
    ) -> Vec<Action> {
        if self.disconnect_requested {
            info!("Browser auth completed after disconnect, discarding result");
            return self.finalize_disconnect();
        }

        if self.phase != StartingPhase::AwaitingCredential {
            debug!("Discarding stale browser auth completion for {}", gateway);
            return Vec::new();
        }
        let Some(session) = self.session.as_mut() else {
            debug!("Discarding browser auth completion without a session");
            return Vec::new();
        };

        match result {
            Ok(credentials) => {
                info!("Browser authentication succeeded for {}", gateway);
                session.cookie = Some(credentials.cookie);
                session.gwcert = credentials.gwcert;
                // A fresh authentication supersedes any earlier rejection and
                // restarts the agent-retry budget. The rejection counter is
                // deliberately left alone; only a working tunnel clears it.
                session.ledger.reconnection_attempt = 0;
                session.ledger.clear_rejection();
                self.pending = None;

                let mut actions = Vec::new();
                self.set_state(ServiceState::Starting, &mut actions);
                self.start_tunnel(&mut actions);
                actions
            }
            Err(reason) => {
                session.ledger.reconnection_attempt += 1;
                let attempt = session.ledger.reconnection_attempt;

                if attempt >= MAX_RECONNECT_ATTEMPTS {
                    return self.fatal(format!(
                        "Could not authenticate to the VPN gateway: {}",
                        reason
                    ));
                }

                warn!(
                    "Browser authentication failed (attempt {}/{}): {}",
                    attempt, MAX_RECONNECT_ATTEMPTS, reason
                );
                self.phase = StartingPhase::Retrying;
                vec![Action::Schedule {
                    timer: TimerName::DirectAuthRetry,
                    delay: DIRECT_AUTH_RETRY_INTERVAL,
                }]
            }
        }
    }

    fn handle_resume(&mut self) -> Vec<Action> {
        if self.state == ServiceState::Started && self.tunnel_generation.is_some() {
            info!("System resumed from suspend, re-establishing tunnel");
            vec![Action::ResumeTunnel]
        } else {
            debug!("Resume from suspend with no established tunnel, ignoring");
            Vec::new()
        }
    }

    /// Launch the tunnel under a fresh generation. The session must carry
    /// both a gateway and a cookie.
    fn start_tunnel(&mut self, actions: &mut Vec<Action>) {
        let Some(session) = &self.session else {
            actions.extend(self.fatal("No session to start the tunnel for"));
            return;
        };
        let Some(cookie) = session.cookie.clone() else {
            actions.extend(self.fatal("No session cookie to start the tunnel with"));
            return;
        };
        let gateway = session.gateway.clone();

        let generation = self.next_generation;
        self.next_generation += 1;
        self.tunnel_generation = Some(generation);
        self.phase = StartingPhase::Idle;

        // A launch supersedes every live retry path.
        actions.push(Action::Cancel(TimerName::RestartBackoff));
        actions.push(Action::Cancel(TimerName::DirectAuthRetry));
        actions.push(Action::Cancel(TimerName::SecretsWait));
        actions.push(Action::StartTunnel {
            generation,
            gateway,
            cookie,
        });
    }

    fn request_auth(&mut self, gateway: String, actions: &mut Vec<Action>) {
        if let Some(session) = &self.session {
            info!(
                "Requesting browser authentication for {} (attempt {}/{})",
                gateway,
                session.ledger.reconnection_attempt + 1,
                MAX_RECONNECT_ATTEMPTS
            );
        }
        self.phase = StartingPhase::AwaitingCredential;
        actions.push(Action::RequestAuth { gateway });
    }

    /// Fatal failure: cancel everything, clear the session, report and stop.
    fn fatal(&mut self, reason: impl Into<String>) -> Vec<Action> {
        let reason = reason.into();
        warn!("Fatal: {}", reason);

        let mut actions = vec![
            Action::Cancel(TimerName::RestartBackoff),
            Action::Cancel(TimerName::DirectAuthRetry),
            Action::Cancel(TimerName::SecretsWait),
        ];
        if self.tunnel_generation.take().is_some() {
            actions.push(Action::TerminateTunnel {
                grace: TERMINATE_GRACE,
            });
        }
        self.session = None;
        self.pending = None;
        self.phase = StartingPhase::Idle;
        actions.push(Action::Notify(Notification::Failure { reason }));
        self.set_state(ServiceState::Stopped, &mut actions);
        actions.push(Action::ClearSecretsStore);
        actions
    }

    fn set_state(&mut self, state: ServiceState, actions: &mut Vec<Action>) {
        if self.state == state {
            return;
        }
        info!("State: {} -> {}", self.state, state);
        self.state = state;
        actions.push(Action::Notify(Notification::StateChanged { state }));
    }
}
