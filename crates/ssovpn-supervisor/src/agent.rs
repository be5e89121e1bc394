//! Browser authentication agent invocation
//!
//! The agent is an external program that opens a browser, performs the SSO
//! login and prints the harvested session cookie. The coordinator launches it
//! detached, hands it the gateway over stdin, bounds the whole run with a
//! timeout and delivers the outcome as an `AgentCompleted` event. At most one
//! invocation is outstanding at a time.
//!
//! Stdin handoff:  `DATA_KEY=gateway\nDATA_VAL=<url>\nDONE\n`
//! Stdout protocol: alternating key/value lines (`cookie`, `gwcert`).

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::event::{Event, EventSender};

/// Credentials harvested by the browser agent.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthCredentials {
    pub gateway: String,
    pub cookie: String,
    pub gwcert: Option<String>,
}

/// Coordinator for the external browser authentication agent.
pub struct AuthAgent {
    events: EventSender,
    program: PathBuf,
    timeout: Duration,
    inflight: Option<JoinHandle<()>>,
}

impl AuthAgent {
    pub fn new(events: EventSender, program: PathBuf, timeout: Duration) -> Self {
        Self {
            events,
            program,
            timeout,
            inflight: None,
        }
    }

    /// True while an agent run is outstanding.
    pub fn is_inflight(&self) -> bool {
        self.inflight
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Launch the agent for `gateway`. Ignored when a run is already
    /// outstanding; the state machine never requests two concurrently.
    pub fn request(&mut self, gateway: String) {
        if self.is_inflight() {
            warn!("Browser auth already in flight, ignoring duplicate request");
            return;
        }

        info!("Launching browser auth agent for gateway {}", gateway);
        let events = self.events.clone();
        let program = self.program.clone();
        let timeout = self.timeout;

        self.inflight = Some(tokio::spawn(async move {
            let result = run_agent(&program, &gateway, timeout).await;
            if let Err(reason) = &result {
                warn!("Browser auth failed: {}", reason);
            }
            let _ = events.send(Event::AgentCompleted { gateway, result });
        }));
    }

    /// Abort any outstanding run without delivering a completion.
    pub fn cancel(&mut self) {
        if let Some(handle) = self.inflight.take() {
            if !handle.is_finished() {
                debug!("Aborting outstanding browser auth run");
            }
            handle.abort();
        }
    }
}

async fn run_agent(
    program: &PathBuf,
    gateway: &str,
    timeout: Duration,
) -> Result<AuthCredentials, String> {
    let mut child = Command::new(program)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| format!("Failed to launch auth agent {:?}: {}", program, e))?;

    if let Some(mut stdin) = child.stdin.take() {
        let handoff = format!("DATA_KEY=gateway\nDATA_VAL={}\nDONE\n", gateway);
        stdin
            .write_all(handoff.as_bytes())
            .await
            .map_err(|e| format!("Failed to write to auth agent stdin: {}", e))?;
        // Closing stdin tells the agent the handoff is complete.
        drop(stdin);
    }

    // On timeout the future is dropped and kill_on_drop reaps the agent.
    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| "Auth agent timed out (user may have closed the browser)".to_string())?
        .map_err(|e| format!("Failed to collect auth agent output: {}", e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!(
            "Auth agent failed ({}): {}",
            output.status,
            stderr.trim()
        ));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let (cookie, gwcert) = parse_agent_output(&stdout);

    match cookie {
        Some(cookie) if !cookie.is_empty() => Ok(AuthCredentials {
            gateway: gateway.to_string(),
            cookie,
            gwcert,
        }),
        _ => Err("No cookie in auth agent output".to_string()),
    }
}

/// Parse the agent's alternating key/value stdout lines.
fn parse_agent_output(stdout: &str) -> (Option<String>, Option<String>) {
    let lines: Vec<&str> = stdout.lines().collect();
    let mut cookie = None;
    let mut gwcert = None;

    let mut i = 0;
    while i < lines.len() {
        match lines[i] {
            "cookie" if i + 1 < lines.len() => {
                cookie = Some(lines[i + 1].to_string());
                i += 2;
            }
            "gwcert" if i + 1 < lines.len() => {
                gwcert = Some(lines[i + 1].to_string());
                i += 2;
            }
            _ => i += 1,
        }
    }

    (cookie, gwcert)
}
