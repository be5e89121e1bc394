//! Tunnel process supervision
//!
//! Starts the tunnel binary, watches for its exit without ever blocking the
//! control task, and classifies the exit. Each start gets a generation
//! number; the waiter task tags its exit event with that generation so the
//! state machine can discard notifications from superseded processes.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::error::SupervisorError;
use crate::event::{Event, EventSender, TunnelExit};

/// How the tunnel binary is invoked.
#[derive(Debug, Clone)]
pub struct TunnelSettings {
    pub binary: std::path::PathBuf,
    pub protocol: String,
    pub helper_command: String,
    pub dtls_enabled: bool,
}

struct Running {
    generation: u64,
    pid: i32,
    dtls_enabled: bool,
    terminate_tx: oneshot::Sender<Duration>,
}

/// Supervisor for the single tunnel subprocess.
pub struct TunnelProcess {
    events: EventSender,
    current: Option<Running>,
}

impl TunnelProcess {
    pub fn new(events: EventSender) -> Self {
        Self {
            events,
            current: None,
        }
    }

    /// True while a tunnel process is tracked.
    pub fn is_running(&self) -> bool {
        self.current.is_some()
    }

    /// Start the tunnel binary for `gateway` with `cookie`.
    ///
    /// Replaces any tracked process; the old process keeps running until
    /// terminated and its eventual exit is discarded as stale. The spawned
    /// waiter task delivers `TunnelExited { generation, .. }` when the child
    /// exits.
    pub fn start(
        &mut self,
        generation: u64,
        settings: &TunnelSettings,
        gateway: &str,
        cookie: &str,
    ) -> Result<(), SupervisorError> {
        let mut cmd = Command::new(&settings.binary);

        // With DTLS disabled the tunnel is forced into SSL-only mode, which
        // is what makes the lightweight reconnect signal work after
        // suspend/resume. With DTLS enabled reconnection is a full restart.
        if !settings.dtls_enabled {
            cmd.arg("--no-dtls");
        }

        cmd.arg("-C")
            .arg(cookie)
            .arg(format!("--protocol={}", settings.protocol))
            .arg(format!("--script={}", settings.helper_command))
            .arg(gateway)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        info!(
            "Executing: {} (cookie masked), dtls={}, gateway={}",
            settings.binary.display(),
            settings.dtls_enabled,
            gateway
        );

        let child = cmd.spawn().map_err(SupervisorError::TunnelLaunch)?;
        let pid = child.id().map(|p| p as i32).unwrap_or(-1);
        info!("Tunnel process started with PID {}", pid);

        let (terminate_tx, terminate_rx) = oneshot::channel();
        self.current = Some(Running {
            generation,
            pid,
            dtls_enabled: settings.dtls_enabled,
            terminate_tx,
        });

        let events = self.events.clone();
        tokio::spawn(wait_for_exit(child, pid, generation, terminate_rx, events));

        Ok(())
    }

    /// Mark a launch failure so the exit flows through the normal transient
    /// failure path.
    pub fn report_spawn_failure(&mut self, generation: u64) {
        let _ = self.events.send(Event::TunnelExited {
            generation,
            exit: TunnelExit::SpawnFailed,
        });
    }

    /// Stop tracking the process once its exit has been consumed. Returns
    /// `false` for exits of superseded processes.
    pub fn acknowledge_exit(&mut self, generation: u64) -> bool {
        match &self.current {
            Some(running) if running.generation == generation => {
                self.current = None;
                true
            }
            _ => false,
        }
    }

    /// Terminate the tracked process: graceful signal first, forceful kill
    /// once the grace period expires. The process is untracked immediately,
    /// so its exit is discarded as stale.
    pub fn terminate(&mut self, grace: Duration) {
        if let Some(running) = self.current.take() {
            info!("Terminating tunnel process {}", running.pid);
            let _ = running.terminate_tx.send(grace);
        }
    }

    /// Ask the tunnel to re-establish after resume-from-suspend.
    ///
    /// SSL-only tunnels support an in-place reconnect signal; DTLS tunnels do
    /// not, so they get a termination and the state machine restarts them
    /// through the transient-exit path (the process stays tracked so its exit
    /// is honored).
    pub fn resume_reconnect(&self) {
        let Some(running) = &self.current else {
            debug!("Resume reconnect requested but no tunnel is running");
            return;
        };

        if running.dtls_enabled {
            info!("Resume: DTLS tunnel, requesting full restart of PID {}", running.pid);
            send_signal(running.pid, libc::SIGTERM);
        } else {
            info!("Resume: signalling PID {} to reconnect in place", running.pid);
            send_signal(running.pid, libc::SIGUSR2);
        }
    }
}

async fn wait_for_exit(
    mut child: Child,
    pid: i32,
    generation: u64,
    mut terminate_rx: oneshot::Receiver<Duration>,
    events: EventSender,
) {
    let exit = tokio::select! {
        status = child.wait() => classify(status),
        grace = &mut terminate_rx => {
            match grace {
                Ok(grace) => {
                    send_signal(pid, libc::SIGTERM);
                    match tokio::time::timeout(grace, child.wait()).await {
                        Ok(status) => classify(status),
                        Err(_) => {
                            warn!("Tunnel process {} did not terminate, killing", pid);
                            let _ = child.start_kill();
                            classify(child.wait().await)
                        }
                    }
                }
                // Supervisor dropped without terminating; keep waiting.
                Err(_) => classify(child.wait().await),
            }
        }
    };

    info!("Tunnel process {} exited with {}", pid, exit);
    let _ = events.send(Event::TunnelExited { generation, exit });
}

fn classify(status: std::io::Result<std::process::ExitStatus>) -> TunnelExit {
    let status = match status {
        Ok(status) => status,
        Err(e) => {
            warn!("Failed to collect tunnel exit status: {}", e);
            return TunnelExit::SpawnFailed;
        }
    };

    if let Some(code) = status.code() {
        return TunnelExit::Code(code);
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return TunnelExit::Signal(sig);
        }
    }

    TunnelExit::Code(-1)
}

fn send_signal(pid: i32, signal: i32) {
    if pid <= 0 {
        return;
    }
    // SAFETY: plain kill(2) on a pid we spawned; failure only means the
    // process is already gone.
    let rc = unsafe { libc::kill(pid, signal) };
    if rc != 0 {
        debug!("kill({}, {}) failed: {}", pid, signal, std::io::Error::last_os_error());
    }
}
