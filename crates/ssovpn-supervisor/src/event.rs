//! The single typed event vocabulary consumed by the state machine
//!
//! Every asynchronous completion in the system - inbound control calls,
//! tunnel exits, timer firings, browser-agent results, resume signals - is
//! expressed as one `Event` and pushed onto one ordered queue. The state
//! machine is the only consumer, so its transition logic is free of data
//! races by construction.

use tokio::sync::mpsc;

use ssovpn_proto::ControlRequest;

use crate::agent::AuthCredentials;

/// Thread-safe handoff into the control task's event queue.
pub type EventSender = mpsc::UnboundedSender<Event>;

/// Exit code the tunnel binary uses when the gateway rejected the cookie.
pub const AUTH_REJECTED_EXIT_CODE: i32 = 2;

/// Named one-shot timers owned by the state machine.
///
/// At most one instance of each name may be pending; scheduling a name again
/// replaces the previous instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerName {
    /// Delay before restarting the tunnel after a transient exit
    RestartBackoff,
    /// Delay before (re-)invoking the browser authentication agent
    DirectAuthRetry,
    /// Grace period for an upstream credential-request path to answer an
    /// interactive connect before falling back to direct browser auth
    SecretsWait,
}

impl std::fmt::Display for TimerName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimerName::RestartBackoff => write!(f, "restart-backoff"),
            TimerName::DirectAuthRetry => write!(f, "direct-auth-retry"),
            TimerName::SecretsWait => write!(f, "secrets-wait"),
        }
    }
}

/// Normalized tunnel process exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelExit {
    /// Exited with a status code
    Code(i32),
    /// Terminated by a signal
    Signal(i32),
    /// The launch itself failed; treated as a transient failure
    SpawnFailed,
}

impl TunnelExit {
    /// True iff the exit means the gateway refused the session cookie.
    pub fn is_credential_rejected(&self) -> bool {
        matches!(self, TunnelExit::Code(code) if *code == AUTH_REJECTED_EXIT_CODE)
    }
}

impl std::fmt::Display for TunnelExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TunnelExit::Code(code) => write!(f, "exit code {}", code),
            TunnelExit::Signal(sig) => write!(f, "signal {}", sig),
            TunnelExit::SpawnFailed => write!(f, "launch failure"),
        }
    }
}

/// An event delivered to the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Inbound control-protocol call forwarded by the adapter
    Control(ControlRequest),

    /// The tunnel process with this generation exited. Only honored when the
    /// generation matches the currently tracked tunnel; exits of superseded
    /// processes are discarded.
    TunnelExited { generation: u64, exit: TunnelExit },

    /// A named timer fired
    TimerFired(TimerName),

    /// The browser authentication agent finished
    AgentCompleted {
        gateway: String,
        result: Result<AuthCredentials, String>,
    },

    /// The system resumed from suspend; the tunnel should re-establish
    ResumeFromSuspend,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_classification() {
        assert!(TunnelExit::Code(2).is_credential_rejected());
        assert!(!TunnelExit::Code(0).is_credential_rejected());
        assert!(!TunnelExit::Code(1).is_credential_rejected());
        assert!(!TunnelExit::Signal(15).is_credential_rejected());
        assert!(!TunnelExit::SpawnFailed.is_credential_rejected());
    }

    #[test]
    fn test_exit_display() {
        assert_eq!(TunnelExit::Code(2).to_string(), "exit code 2");
        assert_eq!(TunnelExit::Signal(9).to_string(), "signal 9");
    }
}
