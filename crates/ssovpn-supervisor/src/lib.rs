//! SSO-VPN connection supervisor - core library
//!
//! The supervisor keeps a corporate SSL-VPN tunnel alive on behalf of a host
//! network-management daemon: it owns the tunnel subprocess lifecycle, decides
//! when the session cookie is stale versus reusable, and drives a bounded,
//! timer-based retry and re-authentication loop on a single control task.
//!
//! All components funnel their completions into one event queue consumed by
//! the connection state machine; the state machine answers with a list of
//! actions the runtime driver executes. Nothing here blocks the control task.

pub mod agent;
pub mod config;
pub mod driver;
pub mod error;
pub mod event;
pub mod machine;
pub mod process;
pub mod timer;

pub use agent::{AuthAgent, AuthCredentials};
pub use config::ServiceConfig;
pub use driver::{Supervisor, SupervisorHandle};
pub use error::SupervisorError;
pub use event::{Event, EventSender, TimerName, TunnelExit};
pub use machine::{Action, RetryLedger, Session, StartingPhase, SupervisorContext};
pub use process::{TunnelProcess, TunnelSettings};
pub use timer::TimerRegistry;
