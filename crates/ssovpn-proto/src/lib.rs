//! SSO-VPN Control Protocol Definitions
//!
//! This crate defines the typed control-protocol surface between the host
//! network-management daemon, the tunnel helper side channel, and the
//! connection supervisor: lifecycle states, the validated connection
//! description, inbound requests and outbound notifications.

pub mod description;
pub mod messages;
pub mod state;

pub use description::{ConnectionDescription, ConnectionSecrets, DescriptionError};
pub use messages::{ConfigMap, ControlRequest, ControlResponse, Notification};
pub use state::ServiceState;
