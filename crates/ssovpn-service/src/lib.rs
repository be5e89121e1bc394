//! SSO-VPN supervisor daemon
//!
//! Binds the supervisor core to the outside world: a Unix-socket control
//! protocol for the host network-management daemon, and the helper side
//! channel the tunnel binary invokes as its configuration script.

pub mod adapter;
pub mod helper;
pub mod ipc;
