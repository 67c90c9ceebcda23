//! ToyVpn shared definitions
//!
//! Connection configuration, host requests and status events shared by the
//! supervisor, the workers and the host service.

pub mod config;
pub mod messages;

pub use config::{AppRouting, ConnectionConfig, ConnectionConfigBuilder, ProxyConfig};
pub use messages::{AttemptId, ProtoError, ServiceRequest, StatusEvent};

/// Legacy action string for a start request
pub const ACTION_CONNECT: &str = "com.aram.vpn.START";

/// Legacy action string for a stop request
pub const ACTION_DISCONNECT: &str = "com.aram.vpn.STOP";
