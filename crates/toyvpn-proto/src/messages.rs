//! Host requests and status events

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors for parsing requests and validating configuration
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtoError {
    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Identifier of one connection attempt
///
/// Allocated in strictly increasing order by the supervisor, starting at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttemptId(pub u64);

impl AttemptId {
    pub const FIRST: AttemptId = AttemptId(1);

    pub fn next(self) -> AttemptId {
        AttemptId(self.0 + 1)
    }
}

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Start/stop request delivered by the host environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceRequest {
    Connect,
    Disconnect,
}

impl ServiceRequest {
    /// Map a host action string to a request.
    ///
    /// Accepts the plain names and the legacy `com.aram.vpn.*` actions.
    pub fn from_action(action: &str) -> Result<Self, ProtoError> {
        match action.trim() {
            "connect" | "start" | crate::ACTION_CONNECT => Ok(ServiceRequest::Connect),
            "disconnect" | "stop" | crate::ACTION_DISCONNECT => Ok(ServiceRequest::Disconnect),
            other => Err(ProtoError::UnknownAction(other.to_string())),
        }
    }
}

impl FromStr for ServiceRequest {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ServiceRequest::from_action(s)
    }
}

/// User-facing status notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StatusEvent {
    /// A new attempt was started
    Connecting { attempt: AttemptId },
    /// An attempt was promoted to the live tunnel
    Connected {
        attempt: AttemptId,
        interface: String,
    },
    /// The live tunnel (if any) was torn down
    Disconnected,
    /// An attempt failed before establishing
    Failed { attempt: AttemptId, reason: String },
}

impl StatusEvent {
    /// Short label shown in notifications
    pub fn label(&self) -> &'static str {
        match self {
            StatusEvent::Connecting { .. } => "connecting",
            StatusEvent::Connected { .. } => "connected",
            StatusEvent::Disconnected => "disconnected",
            StatusEvent::Failed { .. } => "failed",
        }
    }
}

impl fmt::Display for StatusEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusEvent::Connecting { attempt } => write!(f, "Connecting ({})", attempt),
            StatusEvent::Connected { attempt, interface } => {
                write!(f, "Connected via {} ({})", interface, attempt)
            }
            StatusEvent::Disconnected => write!(f, "Disconnected"),
            StatusEvent::Failed { attempt, reason } => {
                write!(f, "Connection failed ({}): {}", attempt, reason)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_from_action() {
        assert_eq!(
            ServiceRequest::from_action("connect"),
            Ok(ServiceRequest::Connect)
        );
        assert_eq!(
            ServiceRequest::from_action(crate::ACTION_CONNECT),
            Ok(ServiceRequest::Connect)
        );
        assert_eq!(
            ServiceRequest::from_action(crate::ACTION_DISCONNECT),
            Ok(ServiceRequest::Disconnect)
        );
        assert_eq!(
            " stop ".parse::<ServiceRequest>(),
            Ok(ServiceRequest::Disconnect)
        );
    }

    #[test]
    fn test_unknown_action() {
        let result = ServiceRequest::from_action("com.aram.vpn.RESTART");
        assert_eq!(
            result,
            Err(ProtoError::UnknownAction("com.aram.vpn.RESTART".to_string()))
        );
    }

    #[test]
    fn test_attempt_ids_increase() {
        let first = AttemptId::FIRST;
        assert_eq!(first.0, 1);
        assert!(first.next() > first);
        assert_eq!(first.to_string(), "#1");
    }

    #[test]
    fn test_status_event_serialization() {
        let event = StatusEvent::Connected {
            attempt: AttemptId(3),
            interface: "tun0".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(
            json,
            r#"{"event":"connected","attempt":3,"interface":"tun0"}"#
        );

        let json = serde_json::to_string(&StatusEvent::Disconnected).unwrap();
        assert_eq!(json, r#"{"event":"disconnected"}"#);
    }
}
