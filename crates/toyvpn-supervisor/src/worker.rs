//! Tunnel worker contract

use crate::interface::{close_quietly, TunnelInterface};
use crate::supervisor::{HandOff, Shared};
use async_trait::async_trait;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use toyvpn_proto::{AttemptId, ConnectionConfig};

/// Worker errors
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Attempt cancelled")]
    Cancelled,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Proxy error: {0}")]
    ProxyError(String),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Long-running unit that negotiates and then serves one tunnel
///
/// `run` either hands an interface to `ctx.establisher` exactly once and keeps
/// running until `ctx.cancel` fires, or returns without establishing. Anything
/// allocated privately before establishing must be released when cancelled.
#[async_trait]
pub trait TunnelWorker: Send + Sync + 'static {
    async fn run(&self, ctx: AttemptContext) -> Result<(), WorkerError>;
}

/// Everything one worker run receives from the supervisor
pub struct AttemptContext {
    pub attempt: AttemptId,
    pub config: Arc<ConnectionConfig>,
    pub cancel: CancellationToken,
    pub establisher: Establisher,
}

/// One-shot completion signal for an attempt
///
/// Consumed by [`Establisher::establish`], so an attempt can report
/// establishment at most once.
pub struct Establisher {
    attempt: AttemptId,
    shared: Weak<Shared>,
}

impl Establisher {
    pub(crate) fn new(attempt: AttemptId, shared: Weak<Shared>) -> Self {
        Self { attempt, shared }
    }

    pub fn attempt(&self) -> AttemptId {
        self.attempt
    }

    /// Hand the negotiated interface over to the supervisor.
    ///
    /// Ownership of `interface` moves to the supervisor in every case. A stale
    /// attempt (superseded, disconnected, or the supervisor is gone) gets its
    /// interface closed before this returns.
    pub fn establish(self, interface: Box<dyn TunnelInterface>) -> HandOff {
        match self.shared.upgrade() {
            Some(shared) => shared.on_established(self.attempt, interface),
            None => {
                tracing::debug!(attempt = %self.attempt, "Supervisor gone, closing interface");
                close_quietly(interface);
                HandOff::Stale
            }
        }
    }
}
