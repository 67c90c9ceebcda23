//! Tunnel connection supervisor
//!
//! Every slot transition happens under one mutex: connect (attempt to
//! attempt), establishment (attempt to tunnel, tunnel to tunnel) and
//! disconnect (both slots to empty). Values leaving a slot are dropped after
//! the lock is released; dropping them cancels their worker and closes their
//! interface (see [`crate::slots`]).

use crate::interface::{close_quietly, TunnelInterface};
use crate::slots::{ConnectionAttempt, Slots};
use crate::status::StatusSink;
use crate::worker::{AttemptContext, Establisher, TunnelWorker, WorkerError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use toyvpn_proto::{AttemptId, ConnectionConfig, StatusEvent};
use tracing::{debug, info, warn};

/// Supervisor errors
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("No tokio runtime available to run tunnel workers")]
    NoRuntime,
}

/// Outcome of reporting an established interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandOff {
    /// The interface is now the live tunnel
    Installed,
    /// The attempt was superseded or cancelled; the interface was closed
    Stale,
}

/// Snapshot of the supervisor's lifecycle state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Connecting {
        attempt: AttemptId,
    },
    Connected {
        tunnel: AttemptId,
        interface: String,
        /// A newer attempt that may replace the tunnel once it establishes
        pending: Option<AttemptId>,
    },
}

impl LinkState {
    pub fn is_idle(&self) -> bool {
        matches!(self, LinkState::Idle)
    }
}

/// State shared between the supervisor and its workers' establishers
pub(crate) struct Shared {
    slots: Mutex<Slots>,
    status: Arc<dyn StatusSink>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Slots> {
        // A panic while holding the lock cannot leave a slot half-written:
        // every transition is a single take/replace.
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn on_established(
        &self,
        attempt: AttemptId,
        interface: Box<dyn TunnelInterface>,
    ) -> HandOff {
        let mut slots = self.lock();

        let Some(pending) = slots.take_attempt_if(attempt) else {
            drop(slots);
            debug!(attempt = %attempt, "Stale establishment, closing interface");
            close_quietly(interface);
            return HandOff::Stale;
        };

        let interface_name = interface.name().to_string();
        let previous = slots.tunnel.replace(pending.into_tunnel(interface));
        self.status.notify(StatusEvent::Connected {
            attempt,
            interface: interface_name.clone(),
        });
        drop(slots);

        info!(attempt = %attempt, interface = %interface_name, "Tunnel established");
        if let Some(previous) = previous {
            info!(attempt = %previous.id(), "Retiring superseded tunnel");
            drop(previous);
        }
        HandOff::Installed
    }

    fn on_worker_exit(&self, attempt: AttemptId, result: Result<(), WorkerError>) {
        let mut slots = self.lock();

        if let Some(failed) = slots.take_attempt_if(attempt) {
            let reason = match &result {
                Ok(()) => "worker exited before establishing".to_string(),
                Err(e) => e.to_string(),
            };
            self.status.notify(StatusEvent::Failed {
                attempt,
                reason: reason.clone(),
            });
            drop(slots);
            warn!(attempt = %attempt, "Connection attempt failed: {}", reason);
            drop(failed);
        } else if let Some(lost) = slots.take_tunnel_if(attempt) {
            self.status.notify(StatusEvent::Disconnected);
            drop(slots);
            match &result {
                Ok(()) => info!(attempt = %attempt, "Tunnel worker exited, tunnel closed"),
                Err(e) => warn!(attempt = %attempt, "Tunnel lost: {}", e),
            }
            drop(lost);
        } else {
            drop(slots);
            match result {
                Ok(()) | Err(WorkerError::Cancelled) => {
                    debug!(attempt = %attempt, "Retired worker exited")
                }
                Err(e) => debug!(attempt = %attempt, "Retired worker exited with error: {}", e),
            }
        }
    }

    fn disconnect(&self) {
        let mut slots = self.lock();
        let attempt = slots.attempt.take();
        let tunnel = slots.tunnel.take();
        self.status.notify(StatusEvent::Disconnected);
        drop(slots);

        match (&attempt, &tunnel) {
            (None, None) => debug!("Disconnect requested while idle"),
            _ => info!(
                attempt = ?attempt.as_ref().map(ConnectionAttempt::id),
                tunnel = ?tunnel.as_ref().map(|t| t.id()),
                "Disconnecting"
            ),
        }
        drop(attempt);
        drop(tunnel);
    }

    fn state(&self) -> LinkState {
        let slots = self.lock();
        match (&slots.attempt, &slots.tunnel) {
            (None, None) => LinkState::Idle,
            (Some(attempt), None) => LinkState::Connecting {
                attempt: attempt.id(),
            },
            (pending, Some(tunnel)) => LinkState::Connected {
                tunnel: tunnel.id(),
                interface: tunnel.interface_name().to_string(),
                pending: pending.as_ref().map(ConnectionAttempt::id),
            },
        }
    }
}

/// Supervisor for a single logical VPN tunnel
///
/// `connect`, `disconnect` and `on_established` are synchronous and never wait
/// for a worker; they may be called concurrently from any thread. Dropping the
/// supervisor tears down whatever it still holds.
pub struct Supervisor {
    shared: Arc<Shared>,
    worker: Arc<dyn TunnelWorker>,
    runtime: Handle,
}

impl Supervisor {
    /// Create a supervisor that spawns workers on the current tokio runtime
    pub fn new<W, S>(worker: W, status: S) -> Result<Self, SupervisorError>
    where
        W: TunnelWorker,
        S: StatusSink,
    {
        let runtime = Handle::try_current().map_err(|_| SupervisorError::NoRuntime)?;
        Ok(Self::with_runtime(Arc::new(worker), Arc::new(status), runtime))
    }

    /// Create a supervisor that spawns workers on `runtime`
    pub fn with_runtime(
        worker: Arc<dyn TunnelWorker>,
        status: Arc<dyn StatusSink>,
        runtime: Handle,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                slots: Mutex::new(Slots::new()),
                status,
            }),
            worker,
            runtime,
        }
    }

    /// Start a new attempt, superseding any attempt still in flight.
    ///
    /// A live tunnel stays up until the new attempt establishes or
    /// `disconnect` is called.
    pub fn connect(&self, config: ConnectionConfig) -> AttemptId {
        let config = Arc::new(config);
        let mut slots = self.shared.lock();

        let attempt = slots.allocate_id();
        let cancel = CancellationToken::new();
        let ctx = AttemptContext {
            attempt,
            config: config.clone(),
            cancel: cancel.clone(),
            establisher: Establisher::new(attempt, Arc::downgrade(&self.shared)),
        };

        // The worker cannot report back before the slot is filled: reporting
        // needs this lock.
        let worker = self.worker.clone();
        let shared = Arc::downgrade(&self.shared);
        let task = self.runtime.spawn(async move {
            let result = worker.run(ctx).await;
            if let Some(shared) = shared.upgrade() {
                shared.on_worker_exit(attempt, result);
            }
        });

        let superseded = slots
            .attempt
            .replace(ConnectionAttempt::new(attempt, cancel, task));
        self.shared.status.notify(StatusEvent::Connecting { attempt });
        drop(slots);

        info!(
            attempt = %attempt,
            server = %config.server_endpoint(),
            "Starting connection attempt"
        );
        if let Some(superseded) = superseded {
            info!(attempt = %superseded.id(), "Superseding connection attempt");
            drop(superseded);
        }
        attempt
    }

    /// Report that `attempt` negotiated `interface`.
    ///
    /// Workers normally go through their [`Establisher`]; this is the same
    /// hand-off for callers that track attempt ids themselves.
    pub fn on_established(
        &self,
        attempt: AttemptId,
        interface: Box<dyn TunnelInterface>,
    ) -> HandOff {
        self.shared.on_established(attempt, interface)
    }

    /// Cancel any attempt and tear down any live tunnel. Idempotent.
    pub fn disconnect(&self) {
        self.shared.disconnect();
    }

    /// Final teardown when the host service stops
    pub fn shutdown(&self) {
        info!("Supervisor shutting down");
        self.shared.disconnect();
    }

    pub fn state(&self) -> LinkState {
        self.shared.state()
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        let slots = self.shared.lock();
        let busy = slots.attempt.is_some() || slots.tunnel.is_some();
        drop(slots);
        if busy {
            self.shared.disconnect();
        }
    }
}
