//! Attempt and tunnel slots
//!
//! Both slot values retire themselves on drop: an attempt cancels its worker,
//! a tunnel cancels its worker and closes its interface. Moving a value out of
//! its slot and dropping it is therefore the only teardown path, which keeps
//! every interface closed exactly once.

use crate::interface::{close_quietly, TunnelInterface};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use toyvpn_proto::AttemptId;
use tracing::debug;

/// One in-progress negotiation
pub struct ConnectionAttempt {
    id: AttemptId,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ConnectionAttempt {
    pub fn new(id: AttemptId, cancel: CancellationToken, task: JoinHandle<()>) -> Self {
        Self {
            id,
            cancel,
            task: Some(task),
        }
    }

    pub fn id(&self) -> AttemptId {
        self.id
    }

    /// Promote into a live tunnel, keeping the worker's cancel token and task.
    pub fn into_tunnel(mut self, interface: Box<dyn TunnelInterface>) -> EstablishedTunnel {
        EstablishedTunnel {
            id: self.id,
            cancel: self.cancel.clone(),
            task: self.task.take(),
            interface: Some(interface),
        }
    }
}

impl Drop for ConnectionAttempt {
    fn drop(&mut self) {
        // A promoted attempt hands its task to the tunnel and must not cancel it.
        if self.task.is_some() {
            debug!(attempt = %self.id, "Cancelling connection attempt");
            self.cancel.cancel();
        }
    }
}

/// One live, negotiated tunnel
pub struct EstablishedTunnel {
    id: AttemptId,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    interface: Option<Box<dyn TunnelInterface>>,
}

impl EstablishedTunnel {
    pub fn id(&self) -> AttemptId {
        self.id
    }

    pub fn interface_name(&self) -> &str {
        self.interface
            .as_ref()
            .map(|interface| interface.name())
            .unwrap_or("")
    }
}

impl Drop for EstablishedTunnel {
    fn drop(&mut self) {
        let worker_running = self.task.as_ref().is_some_and(|task| !task.is_finished());
        debug!(attempt = %self.id, worker_running, "Retiring tunnel");
        self.cancel.cancel();
        if let Some(interface) = self.interface.take() {
            close_quietly(interface);
        }
    }
}

/// The supervisor's only shared mutable state
pub struct Slots {
    next_id: AttemptId,
    pub attempt: Option<ConnectionAttempt>,
    pub tunnel: Option<EstablishedTunnel>,
}

impl Slots {
    pub fn new() -> Self {
        Self {
            next_id: AttemptId::FIRST,
            attempt: None,
            tunnel: None,
        }
    }

    /// Allocate the next attempt id
    pub fn allocate_id(&mut self) -> AttemptId {
        let id = self.next_id;
        self.next_id = id.next();
        id
    }

    pub fn attempt_id(&self) -> Option<AttemptId> {
        self.attempt.as_ref().map(ConnectionAttempt::id)
    }

    pub fn tunnel_id(&self) -> Option<AttemptId> {
        self.tunnel.as_ref().map(EstablishedTunnel::id)
    }

    /// Take the attempt out of its slot if it is `id`
    pub fn take_attempt_if(&mut self, id: AttemptId) -> Option<ConnectionAttempt> {
        if self.attempt_id() == Some(id) {
            self.attempt.take()
        } else {
            None
        }
    }

    /// Take the tunnel out of its slot if it was produced by `id`
    pub fn take_tunnel_if(&mut self, id: AttemptId) -> Option<EstablishedTunnel> {
        if self.tunnel_id() == Some(id) {
            self.tunnel.take()
        } else {
            None
        }
    }
}

impl Default for Slots {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Counted {
        closes: Arc<AtomicUsize>,
    }

    impl TunnelInterface for Counted {
        fn name(&self) -> &str {
            "tun-test"
        }

        fn close(self: Box<Self>) -> io::Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn idle_task() -> JoinHandle<()> {
        tokio::spawn(async {})
    }

    #[tokio::test]
    async fn test_ids_start_at_one_and_increase() {
        let mut slots = Slots::new();
        assert_eq!(slots.allocate_id(), AttemptId(1));
        assert_eq!(slots.allocate_id(), AttemptId(2));
        assert_eq!(slots.allocate_id(), AttemptId(3));
    }

    #[tokio::test]
    async fn test_dropping_attempt_cancels_worker() {
        let token = CancellationToken::new();
        let attempt = ConnectionAttempt::new(AttemptId(1), token.clone(), idle_task());
        drop(attempt);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_promotion_keeps_worker_running() {
        let token = CancellationToken::new();
        let closes = Arc::new(AtomicUsize::new(0));
        let attempt = ConnectionAttempt::new(AttemptId(7), token.clone(), idle_task());

        let tunnel = attempt.into_tunnel(Box::new(Counted {
            closes: closes.clone(),
        }));
        assert!(!token.is_cancelled());
        assert_eq!(tunnel.id(), AttemptId(7));
        assert_eq!(tunnel.interface_name(), "tun-test");

        drop(tunnel);
        assert!(token.is_cancelled());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_take_only_matching_ids() {
        let mut slots = Slots::new();
        let id = slots.allocate_id();
        slots.attempt = Some(ConnectionAttempt::new(
            id,
            CancellationToken::new(),
            idle_task(),
        ));

        assert!(slots.take_attempt_if(id.next()).is_none());
        assert!(slots.take_tunnel_if(id).is_none());
        assert!(slots.take_attempt_if(id).is_some());
        assert!(slots.attempt.is_none());
    }
}
