//! Host service around the tunnel supervisor
//!
//! Owns the `Supervisor`, turns start/stop requests into supervisor calls,
//! forwards status events to the notifier and optionally retries failed
//! connections.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use toyvpn_proto::{AttemptId, ServiceRequest, StatusEvent};
use toyvpn_supervisor::{LinkState, Supervisor, SupervisorError, TunnelWorker};
use toyvpn_worker::TcpWorker;
use tracing::{debug, error, info, warn};

use crate::notifier::Notifier;
use crate::retry::{Backoff, RetryPolicy};
use crate::store::{ConfigError, ConfigStore};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Service is not running")]
    Stopped,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Command for the service loop
pub enum ServiceCommand {
    /// Load the stored profile and start a new attempt
    Connect(oneshot::Sender<Result<AttemptId, ServiceError>>),
    /// Tear everything down
    Disconnect,
    /// Report the current status
    Status(oneshot::Sender<ServiceStatus>),
    /// Stop the service loop
    Shutdown,
}

/// Display-friendly link state
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LinkStatus {
    Idle,
    Connecting,
    Connected,
    /// Waiting to retry after a failure
    Retrying { retry: u32, in_seconds: u64 },
}

impl std::fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkStatus::Idle => write!(f, "○ Idle"),
            LinkStatus::Connecting => write!(f, "◐ Connecting"),
            LinkStatus::Connected => write!(f, "● Connected"),
            LinkStatus::Retrying { retry, in_seconds } => {
                write!(f, "⟳ Retrying (retry {} in {}s)", retry, in_seconds)
            }
        }
    }
}

/// Status snapshot reported to the CLI
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceStatus {
    pub status: LinkStatus,
    /// Attempt that owns the live tunnel
    pub tunnel: Option<AttemptId>,
    pub interface: Option<String>,
    /// Attempt in flight
    pub pending: Option<AttemptId>,
    pub connected_since: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Cloneable front end for a running service
#[derive(Clone)]
pub struct ServiceHandle {
    commands: mpsc::Sender<ServiceCommand>,
}

impl ServiceHandle {
    pub fn new(commands: mpsc::Sender<ServiceCommand>) -> Self {
        Self { commands }
    }

    async fn send(&self, command: ServiceCommand) -> Result<(), ServiceError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ServiceError::Stopped)
    }

    pub async fn connect(&self) -> Result<AttemptId, ServiceError> {
        let (tx, rx) = oneshot::channel();
        self.send(ServiceCommand::Connect(tx)).await?;
        rx.await.map_err(|_| ServiceError::Stopped)?
    }

    pub async fn disconnect(&self) -> Result<(), ServiceError> {
        self.send(ServiceCommand::Disconnect).await
    }

    pub async fn status(&self) -> Result<ServiceStatus, ServiceError> {
        let (tx, rx) = oneshot::channel();
        self.send(ServiceCommand::Status(tx)).await?;
        rx.await.map_err(|_| ServiceError::Stopped)
    }

    pub async fn shutdown(&self) -> Result<(), ServiceError> {
        self.send(ServiceCommand::Shutdown).await
    }

    /// Dispatch a start/stop request by kind
    pub async fn request(
        &self,
        request: ServiceRequest,
    ) -> Result<Option<AttemptId>, ServiceError> {
        match request {
            ServiceRequest::Connect => self.connect().await.map(Some),
            ServiceRequest::Disconnect => self.disconnect().await.map(|_| None),
        }
    }
}

enum Step {
    Command(Option<ServiceCommand>),
    Event(StatusEvent),
    Retry,
}

/// The service loop's state
pub struct Service {
    supervisor: Supervisor,
    events: mpsc::UnboundedReceiver<StatusEvent>,
    store: ConfigStore,
    notifier: Notifier,
    backoff: Backoff,
    /// The user asked for a link and has not asked to stop
    wants_link: bool,
    retry_at: Option<Instant>,
    connected_since: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

impl Service {
    /// Service using the TCP worker
    pub fn new(store: ConfigStore, policy: RetryPolicy) -> Result<Self, SupervisorError> {
        Self::with_worker(TcpWorker::default(), store, policy)
    }

    pub fn with_worker<W: TunnelWorker>(
        worker: W,
        store: ConfigStore,
        policy: RetryPolicy,
    ) -> Result<Self, SupervisorError> {
        let (status_tx, events) = mpsc::unbounded_channel();
        Ok(Self {
            supervisor: Supervisor::new(worker, status_tx)?,
            events,
            store,
            notifier: Notifier::new(),
            backoff: Backoff::new(policy),
            wants_link: false,
            retry_at: None,
            connected_since: None,
            last_error: None,
        })
    }

    /// Spawn the loop and return a handle to it
    pub fn spawn(self) -> (ServiceHandle, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(32);
        let task = tokio::spawn(self.run(rx));
        (ServiceHandle::new(tx), task)
    }

    /// Process commands until `Shutdown` or until every sender is gone
    pub async fn run(mut self, mut commands: mpsc::Receiver<ServiceCommand>) {
        info!("Service started");

        loop {
            let retry_at = self.retry_at;
            // Events first, so a status query sees every transition reported
            // before it was asked
            let step = tokio::select! {
                biased;
                Some(event) = self.events.recv() => Step::Event(event),
                command = commands.recv() => Step::Command(command),
                _ = wait_until(retry_at) => Step::Retry,
            };

            match step {
                Step::Command(None) => {
                    debug!("Command channel closed");
                    break;
                }
                Step::Command(Some(ServiceCommand::Shutdown)) => break,
                Step::Command(Some(command)) => self.handle_command(command),
                Step::Event(event) => self.handle_event(event),
                Step::Retry => {
                    self.retry_at = None;
                    if let Err(e) = self.start_attempt() {
                        error!("Retry abandoned: {}", e);
                        self.wants_link = false;
                    }
                }
            }
        }

        self.supervisor.shutdown();
        // Report the final teardown before going away
        while let Ok(event) = self.events.try_recv() {
            self.notifier.handle(&event);
        }
        info!("Service stopped");
    }

    fn handle_command(&mut self, command: ServiceCommand) {
        match command {
            ServiceCommand::Connect(reply) => {
                self.backoff.reset();
                self.retry_at = None;
                let result = self.start_attempt();
                if let Err(e) = &result {
                    warn!("Connect rejected: {}", e);
                }
                let _ = reply.send(result);
            }
            ServiceCommand::Disconnect => {
                self.wants_link = false;
                self.retry_at = None;
                self.supervisor.disconnect();
            }
            ServiceCommand::Status(reply) => {
                let _ = reply.send(self.status());
            }
            // Handled by the loop
            ServiceCommand::Shutdown => {}
        }
    }

    fn start_attempt(&mut self) -> Result<AttemptId, ServiceError> {
        let config = self.store.load()?;
        self.wants_link = true;
        Ok(self.supervisor.connect(config))
    }

    fn handle_event(&mut self, event: StatusEvent) {
        self.notifier.handle(&event);

        match &event {
            StatusEvent::Connecting { .. } => {}
            StatusEvent::Connected { .. } => {
                self.connected_since = Some(Utc::now());
                self.last_error = None;
                self.backoff.reset();
            }
            StatusEvent::Disconnected => {
                self.connected_since = None;
                if self.wants_link {
                    self.last_error = Some("tunnel lost".to_string());
                    self.schedule_retry();
                }
            }
            StatusEvent::Failed { reason, .. } => {
                self.last_error = Some(reason.clone());
                self.schedule_retry();
            }
        }
    }

    /// Arrange the next automatic connect if the link is wanted but down
    fn schedule_retry(&mut self) {
        if !self.wants_link || !self.supervisor.state().is_idle() || self.retry_at.is_some() {
            return;
        }

        match self.backoff.next_delay() {
            Some(delay) => {
                info!(
                    "Reconnecting in {:.1}s (retry {})",
                    delay.as_secs_f64(),
                    self.backoff.attempt()
                );
                self.retry_at = Some(Instant::now() + delay);
            }
            None if self.backoff.is_enabled() => {
                warn!("Giving up after {} retries", self.backoff.attempt());
                self.wants_link = false;
            }
            None => self.wants_link = false,
        }
    }

    fn status(&self) -> ServiceStatus {
        let (status, tunnel, interface, pending) = match self.supervisor.state() {
            LinkState::Idle => match self.retry_at {
                Some(at) => (
                    LinkStatus::Retrying {
                        retry: self.backoff.attempt(),
                        in_seconds: at.saturating_duration_since(Instant::now()).as_secs(),
                    },
                    None,
                    None,
                    None,
                ),
                None => (LinkStatus::Idle, None, None, None),
            },
            LinkState::Connecting { attempt } => {
                (LinkStatus::Connecting, None, None, Some(attempt))
            }
            LinkState::Connected {
                tunnel,
                interface,
                pending,
            } => (LinkStatus::Connected, Some(tunnel), Some(interface), pending),
        };

        ServiceStatus {
            status,
            tunnel,
            interface,
            pending,
            connected_since: self.connected_since,
            last_error: self.last_error.clone(),
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.status)?;
        if let Some(interface) = &self.interface {
            write!(f, " via {}", interface)?;
        }
        if let Some(since) = &self.connected_since {
            let uptime = Utc::now().signed_duration_since(*since).num_seconds();
            write!(f, " (up {}s)", uptime.max(0))?;
        }
        if let Some(pending) = &self.pending {
            write!(f, ", attempt {} pending", pending)?;
        }
        if let Some(error) = &self.last_error {
            write!(f, "\nLast error: {}", error)?;
        }
        Ok(())
    }
}
