//! Status notification sinks

use toyvpn_proto::StatusEvent;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// Receiver of user-facing status events
///
/// Called while the supervisor holds its slot lock, so implementations must
/// return promptly and never block on the consumer. Delivery is best-effort.
#[cfg_attr(test, mockall::automock)]
pub trait StatusSink: Send + Sync + 'static {
    fn notify(&self, event: StatusEvent);
}

impl StatusSink for mpsc::UnboundedSender<StatusEvent> {
    fn notify(&self, event: StatusEvent) {
        if self.send(event).is_err() {
            debug!("Status receiver dropped, event discarded");
        }
    }
}

impl StatusSink for broadcast::Sender<StatusEvent> {
    fn notify(&self, event: StatusEvent) {
        // No subscribers is not an error.
        let _ = self.send(event);
    }
}

/// Sink that only logs events
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingStatusSink;

impl StatusSink for TracingStatusSink {
    fn notify(&self, event: StatusEvent) {
        match &event {
            StatusEvent::Failed { .. } => warn!("{}", event),
            _ => info!("{}", event),
        }
    }
}
