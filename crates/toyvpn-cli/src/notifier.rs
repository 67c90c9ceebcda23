//! User-facing notifications
//!
//! Mirrors a mobile VPN service's UI: a persistent "foreground" status line
//! that is replaced as the link changes, plus one-off messages for failures.

use toyvpn_proto::StatusEvent;
use tracing::{info, warn};

#[derive(Debug, Default)]
pub struct Notifier {
    /// Line for the live tunnel
    live: Option<String>,
    /// Line for an attempt in flight, shown over `live`
    connecting: Option<String>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current persistent status line, if the service is active
    pub fn foreground(&self) -> Option<&str> {
        self.connecting.as_deref().or(self.live.as_deref())
    }

    pub fn handle(&mut self, event: &StatusEvent) {
        match event {
            StatusEvent::Connecting { .. } => {
                self.connecting = Some(event.to_string());
            }
            StatusEvent::Connected { .. } => {
                self.connecting = None;
                self.live = Some(event.to_string());
            }
            StatusEvent::Disconnected => {
                self.connecting = None;
                self.live = None;
            }
            StatusEvent::Failed { .. } => {
                warn!(target: "toyvpn::notify", status = event.label(), "{}", event);
                self.connecting = None;
                return;
            }
        }
        info!(target: "toyvpn::notify", status = event.label(), "{}", event);
    }
}
