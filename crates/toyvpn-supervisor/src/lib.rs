//! Tunnel connection supervisor
//!
//! Owns the "current attempt" and "current tunnel" slots, arbitrates
//! concurrent connect/disconnect requests and hands a negotiated tunnel
//! interface over from its worker to the live slot.

pub mod interface;
pub mod slots;
pub mod status;
pub mod supervisor;
pub mod worker;

pub use interface::TunnelInterface;
pub use status::{StatusSink, TracingStatusSink};
pub use supervisor::{HandOff, LinkState, Supervisor, SupervisorError};
pub use worker::{AttemptContext, Establisher, TunnelWorker, WorkerError};

pub use toyvpn_proto::{AttemptId, ConnectionConfig, StatusEvent};
