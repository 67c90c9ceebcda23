//! ToyVpn host service
//!
//! Connection profile storage, the service loop around the tunnel supervisor,
//! the daemon control socket and the `toyvpn` command-line front end.

pub mod daemon;
pub mod ipc;
pub mod notifier;
pub mod retry;
pub mod service;
pub mod store;

pub use retry::RetryPolicy;
pub use service::{Service, ServiceCommand, ServiceError, ServiceHandle, ServiceStatus};
pub use store::{ConfigError, ConfigStore};
