//! Reference tunnel worker
//!
//! Reaches the VPN server over TCP (optionally through an HTTP proxy),
//! authenticates with the shared secret and hands the negotiated link to the
//! supervisor as its tunnel interface.

pub mod frame;
pub mod interface;
pub mod params;
pub mod proxy;
pub mod worker;

pub use interface::TcpInterface;
pub use params::{ParamError, Route, TunnelParameters};
pub use worker::{TcpWorker, WorkerSettings};
