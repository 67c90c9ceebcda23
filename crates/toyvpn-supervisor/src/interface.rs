//! Tunnel-interface handle trait

use std::io;

/// Platform resource backing the virtual network interface
///
/// `close` consumes the handle, so a handle can be released at most once.
/// Whoever holds the box owns the interface: the worker until it calls
/// [`Establisher::establish`](crate::Establisher::establish), the supervisor
/// afterwards.
pub trait TunnelInterface: Send + 'static {
    /// Name used in logs and status events (e.g. `tun0`)
    fn name(&self) -> &str;

    /// Release the interface
    fn close(self: Box<Self>) -> io::Result<()>;
}

/// Close an interface on a path that must not fail
pub(crate) fn close_quietly(interface: Box<dyn TunnelInterface>) {
    let name = interface.name().to_string();
    match interface.close() {
        Ok(()) => tracing::debug!(interface = %name, "Closed tunnel interface"),
        Err(e) => tracing::warn!(interface = %name, "Closing tunnel interface failed: {}", e),
    }
}
