//! Tunnel interface backed by the server connection

use crate::params::TunnelParameters;
use std::io;
use tokio::net::tcp::OwnedWriteHalf;
use toyvpn_supervisor::TunnelInterface;
use tracing::debug;

/// The outbound side of a negotiated link
///
/// Closing drops the write half, which shuts down the sending direction of
/// the TCP connection; the server then ends the session and the worker's read
/// loop sees end of stream.
pub struct TcpInterface {
    name: String,
    writer: OwnedWriteHalf,
    parameters: TunnelParameters,
}

impl TcpInterface {
    pub fn new(name: String, writer: OwnedWriteHalf, parameters: TunnelParameters) -> Self {
        Self {
            name,
            writer,
            parameters,
        }
    }

    pub fn parameters(&self) -> &TunnelParameters {
        &self.parameters
    }

    pub fn writer(&mut self) -> &mut OwnedWriteHalf {
        &mut self.writer
    }
}

impl TunnelInterface for TcpInterface {
    fn name(&self) -> &str {
        &self.name
    }

    fn close(self: Box<Self>) -> io::Result<()> {
        let peer = self.writer.peer_addr()?;
        debug!(interface = %self.name, peer = %peer, "Shutting down tunnel link");
        drop(self.writer);
        Ok(())
    }
}
