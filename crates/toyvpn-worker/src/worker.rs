//! TCP tunnel worker

use crate::frame::{self, read_packet, write_packet};
use crate::interface::TcpInterface;
use crate::params::TunnelParameters;
use crate::proxy::http_connect;
use async_trait::async_trait;
use std::time::Duration;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use toyvpn_proto::ConnectionConfig;
use toyvpn_supervisor::{AttemptContext, HandOff, TunnelWorker, WorkerError};
use tracing::{debug, info, warn};

/// Worker timing knobs
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Limit for reaching the server (or the proxy)
    pub connect_timeout: Duration,
    /// Limit for the server's answer to the secret
    pub handshake_timeout: Duration,
    /// Interface names are `<prefix><attempt>`
    pub interface_prefix: String,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            interface_prefix: "toyvpn".to_string(),
        }
    }
}

/// Worker that negotiates over a TCP connection
#[derive(Debug, Clone, Default)]
pub struct TcpWorker {
    settings: WorkerSettings,
}

impl TcpWorker {
    pub fn new(settings: WorkerSettings) -> Self {
        Self { settings }
    }

    async fn open(&self, config: &ConnectionConfig) -> Result<TcpStream, WorkerError> {
        let server = config.server_endpoint();
        let dial = match &config.proxy {
            Some(proxy) => proxy.address(),
            None => server.clone(),
        };

        let connecting = TcpStream::connect(&dial);
        let mut stream = tokio::time::timeout(self.settings.connect_timeout, connecting)
            .await
            .map_err(|_| WorkerError::Timeout(format!("connecting to {}", dial)))?
            .map_err(|e| WorkerError::ConnectionFailed(format!("{}: {}", dial, e)))?;
        stream.set_nodelay(true)?;

        if config.proxy.is_some() {
            debug!(proxy = %dial, server = %server, "Opening proxy tunnel");
            tokio::time::timeout(
                self.settings.connect_timeout,
                http_connect(&mut stream, &server),
            )
            .await
            .map_err(|_| WorkerError::Timeout(format!("proxy CONNECT to {}", server)))??;
        }

        Ok(stream)
    }

    async fn handshake(
        &self,
        stream: &mut TcpStream,
        config: &ConnectionConfig,
    ) -> Result<TunnelParameters, WorkerError> {
        write_packet(stream, &frame::secret_packet(&config.shared_secret)).await?;

        tokio::time::timeout(self.settings.handshake_timeout, read_parameters(stream))
            .await
            .map_err(|_| WorkerError::Timeout("waiting for server parameters".to_string()))?
    }

    async fn negotiate(
        &self,
        config: &ConnectionConfig,
    ) -> Result<(TcpStream, TunnelParameters), WorkerError> {
        let mut stream = self.open(config).await?;
        let parameters = self.handshake(&mut stream, config).await?;
        Ok((stream, parameters))
    }

    /// Read from the server until the link ends
    async fn serve(mut reader: OwnedReadHalf) -> Result<(), WorkerError> {
        let mut packets = 0u64;
        loop {
            match read_packet(&mut reader).await? {
                Some(packet) if frame::is_control(&packet) => {
                    debug!(len = packet.len(), "Control packet from server");
                }
                Some(_) => {
                    packets += 1;
                    if packets % 1000 == 0 {
                        debug!(packets, "Tunnel traffic");
                    }
                }
                None => {
                    return Err(WorkerError::ConnectionFailed(
                        "server closed the tunnel".to_string(),
                    ))
                }
            }
        }
    }
}

/// Wait for the server's control reply, skipping any early data packets
async fn read_parameters(stream: &mut TcpStream) -> Result<TunnelParameters, WorkerError> {
    loop {
        let Some(packet) = read_packet(stream).await? else {
            return Err(WorkerError::HandshakeFailed(
                "server closed the connection (wrong secret?)".to_string(),
            ));
        };
        if frame::is_control(&packet) {
            return TunnelParameters::parse(&packet[1..])
                .map_err(|e| WorkerError::HandshakeFailed(e.to_string()));
        }
        debug!(len = packet.len(), "Ignoring data packet before handshake");
    }
}

#[async_trait]
impl TunnelWorker for TcpWorker {
    async fn run(&self, ctx: AttemptContext) -> Result<(), WorkerError> {
        let AttemptContext {
            attempt,
            config,
            cancel,
            establisher,
        } = ctx;

        info!(attempt = %attempt, server = %config.server_endpoint(), "Negotiating tunnel");

        // Dropping the negotiation future on cancel closes the socket.
        let (stream, parameters) = tokio::select! {
            _ = cancel.cancelled() => return Err(WorkerError::Cancelled),
            negotiated = self.negotiate(&config) => negotiated?,
        };

        if !config.routing.packages().is_empty() {
            debug!(
                attempt = %attempt,
                allow_list = config.routing.is_allow_list(),
                apps = config.routing.packages().len(),
                "Per-app routing requested"
            );
        }

        let (reader, writer) = stream.into_split();
        let name = format!("{}{}", self.settings.interface_prefix, attempt.0);
        let interface = TcpInterface::new(name, writer, parameters);

        if establisher.establish(Box::new(interface)) == HandOff::Stale {
            return Err(WorkerError::Cancelled);
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(attempt = %attempt, "Tunnel worker stopping");
                Ok(())
            }
            result = Self::serve(reader) => {
                if let Err(e) = &result {
                    warn!(attempt = %attempt, "Tunnel link ended: {}", e);
                }
                result
            }
        }
    }
}
