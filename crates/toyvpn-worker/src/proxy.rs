//! HTTP CONNECT proxy support

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use toyvpn_supervisor::WorkerError;
use tracing::debug;

/// Maximum number of headers to parse
const MAX_HEADERS: usize = 32;

/// Largest proxy response header block we accept
const MAX_RESPONSE_HEAD: usize = 8 * 1024;

/// Ask the proxy on `stream` to open a tunnel to `target` (`host:port`).
///
/// Reads the response one byte at a time so nothing past the header block is
/// consumed; the stream is positioned at the first byte from the target.
pub async fn http_connect<S>(stream: &mut S, target: &str) -> Result<(), WorkerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = format!(
        "CONNECT {target} HTTP/1.1\r\nHost: {target}\r\nProxy-Connection: keep-alive\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let mut head = Vec::with_capacity(256);
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_RESPONSE_HEAD {
            return Err(WorkerError::ProxyError(
                "response headers too large".to_string(),
            ));
        }
        let byte = stream.read_u8().await.map_err(|e| {
            WorkerError::ProxyError(format!("proxy closed before responding: {}", e))
        })?;
        head.push(byte);
    }

    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut headers);
    match response.parse(&head) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(WorkerError::ProxyError("incomplete response".to_string()))
        }
        Err(e) => {
            return Err(WorkerError::ProxyError(format!(
                "malformed response: {}",
                e
            )))
        }
    }

    match response.code {
        Some(code) if (200..300).contains(&code) => {
            debug!(target_addr = %target, "Proxy tunnel open");
            Ok(())
        }
        Some(code) => Err(WorkerError::ProxyError(format!(
            "proxy refused CONNECT to {}: {} {}",
            target,
            code,
            response.reason.unwrap_or("")
        ))),
        None => Err(WorkerError::ProxyError("missing status code".to_string())),
    }
}
