//! Length-prefixed packet framing
//!
//! Every packet travels as a big-endian `u16` length followed by the payload.
//! Payloads starting with a zero byte are control packets; everything else is
//! tunnelled IP traffic.

use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// First byte of every control packet
pub const CONTROL: u8 = 0;

/// Largest payload a frame can carry
pub const MAX_PAYLOAD: usize = u16::MAX as usize;

/// Write one packet
pub async fn write_packet<W>(writer: &mut W, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_PAYLOAD {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("packet of {} bytes exceeds frame limit", payload.len()),
        ));
    }

    let mut buf = BytesMut::with_capacity(2 + payload.len());
    buf.put_u16(payload.len() as u16);
    buf.put_slice(payload);
    writer.write_all(&buf).await?;
    writer.flush().await
}

/// Read one packet; `None` on a clean end of stream
pub async fn read_packet<R>(reader: &mut R) -> io::Result<Option<Bytes>>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u16().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(Bytes::from(payload)))
}

/// Build the control packet carrying the shared secret
pub fn secret_packet(secret: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(1 + secret.len());
    packet.push(CONTROL);
    packet.extend_from_slice(secret);
    packet
}

pub fn is_control(packet: &[u8]) -> bool {
    packet.first() == Some(&CONTROL)
}
