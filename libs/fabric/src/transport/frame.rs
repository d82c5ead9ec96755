//! Length-prefix framing shared by the stream transports.
//!
//! Each frame is a 4-byte big-endian length followed by that many bytes.

use std::future::Future;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::transport::{TransportRx, TransportTx};

/// Frames larger than this are rejected (100 MiB)
pub const MAX_FRAME_LEN: usize = 100 * 1024 * 1024;

fn map_eof(e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        Error::ConnectionClosed
    } else {
        e.into()
    }
}

async fn with_timeout<T>(
    timeout: Option<Duration>,
    what: &'static str,
    op: impl Future<Output = Result<T>>,
) -> Result<T> {
    match timeout {
        Some(timeout) => tokio::time::timeout(timeout, op)
            .await
            .map_err(|_| Error::Timeout(what))?,
        None => op.await,
    }
}

/// Write one frame
pub async fn write_frame<W>(writer: &mut W, bytes: &[u8], timeout: Option<Duration>) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(bytes.len())
        .ok()
        .filter(|len| *len as usize <= MAX_FRAME_LEN)
        .ok_or_else(|| Error::InvalidFrame(format!("Message too large: {} bytes", bytes.len())))?;

    with_timeout(timeout, "Send", async {
        writer.write_u32(len).await?;
        writer.write_all(bytes).await?;
        writer.flush().await?;
        Ok(())
    })
    .await
}

/// Read one frame.
///
/// Waits as long as the peer stays silent; liveness is the broker's and the
/// heartbeat's concern, not the framing's.
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32().await.map_err(map_eof)? as usize;

    if len > MAX_FRAME_LEN {
        return Err(Error::InvalidFrame(format!(
            "Message too large: {} bytes",
            len
        )));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await.map_err(map_eof)?;
    Ok(buf)
}

/// Open a stream, giving up after `timeout`
pub(crate) async fn dial<S>(
    timeout: Option<Duration>,
    connect: impl Future<Output = std::io::Result<S>>,
) -> Result<S> {
    with_timeout(timeout, "Connect", async { Ok(connect.await?) }).await
}

/// Framed read half over any async reader
pub struct FramedRx<R> {
    reader: R,
}

impl<R: AsyncRead + Unpin + Send> FramedRx<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }
}

#[async_trait::async_trait]
impl<R: AsyncRead + Unpin + Send> TransportRx for FramedRx<R> {
    async fn receive(&mut self) -> Result<Vec<u8>> {
        read_frame(&mut self.reader).await
    }
}

/// Framed write half over any async writer
pub struct FramedTx<W> {
    writer: W,
    send_timeout: Option<Duration>,
}

impl<W: AsyncWrite + Unpin + Send> FramedTx<W> {
    pub fn new(writer: W, send_timeout: Option<Duration>) -> Self {
        Self {
            writer,
            send_timeout,
        }
    }
}

#[async_trait::async_trait]
impl<W: AsyncWrite + Unpin + Send> TransportTx for FramedTx<W> {
    async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        write_frame(&mut self.writer, bytes, self.send_timeout).await
    }

    async fn close(&mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}
