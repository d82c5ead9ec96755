use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{UnixListener, UnixStream};
use tracing::debug;

use crate::error::Result;
use crate::transport::frame::{dial, read_frame, write_frame, FramedRx, FramedTx};
use crate::transport::{Transport, TransportListener, TransportRx, TransportTx};

/// Length-prefixed frames over a Unix domain socket
pub struct UnixTransport {
    stream: UnixStream,
    send_timeout: Option<Duration>,
}

impl UnixTransport {
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        Self::builder(path).connect().await
    }

    /// Dial the socket at `path` with deadlines
    pub fn builder(path: impl AsRef<Path>) -> UnixTransportBuilder {
        UnixTransportBuilder {
            path: path.as_ref().to_path_buf(),
            connect_timeout: None,
            send_timeout: None,
        }
    }
}

#[async_trait::async_trait]
impl Transport for UnixTransport {
    async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        write_frame(&mut self.stream, bytes, self.send_timeout).await
    }

    async fn receive(&mut self) -> Result<Vec<u8>> {
        read_frame(&mut self.stream).await
    }

    async fn close(&mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }

    fn split(self: Box<Self>) -> (Box<dyn TransportRx>, Box<dyn TransportTx>) {
        let this = *self;
        let (reader, writer) = this.stream.into_split();
        (
            Box::new(FramedRx::new(reader)),
            Box::new(FramedTx::new(writer, this.send_timeout)),
        )
    }
}

/// Accepts broker ports on a socket file, which it owns until dropped
pub struct UnixTransportListener {
    listener: UnixListener,
    path: PathBuf,
}

impl UnixTransportListener {
    pub async fn bind(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        // Left behind by a previous run that did not shut down cleanly
        if path.exists() {
            debug!(path = %path.display(), "removing stale socket");
            std::fs::remove_file(&path)?;
        }

        let listener = UnixListener::bind(&path)?;
        Ok(Self { listener, path })
    }
}

impl Drop for UnixTransportListener {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!(path = %self.path.display(), error = %e, "could not remove socket");
            }
        }
    }
}

#[async_trait::async_trait]
impl TransportListener for UnixTransportListener {
    type Transport = UnixTransport;

    async fn accept(&self) -> Result<UnixTransport> {
        let (stream, _) = self.listener.accept().await?;
        Ok(UnixTransport {
            stream,
            send_timeout: None,
        })
    }

    async fn close(&mut self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

/// Deadlines for dialing a [`UnixTransport`]
pub struct UnixTransportBuilder {
    path: PathBuf,
    connect_timeout: Option<Duration>,
    send_timeout: Option<Duration>,
}

impl UnixTransportBuilder {
    /// Give up on the dial after `timeout`; `None` waits indefinitely
    pub fn connect_timeout(mut self, timeout: impl Into<Option<Duration>>) -> Self {
        self.connect_timeout = timeout.into();
        self
    }

    /// Bound every frame write on the resulting transport
    pub fn send_timeout(mut self, timeout: impl Into<Option<Duration>>) -> Self {
        self.send_timeout = timeout.into();
        self
    }

    pub async fn connect(self) -> Result<UnixTransport> {
        let stream = dial(self.connect_timeout, UnixStream::connect(&self.path)).await?;
        debug!(path = %self.path.display(), "connected over unix socket");
        Ok(UnixTransport {
            stream,
            send_timeout: self.send_timeout,
        })
    }
}
