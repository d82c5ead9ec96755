use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, trace};

use crate::error::Result;
use crate::transport::frame::{dial, read_frame, write_frame, FramedRx, FramedTx};
use crate::transport::{Transport, TransportListener, TransportRx, TransportTx};

/// Length-prefixed frames over a TCP stream
pub struct TcpTransport {
    stream: TcpStream,
    send_timeout: Option<Duration>,
}

impl TcpTransport {
    /// Connect to `addr`, waiting as long as the OS allows
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        Self::builder(addr).connect().await
    }

    /// Dial `addr` with deadlines
    pub fn builder(addr: SocketAddr) -> TcpTransportBuilder {
        TcpTransportBuilder {
            addr,
            connect_timeout: None,
            send_timeout: None,
        }
    }

    fn from_stream(stream: TcpStream, send_timeout: Option<Duration>) -> Self {
        // Envelopes are small; don't let Nagle hold them back.
        let _ = stream.set_nodelay(true);
        Self {
            stream,
            send_timeout,
        }
    }
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
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

/// Accepts broker ports over TCP
pub struct TcpTransportListener {
    listener: TcpListener,
}

impl TcpTransportListener {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    /// Address actually bound, useful after binding port 0
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().map_err(Into::into)
    }
}

#[async_trait::async_trait]
impl TransportListener for TcpTransportListener {
    type Transport = TcpTransport;

    async fn accept(&self) -> Result<TcpTransport> {
        let (stream, peer) = self.listener.accept().await?;
        trace!(%peer, "accepted tcp connection");
        Ok(TcpTransport::from_stream(stream, None))
    }

    // The socket is released when the listener drops
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Deadlines for dialing a [`TcpTransport`]
pub struct TcpTransportBuilder {
    addr: SocketAddr,
    connect_timeout: Option<Duration>,
    send_timeout: Option<Duration>,
}

impl TcpTransportBuilder {
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

    pub async fn connect(self) -> Result<TcpTransport> {
        let stream = dial(self.connect_timeout, TcpStream::connect(self.addr)).await?;
        debug!(addr = %self.addr, "connected over tcp");
        Ok(TcpTransport::from_stream(stream, self.send_timeout))
    }
}
