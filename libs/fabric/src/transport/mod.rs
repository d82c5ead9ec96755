use crate::error::Result;

pub mod frame;
pub mod memory;
pub mod tcp;
pub mod unix;

pub use self::memory::{MemoryRx, MemoryTransport, MemoryTx};
pub use self::tcp::{TcpTransport, TcpTransportBuilder, TcpTransportListener};
pub use self::unix::{UnixTransport, UnixTransportBuilder, UnixTransportListener};

/// Transport trait for sending and receiving raw bytes
///
/// Each transport instance represents a single connection. Frames are
/// delivered whole and in order.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Send bytes over the transport
    async fn send(&mut self, bytes: &[u8]) -> Result<()>;

    /// Receive bytes from the transport
    async fn receive(&mut self) -> Result<Vec<u8>>;

    /// Close the transport connection
    async fn close(&mut self) -> Result<()>;

    /// Split into independent halves so reads and writes can run on
    /// different tasks
    fn split(self: Box<Self>) -> (Box<dyn TransportRx>, Box<dyn TransportTx>);
}

/// Read half of a split transport
#[async_trait::async_trait]
pub trait TransportRx: Send {
    async fn receive(&mut self) -> Result<Vec<u8>>;
}

/// Write half of a split transport
#[async_trait::async_trait]
pub trait TransportTx: Send {
    async fn send(&mut self, bytes: &[u8]) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

/// Listener producing one transport per accepted connection
#[async_trait::async_trait]
pub trait TransportListener: Send + Sync {
    type Transport: Transport + 'static;

    async fn accept(&self) -> Result<Self::Transport>;

    async fn close(&mut self) -> Result<()>;
}
