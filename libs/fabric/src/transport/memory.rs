use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::transport::{Transport, TransportRx, TransportTx};

/// In-process transport backed by a pair of unbounded channels
///
/// Frames need no length prefix since each channel item is one frame. A send
/// fails as soon as the peer has dropped its read half, which makes a dead
/// peer observable at write time.
pub struct MemoryTransport {
    rx: MemoryRx,
    tx: MemoryTx,
}

impl MemoryTransport {
    /// Create two connected ends
    pub fn pair() -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();

        let a = Self {
            rx: MemoryRx { rx: a_rx },
            tx: MemoryTx { tx: Some(a_tx) },
        };
        let b = Self {
            rx: MemoryRx { rx: b_rx },
            tx: MemoryTx { tx: Some(b_tx) },
        };
        (a, b)
    }

    /// Split into concrete halves
    pub fn into_parts(self) -> (MemoryRx, MemoryTx) {
        (self.rx, self.tx)
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        self.tx.send(bytes).await
    }

    async fn receive(&mut self) -> Result<Vec<u8>> {
        self.rx.receive().await
    }

    async fn close(&mut self) -> Result<()> {
        self.tx.close().await
    }

    fn split(self: Box<Self>) -> (Box<dyn TransportRx>, Box<dyn TransportTx>) {
        let (rx, tx) = self.into_parts();
        (Box::new(rx), Box::new(tx))
    }
}

pub struct MemoryRx {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

#[async_trait::async_trait]
impl TransportRx for MemoryRx {
    async fn receive(&mut self) -> Result<Vec<u8>> {
        self.rx.recv().await.ok_or(Error::ConnectionClosed)
    }
}

pub struct MemoryTx {
    tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

#[async_trait::async_trait]
impl TransportTx for MemoryTx {
    async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        let tx = self.tx.as_ref().ok_or(Error::ConnectionClosed)?;
        tx.send(bytes.to_vec()).map_err(|_| Error::ConnectionClosed)
    }

    async fn close(&mut self) -> Result<()> {
        self.tx = None;
        Ok(())
    }
}
