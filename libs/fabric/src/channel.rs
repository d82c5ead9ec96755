use serde::{Deserialize, Serialize};

use crate::codec::Codec;
use crate::error::Result;
use crate::transport::{Transport, TransportRx, TransportTx};

/// Typed messages over one transport.
///
/// Split it once reads and writes need to run on different tasks.
pub struct Channel<C> {
    transport: Box<dyn Transport>,
    codec: C,
}

impl<C: Codec> Channel<C> {
    /// Create a channel from an existing transport
    pub fn from_transport(transport: impl Transport + 'static, codec: C) -> Self {
        Self {
            transport: Box::new(transport),
            codec,
        }
    }

    /// Send a message over the channel
    pub async fn send<T: Serialize>(&mut self, message: &T) -> Result<()> {
        let bytes = self.codec.encode(message)?;
        self.transport.send(&bytes).await
    }

    /// Receive a message from the channel
    pub async fn receive<T: for<'de> Deserialize<'de>>(&mut self) -> Result<T> {
        let bytes = self.transport.receive().await?;
        self.codec.decode(&bytes)
    }
}

impl<C: Codec + Clone> Channel<C> {
    /// Split into a receiving and a sending half
    pub fn into_split(self) -> (ChannelRx<C>, ChannelTx<C>) {
        let (rx, tx) = self.transport.split();
        (
            ChannelRx {
                rx,
                codec: self.codec.clone(),
            },
            ChannelTx {
                tx,
                codec: self.codec,
            },
        )
    }
}

/// Receiving half of a [`Channel`]
pub struct ChannelRx<C> {
    rx: Box<dyn TransportRx>,
    codec: C,
}

impl<C: Codec> ChannelRx<C> {
    /// Receive raw frame bytes without decoding
    pub async fn receive_bytes(&mut self) -> Result<Vec<u8>> {
        self.rx.receive().await
    }

    /// Decode a frame previously obtained from [`receive_bytes`](Self::receive_bytes)
    pub fn decode<T: for<'de> Deserialize<'de>>(&self, bytes: &[u8]) -> Result<T> {
        self.codec.decode(bytes)
    }

    /// Receive and decode a message
    pub async fn receive<T: for<'de> Deserialize<'de>>(&mut self) -> Result<T> {
        let bytes = self.rx.receive().await?;
        self.codec.decode(&bytes)
    }
}

/// Sending half of a [`Channel`]
pub struct ChannelTx<C> {
    tx: Box<dyn TransportTx>,
    codec: C,
}

impl<C: Codec> ChannelTx<C> {
    /// Encode and send a message
    pub async fn send<T: Serialize>(&mut self, message: &T) -> Result<()> {
        let bytes = self.codec.encode(message)?;
        self.tx.send(&bytes).await
    }

    /// Close the sending direction
    pub async fn close(&mut self) -> Result<()> {
        self.tx.close().await
    }
}
