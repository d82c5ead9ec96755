//! Courier Fabric - Low-level transport and codec layer
//!
//! Provides transport abstractions (TCP, Unix sockets, in-memory pairs) and
//! the JSON codec for the ports between the broker and its clients.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use courier_fabric::{Channel, codec::JsonCodec, transport::TcpTransport};
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Hello { name: String }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = TcpTransport::builder("127.0.0.1:7400".parse()?)
//!     .connect_timeout(Duration::from_secs(5))
//!     .connect()
//!     .await?;
//! let channel = Channel::from_transport(transport, JsonCodec);
//!
//! // Split so one task reads while another writes
//! let (mut rx, mut tx) = channel.into_split();
//! tx.send(&Hello { name: "popup".into() }).await?;
//! let reply: Hello = rx.receive().await?;
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod codec;
pub mod error;
pub mod transport;

// Re-exports for convenience
pub use channel::{Channel, ChannelRx, ChannelTx};
pub use error::{Error, Result};
pub use transport::{MemoryTransport, Transport, TransportListener};
