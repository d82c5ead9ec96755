//! Courier Client - named endpoint on a courier broker
//!
//! A [`Client`] registers under a name, then exchanges messages with other
//! clients through the broker: request/response via [`Client::send_to`],
//! fire-and-forget via [`Client::post`], and fan-out via
//! [`Client::broadcast`]. Inbound messages are dispatched to handlers keyed
//! by the payload's `type` field.
//!
//! # Example
//!
//! ```no_run
//! use courier_broker::{Broker, BrokerConfig};
//! use courier_client::{Client, ClientConfig};
//! use serde_json::{json, Value};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = Broker::spawn(BrokerConfig::default());
//!
//! let worker = Client::new(ClientConfig::default());
//! worker.on_message("DOUBLE", |payload: Value, _from: String| async move {
//!     let n = payload["n"].as_i64().unwrap_or(0);
//!     Ok(json!({ "n": n * 2 }))
//! });
//! worker.connect("worker", broker.open_port()?).await?;
//!
//! let main = Client::default();
//! main.connect("main", broker.open_port()?).await?;
//! let reply = main.send_to("worker", json!({"type": "DOUBLE", "n": 21})).await?;
//! assert_eq!(reply["n"], 42);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod event;
pub mod handler;
mod pending;

pub use client::{Client, PingReply};
pub use config::ClientConfig;
pub use error::{Error, Result};
pub use event::{ClientEvent, ClientState, ErrorKind};
pub use handler::{HandlerResult, MessageHandler, Typed};
