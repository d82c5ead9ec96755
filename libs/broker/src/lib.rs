//! Courier Broker - the hub every context connects to
//!
//! Owns the registry of named clients and routes point-to-point and
//! broadcast envelopes between their ports. It knows nothing about request
//! and response semantics: correlation ids are passed through untouched.
//!
//! # Example
//!
//! ```no_run
//! use courier_broker::{Broker, BrokerConfig};
//! use courier_fabric::transport::TcpTransportListener;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = Broker::spawn(BrokerConfig::default());
//!
//! let listener = TcpTransportListener::bind("127.0.0.1:7400".parse()?).await?;
//! broker.serve(listener);
//!
//! // In-process contexts can skip the socket entirely
//! let port = broker.open_port()?;
//! # drop(port);
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod config;
pub mod connection;
pub mod error;
pub mod registry;

pub use broker::{Broker, BrokerHandle};
pub use config::BrokerConfig;
pub use connection::ConnectionId;
pub use error::{Error, Result};
