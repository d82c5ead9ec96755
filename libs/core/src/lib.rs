//! Courier Core - wire protocol shared by the broker and its clients
//!
//! Every message that crosses a port is an [`Envelope`]. Plain data messages
//! carry no [`Kind`] and are routed by `to` or `broadcast`; everything else is
//! a registration, introspection, or notification exchanged with the broker.

pub mod envelope;
pub mod error;
pub mod payload;

pub use envelope::{timestamp, Envelope, Kind, RequestId, Route};
pub use error::{Error, ErrorCode, Result};
