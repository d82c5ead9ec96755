//! Per-connection plumbing between a port and the broker loop.

use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use courier_core::{Envelope, ErrorCode, RequestId};
use courier_fabric::codec::JsonCodec;
use courier_fabric::{ChannelRx, ChannelTx};

use crate::broker::{Event, NAME_REQUIRED};

/// Broker-local identity of one port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Write side of a client's port, owned by the broker loop
pub(crate) struct Port {
    tx: ChannelTx<JsonCodec>,
    write_timeout: Option<Duration>,
    /// Name this connection registered under, if any
    pub(crate) name: Option<String>,
}

impl Port {
    pub(crate) fn new(tx: ChannelTx<JsonCodec>, write_timeout: Option<Duration>) -> Self {
        Self {
            tx,
            write_timeout,
            name: None,
        }
    }

    pub(crate) async fn send(&mut self, envelope: &Envelope) -> courier_fabric::Result<()> {
        match self.write_timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.tx.send(envelope))
                .await
                .map_err(|_| courier_fabric::Error::Timeout("Write"))?,
            None => self.tx.send(envelope).await,
        }
    }

    pub(crate) async fn close(mut self) {
        let _ = self.tx.close().await;
    }
}

/// Rejection for a frame that did not decode as an envelope.
///
/// The frame is re-read as loose JSON so the error can still echo the
/// sender's `requestId`, and so a `REGISTER` whose name has the wrong type
/// is reported as a bad name rather than a bad message.
pub(crate) fn reject(bytes: &[u8], reason: &str) -> Event {
    let loose = serde_json::from_slice::<Value>(bytes).unwrap_or(Value::Null);
    let request_id = loose
        .get("requestId")
        .cloned()
        .and_then(|id| serde_json::from_value::<RequestId>(id).ok());

    let bad_name = loose.get("kind").and_then(Value::as_str) == Some("REGISTER")
        && loose.get("name").is_some_and(|name| !name.is_string() && !name.is_null());

    let (code, message) = if bad_name {
        (ErrorCode::InvalidClientName, NAME_REQUIRED.to_string())
    } else {
        (ErrorCode::InvalidMessage, format!("Invalid message: {}", reason))
    };

    Event::Malformed {
        code,
        message,
        request_id,
    }
}

/// Decode frames from one port and feed them to the broker loop.
///
/// Stops on transport failure, on shutdown, or when the broker is gone.
/// A full inbound queue holds this reader back, which in turn stops it
/// draining the socket.
pub(crate) async fn read_loop(
    id: ConnectionId,
    mut rx: ChannelRx<JsonCodec>,
    inbound: mpsc::Sender<(ConnectionId, Event)>,
    shutdown: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = rx.receive_bytes() => frame,
        };

        let (event, closed) = match frame {
            Ok(bytes) => match rx.decode::<Envelope>(&bytes) {
                Ok(envelope) => {
                    trace!(connection = %id, kind = ?envelope.kind, "inbound envelope");
                    (Event::Inbound(envelope), false)
                }
                Err(e) => (reject(&bytes, &e.to_string()), false),
            },
            Err(e) => {
                if e.is_disconnect() {
                    debug!(connection = %id, "port closed");
                } else {
                    debug!(connection = %id, error = %e, "port failed");
                }
                (Event::Closed, true)
            }
        };

        let sent = tokio::select! {
            _ = shutdown.cancelled() => break,
            sent = inbound.send((id, event)) => sent,
        };
        if sent.is_err() || closed {
            break;
        }
    }
}
