//! Client lifecycle state and the events it publishes.

/// Per-client connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Idle,
    Connecting,
    AwaitingRegistration,
    Ready,
    Disconnected,
}

impl std::fmt::Display for ClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ClientState::Idle => "idle",
            ClientState::Connecting => "connecting",
            ClientState::AwaitingRegistration => "awaiting-registration",
            ClientState::Ready => "ready",
            ClientState::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

/// Subtype of [`ClientEvent::Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A heartbeat ping failed or timed out; the client stays ready
    HeartbeatFailed,
    /// The port to the broker failed
    ChannelFailed,
    /// An uncorrelated `ERROR` arrived from the broker
    Remote,
}

/// Events published to every subscriber
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Connected { name: String, clients: Vec<String> },
    Disconnected { reason: String },
    ClientJoined { name: String, total_clients: usize },
    ClientLeft { name: String, total_clients: usize },
    Error { kind: ErrorKind, message: String },
}
