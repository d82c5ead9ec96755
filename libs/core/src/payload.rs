//! Typed payloads of the broker's system envelopes.
//!
//! These travel in the envelope's `data` field and use camelCase field names
//! on the wire.

use serde::{Deserialize, Serialize};

/// `REGISTERED`: sent to a client once its name is claimed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registered {
    pub name: String,
    pub clients: Vec<String>,
}

/// `CLIENT_JOINED` / `CLIENT_LEFT`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Membership {
    pub name: String,
    pub total_clients: usize,
}

/// `DISCONNECTED`: the broker dropped this client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Disconnected {
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub name: String,
    pub connected_at: i64,
    pub message_count: u64,
}

/// `CLIENT_LIST`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientList {
    pub clients: Vec<ClientInfo>,
    pub total: usize,
}

impl ClientList {
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.clients.iter().map(|c| c.name.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names().any(|n| n == name)
    }
}

/// `STATS`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    /// Messages routed since broker start
    pub total_messages: u64,
    /// Registrations since broker start
    pub total_clients: u64,
    pub current_clients: usize,
    /// Milliseconds since broker start
    pub uptime: u64,
    pub start_time: i64,
}

/// `BROADCAST_ACK`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastAck {
    pub delivered: usize,
    pub failed: usize,
}
