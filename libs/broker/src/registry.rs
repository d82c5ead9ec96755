//! Name registry owned by the broker loop.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;

use courier_core::payload::{ClientInfo, ClientList};

use crate::connection::ConnectionId;

/// One registered client
#[derive(Debug, Clone)]
pub struct ClientRecord {
    pub name: String,
    pub connection: ConnectionId,
    /// Unix milliseconds
    pub connected_at: i64,
    pub message_count: u64,
    pub last_seen: Instant,
}

impl ClientRecord {
    pub fn new(name: impl Into<String>, connection: ConnectionId) -> Self {
        Self {
            name: name.into(),
            connection,
            connected_at: courier_core::timestamp(),
            message_count: 0,
            last_seen: Instant::now(),
        }
    }

    fn info(&self) -> ClientInfo {
        ClientInfo {
            name: self.name.clone(),
            connected_at: self.connected_at,
            message_count: self.message_count,
        }
    }
}

/// Registered clients keyed by name, iterated in name order
#[derive(Debug, Default)]
pub struct Registry {
    clients: BTreeMap<String, ClientRecord>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record, returning the previous holder of the name
    pub fn insert(&mut self, record: ClientRecord) -> Option<ClientRecord> {
        self.clients.insert(record.name.clone(), record)
    }

    pub fn remove(&mut self, name: &str) -> Option<ClientRecord> {
        self.clients.remove(name)
    }

    /// Remove `name` only if it is still held by `connection`
    pub fn remove_held_by(&mut self, name: &str, connection: ConnectionId) -> Option<ClientRecord> {
        if self.holder(name) == Some(connection) {
            self.clients.remove(name)
        } else {
            None
        }
    }

    pub fn get(&self, name: &str) -> Option<&ClientRecord> {
        self.clients.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ClientRecord> {
        self.clients.get_mut(name)
    }

    /// Connection currently holding `name`
    pub fn holder(&self, name: &str) -> Option<ConnectionId> {
        self.clients.get(name).map(|r| r.connection)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.clients.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.clients.keys().cloned().collect()
    }

    /// Names not heard from within `timeout` of `now`
    pub fn stale(&self, now: Instant, timeout: Duration) -> Vec<String> {
        self.clients
            .values()
            .filter(|r| now.saturating_duration_since(r.last_seen) > timeout)
            .map(|r| r.name.clone())
            .collect()
    }

    pub fn client_list(&self) -> ClientList {
        ClientList {
            clients: self.clients.values().map(ClientRecord::info).collect(),
            total: self.clients.len(),
        }
    }
}
