use crate::codec::Message;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::*;
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

/// Sending half of a connection's transport. Each item is one complete,
/// already encoded frame, so frames can never interleave.
pub type FrameSender = UnboundedSender<Bytes>;

/// Unique identifier for a connection (server-generated)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

/// For ids coming back from clients, e.g. a broadcast's `except` list.
impl From<String> for ConnectionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Read-only snapshot of an open connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub context: Value,
    pub created_at: DateTime<Utc>,
    pub rooms: Vec<String>,
}

pub(crate) struct Connection {
    pub(crate) context: Value,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) sender: FrameSender,
    /// Back-reference to the rooms this connection belongs to
    pub(crate) rooms: HashSet<String>,
    pub(crate) closed: CancellationToken,
}

impl Connection {
    fn info(&self, id: &ConnectionId) -> ConnectionInfo {
        let mut rooms: Vec<String> = self.rooms.iter().cloned().collect();
        rooms.sort();
        ConnectionInfo {
            id: id.clone(),
            context: self.context.clone(),
            created_at: self.created_at,
            rooms,
        }
    }
}

/// Registry of open streaming connections keyed by connection id.
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Connection>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
        }
    }

    /// Register a new connection - O(1)
    pub fn register(&self, sender: FrameSender, context: Value) -> ConnectionId {
        let connection_id = ConnectionId::new();

        self.connections.insert(
            connection_id.clone(),
            Connection {
                context,
                created_at: Utc::now(),
                sender,
                rooms: HashSet::new(),
                closed: CancellationToken::new(),
            },
        );

        connection_id
    }

    /// Remove a connection and drop its transport. Only the first call for a
    /// given id returns the snapshot; later calls return `None`.
    pub fn close(&self, connection_id: &ConnectionId) -> Option<ConnectionInfo> {
        let (_, connection) = self.connections.remove(connection_id)?;
        connection.closed.cancel();
        Some(connection.info(connection_id))
    }

    /// Write an already encoded frame. Returns `false` for unknown, closed, or
    /// disconnected connections.
    pub fn send_frame(&self, connection_id: &ConnectionId, frame: Bytes) -> bool {
        let Some(connection) = self.connections.get(connection_id) else {
            return false;
        };

        match connection.sender.send(frame) {
            Ok(()) => true,
            Err(_) => {
                debug!("Failed to send to connection {connection_id}: transport already closed");
                false
            }
        }
    }

    pub fn send(&self, connection_id: &ConnectionId, message: &Message) -> bool {
        match message.encode() {
            Ok(frame) => self.send_frame(connection_id, frame),
            Err(e) => {
                warn!("Refusing to send event to connection {connection_id}: {e}");
                false
            }
        }
    }

    /// Send to every connection accepted by `predicate` (all when `None`) and
    /// return the number of successful sends - O(n)
    pub fn broadcast(
        &self,
        message: &Message,
        predicate: Option<&dyn Fn(&ConnectionInfo) -> bool>,
    ) -> usize {
        let frame = match message.encode() {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Refusing to broadcast event: {e}");
                return 0;
            }
        };

        // Snapshot targets first so no shard lock is held while predicates run
        let targets: Vec<ConnectionId> = match predicate {
            Some(predicate) => self
                .connections()
                .into_iter()
                .filter(|info| predicate(info))
                .map(|info| info.id)
                .collect(),
            None => self.connections.iter().map(|e| e.key().clone()).collect(),
        };

        targets
            .iter()
            .filter(|id| self.send_frame(id, frame.clone()))
            .count()
    }

    pub fn get(&self, connection_id: &ConnectionId) -> Option<ConnectionInfo> {
        self.connections
            .get(connection_id)
            .map(|connection| connection.info(connection_id))
    }

    pub fn contains(&self, connection_id: &ConnectionId) -> bool {
        self.connections.contains_key(connection_id)
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.connections
            .iter()
            .map(|entry| entry.value().info(entry.key()))
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn set_context(&self, connection_id: &ConnectionId, context: Value) -> bool {
        self.update(connection_id, |connection| connection.context = context)
            .is_some()
    }

    pub(crate) fn closed_token(&self, connection_id: &ConnectionId) -> Option<CancellationToken> {
        self.connections
            .get(connection_id)
            .map(|connection| connection.closed.clone())
    }

    /// Run `f` while holding the connection's entry. A concurrent `close`
    /// waits until `f` returns.
    pub(crate) fn update<R>(
        &self,
        connection_id: &ConnectionId,
        f: impl FnOnce(&mut Connection) -> R,
    ) -> Option<R> {
        self.connections
            .get_mut(connection_id)
            .map(|mut connection| f(&mut connection))
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
