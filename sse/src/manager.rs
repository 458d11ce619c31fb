use crate::cluster_link::{ClusterLink, Command};
use crate::codec::Message;
use crate::connection::{ConnectionId, ConnectionInfo, ConnectionRegistry};
use crate::error::{BoxError, Error, ErrorKind};
use crate::rooms::{IntoRoomNames, RoomRegistry};
use crate::stream::{frame_stream, FrameStream};
use log::*;
use serde_json::Value;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Interval between keep-alive comments on idle connections; `None` disables them.
    pub heartbeat_interval: Option<Duration>,
    /// Join every connection to a room named after its own id.
    pub implicit_room: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Some(Duration::from_secs(15)),
            implicit_room: true,
        }
    }
}

/// Connection lifecycle callbacks. Errors are logged and swallowed; they
/// never interrupt registry bookkeeping.
pub trait ConnectionHook: Send + Sync {
    fn on_connect(&self, _connection: &ConnectionInfo) -> Result<(), BoxError> {
        Ok(())
    }

    fn on_disconnect(&self, _connection: &ConnectionInfo) -> Result<(), BoxError> {
        Ok(())
    }
}

/// Lifecycle notifications, used by the bounded wait helpers.
#[derive(Debug, Clone, PartialEq)]
pub enum Lifecycle {
    Connected(ConnectionId),
    Disconnected(ConnectionId),
}

/// Entry point for connection, room, and cross-node operations.
pub struct Manager {
    registry: ConnectionRegistry,
    rooms: RoomRegistry,
    hooks: Vec<Arc<dyn ConnectionHook>>,
    config: ManagerConfig,
    lifecycle: broadcast::Sender<Lifecycle>,
    pub(crate) cluster: RwLock<Option<ClusterLink>>,
}

impl Manager {
    pub fn new(config: ManagerConfig) -> Self {
        let (lifecycle, _) = broadcast::channel(256);
        Self {
            registry: ConnectionRegistry::new(),
            rooms: RoomRegistry::new(),
            hooks: Vec::new(),
            config,
            lifecycle,
            cluster: RwLock::new(None),
        }
    }

    /// Register a lifecycle hook. Hooks run in registration order.
    pub fn with_hook(mut self, hook: Arc<dyn ConnectionHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Open a new connection and return its handle together with the frame
    /// stream that feeds the response body. Dropping the stream closes the
    /// connection.
    pub fn open(self: &Arc<Self>, context: Value) -> (ConnectionHandle, FrameStream) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let connection_id = self.registry.register(sender, context);

        if self.config.implicit_room {
            self.join_room(&connection_id, connection_id.as_str());
        }

        // Registered a moment ago; only a racing close could remove it
        let closed = self
            .registry
            .closed_token(&connection_id)
            .unwrap_or_else(|| {
                let token = CancellationToken::new();
                token.cancel();
                token
            });

        if let Some(info) = self.registry.get(&connection_id) {
            for hook in &self.hooks {
                if let Err(e) = hook.on_connect(&info) {
                    warn!("on_connect hook failed for connection {connection_id}: {e}");
                }
            }
        }
        let _ = self
            .lifecycle
            .send(Lifecycle::Connected(connection_id.clone()));
        info!("Registered new SSE connection {connection_id}");

        let stream = frame_stream(
            receiver,
            self.config.heartbeat_interval,
            connection_id.clone(),
            Arc::downgrade(self),
        );
        let handle = ConnectionHandle {
            connection_id,
            manager: Arc::clone(self),
            closed,
        };
        (handle, stream)
    }

    /// Close a connection. Only the first close of an id does any work:
    /// rooms are left, hooks run once, and `true` is returned.
    pub fn close(&self, connection_id: &ConnectionId) -> bool {
        let Some(info) = self.registry.close(connection_id) else {
            return false;
        };

        let emptied = self.rooms.leave_all(connection_id, info.rooms.iter().cloned());
        self.send_cluster(emptied.into_iter().map(Command::Unsubscribe));

        for hook in &self.hooks {
            if let Err(e) = hook.on_disconnect(&info) {
                warn!("on_disconnect hook failed for connection {connection_id}: {e}");
            }
        }
        let _ = self
            .lifecycle
            .send(Lifecycle::Disconnected(connection_id.clone()));
        info!("Unregistered SSE connection {connection_id}");
        true
    }

    pub fn send(&self, connection_id: &ConnectionId, message: &Message) -> bool {
        self.registry.send(connection_id, message)
    }

    pub fn broadcast(
        &self,
        message: &Message,
        predicate: Option<&dyn Fn(&ConnectionInfo) -> bool>,
    ) -> usize {
        self.registry.broadcast(message, predicate)
    }

    pub fn connection(&self, connection_id: &ConnectionId) -> Option<ConnectionInfo> {
        self.registry.get(connection_id)
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.registry.connections()
    }

    pub fn connection_count(&self) -> usize {
        self.registry.connection_count()
    }

    pub fn is_open(&self, connection_id: &ConnectionId) -> bool {
        self.registry.contains(connection_id)
    }

    pub fn set_context(&self, connection_id: &ConnectionId, context: Value) -> bool {
        self.registry.set_context(connection_id, context)
    }

    pub fn context(&self, connection_id: &ConnectionId) -> Option<Value> {
        self.registry.get(connection_id).map(|info| info.context)
    }

    /// Join one or more rooms. Returns `false` when the connection is not open.
    pub fn join_room(&self, connection_id: &ConnectionId, rooms: impl IntoRoomNames) -> bool {
        let names = rooms.into_room_names();
        let created = self.registry.update(connection_id, |connection| {
            connection.rooms.extend(names.iter().cloned());
            self.rooms.join(connection_id, &names)
        });

        match created {
            Some(created) => {
                self.send_cluster(created.into_iter().map(Command::Subscribe));
                true
            }
            None => false,
        }
    }

    /// Returns `true` when the connection was a member of `room`.
    pub fn leave_room(&self, connection_id: &ConnectionId, room: &str) -> bool {
        let left = self.registry.update(connection_id, |connection| {
            connection.rooms.remove(room);
            self.rooms.leave(connection_id, room)
        });

        match left {
            Some((was_member, emptied)) => {
                if emptied {
                    self.send_cluster([Command::Unsubscribe(room.to_string())]);
                }
                was_member
            }
            None => false,
        }
    }

    /// Deliver `message` once to every connection in any of `rooms`, except
    /// the ids in `except`, then forward it to other nodes when a cluster
    /// adapter is attached. Returns the number of local successful sends.
    pub fn broadcast_to_room(
        &self,
        rooms: impl IntoRoomNames,
        message: &Message,
        except: &[ConnectionId],
    ) -> usize {
        let names = rooms.into_room_names();
        let delivered = self.deliver_to_rooms(&names, message, except);

        // Local delivery first, then the rest of the cluster
        let wire = cluster::WireMessage::from(message);
        self.send_cluster(
            names
                .into_iter()
                .map(|room| Command::Publish(room, wire.clone())),
        );

        delivered
    }

    /// Local-only room delivery, also used for messages arriving from other nodes.
    pub(crate) fn deliver_to_rooms(
        &self,
        names: &[String],
        message: &Message,
        except: &[ConnectionId],
    ) -> usize {
        let frame = match message.encode() {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Refusing to broadcast event to rooms {names:?}: {e}");
                return 0;
            }
        };

        let mut members = self.rooms.members_of_any(names);
        for id in except {
            members.remove(id);
        }

        members
            .iter()
            .filter(|id| self.registry.send_frame(id, frame.clone()))
            .count()
    }

    pub fn connections_in_room(&self, room: &str) -> Vec<ConnectionId> {
        self.rooms.members(room)
    }

    pub fn connection_count_in_room(&self, room: &str) -> usize {
        self.rooms.member_count(room)
    }

    pub fn rooms_of(&self, connection_id: &ConnectionId) -> Vec<String> {
        self.registry
            .get(connection_id)
            .map(|info| info.rooms)
            .unwrap_or_default()
    }

    pub fn room_names(&self) -> Vec<String> {
        self.rooms.names()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.room_count()
    }

    /// Wait for the next connection to open.
    pub async fn wait_for_connection(&self, timeout: Duration) -> Result<ConnectionId, Error> {
        let mut lifecycle = self.lifecycle.subscribe();
        let wait = async {
            loop {
                match lifecycle.recv().await {
                    Ok(Lifecycle::Connected(id)) => return Some(id),
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(Some(id)) => Ok(id),
            Ok(None) => Err(Error::new(ErrorKind::Other(
                "lifecycle channel closed".to_string(),
            ))),
            Err(_) => Err(Error::timeout(format!("a connection after {timeout:?}"))),
        }
    }

    /// Wait until `connection_id` is closed. Returns immediately when it is
    /// already closed or unknown.
    pub async fn wait_for_disconnection(
        &self,
        connection_id: &ConnectionId,
        timeout: Duration,
    ) -> Result<(), Error> {
        let mut lifecycle = self.lifecycle.subscribe();
        if !self.registry.contains(connection_id) {
            return Ok(());
        }

        let wait = async {
            loop {
                match lifecycle.recv().await {
                    Ok(Lifecycle::Disconnected(id)) if &id == connection_id => return,
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        if !self.registry.contains(connection_id) {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        };

        tokio::time::timeout(timeout, wait).await.map_err(|_| {
            Error::timeout(format!(
                "connection {connection_id} to close after {timeout:?}"
            ))
        })
    }
}

impl Default for Manager {
    fn default() -> Self {
        Self::new(ManagerConfig::default())
    }
}

/// Application-facing handle to one open connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    connection_id: ConnectionId,
    manager: Arc<Manager>,
    closed: CancellationToken,
}

impl ConnectionHandle {
    pub fn id(&self) -> &ConnectionId {
        &self.connection_id
    }

    pub fn manager(&self) -> &Arc<Manager> {
        &self.manager
    }

    pub fn info(&self) -> Option<ConnectionInfo> {
        self.manager.connection(&self.connection_id)
    }

    pub fn send(&self, message: &Message) -> bool {
        self.manager.send(&self.connection_id, message)
    }

    pub fn join(&self, rooms: impl IntoRoomNames) -> bool {
        self.manager.join_room(&self.connection_id, rooms)
    }

    pub fn leave(&self, room: &str) -> bool {
        self.manager.leave_room(&self.connection_id, room)
    }

    pub fn rooms(&self) -> Vec<String> {
        self.manager.rooms_of(&self.connection_id)
    }

    pub fn set_context(&self, context: Value) -> bool {
        self.manager.set_context(&self.connection_id, context)
    }

    pub fn context(&self) -> Option<Value> {
        self.manager.context(&self.connection_id)
    }

    pub fn is_open(&self) -> bool {
        !self.closed.is_cancelled()
    }

    pub fn close(&self) -> bool {
        self.manager.close(&self.connection_id)
    }

    /// Resolves once the connection is closed by either side.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}
