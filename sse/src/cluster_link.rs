//! Glue between the `Manager` and a `cluster::Adapter`.
//!
//! Room creation, room removal, and room broadcasts are turned into commands
//! on one queue, and a single worker task applies them to the adapter.
//!
//! Commands are queued after the local room change, so two racing changes
//! to the same room can be queued in the opposite order. Subscribing twice
//! is harmless; an unsubscribe is only applied if the room is still empty
//! locally when the worker gets to it.

use crate::codec::Message;
use crate::error::Error;
use crate::manager::Manager;
use async_trait::async_trait;
use cluster::{Adapter, MessageHandler, WireMessage};
use log::*;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

#[derive(Debug)]
pub(crate) enum Command {
    Subscribe(String),
    Unsubscribe(String),
    Publish(String, WireMessage),
}

pub(crate) struct ClusterLink {
    commands: UnboundedSender<Command>,
    adapter: Arc<dyn Adapter>,
    worker: JoinHandle<()>,
}

impl From<&Message> for WireMessage {
    fn from(message: &Message) -> Self {
        WireMessage {
            event: message.event.clone(),
            data: message.data.clone(),
            id: message.id.clone(),
            retry: message.retry,
        }
    }
}

impl From<WireMessage> for Message {
    fn from(message: WireMessage) -> Self {
        Message {
            event: message.event,
            data: message.data,
            id: message.id,
            retry: message.retry,
        }
    }
}

/// Delivers messages from other nodes to local room members only.
struct LocalDelivery {
    manager: Weak<Manager>,
}

#[async_trait]
impl MessageHandler for LocalDelivery {
    async fn handle(&self, room: &str, message: WireMessage) {
        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        let delivered = manager.deliver_to_rooms(&[room.to_string()], &Message::from(message), &[]);
        trace!("Delivered remote broadcast for room {room} to {delivered} connection(s)");
    }
}

async fn apply_commands(
    adapter: Arc<dyn Adapter>,
    manager: Weak<Manager>,
    mut commands: UnboundedReceiver<Command>,
) {
    while let Some(command) = commands.recv().await {
        let result = match &command {
            Command::Subscribe(room) => adapter.subscribe(room).await,
            Command::Unsubscribe(room) if room_in_use(&manager, room) => {
                debug!("Room {room} was recreated, keeping its subscription");
                continue;
            }
            Command::Unsubscribe(room) => adapter.unsubscribe(room).await,
            Command::Publish(room, message) => adapter.publish(room, message).await,
        };
        if let Err(e) = result {
            warn!("Cluster command {command:?} failed: {e}");
        }
    }
}

fn room_in_use(manager: &Weak<Manager>, room: &str) -> bool {
    manager
        .upgrade()
        .is_some_and(|manager| manager.connection_count_in_room(room) > 0)
}

impl Manager {
    /// Connect `adapter` and start bridging room traffic through it. Rooms
    /// that already exist locally are subscribed right away.
    pub async fn attach_cluster(self: &Arc<Self>, adapter: Arc<dyn Adapter>) -> Result<(), Error> {
        adapter.connect().await?;
        adapter.on_message(Arc::new(LocalDelivery {
            manager: Arc::downgrade(self),
        }));

        let (commands, receiver) = mpsc::unbounded_channel();
        let worker = tokio::spawn(apply_commands(
            Arc::clone(&adapter),
            Arc::downgrade(self),
            receiver,
        ));
        let previous = self
            .cluster
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .replace(ClusterLink {
                commands,
                adapter,
                worker,
            });
        if previous.is_some() {
            warn!("Replaced an already attached cluster adapter");
        }

        // Installed first, so a room created meanwhile is subscribed twice at worst
        self.send_cluster(self.room_names().into_iter().map(Command::Subscribe));
        info!("Cluster adapter attached");
        Ok(())
    }

    /// Flush pending commands and disconnect the adapter.
    pub async fn detach_cluster(&self) -> Result<(), Error> {
        let link = self
            .cluster
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        if let Some(ClusterLink {
            commands,
            adapter,
            worker,
        }) = link
        {
            drop(commands);
            if let Err(e) = worker.await {
                warn!("Cluster worker ended abnormally: {e}");
            }
            adapter.disconnect().await?;
            info!("Cluster adapter detached");
        }
        Ok(())
    }

    pub fn is_clustered(&self) -> bool {
        self.cluster
            .read()
            .map(|link| link.is_some())
            .unwrap_or(false)
    }

    pub(crate) fn send_cluster(&self, commands: impl IntoIterator<Item = Command>) {
        let link = self.cluster.read().unwrap_or_else(|e| e.into_inner());
        let Some(link) = link.as_ref() else {
            return;
        };
        for command in commands {
            if link.commands.send(command).is_err() {
                warn!("Cluster worker is gone, dropping command");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Decoder;
    use crate::manager::ManagerConfig;
    use crate::stream::FrameStream;
    use cluster::{EnvelopeCodec, MemoryBus, NodeId};
    use futures_util::StreamExt;
    use serde_json::{json, Value};
    use std::time::Duration;

    async fn node(bus: &MemoryBus, name: &str) -> Arc<Manager> {
        let manager = Arc::new(Manager::new(ManagerConfig {
            heartbeat_interval: None,
            implicit_room: false,
        }));
        let adapter = bus.adapter(EnvelopeCodec::new(NodeId::from(name), "test:room:"));
        manager.attach_cluster(Arc::new(adapter)).await.unwrap();
        manager
    }

    async fn next_data(stream: &mut FrameStream) -> Option<String> {
        let mut decoder = Decoder::new();
        loop {
            let frame = tokio::time::timeout(Duration::from_millis(300), stream.next())
                .await
                .ok()??;
            if let Some(event) = decoder.feed_bytes(&frame).into_iter().next() {
                return Some(event.data);
            }
        }
    }

    /// Let the worker and the bus reader tasks run.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    /// Records the subscription commands that reach the transport.
    #[derive(Default)]
    struct RecordingAdapter {
        applied: std::sync::Mutex<Vec<String>>,
    }

    impl RecordingAdapter {
        fn applied(&self) -> Vec<String> {
            self.applied.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Adapter for RecordingAdapter {
        async fn connect(&self) -> Result<(), cluster::Error> {
            Ok(())
        }

        async fn disconnect(&self) -> Result<(), cluster::Error> {
            Ok(())
        }

        async fn subscribe(&self, room: &str) -> Result<(), cluster::Error> {
            self.applied.lock().unwrap().push(format!("+{room}"));
            Ok(())
        }

        async fn unsubscribe(&self, room: &str) -> Result<(), cluster::Error> {
            self.applied.lock().unwrap().push(format!("-{room}"));
            Ok(())
        }

        async fn publish(&self, _: &str, _: &WireMessage) -> Result<(), cluster::Error> {
            Ok(())
        }

        fn on_message(&self, _: Arc<dyn MessageHandler>) {}
    }

    #[test]
    fn test_wire_message_conversion_keeps_every_field() {
        let message = Message::new(json!({"a": 1}))
            .with_event("e")
            .with_id("3")
            .with_retry(10);

        assert_eq!(Message::from(WireMessage::from(&message)), message);
    }

    #[tokio::test]
    async fn test_room_broadcast_crosses_nodes() {
        let bus = MemoryBus::default();
        let node_a = node(&bus, "a").await;
        let node_b = node(&bus, "b").await;

        let (remote, mut remote_stream) = node_b.open(Value::Null);
        remote.join("lobby");
        let (local, mut local_stream) = node_a.open(Value::Null);
        local.join("lobby");
        settle().await;

        let delivered = node_a.broadcast_to_room("lobby", &Message::new("hello"), &[]);

        assert_eq!(delivered, 1);
        assert_eq!(next_data(&mut remote_stream).await.as_deref(), Some("hello"));
        assert_eq!(next_data(&mut local_stream).await.as_deref(), Some("hello"));
        // Local delivery happened once; the echo from the bus is ignored
        assert_eq!(next_data(&mut local_stream).await, None);
    }

    #[tokio::test]
    async fn test_remote_node_without_members_receives_nothing() {
        let bus = MemoryBus::default();
        let node_a = node(&bus, "a").await;
        let node_b = node(&bus, "b").await;

        let (member, mut member_stream) = node_b.open(Value::Null);
        member.join("elsewhere");
        settle().await;

        node_a.broadcast_to_room("lobby", &Message::new("not for you"), &[]);

        assert_eq!(next_data(&mut member_stream).await, None);
    }

    #[tokio::test]
    async fn test_emptied_room_is_unsubscribed() {
        let bus = MemoryBus::default();
        let node_a = node(&bus, "a").await;
        let node_b = node(&bus, "b").await;

        let (member, mut member_stream) = node_b.open(Value::Null);
        member.join("lobby");
        settle().await;
        member.leave("lobby");
        settle().await;
        assert!(member.is_open());

        node_a.broadcast_to_room("lobby", &Message::new("late"), &[]);

        assert_eq!(next_data(&mut member_stream).await, None);
    }

    #[tokio::test]
    async fn test_attach_subscribes_existing_rooms() {
        let bus = MemoryBus::default();
        let node_a = node(&bus, "a").await;

        let node_b = Arc::new(Manager::new(ManagerConfig {
            heartbeat_interval: None,
            implicit_room: false,
        }));
        let (member, mut member_stream) = node_b.open(Value::Null);
        member.join("lobby");
        let adapter = bus.adapter(EnvelopeCodec::new(NodeId::from("b"), "test:room:"));
        node_b.attach_cluster(Arc::new(adapter)).await.unwrap();
        settle().await;

        node_a.broadcast_to_room("lobby", &Message::new("welcome"), &[]);

        assert_eq!(next_data(&mut member_stream).await.as_deref(), Some("welcome"));
    }

    #[tokio::test]
    async fn test_detach_stops_cross_node_traffic() {
        let bus = MemoryBus::default();
        let node_a = node(&bus, "a").await;
        let node_b = node(&bus, "b").await;
        let (member, mut member_stream) = node_b.open(Value::Null);
        member.join("lobby");
        settle().await;

        node_b.detach_cluster().await.unwrap();
        assert!(!node_b.is_clustered());
        node_a.broadcast_to_room("lobby", &Message::new("gone"), &[]);

        assert_eq!(next_data(&mut member_stream).await, None);
    }

    #[tokio::test]
    async fn test_stale_unsubscribe_keeps_recreated_room() {
        let manager = Arc::new(Manager::new(ManagerConfig {
            heartbeat_interval: None,
            implicit_room: false,
        }));
        let adapter = Arc::new(RecordingAdapter::default());
        manager.attach_cluster(adapter.clone()).await.unwrap();

        let (member, _stream) = manager.open(Value::Null);
        member.join("lobby");
        // An unsubscribe from an earlier emptying, queued after the room came back
        manager.send_cluster([Command::Unsubscribe("lobby".to_string())]);
        settle().await;
        assert_eq!(adapter.applied(), vec!["+lobby"]);

        member.leave("lobby");
        settle().await;
        assert_eq!(adapter.applied(), vec!["+lobby", "-lobby"]);
    }
}
