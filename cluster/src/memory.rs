use crate::adapter::{Adapter, HandlerSet, MessageHandler};
use crate::envelope::{EnvelopeCodec, WireMessage};
use crate::error::Error;
use async_trait::async_trait;
use log::*;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
struct BusFrame {
    channel: String,
    payload: String,
}

/// An in-process stand-in for a pub/sub store. Every adapter created from
/// the same bus sees every frame published on it.
#[derive(Clone)]
pub struct MemoryBus {
    sender: broadcast::Sender<BusFrame>,
}

impl MemoryBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn adapter(&self, codec: EnvelopeCodec) -> MemoryAdapter {
        MemoryAdapter {
            bus: self.clone(),
            codec,
            channels: Arc::new(Mutex::new(HashSet::new())),
            handlers: HandlerSet::new(),
            reader: Mutex::new(None),
        }
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

pub struct MemoryAdapter {
    bus: MemoryBus,
    codec: EnvelopeCodec,
    channels: Arc<Mutex<HashSet<String>>>,
    handlers: HandlerSet,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryAdapter {
    fn is_connected(&self) -> bool {
        self.reader
            .lock()
            .map(|reader| reader.is_some())
            .unwrap_or(false)
    }

    fn channels(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.channels.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Adapter for MemoryAdapter {
    async fn connect(&self) -> Result<(), Error> {
        let mut reader = self.reader.lock().unwrap_or_else(|e| e.into_inner());
        if reader.is_some() {
            return Ok(());
        }

        let mut receiver = self.bus.sender.subscribe();
        let channels = Arc::clone(&self.channels);
        let codec = self.codec.clone();
        let handlers = self.handlers.clone();

        *reader = Some(tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(frame) => {
                        let subscribed = channels
                            .lock()
                            .map(|c| c.contains(&frame.channel))
                            .unwrap_or(false);
                        if !subscribed {
                            continue;
                        }
                        if let Some((room, message)) = codec.decode(&frame.channel, &frame.payload)
                        {
                            handlers.dispatch(&room, message).await;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Memory bus reader lagged, {skipped} frame(s) lost");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));

        debug!("Memory adapter connected as node {}", self.codec.node_id());
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), Error> {
        let reader = self
            .reader
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(reader) = reader {
            reader.abort();
        }
        self.channels().clear();
        Ok(())
    }

    async fn subscribe(&self, room: &str) -> Result<(), Error> {
        if !self.is_connected() {
            return Err(Error::not_connected());
        }
        self.channels().insert(self.codec.channel(room));
        Ok(())
    }

    async fn unsubscribe(&self, room: &str) -> Result<(), Error> {
        if !self.is_connected() {
            return Err(Error::not_connected());
        }
        self.channels().remove(&self.codec.channel(room));
        Ok(())
    }

    async fn publish(&self, room: &str, message: &WireMessage) -> Result<(), Error> {
        if !self.is_connected() {
            return Err(Error::not_connected());
        }

        let frame = BusFrame {
            channel: self.codec.channel(room),
            payload: self.codec.encode(message)?,
        };

        // No receivers is not a failure for best-effort delivery
        if self.bus.sender.send(frame).is_err() {
            trace!("Published to room {room} with no listening nodes");
        }
        Ok(())
    }

    fn on_message(&self, handler: Arc<dyn MessageHandler>) {
        self.handlers.add(handler);
    }
}
