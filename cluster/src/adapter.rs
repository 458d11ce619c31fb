use crate::envelope::WireMessage;
use crate::error::Error;
use async_trait::async_trait;
use std::sync::{Arc, RwLock};

/// Receives messages that arrived from other nodes.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, room: &str, message: WireMessage);
}

/// A publish/subscribe transport that carries room broadcasts between nodes.
///
/// Implementations own the envelope format through an `EnvelopeCodec` and
/// only hand accepted messages to the registered handlers.
#[async_trait]
pub trait Adapter: Send + Sync {
    async fn connect(&self) -> Result<(), Error>;

    async fn disconnect(&self) -> Result<(), Error>;

    async fn subscribe(&self, room: &str) -> Result<(), Error>;

    async fn unsubscribe(&self, room: &str) -> Result<(), Error>;

    async fn publish(&self, room: &str, message: &WireMessage) -> Result<(), Error>;

    /// Register a handler for inbound messages. Handlers are called
    /// sequentially in registration order.
    fn on_message(&self, handler: Arc<dyn MessageHandler>);
}

/// Shared list of inbound handlers used by the adapter implementations.
#[derive(Clone, Default)]
pub struct HandlerSet {
    handlers: Arc<RwLock<Vec<Arc<dyn MessageHandler>>>>,
}

impl HandlerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, handler: Arc<dyn MessageHandler>) {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.push(handler);
    }

    pub async fn dispatch(&self, room: &str, message: WireMessage) {
        // Snapshot so no lock is held across the handler awaits
        let handlers = self
            .handlers
            .read()
            .map(|h| h.clone())
            .unwrap_or_else(|e| e.into_inner().clone());

        for handler in handlers {
            handler.handle(room, message.clone()).await;
        }
    }
}
