//! # Redis Pub/Sub Adapter
//!
//! Carries room broadcasts between nodes over Redis channels. One pub/sub
//! connection receives messages for every subscribed room and is re-opened,
//! with every room resubscribed, when it drops. Publishing goes through a
//! separate managed connection that reconnects on its own.

use crate::adapter::{Adapter, HandlerSet, MessageHandler};
use crate::envelope::{EnvelopeCodec, WireMessage};
use crate::error::{Error, ErrorKind};
use async_trait::async_trait;
use futures_util::StreamExt;
use log::*;
use redis::aio::{ConnectionManager, PubSubSink, PubSubStream};
use redis::{AsyncCommands, Client, RedisResult};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(MAX_BACKOFF)
}

/// The channels this node wants, and the sink of the live pub/sub
/// connection. The wanted set outlives connections so a reconnect can
/// subscribe to all of it again.
#[derive(Clone, Default)]
struct Subscriptions {
    channels: Arc<std::sync::Mutex<HashSet<String>>>,
    sink: Arc<Mutex<Option<PubSubSink>>>,
}

impl Subscriptions {
    fn channels(&self) -> Vec<String> {
        self.channels
            .lock()
            .map(|channels| channels.iter().cloned().collect())
            .unwrap_or_default()
    }

    async fn add(&self, channel: String) -> RedisResult<()> {
        self.channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(channel.clone());
        match self.sink.lock().await.as_mut() {
            Some(sink) => sink.subscribe(channel).await,
            // Picked up by the next reconnect
            None => Ok(()),
        }
    }

    async fn remove(&self, channel: String) -> RedisResult<()> {
        self.channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&channel);
        match self.sink.lock().await.as_mut() {
            Some(sink) => sink.unsubscribe(channel).await,
            None => Ok(()),
        }
    }

    /// Open a pub/sub connection subscribed to every wanted channel and make
    /// it the live one. The sink lock is held throughout, so a concurrent
    /// `add` is either in the snapshot or applied to the new sink.
    async fn establish(&self, client: &Client) -> RedisResult<PubSubStream> {
        let (mut sink, stream) = client.get_async_pubsub().await?.split();
        let mut live = self.sink.lock().await;
        for channel in self.channels() {
            sink.subscribe(channel).await?;
        }
        *live = Some(sink);
        Ok(stream)
    }

    async fn reset(&self) {
        self.sink.lock().await.take();
    }
}

struct Connected {
    publisher: ConnectionManager,
    supervisor: JoinHandle<()>,
}

pub struct RedisAdapter {
    client: Client,
    codec: EnvelopeCodec,
    handlers: HandlerSet,
    subscriptions: Subscriptions,
    state: Mutex<Option<Connected>>,
}

impl RedisAdapter {
    /// Creates an adapter from a connection string.
    ///
    /// # Arguments
    /// * `url` - The redis URL (e.g., "redis://127.0.0.1/").
    /// * `codec` - Node identity and channel prefix used for envelopes.
    pub fn new(url: &str, codec: EnvelopeCodec) -> Result<Self, Error> {
        let client = Client::open(url)?;
        Ok(Self {
            client,
            codec,
            handlers: HandlerSet::new(),
            subscriptions: Subscriptions::default(),
            state: Mutex::new(None),
        })
    }

    async fn ensure_connected(&self) -> Result<(), Error> {
        match self.state.lock().await.as_ref() {
            Some(_) => Ok(()),
            None => Err(Error::not_connected()),
        }
    }
}

async fn read_messages(mut stream: PubSubStream, codec: &EnvelopeCodec, handlers: &HandlerSet) {
    while let Some(msg) = stream.next().await {
        let channel = msg.get_channel_name().to_string();
        let payload: String = match msg.get_payload() {
            Ok(payload) => payload,
            Err(e) => {
                debug!("Dropping unreadable payload on channel {channel}: {e}");
                continue;
            }
        };
        if let Some((room, message)) = codec.decode(&channel, &payload) {
            handlers.dispatch(&room, message).await;
        }
    }
}

/// Reads until the pub/sub connection drops, then reconnects with
/// exponential backoff and resubscribes. Runs until aborted.
async fn supervise(
    client: Client,
    subscriptions: Subscriptions,
    codec: EnvelopeCodec,
    handlers: HandlerSet,
    mut stream: PubSubStream,
) {
    loop {
        read_messages(stream, &codec, &handlers).await;
        subscriptions.reset().await;
        warn!("Redis pub/sub connection lost, reconnecting");

        let mut backoff = INITIAL_BACKOFF;
        stream = loop {
            tokio::time::sleep(backoff).await;
            match subscriptions.establish(&client).await {
                Ok(stream) => break stream,
                Err(e) => {
                    backoff = next_backoff(backoff);
                    warn!("Redis reconnect failed, retrying in {backoff:?}: {e}");
                }
            }
        };
        info!(
            "Reconnected to Redis, resubscribed to {} channel(s)",
            subscriptions.channels().len()
        );
    }
}

#[async_trait]
impl Adapter for RedisAdapter {
    async fn connect(&self) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            return Ok(());
        }

        let publisher = ConnectionManager::new(self.client.clone()).await?;
        let stream = self.subscriptions.establish(&self.client).await?;
        let supervisor = tokio::spawn(supervise(
            self.client.clone(),
            self.subscriptions.clone(),
            self.codec.clone(),
            self.handlers.clone(),
            stream,
        ));

        *state = Some(Connected {
            publisher,
            supervisor,
        });
        info!("Connected to Redis as node {}", self.codec.node_id());
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), Error> {
        if let Some(connected) = self.state.lock().await.take() {
            connected.supervisor.abort();
            self.subscriptions.reset().await;
            self.subscriptions
                .channels
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clear();
            info!("Disconnected from Redis");
        }
        Ok(())
    }

    async fn subscribe(&self, room: &str) -> Result<(), Error> {
        self.ensure_connected().await?;
        self.subscriptions
            .add(self.codec.channel(room))
            .await
            .map_err(|e| Error::with_source(ErrorKind::Subscribe, e))
    }

    async fn unsubscribe(&self, room: &str) -> Result<(), Error> {
        self.ensure_connected().await?;
        self.subscriptions
            .remove(self.codec.channel(room))
            .await
            .map_err(|e| Error::with_source(ErrorKind::Subscribe, e))
    }

    async fn publish(&self, room: &str, message: &WireMessage) -> Result<(), Error> {
        // Clone the managed connection so the state lock is not held while publishing
        let mut publisher = {
            let state = self.state.lock().await;
            state
                .as_ref()
                .ok_or_else(Error::not_connected)?
                .publisher
                .clone()
        };

        let payload = self.codec.encode(message)?;
        let _: () = publisher
            .publish(self.codec.channel(room), payload)
            .await
            .map_err(|e| Error::with_source(ErrorKind::Publish, e))?;
        Ok(())
    }

    fn on_message(&self, handler: Arc<dyn MessageHandler>) {
        self.handlers.add(handler);
    }
}
