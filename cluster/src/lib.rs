//! Cross-node broadcast plumbing for eventcast.
//!
//! This crate lets independently running server processes share room
//! broadcasts through a publish/subscribe store. It has no dependencies on
//! internal crates, so the `sse` crate can depend on it without cycles.
//!
//! # Architecture
//!
//! - **Adapter**: trait implemented by each backing transport
//!   (`connect`, `disconnect`, `subscribe`, `unsubscribe`, `publish`, `on_message`).
//! - **Envelope**: the versioned JSON wrapper `{ v, m, n }` carried on a
//!   channel named `<prefix><room>`.
//! - **EnvelopeCodec**: builds outgoing envelopes and filters incoming ones
//!   (unknown version, own origin, malformed payload, foreign channel).
//! - **RedisAdapter** / **MemoryAdapter**: the shipped transports.
//!
//! Delivery is at-most-once and best-effort: nothing is acknowledged,
//! persisted, or redelivered.

pub mod adapter;
pub mod envelope;
pub mod error;
pub mod memory;
pub mod redis_adapter;

pub use adapter::{Adapter, HandlerSet, MessageHandler};
pub use envelope::{Envelope, EnvelopeCodec, NodeId, WireMessage, PROTOCOL_VERSION};
pub use error::{Error, ErrorKind};
pub use memory::{MemoryAdapter, MemoryBus};
pub use redis_adapter::RedisAdapter;
