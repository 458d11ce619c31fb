//! Server-Sent Events (SSE) engine.
//!
//! This crate tracks open event-stream connections, frames events for the
//! `text/event-stream` wire format, groups connections into rooms, replays
//! missed events to reconnecting clients, and bridges room broadcasts across
//! server nodes through a `cluster::Adapter`.
//!
//! # Architecture
//!
//! - **Connection registry**: DashMap keyed by a type-safe `ConnectionId`.
//!   Each entry owns the sender half of the channel that feeds its response
//!   body, plus the connection's context and room memberships.
//! - **Rooms**: named groups that exist only while they have members. A room
//!   broadcast reaches each member exactly once, even when it belongs to
//!   several of the targeted rooms.
//! - **Exactly-once close**: whichever side closes first (the server through
//!   `ConnectionHandle::close`, the client by dropping the body) performs the
//!   cleanup; later closes are no-ops.
//! - **Cross-node rooms**: with an adapter attached, rooms are subscribed on
//!   creation, unsubscribed when they empty, and room broadcasts are
//!   published after local delivery.
//!
//! # Example: pushing an event
//!
//! ```rust,ignore
//! use sse::{Manager, Message};
//!
//! let manager = std::sync::Arc::new(Manager::default());
//! let (connection, body) = manager.open(serde_json::Value::Null);
//! connection.join("orders");
//!
//! manager.broadcast_to_room(
//!     "orders",
//!     &Message::new(serde_json::json!({"id": 7})).with_event("order.created"),
//!     &[],
//! );
//! ```
//!
//! # Modules
//!
//! - `codec`: event encoding and the incremental stream decoder
//! - `connection`: ConnectionRegistry and ConnectionId
//! - `rooms`: room membership index
//! - `manager`: high-level connection and room operations
//! - `replay`: Last-Event-ID replay sources and the in-memory history
//! - `stream`: the per-connection frame stream with keep-alives

mod cluster_link;
pub mod codec;
pub mod connection;
pub mod error;
pub mod manager;
pub mod replay;
pub mod rooms;
pub mod stream;

pub use codec::{DecodedEvent, Decoder, Message, HEARTBEAT_FRAME};
pub use connection::{ConnectionId, ConnectionInfo};
pub use error::{BoxError, Error, ErrorKind};
pub use manager::{ConnectionHandle, ConnectionHook, Lifecycle, Manager, ManagerConfig};
pub use replay::{EventHistory, ReplaySource, ReplayStream, LAST_EVENT_ID_HEADER};
pub use rooms::IntoRoomNames;
pub use stream::FrameStream;
