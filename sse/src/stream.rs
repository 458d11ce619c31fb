use crate::codec::HEARTBEAT_FRAME;
use crate::connection::ConnectionId;
use crate::manager::Manager;
use async_stream::stream;
use bytes::Bytes;
use futures_util::Stream;
use log::*;
use std::pin::Pin;
use std::sync::Weak;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Encoded frames for one connection, ready to become a response body.
pub type FrameStream = Pin<Box<dyn Stream<Item = Bytes> + Send>>;

/// Closes the connection when the response body is dropped, which is how a
/// client-initiated disconnect reaches the registry.
struct DisconnectGuard {
    connection_id: ConnectionId,
    manager: Weak<Manager>,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        if let Some(manager) = self.manager.upgrade() {
            if manager.close(&self.connection_id) {
                debug!("SSE client {} disconnected", self.connection_id);
            }
        }
    }
}

pub(crate) fn frame_stream(
    mut receiver: UnboundedReceiver<Bytes>,
    heartbeat: Option<Duration>,
    connection_id: ConnectionId,
    manager: Weak<Manager>,
) -> FrameStream {
    let guard = DisconnectGuard {
        connection_id,
        manager,
    };

    Box::pin(stream! {
        let _guard = guard;
        let mut ticker = heartbeat.map(|period| {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        loop {
            let frame = match ticker.as_mut() {
                Some(ticker) => tokio::select! {
                    frame = receiver.recv() => frame,
                    _ = ticker.tick() => Some(Bytes::from_static(HEARTBEAT_FRAME.as_bytes())),
                },
                None => receiver.recv().await,
            };

            match frame {
                Some(frame) => yield frame,
                // Sender dropped: the connection was closed server-side
                None => break,
            }
        }
    })
}
