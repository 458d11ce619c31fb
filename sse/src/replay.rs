//! Reconnection replay.
//!
//! A reconnecting client sends the id of the last event it processed in the
//! `Last-Event-ID` header. A `ReplaySource` decides which events come "after"
//! that id; `run` sends them, in order, before the live handler starts.

use crate::codec::Message;
use crate::connection::ConnectionInfo;
use crate::error::BoxError;
use crate::manager::ConnectionHandle;
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use log::*;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

/// Request header carrying the resume marker.
pub const LAST_EVENT_ID_HEADER: &str = "last-event-id";

/// Possibly-empty, possibly-asynchronous sequence of missed events.
pub type ReplayStream = BoxStream<'static, Result<Message, BoxError>>;

#[async_trait]
pub trait ReplaySource: Send + Sync {
    async fn replay(
        &self,
        connection: &ConnectionInfo,
        last_event_id: &str,
    ) -> Result<ReplayStream, BoxError>;
}

pub fn from_messages(messages: Vec<Message>) -> ReplayStream {
    stream::iter(messages.into_iter().map(Ok)).boxed()
}

/// Send every replayed event to `connection` and return how many were sent.
///
/// Source failures are logged and end the replay; the connection carries on
/// with live delivery either way.
pub async fn run(
    connection: &ConnectionHandle,
    last_event_id: &str,
    source: &dyn ReplaySource,
) -> usize {
    let Some(info) = connection.info() else {
        return 0;
    };

    let mut events = match source.replay(&info, last_event_id).await {
        Ok(events) => events,
        Err(e) => {
            error!(
                "Replay after event {last_event_id} failed for connection {}: {e}",
                info.id
            );
            return 0;
        }
    };

    let mut sent = 0;
    while let Some(event) = events.next().await {
        match event {
            Ok(message) => {
                if !connection.send(&message) {
                    debug!("Connection {} closed during replay", info.id);
                    break;
                }
                sent += 1;
            }
            Err(e) => {
                error!(
                    "Replay after event {last_event_id} failed for connection {} after {sent} event(s): {e}",
                    info.id
                );
                break;
            }
        }
    }

    debug!(
        "Replayed {sent} event(s) after {last_event_id} to connection {}",
        info.id
    );
    sent
}

/// Bounded in-memory history of recently sent events.
pub struct EventHistory {
    capacity: usize,
    window: Mutex<Window>,
}

struct Window {
    next_id: u64,
    events: VecDeque<Message>,
}

impl EventHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            window: Mutex::new(Window {
                next_id: 1,
                events: VecDeque::new(),
            }),
        }
    }

    fn window(&self) -> MutexGuard<'_, Window> {
        self.window.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Hands out increasing numeric ids, starting at 1.
    pub fn next_id(&self) -> String {
        self.window().take_id()
    }

    /// Store `message`, assigning the next id when it has none, and return
    /// the stored copy. The oldest event is dropped once full.
    pub fn record(&self, message: Message) -> Message {
        self.record_then(message, |_| ()).0
    }

    /// Like `record`, but `deliver` runs with the stored copy before any
    /// other event can be recorded, so live delivery follows id order too.
    pub fn record_then<R>(
        &self,
        mut message: Message,
        deliver: impl FnOnce(&Message) -> R,
    ) -> (Message, R) {
        let mut window = self.window();
        if message.id.is_none() {
            message.id = Some(window.take_id());
        }
        if window.events.len() == self.capacity {
            window.events.pop_front();
        }
        window.events.push_back(message.clone());

        let delivered = deliver(&message);
        (message, delivered)
    }

    /// Events recorded after `last_event_id`.
    ///
    /// Numeric ids select every retained event with a greater numeric id.
    /// Other ids are matched by position; an unknown one replays the whole
    /// window.
    pub fn after(&self, last_event_id: &str) -> Vec<Message> {
        let window = self.window();
        let events = &window.events;

        if let Ok(last) = last_event_id.parse::<u64>() {
            return events
                .iter()
                .filter(|m| {
                    m.id
                        .as_deref()
                        .and_then(|id| id.parse::<u64>().ok())
                        .is_some_and(|id| id > last)
                })
                .cloned()
                .collect();
        }

        match events
            .iter()
            .rposition(|m| m.id.as_deref() == Some(last_event_id))
        {
            Some(pos) => events.iter().skip(pos + 1).cloned().collect(),
            None => events.iter().cloned().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.window().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Window {
    fn take_id(&mut self) -> String {
        let id = self.next_id;
        self.next_id += 1;
        id.to_string()
    }
}

#[async_trait]
impl ReplaySource for EventHistory {
    async fn replay(
        &self,
        _connection: &ConnectionInfo,
        last_event_id: &str,
    ) -> Result<ReplayStream, BoxError> {
        Ok(from_messages(self.after(last_event_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Decoder;
    use crate::manager::{Manager, ManagerConfig};
    use crate::stream::FrameStream;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;

    fn history_one_to_five() -> EventHistory {
        let history = EventHistory::new(10);
        for n in 1..=5 {
            history.record(Message::new(json!({"n": n})).with_event("tick"));
        }
        history
    }

    fn ids(messages: &[Message]) -> Vec<String> {
        messages.iter().filter_map(|m| m.id.clone()).collect()
    }

    fn open() -> (Arc<Manager>, ConnectionHandle, FrameStream) {
        let manager = Arc::new(Manager::new(ManagerConfig {
            heartbeat_interval: None,
            implicit_room: true,
        }));
        let (handle, stream) = manager.open(Value::Null);
        (manager, handle, stream)
    }

    /// Close the connection and decode everything it was sent.
    async fn drain(handle: &ConnectionHandle, stream: FrameStream) -> Vec<String> {
        handle.close();
        let frames = tokio::time::timeout(Duration::from_secs(1), stream.collect::<Vec<_>>())
            .await
            .unwrap();
        let mut decoder = Decoder::new();
        frames
            .iter()
            .flat_map(|frame| decoder.feed_bytes(frame))
            .filter_map(|event| event.id)
            .collect()
    }

    struct FailingSource;

    #[async_trait]
    impl ReplaySource for FailingSource {
        async fn replay(&self, _: &ConnectionInfo, _: &str) -> Result<ReplayStream, BoxError> {
            Err("history store unavailable".into())
        }
    }

    struct FailsMidway;

    #[async_trait]
    impl ReplaySource for FailsMidway {
        async fn replay(&self, _: &ConnectionInfo, _: &str) -> Result<ReplayStream, BoxError> {
            let items: Vec<Result<Message, BoxError>> = vec![
                Ok(Message::new("a").with_id("10")),
                Err("lost the cursor".into()),
                Ok(Message::new("b").with_id("11")),
            ];
            Ok(stream::iter(items).boxed())
        }
    }

    #[test]
    fn test_history_after_numeric_ids() {
        let history = history_one_to_five();

        assert_eq!(ids(&history.after("2")), vec!["3", "4", "5"]);
        assert!(history.after("5").is_empty());
        assert!(history.after("99").is_empty());
        assert_eq!(history.after("0").len(), 5);
    }

    #[test]
    fn test_history_after_unknown_text_id_replays_window() {
        let history = history_one_to_five();

        assert_eq!(history.after("not-an-id").len(), 5);
    }

    #[test]
    fn test_history_is_bounded() {
        let history = EventHistory::new(3);
        for n in 1..=5 {
            history.record(Message::new(n.to_string()));
        }

        assert_eq!(history.len(), 3);
        assert_eq!(ids(&history.after("1")), vec!["3", "4", "5"]);
    }

    #[test]
    fn test_history_positional_match_for_text_ids() {
        let history = EventHistory::new(10);
        for id in ["a", "b", "c"] {
            history.record(Message::new(id).with_id(id));
        }

        assert_eq!(ids(&history.after("a")), vec!["b", "c"]);
    }

    #[test]
    fn test_concurrent_records_keep_id_order() {
        let history = EventHistory::new(1000);

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..50 {
                        history.record(Message::new("tick"));
                    }
                });
            }
        });

        let stored: Vec<u64> = ids(&history.after("0"))
            .iter()
            .map(|id| id.parse().unwrap())
            .collect();
        assert_eq!(stored, (1..=400).collect::<Vec<u64>>());
        for last in [1u64, 57, 200, 399] {
            assert_eq!(history.after(&last.to_string()).len() as u64, 400 - last);
        }
    }

    #[test]
    fn test_record_then_delivers_in_id_order() {
        let history = EventHistory::new(1000);
        let delivered = Mutex::new(Vec::new());

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..50 {
                        history.record_then(Message::new("tick"), |stored| {
                            delivered.lock().unwrap().push(stored.id.clone().unwrap());
                        });
                    }
                });
            }
        });

        let delivered: Vec<u64> = delivered
            .into_inner()
            .unwrap()
            .iter()
            .map(|id| id.parse().unwrap())
            .collect();
        assert_eq!(delivered, (1..=200).collect::<Vec<u64>>());
    }

    #[test]
    fn test_numeric_id_after_caller_supplied_ids() {
        let history = EventHistory::new(10);
        history.record(Message::new("late").with_id("9"));
        history.record(Message::new("early").with_id("4"));

        assert_eq!(ids(&history.after("4")), vec!["9"]);
    }

    #[tokio::test]
    async fn test_replay_sends_missed_events_before_live_ones() {
        let history = history_one_to_five();
        let (_manager, handle, stream) = open();

        let sent = run(&handle, "2", &history).await;
        handle.send(&Message::new("live").with_id("6"));

        assert_eq!(sent, 3);
        assert_eq!(drain(&handle, stream).await, vec!["3", "4", "5", "6"]);
    }

    #[tokio::test]
    async fn test_replay_at_latest_id_sends_nothing() {
        let history = history_one_to_five();
        let (_manager, handle, stream) = open();

        assert_eq!(run(&handle, "5", &history).await, 0);
        assert!(drain(&handle, stream).await.is_empty());
    }

    #[tokio::test]
    async fn test_failing_source_is_treated_as_empty() {
        let (manager, handle, stream) = open();

        assert_eq!(run(&handle, "1", &FailingSource).await, 0);
        assert!(manager.is_open(handle.id()));
        assert!(drain(&handle, stream).await.is_empty());
    }

    #[tokio::test]
    async fn test_mid_stream_failure_stops_replay() {
        let (manager, handle, stream) = open();

        assert_eq!(run(&handle, "9", &FailsMidway).await, 1);
        assert!(manager.is_open(handle.id()));
        assert_eq!(drain(&handle, stream).await, vec!["10"]);
    }
}
