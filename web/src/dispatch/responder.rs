use super::state::{DispatchError, ResponseState};
use crate::contract::RouteContract;
use crate::error::Error;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use log::*;
use serde_json::{json, Value};
use sse::{BoxError, ConnectionHandle, FrameStream, IntoRoomNames, Manager, Message};
use std::sync::Arc;
use tokio::sync::oneshot;

/// Name used to look up the schema of an event sent without a name.
const DEFAULT_EVENT_NAME: &str = "message";

/// How the HTTP side should answer, decided by the stream handler.
pub(crate) enum Decision {
    Respond(Response),
    Stream(FrameStream),
}

/// Handed to a stream handler: answer early with `respond`, or commit to
/// streaming with `start`.
pub struct Responder {
    state: ResponseState,
    decision: Option<oneshot::Sender<Decision>>,
    contract: Arc<RouteContract>,
    manager: Arc<Manager>,
    last_event_id: Option<String>,
    connection: Option<ConnectionHandle>,
}

impl Responder {
    pub(crate) fn new(
        contract: Arc<RouteContract>,
        manager: Arc<Manager>,
        last_event_id: Option<String>,
        decision: oneshot::Sender<Decision>,
    ) -> Self {
        Self {
            state: ResponseState::Initial,
            decision: Some(decision),
            contract,
            manager,
            last_event_id,
            connection: None,
        }
    }

    pub fn state(&self) -> ResponseState {
        self.state
    }

    /// Answer once with a JSON body. No stream headers are sent.
    pub fn respond(&mut self, status: StatusCode, body: Value) -> Result<(), DispatchError> {
        self.state = self.state.respond()?;
        self.decide(Decision::Respond((status, Json(body)).into_response()));
        Ok(())
    }

    /// Commit to streaming: open the connection, hand its body to the client,
    /// join the route's rooms, then replay missed events when the client is
    /// resuming.
    pub async fn start(&mut self) -> Result<EventStream, DispatchError> {
        self.state = self.state.start()?;

        let (connection, body) = self.manager.open(Value::Null);
        if !self.decide(Decision::Stream(body)) {
            // Request already gone, so the body was dropped and closed the connection
            debug!("Client left before stream {} started", connection.id());
        }
        self.connection = Some(connection.clone());

        if !self.contract.rooms.is_empty() {
            connection.join(self.contract.rooms.clone());
        }
        if let (Some(last_event_id), Some(source)) = (&self.last_event_id, &self.contract.replay) {
            sse::replay::run(&connection, last_event_id, source.as_ref()).await;
        }

        Ok(EventStream {
            connection,
            contract: Arc::clone(&self.contract),
        })
    }

    /// Close a started stream. Idempotent.
    pub fn close(&mut self) -> Result<(), DispatchError> {
        self.state = self.state.close()?;
        if let Some(connection) = &self.connection {
            connection.close();
        }
        Ok(())
    }

    /// Wrap up after the handler returned.
    pub(crate) fn finish(mut self, result: Result<(), BoxError>) {
        if let Err(fault) = self.state.finish() {
            if let Err(e) = &result {
                error!("Stream handler failed: {e}");
            }
            // Logged once by the error's response conversion
            self.decide(Decision::Respond(Error::from(fault).into_response()));
            return;
        }

        match (self.state, result) {
            (ResponseState::Streaming, Err(e)) => {
                error!("Stream handler failed: {e}");
                if let Some(connection) = &self.connection {
                    connection.send(&error_event(e.to_string()));
                }
            }
            (_, Err(e)) => warn!("Stream handler failed after its response was decided: {e}"),
            (_, Ok(())) => {}
        }

        if self.state == ResponseState::Streaming {
            let _ = self.close();
        }
    }

    fn decide(&mut self, decision: Decision) -> bool {
        match self.decision.take() {
            Some(sender) => sender.send(decision).is_ok(),
            None => false,
        }
    }
}

// A handler that panics never reaches `finish`; don't leave its stream open.
impl Drop for Responder {
    fn drop(&mut self) {
        if self.state != ResponseState::Streaming {
            return;
        }
        if let Some(connection) = &self.connection {
            if connection.close() {
                warn!(
                    "Stream handler for {} ended without finishing, stream closed",
                    connection.id()
                );
            }
        }
    }
}

fn error_event(message: String) -> Message {
    Message::new(json!({ "message": message })).with_event("error")
}

/// A started stream. Events are checked against the route's event schemas
/// before they are written.
#[derive(Clone)]
pub struct EventStream {
    connection: ConnectionHandle,
    contract: Arc<RouteContract>,
}

impl EventStream {
    pub fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    /// Validate and send one event. An event that fails its schema is not
    /// sent: the client gets an `error` event instead and the stream closes.
    pub fn send(&self, message: Message) -> bool {
        match self.validate(message) {
            Ok(message) => self.connection.send(&message),
            Err(reason) => {
                if !self.connection.is_open() {
                    return false;
                }
                self.connection.send(&error_event(reason.clone()));
                // Only the call that actually closes the stream reports it
                if self.connection.close() {
                    error!(
                        "Closed stream {} after invalid event: {reason}",
                        self.connection.id()
                    );
                }
                false
            }
        }
    }

    pub fn join(&self, rooms: impl IntoRoomNames) -> bool {
        self.connection.join(rooms)
    }

    pub fn leave(&self, room: &str) -> bool {
        self.connection.leave(room)
    }

    pub fn is_open(&self) -> bool {
        self.connection.is_open()
    }

    pub fn close(&self) -> bool {
        self.connection.close()
    }

    /// Resolves once either side closes the stream.
    pub async fn closed(&self) {
        self.connection.closed().await
    }

    fn validate(&self, mut message: Message) -> Result<Message, String> {
        if self.contract.events.is_empty() {
            return Ok(message);
        }

        let name = message.event.as_deref().unwrap_or(DEFAULT_EVENT_NAME);
        let Some(schema) = self.contract.events.get(name) else {
            return Err(format!("event `{name}` is not declared by this route"));
        };
        message.data = schema
            .validate(&message.data)
            .map_err(|e| format!("event `{name}` failed validation: {e}"))?;
        Ok(message)
    }
}
