//! Route contracts: what a route accepts, what it may answer synchronously,
//! and which events it may stream.

use crate::dispatch::Responder;
use crate::error::Error;
use crate::negotiate::{Mode, Negotiated};
use crate::schema::Schema;
use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use serde_json::Value;
use sse::{BoxError, ReplaySource};
use std::collections::HashMap;
use std::sync::Arc;

/// Everything a handler gets to see of the incoming request.
#[derive(Debug, Clone)]
pub struct RouteRequest {
    pub params: HashMap<String, String>,
    pub headers: HeaderMap,
    /// Validated body for body-carrying routes, `Value::Null` otherwise.
    pub body: Value,
    pub negotiated: Negotiated,
    pub last_event_id: Option<String>,
}

impl RouteRequest {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }
}

/// A synchronous answer, checked against the route's `ResponseContract`.
#[derive(Debug, Clone)]
pub struct SyncResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Value,
}

impl SyncResponse {
    pub fn ok(body: Value) -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body,
        }
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }
}

#[async_trait]
pub trait StreamHandler: Send + Sync {
    /// Either `respond` early or `start` the stream. Once the handler
    /// returns, a started stream is closed.
    async fn handle(&self, request: RouteRequest, responder: &mut Responder)
        -> Result<(), BoxError>;
}

#[async_trait]
pub trait SyncHandler: Send + Sync {
    async fn handle(&self, request: RouteRequest) -> Result<SyncResponse, Error>;
}

pub struct ResponseContract {
    pub schema: Arc<dyn Schema>,
    pub required_headers: Vec<HeaderName>,
}

impl ResponseContract {
    pub fn new(schema: impl Schema + 'static) -> Self {
        Self {
            schema: Arc::new(schema),
            required_headers: Vec::new(),
        }
    }

    pub fn require_header(mut self, name: HeaderName) -> Self {
        self.required_headers.push(name);
        self
    }
}

pub enum RouteShape {
    /// Stream-only GET.
    Stream { stream: Arc<dyn StreamHandler> },
    /// Stream-only route carrying a JSON body.
    StreamWithBody {
        body: Arc<dyn Schema>,
        stream: Arc<dyn StreamHandler>,
    },
    /// GET answering either synchronously or with a stream.
    Dual {
        response: ResponseContract,
        sync: Arc<dyn SyncHandler>,
        stream: Arc<dyn StreamHandler>,
    },
    /// Dual-mode route carrying a JSON body.
    DualWithBody {
        body: Arc<dyn Schema>,
        response: ResponseContract,
        sync: Arc<dyn SyncHandler>,
        stream: Arc<dyn StreamHandler>,
    },
}

impl RouteShape {
    pub fn body_schema(&self) -> Option<&Arc<dyn Schema>> {
        match self {
            RouteShape::Stream { .. } | RouteShape::Dual { .. } => None,
            RouteShape::StreamWithBody { body, .. } | RouteShape::DualWithBody { body, .. } => {
                Some(body)
            }
        }
    }

    pub fn is_dual(&self) -> bool {
        matches!(self, RouteShape::Dual { .. } | RouteShape::DualWithBody { .. })
    }
}

pub struct RouteContract {
    pub shape: RouteShape,
    /// Schemas for outgoing events, by event name. When empty, events are not
    /// checked; otherwise an undeclared event name is a validation failure.
    pub events: HashMap<String, Arc<dyn Schema>>,
    /// Mode used by dual routes when negotiation expresses no usable preference.
    pub default_mode: Mode,
    pub replay: Option<Arc<dyn ReplaySource>>,
    /// Rooms a started stream joins before any replay, so nothing broadcast
    /// in between is missed.
    pub rooms: Vec<String>,
}

impl RouteContract {
    fn with_shape(shape: RouteShape) -> Self {
        Self {
            shape,
            events: HashMap::new(),
            default_mode: Mode::Sync,
            replay: None,
            rooms: Vec::new(),
        }
    }

    pub fn stream(stream: impl StreamHandler + 'static) -> Self {
        Self::with_shape(RouteShape::Stream {
            stream: Arc::new(stream),
        })
    }

    pub fn stream_with_body(
        body: impl Schema + 'static,
        stream: impl StreamHandler + 'static,
    ) -> Self {
        Self::with_shape(RouteShape::StreamWithBody {
            body: Arc::new(body),
            stream: Arc::new(stream),
        })
    }

    pub fn dual(
        response: ResponseContract,
        sync: impl SyncHandler + 'static,
        stream: impl StreamHandler + 'static,
    ) -> Self {
        Self::with_shape(RouteShape::Dual {
            response,
            sync: Arc::new(sync),
            stream: Arc::new(stream),
        })
    }

    pub fn dual_with_body(
        body: impl Schema + 'static,
        response: ResponseContract,
        sync: impl SyncHandler + 'static,
        stream: impl StreamHandler + 'static,
    ) -> Self {
        Self::with_shape(RouteShape::DualWithBody {
            body: Arc::new(body),
            response,
            sync: Arc::new(sync),
            stream: Arc::new(stream),
        })
    }

    pub fn event(mut self, name: impl Into<String>, schema: impl Schema + 'static) -> Self {
        self.events.insert(name.into(), Arc::new(schema));
        self
    }

    pub fn default_mode(mut self, mode: Mode) -> Self {
        self.default_mode = mode;
        self
    }

    pub fn replay(mut self, source: Arc<dyn ReplaySource>) -> Self {
        self.replay = Some(source);
        self
    }

    pub fn room(mut self, room: impl Into<String>) -> Self {
        self.rooms.push(room.into());
        self
    }

    pub fn stream_handler(&self) -> &Arc<dyn StreamHandler> {
        match &self.shape {
            RouteShape::Stream { stream }
            | RouteShape::StreamWithBody { stream, .. }
            | RouteShape::Dual { stream, .. }
            | RouteShape::DualWithBody { stream, .. } => stream,
        }
    }
}
