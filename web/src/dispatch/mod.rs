//! Per-request dispatch for contract-described routes.
//!
//! A request is validated against its route contract, negotiated into sync or
//! stream mode, and handed to the matching handler. Stream handlers run on
//! their own task; the first `respond`/`start` decision is sent back to the
//! HTTP side over a oneshot channel, so a long-lived stream never blocks the
//! response headers.

mod responder;
mod state;

pub use responder::{EventStream, Responder};
pub use state::{DispatchError, ResponseState};

use crate::contract::{ResponseContract, RouteContract, RouteRequest, RouteShape, SyncHandler};
use crate::error::{Error, ErrorKind};
use crate::negotiate::{negotiate, Mode, Negotiated, EVENT_STREAM};
use axum::body::{Body, Bytes};
use axum::extract::{FromRef, RawPathParams, State};
use axum::http::header::{ACCEPT, CACHE_CONTROL, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post, MethodRouter};
use futures_util::StreamExt;
use log::*;
use responder::Decision;
use serde_json::Value;
use sse::{FrameStream, Manager, LAST_EVENT_ID_HEADER};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::oneshot;

/// The parts of an HTTP request the dispatcher consumes.
pub struct Incoming {
    pub params: HashMap<String, String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Mount `contract` as an axum route: POST for body-carrying shapes, GET
/// otherwise.
pub fn route<S>(contract: RouteContract) -> MethodRouter<S>
where
    S: Clone + Send + Sync + 'static,
    Arc<Manager>: FromRef<S>,
{
    let has_body = contract.shape.body_schema().is_some();
    let contract = Arc::new(contract);

    let handler = move |State(manager): State<Arc<Manager>>,
                        params: RawPathParams,
                        headers: HeaderMap,
                        body: Bytes| {
        let contract = Arc::clone(&contract);
        let params = params
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect();
        async move {
            dispatch(
                contract,
                manager,
                Incoming {
                    params,
                    headers,
                    body,
                },
            )
            .await
            .into_response()
        }
    };

    if has_body {
        post(handler)
    } else {
        get(handler)
    }
}

pub async fn dispatch(
    contract: Arc<RouteContract>,
    manager: Arc<Manager>,
    incoming: Incoming,
) -> Result<Response, Error> {
    let Incoming {
        params,
        headers,
        body,
    } = incoming;

    let body = match contract.shape.body_schema() {
        Some(schema) => {
            let raw: Value = serde_json::from_slice(&body)?;
            schema.validate(&raw).map_err(Error::invalid_body)?
        }
        None => Value::Null,
    };

    let negotiated = if contract.shape.is_dual() {
        let accept = headers.get(ACCEPT).and_then(|value| value.to_str().ok());
        negotiate(accept, contract.default_mode)
    } else {
        Negotiated::Stream
    };

    let last_event_id = headers
        .get(LAST_EVENT_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    let request = RouteRequest {
        params,
        headers,
        body,
        negotiated,
        last_event_id,
    };

    match (&contract.shape, request.negotiated.mode()) {
        (
            RouteShape::Dual { response, sync, .. }
            | RouteShape::DualWithBody { response, sync, .. },
            Mode::Sync,
        ) => respond_sync(response, sync.as_ref(), request).await,
        (RouteShape::Dual { .. } | RouteShape::DualWithBody { .. }, Mode::Stream)
        | (
            RouteShape::Stream { .. } | RouteShape::StreamWithBody { .. },
            Mode::Sync | Mode::Stream,
        ) => start_stream(Arc::clone(&contract), manager, request).await,
    }
}

async fn respond_sync(
    contract: &ResponseContract,
    handler: &dyn SyncHandler,
    request: RouteRequest,
) -> Result<Response, Error> {
    let response = handler.handle(request).await?;

    let body = contract
        .schema
        .validate(&response.body)
        .map_err(Error::invalid_response)?;
    if let Some(missing) = contract
        .required_headers
        .iter()
        .find(|name| !response.headers.contains_key(*name))
    {
        return Err(Error::missing_header(missing));
    }

    let mut http = (response.status, Json(body)).into_response();
    http.headers_mut().extend(response.headers);
    Ok(http)
}

async fn start_stream(
    contract: Arc<RouteContract>,
    manager: Arc<Manager>,
    request: RouteRequest,
) -> Result<Response, Error> {
    let (decision, decided) = oneshot::channel();
    let handler = Arc::clone(contract.stream_handler());
    let mut responder = Responder::new(contract, manager, request.last_event_id.clone(), decision);

    tokio::spawn(async move {
        let result = handler.handle(request, &mut responder).await;
        responder.finish(result);
    });

    match decided.await {
        Ok(Decision::Respond(response)) => Ok(response),
        Ok(Decision::Stream(body)) => Ok(stream_response(body)),
        // The handler task panicked before deciding
        Err(_) => {
            warn!("Stream handler ended without a response");
            Err(Error::new(ErrorKind::Other(
                "stream handler ended without a response".to_string(),
            )))
        }
    }
}

fn stream_response(body: FrameStream) -> Response {
    let mut response = Body::from_stream(body.map(Ok::<_, Infallible>)).into_response();
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(EVENT_STREAM));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(
        HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::{StreamHandler, SyncResponse};
    use crate::schema::{AnySchema, RequiredFields};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::Router;
    use serde_json::json;
    use sse::{
        BoxError, ConnectionInfo, DecodedEvent, Decoder, EventHistory, ManagerConfig, Message,
        ReplaySource, ReplayStream,
    };
    use std::sync::Mutex;
    use std::time::Duration;
    use tower::ServiceExt;

    fn manager() -> Arc<Manager> {
        Arc::new(Manager::new(ManagerConfig {
            heartbeat_interval: None,
            implicit_room: true,
        }))
    }

    fn app(path: &str, contract: RouteContract) -> Router {
        Router::new().route(path, route(contract)).with_state(manager())
    }

    fn get_request(uri: &str, accept: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(uri);
        if let Some(accept) = accept {
            builder = builder.header(ACCEPT, accept);
        }
        builder.body(Body::empty()).unwrap()
    }

    fn post_request(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    /// Decode events until the body ends or stays idle for a moment.
    async fn read_events(response: Response) -> Vec<DecodedEvent> {
        let mut body = response.into_body().into_data_stream();
        let mut decoder = Decoder::new();
        let mut events = Vec::new();
        while let Ok(Some(chunk)) = tokio::time::timeout(Duration::from_millis(500), body.next()).await
        {
            events.extend(decoder.feed_bytes(&chunk.unwrap()));
        }
        events
    }

    struct EarlyNotFound {
        late_start: Arc<Mutex<Option<DispatchError>>>,
    }

    #[async_trait]
    impl StreamHandler for EarlyNotFound {
        async fn handle(&self, _: RouteRequest, responder: &mut Responder) -> Result<(), BoxError> {
            responder.respond(StatusCode::NOT_FOUND, json!({"error": "no such thing"}))?;
            if let Err(fault) = responder.start().await {
                *self.late_start.lock().unwrap() = Some(fault);
            }
            Ok(())
        }
    }

    struct ForgetsToStart;

    #[async_trait]
    impl StreamHandler for ForgetsToStart {
        async fn handle(&self, _: RouteRequest, _: &mut Responder) -> Result<(), BoxError> {
            Ok(())
        }
    }

    struct Emits(Vec<Message>);

    #[async_trait]
    impl StreamHandler for Emits {
        async fn handle(&self, _: RouteRequest, responder: &mut Responder) -> Result<(), BoxError> {
            let stream = responder.start().await?;
            for message in &self.0 {
                stream.send(message.clone());
            }
            Ok(())
        }
    }

    struct FailsAfterStart;

    #[async_trait]
    impl StreamHandler for FailsAfterStart {
        async fn handle(&self, _: RouteRequest, responder: &mut Responder) -> Result<(), BoxError> {
            let stream = responder.start().await?;
            stream.send(Message::new("working"));
            Err("database went away".into())
        }
    }

    struct PanicsAfterStart;

    #[async_trait]
    impl StreamHandler for PanicsAfterStart {
        async fn handle(&self, _: RouteRequest, responder: &mut Responder) -> Result<(), BoxError> {
            let _stream = responder.start().await?;
            panic!("handler bug");
        }
    }

    /// Replays one event listing the rooms the connection is in at replay time.
    struct RoomsAtReplay;

    #[async_trait]
    impl ReplaySource for RoomsAtReplay {
        async fn replay(&self, connection: &ConnectionInfo, _: &str) -> Result<ReplayStream, BoxError> {
            let message = Message::new(json!(connection.rooms)).with_id("1");
            Ok(sse::replay::from_messages(vec![message]))
        }
    }

    struct StaticItem {
        with_version: bool,
    }

    #[async_trait]
    impl SyncHandler for StaticItem {
        async fn handle(&self, request: RouteRequest) -> Result<SyncResponse, Error> {
            let id = request.param("id").unwrap_or_default().to_string();
            let response = SyncResponse::ok(json!({ "id": id, "echo": request.body }));
            if !self.with_version {
                return Ok(response);
            }
            Ok(response.with_header(
                HeaderName::from_static("x-item-version"),
                HeaderValue::from_static("3"),
            ))
        }
    }

    fn item_contract(with_version: bool) -> RouteContract {
        RouteContract::dual(
            ResponseContract::new(RequiredFields::new(&["id"]))
                .require_header(HeaderName::from_static("x-item-version")),
            StaticItem { with_version },
            Emits(vec![Message::new("streamed").with_event("snapshot")]),
        )
    }

    #[tokio::test]
    async fn test_early_respond_sends_no_stream_headers_and_blocks_start() {
        let late_start = Arc::new(Mutex::new(None));
        let app = app(
            "/things/{id}",
            RouteContract::stream(EarlyNotFound {
                late_start: late_start.clone(),
            }),
        );

        let response = app.oneshot(get_request("/things/9", None)).await.unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_ne!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            EVENT_STREAM
        );
        assert!(response.headers().get(CACHE_CONTROL).is_none());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            *late_start.lock().unwrap(),
            Some(DispatchError::StartAfterRespond)
        );
    }

    #[tokio::test]
    async fn test_handler_that_never_decides_is_a_server_error() {
        let app = app("/idle", RouteContract::stream(ForgetsToStart));

        let response = app.oneshot(get_request("/idle", None)).await.unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_stream_headers_and_close_after_handler_returns() {
        let app = app(
            "/feed",
            RouteContract::stream(Emits(vec![
                Message::new(json!({"n": 1})).with_id("1"),
                Message::new(json!({"n": 2})).with_id("2"),
            ])),
        );

        let response = app.oneshot(get_request("/feed", None)).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], EVENT_STREAM);
        assert_eq!(response.headers()[CACHE_CONTROL], "no-cache");
        assert_eq!(response.headers()["x-accel-buffering"], "no");
        let ids: Vec<_> = read_events(response)
            .await
            .into_iter()
            .filter_map(|e| e.id)
            .collect();
        assert_eq!(ids, vec!["1", "2"]);
    }

    #[tokio::test]
    async fn test_handler_error_becomes_error_event() {
        let app = app("/work", RouteContract::stream(FailsAfterStart));

        let response = app.oneshot(get_request("/work", None)).await.unwrap();
        let events = read_events(response).await;

        assert_eq!(events.len(), 2);
        assert_eq!(events[1].event.as_deref(), Some("error"));
        assert_eq!(
            events[1].json().unwrap(),
            json!({"message": "database went away"})
        );
    }

    #[tokio::test]
    async fn test_invalid_event_sends_error_and_closes() {
        let contract = RouteContract::stream(Emits(vec![
            Message::new(json!({"step": 1})).with_event("progress"),
            Message::new(json!({"oops": true})).with_event("progress"),
            Message::new(json!({"step": 3})).with_event("progress"),
        ]))
        .event("progress", RequiredFields::new(&["step"]));
        let app = app("/progress", contract);

        let response = app.oneshot(get_request("/progress", None)).await.unwrap();
        let events = read_events(response).await;

        let names: Vec<_> = events.iter().filter_map(|e| e.event.clone()).collect();
        assert_eq!(names, vec!["progress", "error"]);
    }

    #[tokio::test]
    async fn test_undeclared_event_is_rejected_when_events_are_declared() {
        let contract = RouteContract::stream(Emits(vec![Message::new("x").with_event("surprise")]))
            .event("progress", AnySchema);
        let app = app("/strict", contract);

        let response = app.oneshot(get_request("/strict", None)).await.unwrap();
        let events = read_events(response).await;

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("error"));
    }

    #[tokio::test]
    async fn test_dual_route_sync_json() {
        let app = app("/items/{id}", item_contract(true));

        let response = app
            .oneshot(get_request("/items/7", Some("application/json")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], "application/json");
        assert_eq!(response.headers()["x-item-version"], "3");
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body, json!({"id": "7", "echo": null}));
    }

    #[tokio::test]
    async fn test_missing_required_header_is_a_server_error() {
        let app = app("/items/{id}", item_contract(false));

        let response = app.oneshot(get_request("/items/7", None)).await.unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_dual_route_streams_when_preferred() {
        let app = app("/items/{id}", item_contract(false));

        let response = app
            .oneshot(get_request(
                "/items/7",
                Some("application/json;q=0.4, text/event-stream"),
            ))
            .await
            .unwrap();

        assert_eq!(response.headers()[CONTENT_TYPE], EVENT_STREAM);
        let events = read_events(response).await;
        assert_eq!(events[0].event.as_deref(), Some("snapshot"));
    }

    #[tokio::test]
    async fn test_body_validation() {
        let contract = RouteContract::dual_with_body(
            RequiredFields::new(&["name"]),
            ResponseContract::new(AnySchema).require_header(HeaderName::from_static("x-item-version")),
            StaticItem { with_version: true },
            ForgetsToStart,
        );
        let app = app("/items", contract);

        let malformed = app.clone().oneshot(post_request("/items", "{not json")).await.unwrap();
        let invalid = app.clone().oneshot(post_request("/items", r#"{"size": 1}"#)).await.unwrap();
        let valid = app
            .oneshot(post_request("/items", r#"{"name": "lamp"}"#))
            .await
            .unwrap();

        assert_eq!(malformed.status(), StatusCode::BAD_REQUEST);
        assert_eq!(invalid.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(valid.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_last_event_id_replays_before_live_events() {
        let history = Arc::new(EventHistory::new(10));
        for n in 1..=5 {
            history.record(Message::new(json!({"n": n})));
        }
        let contract = RouteContract::stream(Emits(vec![Message::new("live").with_id("6")]))
            .replay(history);
        let app = app("/feed", contract);

        let request = Request::builder()
            .uri("/feed")
            .header(LAST_EVENT_ID_HEADER, "2")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        let ids: Vec<_> = read_events(response)
            .await
            .into_iter()
            .filter_map(|e| e.id)
            .collect();
        assert_eq!(ids, vec!["3", "4", "5", "6"]);
    }

    #[tokio::test]
    async fn test_no_marker_means_no_replay() {
        let history = Arc::new(EventHistory::new(10));
        history.record(Message::new("old"));
        let contract = RouteContract::stream(Emits(vec![Message::new("live")])).replay(history);
        let app = app("/feed", contract);

        let response = app.oneshot(get_request("/feed", None)).await.unwrap();
        let events = read_events(response).await;

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "live");
    }

    #[tokio::test]
    async fn test_second_invalid_event_is_not_reported_again() {
        let contract = RouteContract::stream(Emits(vec![
            Message::new(json!({"oops": 1})).with_event("progress"),
            Message::new(json!({"oops": 2})).with_event("progress"),
        ]))
        .event("progress", RequiredFields::new(&["step"]));
        let app = app("/progress", contract);

        let response = app.oneshot(get_request("/progress", None)).await.unwrap();
        let events = read_events(response).await;

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("error"));
    }

    #[tokio::test]
    async fn test_stream_only_route_ignores_accept() {
        let app = app("/feed", RouteContract::stream(Emits(vec![Message::new("x")])));

        let response = app
            .oneshot(get_request("/feed", Some("application/json")))
            .await
            .unwrap();

        assert_eq!(response.headers()[CONTENT_TYPE], EVENT_STREAM);
    }

    #[tokio::test]
    async fn test_route_rooms_are_joined_before_replay() {
        let contract = RouteContract::stream(Emits(Vec::new()))
            .room("news")
            .replay(Arc::new(RoomsAtReplay));
        let app = app("/news", contract);

        let request = Request::builder()
            .uri("/news")
            .header(LAST_EVENT_ID_HEADER, "0")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let events = read_events(response).await;

        let rooms = events[0].json().unwrap();
        assert!(rooms.as_array().unwrap().contains(&json!("news")));
    }

    #[tokio::test]
    async fn test_panicking_handler_does_not_leak_its_stream() {
        let manager = manager();
        let app = Router::new()
            .route("/boom", route(RouteContract::stream(PanicsAfterStart)))
            .with_state(Arc::clone(&manager));

        let response = app.oneshot(get_request("/boom", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        tokio::time::timeout(Duration::from_secs(1), async {
            while manager.connection_count() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("stream closed after the handler panicked");
        assert!(read_events(response).await.is_empty());
    }
}
