use crate::contract::{RouteContract, RouteRequest, StreamHandler};
use crate::controller::ApiResponse;
use crate::dispatch::Responder;
use crate::schema::RequiredFields;
use crate::AppState;
use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use log::*;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sse::{BoxError, EventHistory, Message};
use std::sync::Arc;
use utoipa::ToSchema;

/// Room every notification subscriber joins.
pub const ROOM: &str = "notifications";
pub const EVENT: &str = "notification";

#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct NotificationParams {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct Published {
    pub id: Option<String>,
    pub delivered: usize,
}

/// GET /notifications: stream of notifications, resumable with Last-Event-ID.
pub(crate) fn events(history: Arc<EventHistory>) -> RouteContract {
    RouteContract::stream(Subscribe)
        .event(EVENT, RequiredFields::new(&["message"]))
        .room(ROOM)
        .replay(history)
}

struct Subscribe;

#[async_trait]
impl StreamHandler for Subscribe {
    async fn handle(&self, _: RouteRequest, responder: &mut Responder) -> Result<(), BoxError> {
        let stream = responder.start().await?;
        stream.closed().await;
        Ok(())
    }
}

/// POST publish a notification to every subscriber
#[utoipa::path(
    post,
    path = "/notifications",
    request_body = NotificationParams,
    responses(
        (status = 201, description = "Notification recorded and broadcast", body = Published),
        (status = 400, description = "Bad Request"),
        (status = 422, description = "Unprocessable Entity")
    )
)]
pub async fn create(
    State(app_state): State<AppState>,
    Json(params): Json<NotificationParams>,
) -> impl IntoResponse {
    let manager = &app_state.sse_manager;
    let (message, delivered) = app_state.history.record_then(
        Message::new(json!(params)).with_event(EVENT),
        |message| manager.broadcast_to_room(ROOM, message, &[]),
    );
    debug!(
        "Notification {:?} delivered to {delivered} local subscriber(s)",
        message.id
    );

    (
        StatusCode::CREATED,
        Json(ApiResponse::new(
            StatusCode::CREATED.into(),
            Published {
                id: message.id,
                delivered,
            },
        )),
    )
}
