use crate::contract::{RouteContract, RouteRequest, StreamHandler};
use crate::controller::ApiResponse;
use crate::dispatch::Responder;
use crate::AppState;
use async_trait::async_trait;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sse::{BoxError, ConnectionId, Message};
use utoipa::ToSchema;

#[derive(Debug, Deserialize, ToSchema)]
pub struct RoomMessageParams {
    pub event: Option<String>,
    #[schema(value_type = Object)]
    pub data: Value,
    /// Connection ids that should not receive the message.
    #[serde(default)]
    pub except: Vec<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct Delivered {
    pub delivered: usize,
}

/// GET /rooms/{room}/events: joins the room named in the path.
pub(crate) fn events() -> RouteContract {
    RouteContract::stream(JoinRoom)
}

struct JoinRoom;

#[async_trait]
impl StreamHandler for JoinRoom {
    async fn handle(&self, request: RouteRequest, responder: &mut Responder) -> Result<(), BoxError> {
        let room = request.param("room").unwrap_or_default().to_string();
        let stream = responder.start().await?;
        stream.join(room);
        stream.closed().await;
        Ok(())
    }
}

/// POST broadcast a message to a room
#[utoipa::path(
    post,
    path = "/rooms/{room}/messages",
    params(("room" = String, Path, description = "Room to broadcast to")),
    request_body = RoomMessageParams,
    responses(
        (status = 200, description = "Number of local connections reached", body = Delivered),
        (status = 422, description = "Unprocessable Entity")
    )
)]
pub async fn broadcast(
    State(app_state): State<AppState>,
    Path(room): Path<String>,
    Json(params): Json<RoomMessageParams>,
) -> impl IntoResponse {
    let mut message = Message::new(params.data);
    if let Some(event) = params.event {
        message = message.with_event(event);
    }
    let except: Vec<ConnectionId> = params.except.into_iter().map(ConnectionId::from).collect();

    let delivered = app_state
        .sse_manager
        .broadcast_to_room(room, &message, &except);

    Json(ApiResponse::new(StatusCode::OK.into(), Delivered { delivered }))
}
