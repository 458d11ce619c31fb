use crate::controller::ApiResponse;
use crate::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;
use utoipa::ToSchema;

#[derive(Debug, Serialize, ToSchema)]
pub struct Stats {
    pub connections: usize,
    pub rooms: usize,
    pub clustered: bool,
    pub history: usize,
}

/// GET connection and room counts for this node
#[utoipa::path(
    get,
    path = "/stats",
    responses(
        (status = 200, description = "Counts for this node", body = Stats)
    )
)]
pub async fn read(State(app_state): State<AppState>) -> impl IntoResponse {
    let manager = &app_state.sse_manager;
    let stats = Stats {
        connections: manager.connection_count(),
        rooms: manager.room_count(),
        clustered: manager.is_clustered(),
        history: app_state.history.len(),
    };

    Json(ApiResponse::new(StatusCode::OK.into(), stats))
}
