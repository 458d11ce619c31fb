use crate::controller::{
    health_check_controller, item_controller, notification_controller, room_controller,
    stats_controller, task_controller,
};
use crate::dispatch::route;
use crate::AppState;
use axum::http::header::{ACCEPT, CONTENT_TYPE};
use axum::http::{HeaderName, HeaderValue, Method};
use axum::{
    routing::{get, post},
    Router,
};
use log::*;
use service::config::Config;
use sse::LAST_EVENT_ID_HEADER;
use tower_http::cors::CorsLayer;
use utoipa::OpenApi;
use utoipa_rapidoc::RapiDoc;

// Only the plain JSON endpoints are listed; contract routes negotiate their
// representation per request.
#[derive(OpenApi)]
#[openapi(
        info(
            title = "eventcast API"
        ),
        paths(
            health_check_controller::health_check,
            notification_controller::create,
            room_controller::broadcast,
            stats_controller::read,
        ),
        components(
            schemas(
                notification_controller::NotificationParams,
                notification_controller::Published,
                room_controller::RoomMessageParams,
                room_controller::Delivered,
                stats_controller::Stats,
            )
        ),
        tags(
            (name = "eventcast", description = "Server-Sent Events with rooms and replay")
        )
    )]
struct ApiDoc;

pub fn define_routes(app_state: AppState) -> Router {
    let cors = cors_layer(&app_state.config);

    Router::new()
        .merge(health_routes())
        .merge(notification_routes(app_state.clone()))
        .merge(room_routes(app_state.clone()))
        .merge(item_routes(app_state.clone()))
        .merge(task_routes(app_state.clone()))
        .merge(stats_routes(app_state))
        .merge(RapiDoc::with_openapi("/api-docs/openapi.json", ApiDoc::openapi()).path("/rapidoc"))
        .layer(cors)
}

fn cors_layer(config: &Config) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(origin) => Some(origin),
            Err(_) => {
                warn!("Ignoring invalid CORS origin {origin}");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([
            ACCEPT,
            CONTENT_TYPE,
            HeaderName::from_static(LAST_EVENT_ID_HEADER),
        ])
        .expose_headers([HeaderName::from_static(item_controller::VERSION_HEADER)])
        .allow_credentials(true)
}

fn health_routes() -> Router {
    Router::new().route("/health", get(health_check_controller::health_check))
}

fn notification_routes(app_state: AppState) -> Router {
    let history = app_state.history.clone();
    Router::new()
        .route(
            "/notifications",
            route(notification_controller::events(history)).post(notification_controller::create),
        )
        .with_state(app_state)
}

fn room_routes(app_state: AppState) -> Router {
    Router::new()
        .route("/rooms/{room}/events", route(room_controller::events()))
        .route("/rooms/{room}/messages", post(room_controller::broadcast))
        .with_state(app_state)
}

fn item_routes(app_state: AppState) -> Router {
    Router::new()
        .route("/items/{id}", route(item_controller::contract()))
        .with_state(app_state)
}

fn task_routes(app_state: AppState) -> Router {
    Router::new()
        .route("/tasks", route(task_controller::contract()))
        .with_state(app_state)
}

fn stats_routes(app_state: AppState) -> Router {
    Router::new()
        .route("/stats", get(stats_controller::read))
        .with_state(app_state)
}
