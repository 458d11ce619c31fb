//! HTTP surface of the event server.
//!
//! Routes are described by a `RouteContract`: whether they take a JSON body,
//! whether they can answer synchronously as well as stream, and which events
//! they may emit. `dispatch::route` turns a contract into an axum route that
//! negotiates the mode from the `Accept` header and enforces the response
//! state machine.

use axum::extract::FromRef;
use log::*;
use service::config::Config;
use sse::{EventHistory, Manager};
use std::sync::Arc;

pub mod contract;
pub(crate) mod controller;
pub mod dispatch;
pub mod error;
pub mod negotiate;
pub mod router;
pub mod schema;

pub use error::{Error, Result};

/// Binds the configured interface and port and serves the routes until
/// `shutdown` resolves. Open event streams are closed as the server drains.
pub async fn init_server(
    app_state: AppState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let interface = app_state
        .config
        .interface
        .clone()
        .unwrap_or_else(|| "127.0.0.1".to_string());
    let address = format!("{interface}:{}", app_state.config.port);
    let manager = Arc::clone(&app_state.sse_manager);

    let listener = tokio::net::TcpListener::bind(&address).await?;
    info!("Server starting... listening for connections on http://{address}");

    let routes = router::define_routes(app_state);
    axum::serve(listener, routes)
        .with_graceful_shutdown(async move {
            shutdown.await;
            info!("Shutting down, closing {} event streams", manager.connection_count());
            for connection in manager.connections() {
                manager.close(&connection.id);
            }
        })
        .await
}

// Needs to implement Clone to be able to be passed into Router as State
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub sse_manager: Arc<Manager>,
    /// Recent notifications, replayed to reconnecting clients.
    pub history: Arc<EventHistory>,
}

impl AppState {
    pub fn new(app_config: Config, sse_manager: &Arc<Manager>) -> Self {
        let history = Arc::new(EventHistory::new(app_config.replay_history_capacity));
        Self {
            config: app_config,
            sse_manager: Arc::clone(sse_manager),
            history,
        }
    }
}

impl FromRef<AppState> for Arc<Manager> {
    fn from_ref(app_state: &AppState) -> Self {
        Arc::clone(&app_state.sse_manager)
    }
}
