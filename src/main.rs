use cluster::{EnvelopeCodec, NodeId, RedisAdapter};
use log::*;
use service::{config::Config, logging::Logger};
use sse::{Manager, ManagerConfig};
use std::sync::Arc;

#[tokio::main]
async fn main() {
    let config = Config::new();
    Logger::init_logger(&config as &Config);

    info!(
        "Starting up eventcast v{} [{}]",
        env!("CARGO_PKG_VERSION"),
        config.runtime_env()
    );

    let sse_manager = Arc::new(Manager::new(ManagerConfig {
        heartbeat_interval: config.heartbeat_interval(),
        implicit_room: true,
    }));

    if let Some(url) = config.redis_url() {
        let node_id = config.node_id().map(NodeId::from).unwrap_or_default();
        info!("Joining cluster as node {node_id} via {url}");

        let codec = EnvelopeCodec::new(node_id, config.channel_prefix());
        let attached = match RedisAdapter::new(url, codec) {
            Ok(adapter) => sse_manager.attach_cluster(Arc::new(adapter)).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = attached {
            error!("Failed to connect to the pub/sub store: {e}");
            std::process::exit(1);
        }
    } else {
        info!("No redis URL configured, running as a single node");
    }

    let app_state = web::AppState::new(config, &sse_manager);

    if let Err(e) = web::init_server(app_state, shutdown_signal()).await {
        error!("Server failed: {e}");
    }

    if let Err(e) = sse_manager.detach_cluster().await {
        warn!("Failed to leave the cluster cleanly: {e}");
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for the shutdown signal: {e}");
    }
}
