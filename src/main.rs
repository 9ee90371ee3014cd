mod cleanup;
mod config;
mod controller;
mod downloads;
mod error;
mod events;
mod handlers;
mod progress;
mod state;
mod tasks;

use axum::{
    Router,
    routing::{delete, get},
};
use std::net::SocketAddr;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{Level, info, warn};

use crate::config::Settings;
use crate::controller::DownloadController;
use crate::downloads::DownloadRegistry;
use crate::handlers::{api, commands};
use crate::state::AppState;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let settings = Settings::new().expect("Failed to load configuration");

    tracing_subscriber::fmt()
        .with_env_filter(&settings.log_level)
        .init();

    info!("Starting releasedl...");

    if !settings.download_dir.exists() {
        std::fs::create_dir_all(&settings.download_dir)
            .expect("Failed to create download directory");
    }

    let registry = DownloadRegistry::new();
    let (tx, _) = broadcast::channel(settings.event_buffer);
    let controller = DownloadController::new(&settings, registry, tx)
        .expect("Failed to build HTTP client");

    let shutdown = CancellationToken::new();
    let state = AppState {
        settings: settings.clone(),
        controller: controller.clone(),
        shutdown: shutdown.clone(),
    };

    // Start background tasks (redirect follower)
    tasks::start_background_tasks(state.clone());

    // --- Router Setup ---
    let app = create_app(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], settings.server_port));
    info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind server port");
    let drain = async move {
        shutdown_signal().await;
        let drained = controller.shutdown().await;
        info!("Drained {} downloads still in flight", drained);
        shutdown.cancel();
    };
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(drain)
        .await
    {
        warn!("Server stopped with error: {}", e);
    }
    info!("Shutdown complete");
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/api/info", get(api::server_info))
        .route(
            "/api/downloads",
            get(api::list_downloads).post(commands::start_download),
        )
        .route("/api/downloads/{id}", delete(commands::cancel_download))
        .route("/events", get(api::sse_handler))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(tower_http::trace::DefaultMakeSpan::new().level(Level::INFO))
                .on_response(tower_http::trace::DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown requested, draining downloads");
}
