use crate::downloads::DownloadState;
use crate::state::AppState;
use axum::{
    Json,
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
};
use futures::stream::{Stream, StreamExt};
use tracing::error;

pub async fn server_info(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "download_dir": state.settings.download_dir,
        "timeout_secs": state.settings.timeout_secs,
        "follow_redirects": state.settings.follow_redirects,
        "active_downloads": state.controller.registry().len(),
    }))
}

pub async fn list_downloads(State(state): State<AppState>) -> Json<Vec<DownloadState>> {
    Json(state.controller.registry().snapshot())
}

pub async fn sse_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let rx = state.controller.subscribe();
    let closed = state.shutdown.clone().cancelled_owned();
    let stream = tokio_stream::wrappers::BroadcastStream::new(rx).map(|msg| match msg {
        // The SSE event name is the serde `type` tag of the payload.
        Ok(event) => match serde_json::to_value(&event) {
            Ok(data) => {
                let name = data["type"].as_str().unwrap_or("message");
                Ok(Event::default().event(name).data(data.to_string()))
            }
            Err(e) => {
                error!("Failed to serialize event: {}", e);
                Ok(Event::default().comment("keepalive"))
            }
        },
        Err(_) => Ok(Event::default().comment("keepalive")),
    });
    let stream = stream.take_until(closed);

    Sse::new(stream).keep_alive(KeepAlive::default())
}
