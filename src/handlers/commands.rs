use crate::controller::StartRequest;
use crate::state::AppState;
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use percent_encoding::percent_decode_str;
use serde::Deserialize;
use std::path::PathBuf;
use uuid::Uuid;

/// Ids arrive as JSON strings or numbers; both are keyed by their text.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum DownloadId {
    Text(String),
    Number(serde_json::Number),
}

impl From<DownloadId> for String {
    fn from(id: DownloadId) -> Self {
        match id {
            DownloadId::Text(text) => text,
            DownloadId::Number(number) => number.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct StartDownloadBody {
    pub id: Option<DownloadId>,
    pub url: String,
    pub filename: Option<String>,
    pub destination_directory: Option<PathBuf>,
}

pub async fn start_download(
    State(state): State<AppState>,
    Json(body): Json<StartDownloadBody>,
) -> impl IntoResponse {
    let id: String = body
        .id
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let filename = body
        .filename
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| filename_from_url(&body.url));
    let destination_directory = body
        .destination_directory
        .unwrap_or_else(|| state.settings.download_dir.clone());

    state
        .controller
        .start(StartRequest {
            id: id.clone(),
            url: body.url,
            filename,
            destination_directory,
        })
        .await;

    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "id": id, "status": "started" })),
    )
}

pub async fn cancel_download(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    state.controller.cancel(&id).await;
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "id": id, "status": "cancelling" })),
    )
}

/// Last non-empty path segment of `url`, percent-decoded.
pub fn filename_from_url(url: &str) -> String {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|parsed| {
            parsed
                .path_segments()
                .and_then(|mut segments| segments.next_back())
                .filter(|segment| !segment.is_empty())
                .map(|segment| percent_decode_str(segment).decode_utf8_lossy().to_string())
        })
        .filter(|name| name != "." && name != ".." && !name.contains(|c: char| c == '/' || c == '\\'))
        .unwrap_or_else(|| "download".to_string())
}
