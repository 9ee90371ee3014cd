use serde::Serialize;
use std::path::PathBuf;
use tokio::sync::broadcast;

/// Everything the controller tells the caller. Serialized as
/// `{"type": "download-progress", "id": ..., ...}`.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum DownloadEvent {
    DownloadProgress {
        id: String,
        progress: u64,
        downloaded: u64,
        size: u64,
        speed: u64,
    },
    DownloadComplete {
        id: String,
        file_path: PathBuf,
    },
    DownloadError {
        id: String,
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        status_code: Option<u16>,
    },
    /// Carries the original filename and directory so a caller can
    /// re-issue the start command against `new_url`.
    DownloadRedirect {
        id: String,
        new_url: String,
        filename: String,
        destination_directory: PathBuf,
    },
    DownloadCancelled {
        id: String,
    },
}

impl DownloadEvent {
    pub fn id(&self) -> &str {
        match self {
            DownloadEvent::DownloadProgress { id, .. }
            | DownloadEvent::DownloadComplete { id, .. }
            | DownloadEvent::DownloadError { id, .. }
            | DownloadEvent::DownloadRedirect { id, .. }
            | DownloadEvent::DownloadCancelled { id } => id,
        }
    }

    /// Completion, error and cancellation end a download's lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadEvent::DownloadComplete { .. }
                | DownloadEvent::DownloadError { .. }
                | DownloadEvent::DownloadCancelled { .. }
        )
    }
}

pub type EventSender = broadcast::Sender<DownloadEvent>;

/// Sending only fails when nobody is subscribed, which is fine.
pub fn emit(tx: &EventSender, event: DownloadEvent) {
    let _ = tx.send(event);
}
