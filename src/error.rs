use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Every way a single download attempt can end other than completion.
///
/// `RedirectReceived` and `UnknownIdOnCancel` are control flow: the
/// controller never reports them as `download-error`.
#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("Failed to create directory {path:?}: {source}")]
    DirectoryCreateFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Invalid filename: {0:?}")]
    InvalidFilename(String),
    #[error("Failed to open {path:?}: {source}")]
    FileOpen {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Server responded with status {0}")]
    NonSuccessStatus(u16),
    #[error("Redirected to {0}")]
    RedirectReceived(String),
    #[error("Too many redirects (limit {0})")]
    TooManyRedirects(u32),
    #[error("Transport error: {0}")]
    TransportError(String),
    #[error("Stream error: {0}")]
    StreamError(String),
    #[error("Download timed out after {}s without activity", .0.as_secs())]
    Timeout(Duration),
    #[error("No active download with that id")]
    UnknownIdOnCancel,
}

impl DownloadError {
    pub fn status_code(&self) -> Option<u16> {
        match self {
            DownloadError::NonSuccessStatus(code) => Some(*code),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for DownloadError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_body() || err.is_decode() {
            DownloadError::StreamError(err.to_string())
        } else {
            DownloadError::TransportError(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_only_for_non_success() {
        assert_eq!(DownloadError::NonSuccessStatus(404).status_code(), Some(404));
        assert_eq!(
            DownloadError::Timeout(Duration::from_secs(30)).status_code(),
            None
        );
    }

    #[test]
    fn test_timeout_message_mentions_timeout() {
        let msg = DownloadError::Timeout(Duration::from_secs(30)).to_string();
        assert!(msg.contains("timed out"));
        assert!(msg.contains("30s"));
    }
}
