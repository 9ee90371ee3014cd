use crate::cleanup::{CleanupCoordinator, release};
use crate::config::Settings;
use crate::downloads::{DownloadRegistry, DownloadState, DownloadStatus, FileSink, TransportSession};
use crate::error::DownloadError;
use crate::events::{DownloadEvent, EventSender, emit};
use crate::progress;
use futures::StreamExt;
use reqwest::header::LOCATION;
use reqwest::{Client, redirect};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Arguments of the `start-download` command.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub id: String,
    pub url: String,
    pub filename: String,
    pub destination_directory: PathBuf,
}

/// How the streaming loop of one attempt ended.
enum Outcome {
    Finished,
    Redirected(String),
    /// Cancelled, shut down, or the record was replaced. Nothing to report.
    Abandoned,
}

/// Drives downloads from start to a terminal event.
#[derive(Clone)]
pub struct DownloadController {
    registry: DownloadRegistry,
    cleanup: CleanupCoordinator,
    client: Client,
    tx: EventSender,
    timeout: Duration,
    /// Whether redirected ids stay reserved for a follow-up start.
    hold_redirects: bool,
}

impl DownloadController {
    pub fn new(
        settings: &Settings,
        registry: DownloadRegistry,
        tx: EventSender,
    ) -> Result<Self, reqwest::Error> {
        let timeout = settings.timeout();
        let client = Client::builder()
            .redirect(redirect::Policy::none())
            .connect_timeout(timeout)
            .user_agent(settings.user_agent.clone())
            .build()?;
        let cleanup = CleanupCoordinator::new(registry.clone(), tx.clone(), settings.cancel_grace());

        Ok(Self {
            registry,
            cleanup,
            client,
            tx,
            timeout,
            hold_redirects: settings.follow_redirects,
        })
    }

    pub fn registry(&self) -> &DownloadRegistry {
        &self.registry
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.tx.subscribe()
    }

    /// Prepares the destination, registers the attempt and spawns its
    /// driver. Setup failures become a single `download-error` and leave
    /// nothing in the registry.
    pub async fn start(&self, request: StartRequest) {
        let id = request.id.clone();
        if let Err(e) = self.begin(request, false).await {
            error!("Download {} failed to start: {}", id, e);
            self.report_error(&id, &e);
        }
    }

    /// Starts the attempt that follows a redirect. Does nothing if the id
    /// was cancelled, or started afresh, after the redirect.
    pub async fn follow(&self, request: StartRequest) {
        let id = request.id.clone();
        if let Err(e) = self.begin(request, true).await {
            self.abandon_redirect(&id, e);
        }
    }

    /// Ends a redirected id that will not be followed with a single
    /// `download-error`, unless it was cancelled in the meantime.
    pub fn abandon_redirect(&self, id: &str, err: DownloadError) {
        let reported = self.registry.finish_handoff(id, || {
            error!("Download {} failed after redirect: {}", id, err);
            self.report_error(id, &err);
        });
        if !reported {
            debug!("Download {} no longer awaits its redirect: {}", id, err);
        }
    }

    /// Fire-and-forget; always ends in a `download-cancelled` event.
    pub async fn cancel(&self, id: &str) {
        self.cleanup.cancel(id).await;
    }

    pub async fn shutdown(&self) -> usize {
        self.cleanup.shutdown().await
    }

    /// Errors returned here happen before anything is registered. Later
    /// failures are reported by the attempt itself.
    async fn begin(&self, request: StartRequest, resume: bool) -> Result<(), DownloadError> {
        validate_filename(&request.filename)?;

        let dir = &request.destination_directory;
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|source| DownloadError::DirectoryCreateFailed {
                path: dir.clone(),
                source,
            })?;

        let mut state = DownloadState::new(&request.id, &request.url, &request.filename, dir);
        let file_path = state.file_path.clone();
        let transport = TransportSession::new();
        state.transport = Some(transport.clone());

        // Registered before the file is touched so a pending unlink from a
        // cancelled attempt on the same path is dropped first.
        let registered = if resume {
            self.registry.resume(state)
        } else {
            Some(self.registry.create(state))
        };
        let Some((attempt, replaced)) = registered else {
            info!("Download {} was cancelled before its redirect was followed", request.id);
            return Ok(());
        };
        if let Some(mut old) = replaced {
            warn!("Download id {} reused while still registered", request.id);
            let (old_transport, old_sink) = old.take_resources();
            release(&request.id, old_transport, old_sink).await;
        }

        remove_if_empty(&file_path).await;
        let sink = match FileSink::create(&file_path).await {
            Ok(sink) => sink,
            Err(source) => {
                let err = DownloadError::FileOpen {
                    path: file_path,
                    source,
                };
                if self.registry.take_active(&request.id, attempt).is_some() {
                    transport.terminate();
                    error!("Download {} failed to start: {}", request.id, err);
                    self.report_error(&request.id, &err);
                }
                return Ok(());
            }
        };

        let attached = self.registry.update_attempt(&request.id, attempt, |state| {
            if state.status != DownloadStatus::Downloading {
                return false;
            }
            state.sink = Some(sink.clone());
            true
        });
        if attached != Some(true) {
            debug!("Download {} cancelled while opening {:?}", request.id, file_path);
            if let Err(e) = sink.close().await {
                warn!("Failed to close file sink for {}: {}", request.id, e);
            }
            return Ok(());
        }

        info!(
            "Starting download {} (attempt {}): {} -> {:?}",
            request.id,
            attempt,
            request.url,
            sink.path()
        );

        let controller = self.clone();
        tokio::spawn(async move {
            controller
                .drive(request.id, attempt, request.url, transport.token(), sink)
                .await;
        });
        Ok(())
    }

    async fn drive(
        self,
        id: String,
        attempt: u64,
        url: String,
        token: CancellationToken,
        sink: FileSink,
    ) {
        match self.stream(&id, attempt, &url, &token, &sink).await {
            Ok(Outcome::Finished) => self.complete(&id, attempt, &sink).await,
            Ok(Outcome::Redirected(location)) => self.redirect(&id, attempt, location).await,
            Ok(Outcome::Abandoned) => {
                debug!("Download {} (attempt {}) abandoned", id, attempt);
                if let Err(e) = sink.close().await {
                    warn!("Failed to close file sink for {}: {}", id, e);
                }
            }
            Err(e) => self.fail(&id, attempt, &sink, e).await,
        }
    }

    async fn stream(
        &self,
        id: &str,
        attempt: u64,
        url: &str,
        token: &CancellationToken,
        sink: &FileSink,
    ) -> Result<Outcome, DownloadError> {
        let request = self.client.get(url);
        let response = tokio::select! {
            _ = token.cancelled() => return Ok(Outcome::Abandoned),
            sent = tokio::time::timeout(self.timeout, request.send()) => match sent {
                Ok(response) => response?,
                Err(_) => return Err(DownloadError::Timeout(self.timeout)),
            },
        };

        let status = response.status();
        if status.is_redirection() {
            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| response.url().join(value).ok());
            return match location {
                Some(location) => Ok(Outcome::Redirected(location.to_string())),
                None => Err(DownloadError::NonSuccessStatus(status.as_u16())),
            };
        }
        if !status.is_success() {
            return Err(DownloadError::NonSuccessStatus(status.as_u16()));
        }

        let total_size = response.content_length().unwrap_or(0);
        if self
            .registry
            .update_attempt(id, attempt, |state| state.total_size = total_size)
            .is_none()
        {
            return Ok(Outcome::Abandoned);
        }
        debug!("Download {} response {} with size {}", id, status, total_size);

        let mut body = response.bytes_stream();
        loop {
            let next = tokio::select! {
                _ = token.cancelled() => return Ok(Outcome::Abandoned),
                next = tokio::time::timeout(self.timeout, body.next()) => next,
            };
            let chunk = match next {
                Err(_) => return Err(DownloadError::Timeout(self.timeout)),
                Ok(None) => return Ok(Outcome::Finished),
                Ok(Some(Err(e))) => return Err(DownloadError::StreamError(e.to_string())),
                Ok(Some(Ok(chunk))) => chunk,
            };

            if !self.is_active(id, attempt) {
                token.cancel();
                return Ok(Outcome::Abandoned);
            }
            match sink.write(&chunk).await {
                Ok(true) => {}
                Ok(false) => return Ok(Outcome::Abandoned),
                Err(e) => return Err(DownloadError::StreamError(format!("write failed: {}", e))),
            }

            let reported = self.registry.update_attempt(id, attempt, |state| {
                if state.status != DownloadStatus::Downloading {
                    return false;
                }
                state.bytes_downloaded += chunk.len() as u64;
                let sample = progress::measure(
                    state.bytes_downloaded,
                    state.total_size,
                    state.start_time.elapsed(),
                );
                state.progress = sample.percent;
                state.speed = sample.speed;
                // Emitted under the registry lock so no progress can follow
                // a cancellation mark.
                emit(
                    &self.tx,
                    DownloadEvent::DownloadProgress {
                        id: state.id.clone(),
                        progress: sample.percent,
                        downloaded: state.bytes_downloaded,
                        size: state.total_size,
                        speed: sample.speed,
                    },
                );
                true
            });
            if reported != Some(true) {
                token.cancel();
                return Ok(Outcome::Abandoned);
            }
        }
    }

    fn is_active(&self, id: &str, attempt: u64) -> bool {
        self.registry
            .update_attempt(id, attempt, |state| state.status == DownloadStatus::Downloading)
            .unwrap_or(false)
    }

    async fn complete(&self, id: &str, attempt: u64, sink: &FileSink) {
        if let Err(e) = sink.close().await {
            let err = DownloadError::StreamError(format!("failed to finalize file: {}", e));
            self.fail(id, attempt, sink, err).await;
            return;
        }

        let Some(mut state) = self.registry.take_active(id, attempt) else {
            debug!("Download {} finished after cancellation; no completion", id);
            return;
        };
        let (transport, _) = state.take_resources();
        release(id, transport, None).await;
        state.status = DownloadStatus::Completed;
        // Unknown length: what arrived is the whole file.
        if state.total_size == 0 {
            state.total_size = state.bytes_downloaded;
        }
        state.progress = 100;

        info!(
            "Download {} complete: {} bytes in {:.2?} -> {:?}",
            id,
            state.bytes_downloaded,
            state.start_time.elapsed(),
            state.file_path
        );
        emit(
            &self.tx,
            DownloadEvent::DownloadComplete {
                id: state.id,
                file_path: state.file_path,
            },
        );
    }

    async fn redirect(&self, id: &str, attempt: u64, location: String) {
        let Some(mut state) = self.registry.take_redirected(id, attempt, self.hold_redirects) else {
            return;
        };
        let (transport, sink) = state.take_resources();
        release(id, transport, sink).await;
        remove_if_empty(&state.file_path).await;

        info!(
            "Download {} from {}: {}",
            id,
            state.url,
            DownloadError::RedirectReceived(location.clone())
        );
        emit(
            &self.tx,
            DownloadEvent::DownloadRedirect {
                id: state.id,
                new_url: location,
                filename: state.filename,
                destination_directory: state.destination_directory,
            },
        );
    }

    async fn fail(&self, id: &str, attempt: u64, sink: &FileSink, err: DownloadError) {
        if let Err(e) = sink.close().await {
            warn!("Failed to close file sink for {}: {}", id, e);
        }
        let Some(mut state) = self.registry.take_active(id, attempt) else {
            debug!("Download {} errored after cancellation: {}", id, err);
            return;
        };
        let (transport, sink) = state.take_resources();
        release(id, transport, sink).await;
        state.status = DownloadStatus::Error;

        match &err {
            DownloadError::NonSuccessStatus(_) => warn!("Download {} failed: {}", id, err),
            _ => error!("Download {} failed: {}", id, err),
        }
        self.report_error(id, &err);
    }

    fn report_error(&self, id: &str, err: &DownloadError) {
        emit(
            &self.tx,
            DownloadEvent::DownloadError {
                id: id.to_string(),
                error: err.to_string(),
                status_code: err.status_code(),
            },
        );
    }
}

fn validate_filename(filename: &str) -> Result<(), DownloadError> {
    let invalid = filename.is_empty()
        || filename == "."
        || filename == ".."
        || filename.contains(|c: char| c == '/' || c == '\\');
    if invalid {
        return Err(DownloadError::InvalidFilename(filename.to_string()));
    }
    Ok(())
}

/// Zero-byte files at the target are leftovers of a failed attempt.
async fn remove_if_empty(path: &Path) {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() && meta.len() == 0 => {
            if let Err(e) = tokio::fs::remove_file(path).await
                && e.kind() != ErrorKind::NotFound
            {
                warn!("Failed to remove empty file {:?}: {}", path, e);
            }
        }
        _ => {}
    }
}
