use crate::downloads::{CancelClaim, DownloadRegistry, DownloadStatus, FileSink, TransportSession};
use crate::error::DownloadError;
use crate::events::{DownloadEvent, EventSender, emit};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Tears down sessions and sinks on explicit cancel and on process
/// shutdown. Never fails: individual teardown errors are logged and the
/// remaining steps still run.
#[derive(Clone)]
pub struct CleanupCoordinator {
    registry: DownloadRegistry,
    tx: EventSender,
    grace: Duration,
}

impl CleanupCoordinator {
    pub fn new(registry: DownloadRegistry, tx: EventSender, grace: Duration) -> Self {
        Self {
            registry,
            tx,
            grace,
        }
    }

    /// Marks the download cancelled right away, releases its resources and,
    /// after the grace delay, unlinks the partial file, drops the record and
    /// acknowledges. Unknown ids are acknowledged immediately.
    ///
    /// The file is left alone if a newer attempt started writing to the
    /// same path during the grace delay.
    pub async fn cancel(&self, id: &str) {
        let (attempt, file_path, transport, sink) = match self.registry.claim_cancel(id) {
            CancelClaim::Active {
                attempt,
                file_path,
                transport,
                sink,
            } => (attempt, file_path, transport, sink),
            CancelClaim::Handoff => {
                info!("Cancelling download {} before its redirect is followed", id);
                emit(
                    &self.tx,
                    DownloadEvent::DownloadCancelled { id: id.to_string() },
                );
                return;
            }
            CancelClaim::Inactive => {
                debug!("{} ({}); acknowledging", DownloadError::UnknownIdOnCancel, id);
                emit(
                    &self.tx,
                    DownloadEvent::DownloadCancelled { id: id.to_string() },
                );
                return;
            }
        };

        info!("Cancelling download {} (attempt {})", id, attempt);
        release(id, transport, sink).await;

        let registry = self.registry.clone();
        let tx = self.tx.clone();
        let grace = self.grace;
        let id = id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            remove_partial(&registry, file_path, attempt).await;
            registry.remove_attempt(&id, attempt);
            emit(&tx, DownloadEvent::DownloadCancelled { id });
        });
    }

    /// Drains every registered download once and clears the registry.
    /// Partial files stay on disk.
    pub async fn shutdown(&self) -> usize {
        let handoffs = self.registry.cancel_handoffs();
        for id in &handoffs {
            emit(&self.tx, DownloadEvent::DownloadCancelled { id: id.clone() });
        }
        if self.registry.is_empty() {
            return handoffs.len();
        }
        let claimed = self.registry.update_all(|state| {
            let was_active = state.status == DownloadStatus::Downloading;
            state.status = DownloadStatus::Cancelled;
            let (transport, sink) = state.take_resources();
            (state.id.clone(), was_active, transport, sink)
        });
        let count = claimed.len() + handoffs.len();

        for (id, was_active, transport, sink) in claimed {
            release(&id, transport, sink).await;
            // Records already cancelled get their acknowledgement from the
            // pending cancel task.
            if was_active {
                emit(&self.tx, DownloadEvent::DownloadCancelled { id });
            }
        }

        self.registry.remove_all();
        info!("Shutdown drained {} downloads", count);
        count
    }
}

/// Terminates the transport and closes the sink, logging failures.
pub async fn release(id: &str, transport: Option<TransportSession>, sink: Option<FileSink>) {
    if let Some(transport) = transport {
        transport.terminate();
    }
    if let Some(sink) = sink
        && let Err(e) = sink.close().await
    {
        warn!(
            "Failed to close file sink for {} ({:?}): {}",
            id,
            sink.path(),
            e
        );
    }
}

/// Unlinks under the registry lock so a start on the same path cannot slip
/// in between the ownership check and the unlink.
async fn remove_partial(registry: &DownloadRegistry, path: PathBuf, attempt: u64) {
    let registry = registry.clone();
    let removed = tokio::task::spawn_blocking(move || {
        registry.unlink_if_owned(&path, attempt, |path| {
            (path.to_path_buf(), std::fs::remove_file(path))
        })
    })
    .await;

    match removed {
        Ok(None) => debug!("Partial file of attempt {} now belongs to a newer attempt", attempt),
        Ok(Some((path, Ok(())))) => debug!("Removed partial file {:?}", path),
        Ok(Some((_, Err(e)))) if e.kind() == ErrorKind::NotFound => {}
        Ok(Some((path, Err(e)))) => warn!("Failed to remove partial file {:?}: {}", path, e),
        Err(e) => warn!("Partial file removal task failed: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloads::DownloadState;
    use std::path::Path;
    use tempfile::tempdir;
    use tokio::sync::broadcast;

    fn coordinator(registry: &DownloadRegistry) -> (CleanupCoordinator, broadcast::Receiver<DownloadEvent>) {
        let (tx, rx) = broadcast::channel(16);
        (
            CleanupCoordinator::new(registry.clone(), tx, Duration::from_millis(50)),
            rx,
        )
    }

    async fn register(registry: &DownloadRegistry, id: &str, dir: &Path) -> (TransportSession, FileSink) {
        let mut state = DownloadState::new(id, "http://localhost/f", "f.bin", dir);
        let transport = TransportSession::new();
        let sink = FileSink::create(&state.file_path).await.unwrap();
        sink.write(b"partial").await.unwrap();
        state.transport = Some(transport.clone());
        state.sink = Some(sink.clone());
        registry.create(state);
        (transport, sink)
    }

    #[tokio::test]
    async fn test_cancel_unknown_id_acknowledges() {
        let registry = DownloadRegistry::new();
        let (cleanup, mut rx) = coordinator(&registry);

        cleanup.cancel("ghost").await;

        assert_eq!(
            rx.recv().await.unwrap(),
            DownloadEvent::DownloadCancelled {
                id: "ghost".to_string()
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cancel_marks_then_removes_after_grace() {
        let dir = tempdir().unwrap();
        let registry = DownloadRegistry::new();
        let (cleanup, mut rx) = coordinator(&registry);
        let (transport, sink) = register(&registry, "1", dir.path()).await;

        cleanup.cancel("1").await;

        let state = registry.get("1").unwrap();
        assert_eq!(state.status, DownloadStatus::Cancelled);
        assert!(state.transport.is_none());
        assert!(state.sink.is_none());
        assert!(transport.is_terminated());
        assert!(sink.is_closed().await);

        let event = rx.recv().await.unwrap();
        assert_eq!(event, DownloadEvent::DownloadCancelled { id: "1".to_string() });
        assert!(registry.get("1").is_none());
        assert!(!dir.path().join("f.bin").exists());
    }

    #[tokio::test]
    async fn test_shutdown_drains_everything_and_keeps_files() {
        let dir = tempdir().unwrap();
        let registry = DownloadRegistry::new();
        let (cleanup, mut rx) = coordinator(&registry);
        let mut handles = Vec::new();
        for id in ["a", "b"] {
            let sub = dir.path().join(id);
            std::fs::create_dir_all(&sub).unwrap();
            handles.push(register(&registry, id, &sub).await);
        }

        assert_eq!(cleanup.shutdown().await, 2);
        assert!(registry.is_empty());
        for (transport, sink) in &handles {
            assert!(transport.is_terminated());
            assert!(sink.is_closed().await);
        }
        assert!(dir.path().join("a").join("f.bin").exists());

        let mut ids = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()]
            .into_iter()
            .map(|e| e.id().to_string())
            .collect::<Vec<_>>();
        ids.sort();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_cancel_keeps_file_taken_over_by_newer_attempt() {
        let dir = tempdir().unwrap();
        let registry = DownloadRegistry::new();
        let (cleanup, mut rx) = coordinator(&registry);
        register(&registry, "old", dir.path()).await;

        cleanup.cancel("old").await;
        let (_, sink) = register(&registry, "new", dir.path()).await;
        sink.close().await.unwrap();

        assert_eq!(
            rx.recv().await.unwrap(),
            DownloadEvent::DownloadCancelled { id: "old".to_string() }
        );
        assert!(registry.get("old").is_none());
        assert_eq!(std::fs::read(dir.path().join("f.bin")).unwrap(), b"partial");
    }

    #[tokio::test]
    async fn test_cancel_pending_redirect_acknowledges_once() {
        let dir = tempdir().unwrap();
        let registry = DownloadRegistry::new();
        let (cleanup, mut rx) = coordinator(&registry);
        register(&registry, "r", dir.path()).await;
        let attempt = registry.get("r").unwrap().attempt;
        registry.take_redirected("r", attempt, true);

        cleanup.cancel("r").await;
        assert_eq!(
            rx.recv().await.unwrap(),
            DownloadEvent::DownloadCancelled { id: "r".to_string() }
        );
        assert!(registry.resume(DownloadState::new("r", "http://localhost/g", "f.bin", dir.path())).is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_cancels_pending_redirects() {
        let registry = DownloadRegistry::new();
        let (cleanup, mut rx) = coordinator(&registry);
        let (attempt, _) = registry.create(DownloadState::new("r", "http://localhost/f", "f.bin", Path::new("/tmp")));
        registry.take_redirected("r", attempt, true);

        assert_eq!(cleanup.shutdown().await, 1);
        assert_eq!(
            rx.recv().await.unwrap(),
            DownloadEvent::DownloadCancelled { id: "r".to_string() }
        );
        assert!(!registry.finish_handoff("r", || panic!("cancelled by shutdown")));
    }

    #[tokio::test]
    async fn test_shutdown_on_empty_registry() {
        let registry = DownloadRegistry::new();
        let (cleanup, _rx) = coordinator(&registry);
        assert_eq!(cleanup.shutdown().await, 0);
    }
}
