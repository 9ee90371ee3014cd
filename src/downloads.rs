use serde::Serialize;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Downloading,
    Completed,
    Error,
    Cancelled,
}

impl DownloadStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, DownloadStatus::Downloading)
    }
}

/// Handle on the outbound request of one attempt. The driver task watches
/// the token at every suspension point and drops the response once it fires.
#[derive(Clone, Debug, Default)]
pub struct TransportSession {
    token: CancellationToken,
}

impl TransportSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn terminate(&self) {
        self.token.cancel();
    }

    #[cfg(test)]
    pub fn is_terminated(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Writable destination file of one attempt.
///
/// Clones share the handle. A write holding the lock always finishes;
/// `close` takes the handle so later writes become no-ops.
#[derive(Clone, Debug)]
pub struct FileSink {
    path: PathBuf,
    file: Arc<tokio::sync::Mutex<Option<File>>>,
}

impl FileSink {
    pub async fn create(path: &Path) -> io::Result<Self> {
        let file = File::create(path).await?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Arc::new(tokio::sync::Mutex::new(Some(file))),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns `Ok(false)` without writing when the sink is already closed.
    pub async fn write(&self, chunk: &[u8]) -> io::Result<bool> {
        let mut guard = self.file.lock().await;
        match guard.as_mut() {
            Some(file) => {
                file.write_all(chunk).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Flushes and releases the handle. Closing twice is fine.
    pub async fn close(&self) -> io::Result<()> {
        let file = self.file.lock().await.take();
        if let Some(mut file) = file {
            file.flush().await?;
        }
        Ok(())
    }

    #[cfg(test)]
    pub async fn is_closed(&self) -> bool {
        self.file.lock().await.is_none()
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct DownloadState {
    pub id: String,
    pub attempt: u64,
    pub url: String,
    pub filename: String,
    pub destination_directory: PathBuf,
    pub file_path: PathBuf,
    pub status: DownloadStatus,
    pub total_size: u64,
    pub bytes_downloaded: u64,
    pub progress: u64,
    pub speed: u64, // bytes per second
    #[serde(skip)]
    pub start_time: Instant,
    #[serde(skip)]
    pub transport: Option<TransportSession>,
    #[serde(skip)]
    pub sink: Option<FileSink>,
}

impl DownloadState {
    pub fn new(id: &str, url: &str, filename: &str, destination_directory: &Path) -> Self {
        Self {
            id: id.to_string(),
            attempt: 0,
            url: url.to_string(),
            filename: filename.to_string(),
            destination_directory: destination_directory.to_path_buf(),
            file_path: destination_directory.join(filename),
            status: DownloadStatus::Downloading,
            total_size: 0,
            bytes_downloaded: 0,
            progress: 0,
            speed: 0,
            start_time: Instant::now(),
            transport: None,
            sink: None,
        }
    }

    /// Detaches the session and sink so they can be torn down outside the
    /// registry lock.
    pub fn take_resources(&mut self) -> (Option<TransportSession>, Option<FileSink>) {
        (self.transport.take(), self.sink.take())
    }
}

/// What `claim_cancel` found under an id.
#[derive(Debug)]
pub enum CancelClaim {
    /// A running attempt, now marked cancelled. Its resources are detached
    /// and its file is scheduled for unlinking.
    Active {
        attempt: u64,
        file_path: PathBuf,
        transport: Option<TransportSession>,
        sink: Option<FileSink>,
    },
    /// The id redirected and the follow-up start has not run yet. It now
    /// never will.
    Handoff,
    /// Unknown id, or a record that already reached a terminal state.
    Inactive,
}

#[derive(Default)]
struct RegistryInner {
    entries: HashMap<String, DownloadState>,
    /// Ids between a redirect and the start that follows it; `true` once
    /// cancelled.
    handoffs: HashMap<String, bool>,
    /// Files of cancelled attempts waiting for the grace delay, keyed to
    /// the attempt that wrote them. A newer attempt on the same path
    /// drops the entry.
    pending_unlinks: HashMap<PathBuf, u64>,
    next_attempt: u64,
}

impl RegistryInner {
    fn insert(&mut self, mut state: DownloadState) -> (u64, Option<DownloadState>) {
        self.next_attempt += 1;
        let attempt = self.next_attempt;
        state.attempt = attempt;
        self.pending_unlinks.remove(&state.file_path);
        let replaced = self.entries.insert(state.id.clone(), state);
        (attempt, replaced)
    }
}

/// The only owner of the id → state mapping. Cheap to clone; every clone
/// sees the same entries.
#[derive(Clone, Default)]
pub struct DownloadRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl DownloadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts a fresh record under `state.id` and stamps it with a new
    /// attempt number. A record already stored under that id is handed back.
    /// Any redirect still waiting to be followed for the id is dropped.
    pub fn create(&self, state: DownloadState) -> (u64, Option<DownloadState>) {
        let mut inner = self.lock();
        inner.handoffs.remove(&state.id);
        inner.insert(state)
    }

    /// Registers the start that follows a redirect. Returns `None` when the
    /// id was cancelled, or taken over by a fresh start, in the meantime.
    pub fn resume(&self, state: DownloadState) -> Option<(u64, Option<DownloadState>)> {
        let mut inner = self.lock();
        match inner.handoffs.remove(&state.id) {
            Some(false) => Some(inner.insert(state)),
            _ => None,
        }
    }

    #[cfg(test)]
    pub fn get(&self, id: &str) -> Option<DownloadState> {
        self.lock().entries.get(id).cloned()
    }

    #[cfg(test)]
    pub fn update<R>(&self, id: &str, mutator: impl FnOnce(&mut DownloadState) -> R) -> Option<R> {
        self.lock().entries.get_mut(id).map(mutator)
    }

    /// Like `update`, but only when the stored record still belongs to
    /// `attempt`.
    pub fn update_attempt<R>(
        &self,
        id: &str,
        attempt: u64,
        mutator: impl FnOnce(&mut DownloadState) -> R,
    ) -> Option<R> {
        self.lock()
            .entries
            .get_mut(id)
            .filter(|state| state.attempt == attempt)
            .map(mutator)
    }

    /// Applies `mutator` to every record exactly once.
    pub fn update_all<R>(&self, mut mutator: impl FnMut(&mut DownloadState) -> R) -> Vec<R> {
        self.lock().entries.values_mut().map(&mut mutator).collect()
    }

    pub fn remove_attempt(&self, id: &str, attempt: u64) -> Option<DownloadState> {
        let mut inner = self.lock();
        match inner.entries.get(id) {
            Some(state) if state.attempt == attempt => inner.entries.remove(id),
            _ => None,
        }
    }

    /// Removes the record only if it is still `attempt` and still
    /// downloading. The caller then owns the terminal outcome.
    pub fn take_active(&self, id: &str, attempt: u64) -> Option<DownloadState> {
        self.take_redirected(id, attempt, false)
    }

    /// Like `take_active`, but when `hold` is set the id stays reserved for
    /// the start that follows the redirect.
    pub fn take_redirected(&self, id: &str, attempt: u64, hold: bool) -> Option<DownloadState> {
        let mut inner = self.lock();
        let state = match inner.entries.get(id) {
            Some(state)
                if state.attempt == attempt && state.status == DownloadStatus::Downloading =>
            {
                inner.entries.remove(id)
            }
            _ => None,
        }?;
        if hold {
            inner.handoffs.insert(id.to_string(), false);
        }
        Some(state)
    }

    /// Drops the redirect reservation of `id`. `on_live` runs under the lock
    /// when the reservation was not cancelled, so nothing can cancel the id
    /// while the caller reports its outcome.
    pub fn finish_handoff(&self, id: &str, on_live: impl FnOnce()) -> bool {
        let mut inner = self.lock();
        let live = inner.handoffs.remove(id) == Some(false);
        if live {
            on_live();
        }
        live
    }

    /// Marks whatever `id` currently stands for as cancelled.
    pub fn claim_cancel(&self, id: &str) -> CancelClaim {
        let mut inner = self.lock();
        if let Some(state) = inner.entries.get_mut(id) {
            if state.status.is_terminal() {
                return CancelClaim::Inactive;
            }
            state.status = DownloadStatus::Cancelled;
            let (transport, sink) = state.take_resources();
            let attempt = state.attempt;
            let file_path = state.file_path.clone();
            inner.pending_unlinks.insert(file_path.clone(), attempt);
            return CancelClaim::Active {
                attempt,
                file_path,
                transport,
                sink,
            };
        }
        match inner.handoffs.get_mut(id) {
            Some(cancelled) if !*cancelled => {
                *cancelled = true;
                CancelClaim::Handoff
            }
            _ => CancelClaim::Inactive,
        }
    }

    /// Cancels every redirect still waiting to be followed and returns
    /// their ids.
    pub fn cancel_handoffs(&self) -> Vec<String> {
        self.lock()
            .handoffs
            .iter_mut()
            .filter(|(_, cancelled)| !**cancelled)
            .map(|(id, cancelled)| {
                *cancelled = true;
                id.clone()
            })
            .collect()
    }

    /// Runs `unlink` under the lock if `path` still belongs to the cancelled
    /// `attempt`, i.e. no later attempt has started writing there.
    pub fn unlink_if_owned<R>(
        &self,
        path: &Path,
        attempt: u64,
        unlink: impl FnOnce(&Path) -> R,
    ) -> Option<R> {
        let mut inner = self.lock();
        if inner.pending_unlinks.get(path) != Some(&attempt) {
            return None;
        }
        inner.pending_unlinks.remove(path);
        Some(unlink(path))
    }

    pub fn remove_all(&self) -> Vec<DownloadState> {
        self.lock().entries.drain().map(|(_, state)| state).collect()
    }

    pub fn snapshot(&self) -> Vec<DownloadState> {
        let mut states: Vec<_> = self.lock().entries.values().cloned().collect();
        states.sort_by(|a, b| a.id.cmp(&b.id));
        states
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
