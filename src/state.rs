use crate::config::Settings;
use crate::controller::DownloadController;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct AppState {
    pub settings: Settings,
    pub controller: DownloadController,
    /// Fired after downloads are drained; ends open event streams.
    pub shutdown: CancellationToken,
}
