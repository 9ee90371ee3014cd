use crate::controller::{DownloadController, StartRequest};
use crate::error::DownloadError;
use crate::events::DownloadEvent;
use crate::state::AppState;
use std::collections::HashMap;
use tokio::sync::broadcast::{Receiver, error::RecvError};
use tracing::{info, warn};

pub fn start_background_tasks(state: AppState) {
    // Redirect follower
    if state.settings.follow_redirects {
        let rx = state.controller.subscribe();
        let controller = state.controller.clone();
        let max_redirects = state.settings.max_redirects;
        tokio::spawn(async move {
            follow_redirects(controller, rx, max_redirects).await;
        });
    }
}

/// Re-issues `start-download` against every redirect target, keeping the
/// id, filename and directory, until `max_redirects` hops for one id.
/// Ids cancelled between the redirect and this task picking it up are not
/// restarted.
pub async fn follow_redirects(
    controller: DownloadController,
    mut rx: Receiver<DownloadEvent>,
    max_redirects: u32,
) {
    let mut hops: HashMap<String, u32> = HashMap::new();

    loop {
        match rx.recv().await {
            Ok(DownloadEvent::DownloadRedirect {
                id,
                new_url,
                filename,
                destination_directory,
            }) => {
                let count = hops.entry(id.clone()).or_insert(0);
                *count += 1;
                if *count > max_redirects {
                    hops.remove(&id);
                    warn!("Download {} exceeded {} redirects", id, max_redirects);
                    controller.abandon_redirect(&id, DownloadError::TooManyRedirects(max_redirects));
                    continue;
                }

                info!("Following redirect {} for {} -> {}", count, id, new_url);
                controller
                    .follow(StartRequest {
                        id,
                        url: new_url,
                        filename,
                        destination_directory,
                    })
                    .await;
            }
            Ok(event) if event.is_terminal() => {
                hops.remove(event.id());
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                warn!("Redirect follower lagged, skipped {} events", skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }
}
