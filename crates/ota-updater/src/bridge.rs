use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info};

use crate::{engine::EngineEvent, manager::WeakUpdateManager};

/// Forwards engine callbacks to the manager until either side goes away.
pub(crate) fn spawn_bridge(
    mut events: mpsc::Receiver<EngineEvent>,
    manager: WeakUpdateManager,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let Some(manager) = manager.upgrade() else {
                debug!("Update manager dropped; closing engine bridge");
                return;
            };
            match event {
                EngineEvent::StatusUpdate {
                    status_code,
                    progress,
                } => manager.on_engine_status(status_code, progress).await,
                // Success and failure already arrive as status updates.
                EngineEvent::PayloadApplicationComplete { error_code } => {
                    info!("Payload application complete (error code {})", error_code);
                }
            }
        }
        debug!("Engine event stream closed");
    })
}
