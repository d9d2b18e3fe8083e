use ota_proto::ota::v1::{
    status_event::Payload, updater_service_server::UpdaterService, ApplyUpdateRequest,
    ApplyUpdateResponse, CheckAndApplyUpdateRequest, CheckAndApplyUpdateResponse,
    CheckForUpdateRequest, CheckForUpdateResponse, GetStatusRequest, GetStatusResponse,
    ProgressUpdated, ResumeUpdateRequest, ResumeUpdateResponse, StatusChanged,
    StatusEvent as ProtoStatusEvent, StatusSnapshot, StreamStatusRequest, SuspendUpdateRequest,
    SuspendUpdateResponse,
};
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use tracing::{info, warn};

use crate::{
    error::UpdateError,
    manager::{ApplyOutcome, CheckOutcome, Snapshot, StatusEvent, UpdateManager},
    status::UpdateStatus,
};

const STREAM_BUFFER: usize = 256;

#[derive(Clone)]
pub struct UpdaterSvc {
    manager: UpdateManager,
}

impl UpdaterSvc {
    pub fn new(manager: UpdateManager) -> Self {
        Self { manager }
    }

    async fn status_proto(&self) -> StatusSnapshot {
        snapshot_to_proto(&self.manager.snapshot().await)
    }

    fn spawn_apply(&self) {
        let manager = self.manager.clone();
        tokio::spawn(async move {
            match manager.apply_available().await {
                ApplyOutcome::Started => info!("Update download started"),
                ApplyOutcome::NoUpdate => info!("No update to apply"),
                ApplyOutcome::Busy => info!("Update already in progress"),
                ApplyOutcome::Failed(err) => warn!("Update failed: {}", err),
            }
        });
    }
}

pub fn snapshot_to_proto(snapshot: &Snapshot) -> StatusSnapshot {
    StatusSnapshot {
        state: snapshot.status.to_proto() as i32,
        progress_percent: if snapshot.status.is_active_transfer() {
            snapshot.progress_percent
        } else {
            0
        },
        manifest: snapshot.manifest.as_ref().map(|m| m.summary()),
        last_check: ota_util::ts(snapshot.last_check_unix_millis),
        update_failed: snapshot.status.is_failure(),
    }
}

fn event_to_proto(event: &StatusEvent) -> ProtoStatusEvent {
    ProtoStatusEvent {
        seq: event.seq,
        at: ota_util::ts(event.at_unix_millis),
        payload: Some(Payload::StatusChanged(StatusChanged {
            state: event.status.to_proto() as i32,
        })),
    }
}

fn progress_to_proto(percent: u32) -> ProtoStatusEvent {
    ProtoStatusEvent {
        seq: 0,
        at: ota_util::ts(ota_util::now_millis()),
        payload: Some(Payload::ProgressUpdated(ProgressUpdated { percent })),
    }
}

fn engine_status(err: UpdateError) -> Status {
    match err {
        UpdateError::Engine(msg) => Status::unavailable(msg),
        other => Status::internal(other.to_string()),
    }
}

/// Returns `false` while an apply cannot start, so callers get an honest
/// `accepted` flag before the work moves to the background.
fn can_start_apply(snapshot: &Snapshot) -> bool {
    snapshot.manifest.is_some()
        && !snapshot.status.is_busy()
        && !matches!(
            snapshot.status,
            UpdateStatus::CheckingForUpdate | UpdateStatus::UpdatedNeedReboot
        )
}

#[tonic::async_trait]
impl UpdaterService for UpdaterSvc {
    async fn check_for_update(
        &self,
        request: Request<CheckForUpdateRequest>,
    ) -> Result<Response<CheckForUpdateResponse>, Status> {
        let req = request.into_inner();
        let outcome = if req.channel.trim().is_empty() {
            self.manager.check_updates().await
        } else {
            self.manager.check_updates_on(req.channel.trim()).await
        };
        if outcome == CheckOutcome::Busy {
            return Err(Status::failed_precondition(
                "an update is in progress or awaiting reboot",
            ));
        }
        Ok(Response::new(CheckForUpdateResponse {
            update_available: outcome == CheckOutcome::UpdateAvailable,
            status: Some(self.status_proto().await),
        }))
    }

    async fn apply_update(
        &self,
        _request: Request<ApplyUpdateRequest>,
    ) -> Result<Response<ApplyUpdateResponse>, Status> {
        let accepted = can_start_apply(&self.manager.snapshot().await);
        if accepted {
            self.spawn_apply();
        }
        Ok(Response::new(ApplyUpdateResponse {
            accepted,
            status: Some(self.status_proto().await),
        }))
    }

    async fn check_and_apply_update(
        &self,
        request: Request<CheckAndApplyUpdateRequest>,
    ) -> Result<Response<CheckAndApplyUpdateResponse>, Status> {
        let req = request.into_inner();
        let outcome = if req.channel.trim().is_empty() {
            self.manager.check_updates().await
        } else {
            self.manager.check_updates_on(req.channel.trim()).await
        };
        if outcome == CheckOutcome::Busy {
            return Err(Status::failed_precondition(
                "an update is in progress or awaiting reboot",
            ));
        }
        let update_available = outcome == CheckOutcome::UpdateAvailable;
        let accepted = update_available && can_start_apply(&self.manager.snapshot().await);
        if accepted {
            self.spawn_apply();
        }
        Ok(Response::new(CheckAndApplyUpdateResponse {
            update_available,
            accepted,
            status: Some(self.status_proto().await),
        }))
    }

    async fn suspend_update(
        &self,
        _request: Request<SuspendUpdateRequest>,
    ) -> Result<Response<SuspendUpdateResponse>, Status> {
        let accepted = self.manager.suspend_update().await.map_err(engine_status)?;
        Ok(Response::new(SuspendUpdateResponse {
            accepted,
            status: Some(self.status_proto().await),
        }))
    }

    async fn resume_update(
        &self,
        _request: Request<ResumeUpdateRequest>,
    ) -> Result<Response<ResumeUpdateResponse>, Status> {
        let accepted = self.manager.resume_update().await.map_err(engine_status)?;
        Ok(Response::new(ResumeUpdateResponse {
            accepted,
            status: Some(self.status_proto().await),
        }))
    }

    async fn get_status(
        &self,
        _request: Request<GetStatusRequest>,
    ) -> Result<Response<GetStatusResponse>, Status> {
        Ok(Response::new(GetStatusResponse {
            status: Some(self.status_proto().await),
        }))
    }

    type StreamStatusStream = ReceiverStream<Result<ProtoStatusEvent, Status>>;

    async fn stream_status(
        &self,
        request: Request<StreamStatusRequest>,
    ) -> Result<Response<Self::StreamStatusStream>, Status> {
        let req = request.into_inner();
        let (history, mut rx) = self.manager.subscribe_with_history().await;
        let history = if req.include_history { history } else { Vec::new() };
        let mut progress = self.manager.watch_progress();

        let (tx, out_rx) = mpsc::channel::<Result<ProtoStatusEvent, Status>>(STREAM_BUFFER);

        // Replay history, then forward live status and progress.
        tokio::spawn(async move {
            for event in &history {
                if tx.send(Ok(event_to_proto(event))).await.is_err() {
                    return;
                }
            }

            loop {
                tokio::select! {
                    received = rx.recv() => match received {
                        Ok(event) => {
                            if tx.send(Ok(event_to_proto(&event))).await.is_err() {
                                return;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("Status stream lagged; skipped {} events", skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    },
                    changed = progress.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        let percent = *progress.borrow_and_update();
                        if tx.send(Ok(progress_to_proto(percent))).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(out_rx)))
    }
}
