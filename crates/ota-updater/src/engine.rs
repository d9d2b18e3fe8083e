use std::{path::Path, time::Duration};

use ota_proto::ota::v1::{
    engine_callback::Event, update_engine_service_client::UpdateEngineServiceClient,
    ApplyPayloadRequest, BindRequest, ResumeEngineRequest, SuspendEngineRequest,
    VerifyPayloadMetadataRequest,
};
use tokio::sync::mpsc;
use tonic::transport::Channel;
use tracing::{info, warn};

use crate::error::UpdateError;

const EVENT_BUFFER: usize = 64;
const BIND_RETRY_MIN: Duration = Duration::from_millis(500);
const BIND_RETRY_MAX: Duration = Duration::from_secs(30);

/// Raw callback from the update engine.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum EngineEvent {
    StatusUpdate { status_code: i32, progress: f32 },
    PayloadApplicationComplete { error_code: i32 },
}

/// The privileged component that writes the payload to the inactive slot.
#[tonic::async_trait]
pub trait UpdateEngine: Send + Sync {
    async fn verify_payload_metadata(&self, path: &Path) -> Result<bool, UpdateError>;

    async fn apply_payload(
        &self,
        url: &str,
        offset: u64,
        size: u64,
        headers: Vec<String>,
    ) -> Result<(), UpdateError>;

    async fn suspend(&self) -> Result<(), UpdateError>;

    async fn resume(&self) -> Result<(), UpdateError>;

    /// Subscribes to engine callbacks for the rest of the process lifetime.
    fn bind(&self) -> mpsc::Receiver<EngineEvent>;
}

/// Engine reached over `ota.v1.UpdateEngineService`.
#[derive(Clone)]
pub struct GrpcEngine {
    addr: String,
}

impl GrpcEngine {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    async fn connect(&self) -> Result<UpdateEngineServiceClient<Channel>, UpdateError> {
        connect_engine(&self.addr).await
    }
}

async fn connect_engine(addr: &str) -> Result<UpdateEngineServiceClient<Channel>, UpdateError> {
    let endpoint = format!("http://{addr}");
    let channel = Channel::from_shared(endpoint)
        .map_err(|e| UpdateError::Engine(format!("invalid engine endpoint: {e}")))?
        .connect()
        .await
        .map_err(|e| UpdateError::Engine(format!("update engine unavailable: {e}")))?;
    Ok(UpdateEngineServiceClient::new(channel))
}

fn engine_error(call: &str, status: tonic::Status) -> UpdateError {
    UpdateError::Engine(format!("{call} failed: {}", status.message()))
}

#[tonic::async_trait]
impl UpdateEngine for GrpcEngine {
    async fn verify_payload_metadata(&self, path: &Path) -> Result<bool, UpdateError> {
        let mut client = self.connect().await?;
        let resp = client
            .verify_payload_metadata(VerifyPayloadMetadataRequest {
                metadata_path: path.to_string_lossy().into_owned(),
            })
            .await
            .map_err(|e| engine_error("verify_payload_metadata", e))?;
        Ok(resp.into_inner().valid)
    }

    async fn apply_payload(
        &self,
        url: &str,
        offset: u64,
        size: u64,
        headers: Vec<String>,
    ) -> Result<(), UpdateError> {
        let mut client = self.connect().await?;
        client
            .apply_payload(ApplyPayloadRequest {
                url: url.to_string(),
                offset,
                size,
                headers,
            })
            .await
            .map_err(|e| engine_error("apply_payload", e))?;
        Ok(())
    }

    async fn suspend(&self) -> Result<(), UpdateError> {
        let mut client = self.connect().await?;
        client
            .suspend_engine(SuspendEngineRequest {})
            .await
            .map_err(|e| engine_error("suspend", e))?;
        Ok(())
    }

    async fn resume(&self) -> Result<(), UpdateError> {
        let mut client = self.connect().await?;
        client
            .resume_engine(ResumeEngineRequest {})
            .await
            .map_err(|e| engine_error("resume", e))?;
        Ok(())
    }

    fn bind(&self) -> mpsc::Receiver<EngineEvent> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let addr = self.addr.clone();
        tokio::spawn(async move {
            let mut backoff = BIND_RETRY_MIN;
            loop {
                if tx.is_closed() {
                    return;
                }
                match pump_callbacks(&addr, &tx).await {
                    Ok(()) => {
                        warn!("Engine callback stream ended; rebinding");
                        backoff = BIND_RETRY_MIN;
                    }
                    Err(err) => {
                        warn!("Engine bind failed: {err}; retrying in {:?}", backoff);
                    }
                }
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(BIND_RETRY_MAX);
            }
        });
        rx
    }
}

async fn pump_callbacks(addr: &str, tx: &mpsc::Sender<EngineEvent>) -> Result<(), UpdateError> {
    let mut client = connect_engine(addr).await?;
    let mut stream = client
        .bind(BindRequest {
            client_name: "ota-updaterd".into(),
        })
        .await
        .map_err(|e| engine_error("bind", e))?
        .into_inner();
    info!("Bound to update engine at {}", addr);

    loop {
        let callback = match stream.message().await {
            Ok(Some(callback)) => callback,
            Ok(None) => return Ok(()),
            Err(status) => return Err(engine_error("callback stream", status)),
        };
        let event = match callback.event {
            Some(Event::StatusUpdate(update)) => EngineEvent::StatusUpdate {
                status_code: update.status_code,
                progress: update.progress,
            },
            Some(Event::PayloadApplicationComplete(done)) => {
                EngineEvent::PayloadApplicationComplete {
                    error_code: done.error_code,
                }
            }
            None => continue,
        };
        if tx.send(event).await.is_err() {
            return Ok(());
        }
    }
}
