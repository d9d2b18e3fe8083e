use std::sync::Arc;

use ota_proto::ota::v1::updater_service_server::UpdaterServiceServer;
use ota_updater::{
    service::UpdaterSvc, ApplyOutcome, GrpcEngine, StateStore, UpdateManager, UpdaterConfig,
};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    ota_util::init_tracing()?;

    let config = UpdaterConfig::load();
    info!(
        "Updater for device '{}' on channel '{}' via {}",
        config.build.device, config.channel, config.server_url
    );

    let engine = Arc::new(GrpcEngine::new(config.engine_addr.clone()));
    let manager = UpdateManager::start(&config, engine, StateStore::open_default())?;

    if let Some(interval) = config.auto_check_interval() {
        let manager = manager.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match manager.check_and_apply().await {
                    ApplyOutcome::Started => info!("Periodic check started an update"),
                    ApplyOutcome::Failed(err) => warn!("Periodic update failed: {}", err),
                    ApplyOutcome::NoUpdate | ApplyOutcome::Busy => {}
                }
            }
        });
    }

    let svc = UpdaterSvc::new(manager);
    ota_util::serve_grpc(
        "ota-updaterd (UpdaterService)",
        &ota_util::updater_addr(),
        move |server| server.add_service(UpdaterServiceServer::new(svc)),
    )
    .await
}
