use std::{
    collections::VecDeque,
    sync::{Arc, Weak},
};

use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, info, warn};

use crate::{
    config::UpdaterConfig,
    engine::UpdateEngine,
    error::UpdateError,
    fetcher::{ManifestFetcher, ManifestOutcome},
    http::build_client,
    manifest::{
        AbInstallType, Manifest, PackageFile, PAYLOAD_BINARY, PAYLOAD_METADATA, PAYLOAD_PROPERTIES,
    },
    range::RangeDownloader,
    state::StateStore,
    status::{percent_from_fraction, reconcile, EngineStatus, UpdateStatus},
    verifier::MetadataVerifier,
};

const HISTORY_CAPACITY: usize = 256;
const BROADCAST_CAPACITY: usize = 256;
const AUTHORIZATION_KEY: &str = "AUTHORIZATION";

/// One adopted status transition. `seq` increases by one per event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatusEvent {
    pub seq: u64,
    pub status: UpdateStatus,
    pub at_unix_millis: i64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Snapshot {
    pub status: UpdateStatus,
    pub progress_percent: u32,
    pub manifest: Option<Manifest>,
    pub last_check_unix_millis: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckOutcome {
    UpdateAvailable,
    NoUpdate,
    /// A check or update sequence is already running.
    Busy,
}

#[derive(Debug)]
pub enum ApplyOutcome {
    /// The engine accepted the payload and is downloading.
    Started,
    NoUpdate,
    Busy,
    Failed(UpdateError),
}

struct Inner {
    status: UpdateStatus,
    manifest: Option<Manifest>,
    suspended_from: Option<UpdateStatus>,
    last_check_unix_millis: i64,
    next_seq: u64,
    history: VecDeque<StatusEvent>,
}

struct Shared {
    state: Mutex<Inner>,
    events: broadcast::Sender<StatusEvent>,
    progress: watch::Sender<u32>,
    fetcher: ManifestFetcher,
    downloader: RangeDownloader,
    verifier: MetadataVerifier,
    engine: Arc<dyn UpdateEngine>,
    store: StateStore,
    channel: String,
}

/// Owns the update status and sequences check, verify and apply.
///
/// Every status change goes through one lock, so engine callbacks and
/// caller actions never observe each other half-way.
#[derive(Clone)]
pub struct UpdateManager {
    shared: Arc<Shared>,
}

#[derive(Clone)]
pub(crate) struct WeakUpdateManager {
    shared: Weak<Shared>,
}

impl WeakUpdateManager {
    pub(crate) fn upgrade(&self) -> Option<UpdateManager> {
        self.shared.upgrade().map(|shared| UpdateManager { shared })
    }
}

impl UpdateManager {
    /// Restores persisted state and binds to the engine's callbacks.
    pub fn start(
        config: &UpdaterConfig,
        engine: Arc<dyn UpdateEngine>,
        store: StateStore,
    ) -> Result<Self, UpdateError> {
        let client = build_client(config.http_timeout())?;
        let fetcher = ManifestFetcher::new(
            client.clone(),
            config.server_url.clone(),
            config.build.clone(),
            config.compare_policy,
        )
        .with_cache(
            config.cache_dir.clone(),
            std::time::Duration::from_secs(config.manifest_cache_secs),
        );
        let downloader = RangeDownloader::new(client);
        let verifier =
            MetadataVerifier::new(downloader.clone(), engine.clone(), config.scratch_dir.clone());

        let restored = store.restore();
        info!(
            "Starting update manager in {} (manifest: {})",
            restored.status,
            restored
                .manifest
                .as_ref()
                .map(|m| m.name.as_str())
                .unwrap_or("none")
        );
        let initial = StatusEvent {
            seq: 1,
            status: restored.status,
            at_unix_millis: ota_util::now_millis(),
        };
        let mut history = VecDeque::with_capacity(HISTORY_CAPACITY);
        history.push_back(initial);

        let (events, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (progress, _) = watch::channel(0u32);
        let shared = Arc::new(Shared {
            state: Mutex::new(Inner {
                status: restored.status,
                manifest: restored.manifest,
                suspended_from: None,
                last_check_unix_millis: restored.last_check_unix_millis,
                next_seq: 2,
                history,
            }),
            events,
            progress,
            fetcher,
            downloader,
            verifier,
            engine,
            store,
            channel: config.channel.clone(),
        });

        let manager = UpdateManager { shared };
        let engine_events = manager.shared.engine.bind();
        crate::bridge::spawn_bridge(engine_events, manager.downgrade());
        Ok(manager)
    }

    pub(crate) fn downgrade(&self) -> WeakUpdateManager {
        WeakUpdateManager {
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub async fn status(&self) -> UpdateStatus {
        self.shared.state.lock().await.status
    }

    pub async fn manifest(&self) -> Option<Manifest> {
        self.shared.state.lock().await.manifest.clone()
    }

    pub async fn snapshot(&self) -> Snapshot {
        let inner = self.shared.state.lock().await;
        Snapshot {
            status: inner.status,
            progress_percent: *self.shared.progress.borrow(),
            manifest: inner.manifest.clone(),
            last_check_unix_millis: inner.last_check_unix_millis,
        }
    }

    pub async fn history(&self) -> Vec<StatusEvent> {
        self.shared.state.lock().await.history.iter().copied().collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.shared.events.subscribe()
    }

    /// History and a live receiver taken together, so no event falls between them.
    pub async fn subscribe_with_history(
        &self,
    ) -> (Vec<StatusEvent>, broadcast::Receiver<StatusEvent>) {
        let inner = self.shared.state.lock().await;
        let history = inner.history.iter().copied().collect();
        (history, self.shared.events.subscribe())
    }

    pub fn watch_progress(&self) -> watch::Receiver<u32> {
        self.shared.progress.subscribe()
    }

    pub async fn check_updates(&self) -> CheckOutcome {
        let channel = self.shared.channel.clone();
        self.check_updates_on(&channel).await
    }

    pub async fn check_updates_on(&self, channel: &str) -> CheckOutcome {
        {
            let mut inner = self.shared.state.lock().await;
            if blocks_new_cycle(inner.status) {
                info!("Ignoring update check while {}", inner.status);
                return CheckOutcome::Busy;
            }
            self.transition(&mut inner, UpdateStatus::CheckingForUpdate);
        }

        let outcome = self.shared.fetcher.fetch_manifest(channel).await;
        let now = ota_util::now_millis();
        self.shared.store.save_last_check(now);

        let mut inner = self.shared.state.lock().await;
        inner.last_check_unix_millis = now;
        if inner.status != UpdateStatus::CheckingForUpdate {
            warn!("Status changed to {} during update check; dropping result", inner.status);
            return CheckOutcome::NoUpdate;
        }
        match outcome {
            ManifestOutcome::Available(manifest) if self.shared.fetcher.is_newer(&manifest) => {
                info!("Update available: {}", manifest.name);
                inner.manifest = Some(manifest);
                self.transition(&mut inner, UpdateStatus::UpdateAvailable);
                CheckOutcome::UpdateAvailable
            }
            ManifestOutcome::Available(manifest) => {
                info!("Manifest {} is not newer than the running build", manifest.name);
                inner.manifest = None;
                self.transition(&mut inner, UpdateStatus::Idle);
                CheckOutcome::NoUpdate
            }
            ManifestOutcome::NotAvailable => {
                inner.manifest = None;
                self.transition(&mut inner, UpdateStatus::Idle);
                CheckOutcome::NoUpdate
            }
        }
    }

    /// Verifies metadata, fetches properties and hands the payload to the engine.
    pub async fn apply_update(&self, manifest: Manifest) -> ApplyOutcome {
        if manifest.is_empty() {
            info!("No update manifest to apply");
            return ApplyOutcome::NoUpdate;
        }
        {
            let mut inner = self.shared.state.lock().await;
            if blocks_new_cycle(inner.status) {
                info!("Ignoring apply while {}", inner.status);
                return ApplyOutcome::Busy;
            }
            inner.manifest = Some(manifest.clone());
            inner.suspended_from = None;
            self.transition(&mut inner, UpdateStatus::PreparingToUpdate);
        }

        let prepared = self.prepare(&manifest).await;

        let mut inner = self.shared.state.lock().await;
        if inner.status != UpdateStatus::PreparingToUpdate {
            warn!("Status changed to {} during preparation; aborting", inner.status);
            return ApplyOutcome::Failed(UpdateError::Invalid(format!(
                "preparation interrupted by {}",
                inner.status
            )));
        }
        let (payload, headers) = match prepared {
            Ok(prepared) => prepared,
            Err(err) => {
                warn!("Failed to prepare update {}: {}", manifest.name, err);
                self.transition(&mut inner, UpdateStatus::FailedPreparingUpdate);
                return ApplyOutcome::Failed(err);
            }
        };

        self.publish_progress(0);
        self.transition(&mut inner, UpdateStatus::Downloading);
        match self
            .shared
            .engine
            .apply_payload(&manifest.url, payload.offset, payload.size, headers)
            .await
        {
            Ok(()) => ApplyOutcome::Started,
            Err(err) => {
                warn!("Engine refused payload: {}", err);
                self.transition(&mut inner, UpdateStatus::FailedPreparingUpdate);
                ApplyOutcome::Failed(err)
            }
        }
    }

    /// Applies the manifest found by the last check.
    pub async fn apply_available(&self) -> ApplyOutcome {
        let (status, manifest) = {
            let inner = self.shared.state.lock().await;
            (inner.status, inner.manifest.clone())
        };
        if status == UpdateStatus::UpdatedNeedReboot {
            info!("Update already applied; reboot pending");
            return ApplyOutcome::NoUpdate;
        }
        match manifest {
            Some(manifest) => self.apply_update(manifest).await,
            None => {
                info!("No discovered update to apply");
                ApplyOutcome::NoUpdate
            }
        }
    }

    pub async fn check_and_apply(&self) -> ApplyOutcome {
        let channel = self.shared.channel.clone();
        self.check_and_apply_on(&channel).await
    }

    pub async fn check_and_apply_on(&self, channel: &str) -> ApplyOutcome {
        match self.check_updates_on(channel).await {
            CheckOutcome::UpdateAvailable => self.apply_available().await,
            CheckOutcome::NoUpdate => ApplyOutcome::NoUpdate,
            CheckOutcome::Busy => ApplyOutcome::Busy,
        }
    }

    /// Pauses a running download. Returns `false` when there was nothing to pause.
    pub async fn suspend_update(&self) -> Result<bool, UpdateError> {
        let mut inner = self.shared.state.lock().await;
        match inner.status {
            UpdateStatus::Suspended => {
                debug!("Update already suspended");
                Ok(false)
            }
            UpdateStatus::Downloading => {
                self.shared.engine.suspend().await?;
                inner.suspended_from = Some(inner.status);
                self.transition(&mut inner, UpdateStatus::Suspended);
                Ok(true)
            }
            other => {
                info!("Nothing to suspend while {}", other);
                Ok(false)
            }
        }
    }

    /// Continues a suspended download. Returns `false` when not suspended.
    pub async fn resume_update(&self) -> Result<bool, UpdateError> {
        let mut inner = self.shared.state.lock().await;
        if inner.status != UpdateStatus::Suspended {
            debug!("Resume ignored while {}", inner.status);
            return Ok(false);
        }
        self.shared.engine.resume().await?;
        let resumed = inner.suspended_from.take().unwrap_or(UpdateStatus::Downloading);
        self.transition(&mut inner, resumed);
        Ok(true)
    }

    /// Folds one engine status callback into the current status.
    pub async fn on_engine_status(&self, status_code: i32, fraction: f32) {
        let incoming = match EngineStatus::from_code(status_code) {
            EngineStatus::Known(status) => status,
            EngineStatus::Unknown(code) => {
                warn!("Ignoring unknown engine status code {}", code);
                return;
            }
        };
        let mut inner = self.shared.state.lock().await;
        if let Some(next) = reconcile(inner.status, incoming) {
            if next != inner.status {
                self.transition(&mut inner, next);
            }
        } else {
            debug!("Engine status {} masked while {}", incoming, inner.status);
        }
        if inner.status.is_active_transfer() {
            self.publish_progress(percent_from_fraction(fraction));
        }
    }

    fn publish_progress(&self, percent: u32) {
        self.shared.progress.send_if_modified(|current| {
            let changed = *current != percent;
            *current = percent;
            changed
        });
    }

    async fn prepare(
        &self,
        manifest: &Manifest,
    ) -> Result<(PackageFile, Vec<String>), UpdateError> {
        if manifest.ab_install_type == Some(AbInstallType::NotAvailable) {
            return Err(UpdateError::Invalid(format!(
                "{} cannot be installed on this device",
                manifest.name
            )));
        }
        let payload = required_file(manifest, PAYLOAD_BINARY)?;

        if manifest.ab_config.verify_payload_metadata {
            let metadata = required_file(manifest, PAYLOAD_METADATA)?;
            self.shared.verifier.verify(&manifest.url, metadata).await?;
        } else {
            info!("Manifest {} skips payload metadata verification", manifest.name);
        }

        let properties = required_file(manifest, PAYLOAD_PROPERTIES)?;
        let mut headers = self
            .shared
            .downloader
            .fetch_properties(&manifest.url, properties)
            .await?;
        let token = manifest.ab_config.authorization.trim();
        if !token.is_empty() {
            headers.push(format!("{AUTHORIZATION_KEY}={token}"));
        }
        Ok((payload.clone(), headers))
    }

    fn transition(&self, inner: &mut Inner, next: UpdateStatus) {
        let prev = inner.status;
        inner.status = next;
        let event = StatusEvent {
            seq: inner.next_seq,
            status: next,
            at_unix_millis: ota_util::now_millis(),
        };
        inner.next_seq += 1;
        if inner.history.len() >= HISTORY_CAPACITY {
            inner.history.pop_front();
        }
        inner.history.push_back(event);
        info!("Update status {} -> {}", prev, next);
        if !next.is_active_transfer() {
            self.publish_progress(0);
        }

        if next != UpdateStatus::CheckingForUpdate {
            self.shared.store.save_update(next, inner.manifest.as_ref());
        }
        let _ = self.shared.events.send(event);
    }
}

/// A pending reboot blocks new cycles until the device restarts.
fn blocks_new_cycle(status: UpdateStatus) -> bool {
    status.is_busy()
        || matches!(
            status,
            UpdateStatus::CheckingForUpdate | UpdateStatus::UpdatedNeedReboot
        )
}

fn required_file<'a>(
    manifest: &'a Manifest,
    filename: &str,
) -> Result<&'a PackageFile, UpdateError> {
    manifest
        .package_file(filename)
        .ok_or_else(|| UpdateError::Malformed(format!("manifest has no {filename}")))
}
