use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::Mutex,
};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{manifest::Manifest, status::UpdateStatus};

pub const STATE_FILE_NAME: &str = "updater.json";
const SCHEMA_VERSION: u32 = 1;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
struct PersistedState {
    schema_version: u32,
    update_status: Option<String>,
    update_manifest: Option<String>,
    last_check_unix_millis: i64,
}

/// What a fresh process resumes from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RestoredState {
    pub status: UpdateStatus,
    pub manifest: Option<Manifest>,
    pub last_check_unix_millis: i64,
}

impl Default for RestoredState {
    fn default() -> Self {
        Self {
            status: UpdateStatus::Idle,
            manifest: None,
            last_check_unix_millis: 0,
        }
    }
}

/// Durable status, manifest and last-check record backed by one JSON file.
pub struct StateStore {
    path: PathBuf,
    cached: Mutex<PersistedState>,
}

impl StateStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let cached = load_state(&path);
        Self {
            path,
            cached: Mutex::new(cached),
        }
    }

    pub fn open_default() -> Self {
        Self::open(ota_util::state_file_path(STATE_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn restore(&self) -> RestoredState {
        let persisted = match self.cached.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        restore_from(persisted)
    }

    /// Records an adopted status together with the manifest it belongs to.
    pub fn save_update(&self, status: UpdateStatus, manifest: Option<&Manifest>) {
        self.update(|state| {
            state.update_status = Some(status.as_str().to_string());
            state.update_manifest = manifest
                .filter(|m| !m.raw_json.is_empty())
                .map(|m| m.raw_json.clone());
        });
    }

    pub fn save_last_check(&self, unix_millis: i64) {
        self.update(|state| state.last_check_unix_millis = unix_millis);
    }

    fn update(&self, apply: impl FnOnce(&mut PersistedState)) {
        let mut guard = match self.cached.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        apply(&mut guard);
        guard.schema_version = SCHEMA_VERSION;
        if let Err(err) = ota_util::write_json_atomic(&self.path, &*guard) {
            warn!("Failed to persist updater state {}: {}", self.path.display(), err);
        }
    }
}

fn load_state(path: &Path) -> PersistedState {
    let data = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return PersistedState::default(),
        Err(e) => {
            warn!("Failed to read updater state {}: {}", path.display(), e);
            return PersistedState::default();
        }
    };

    let parsed: PersistedState = match serde_json::from_slice(&data) {
        Ok(state) => state,
        Err(e) => {
            warn!("Failed to parse updater state {}: {}", path.display(), e);
            return PersistedState::default();
        }
    };
    if parsed.schema_version > SCHEMA_VERSION {
        warn!(
            "Updater state {} has schema version {} (supported {}); ignoring",
            path.display(),
            parsed.schema_version,
            SCHEMA_VERSION
        );
        return PersistedState::default();
    }
    parsed
}

fn restore_from(persisted: PersistedState) -> RestoredState {
    let manifest = persisted
        .update_manifest
        .as_deref()
        .filter(|raw| !raw.trim().is_empty())
        .and_then(|raw| match Manifest::parse(raw) {
            Ok(manifest) if !manifest.is_empty() => Some(manifest),
            Ok(_) => None,
            Err(err) => {
                warn!("Discarding persisted manifest: {}", err);
                None
            }
        });

    let mut status = match persisted.update_status.as_deref() {
        None => UpdateStatus::Idle,
        Some(name) => name.parse().unwrap_or_else(|err| {
            warn!("{}; restoring as idle", err);
            UpdateStatus::Idle
        }),
    };
    status = match status {
        // Preparation runs inside this process; it cannot survive a restart.
        UpdateStatus::PreparingToUpdate => UpdateStatus::FailedPreparingUpdate,
        UpdateStatus::CheckingForUpdate => UpdateStatus::Idle,
        UpdateStatus::UpdateAvailable if manifest.is_none() => UpdateStatus::Idle,
        other => other,
    };
    debug!("Restored updater status {}", status);

    RestoredState {
        status,
        manifest,
        last_check_unix_millis: persisted.last_check_unix_millis,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RAW: &str = r#"{"name":"lynx-2024","url":"https://example.invalid/pkg.zip","build_date_utc":2000,"ab_config":{"property_files":[{"filename":"payload.bin","offset":1000,"size":90000},{"filename":"payload_properties.txt","offset":200,"size":20}]}}"#;

    #[test]
    fn status_and_raw_manifest_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STATE_FILE_NAME);
        let manifest = Manifest::parse(RAW).unwrap();

        let store = StateStore::open(&path);
        store.save_update(UpdateStatus::Downloading, Some(&manifest));
        store.save_last_check(1234);

        let restored = StateStore::open(&path).restore();
        assert_eq!(restored.status, UpdateStatus::Downloading);
        assert_eq!(restored.manifest.unwrap().raw_json, RAW);
        assert_eq!(restored.last_check_unix_millis, 1234);
    }

    #[test]
    fn missing_file_restores_idle() {
        let dir = tempfile::tempdir().unwrap();
        let restored = StateStore::open(dir.path().join("none.json")).restore();
        assert_eq!(restored, RestoredState::default());
    }

    #[test]
    fn interrupted_preparation_restores_as_failure() {
        let restored = restore_from(PersistedState {
            schema_version: SCHEMA_VERSION,
            update_status: Some("PREPARING_TO_UPDATE".into()),
            update_manifest: Some(RAW.into()),
            last_check_unix_millis: 0,
        });
        assert_eq!(restored.status, UpdateStatus::FailedPreparingUpdate);
    }

    #[test]
    fn available_without_manifest_restores_idle() {
        let restored = restore_from(PersistedState {
            schema_version: SCHEMA_VERSION,
            update_status: Some("UPDATE_AVAILABLE".into()),
            update_manifest: None,
            last_check_unix_millis: 0,
        });
        assert_eq!(restored.status, UpdateStatus::Idle);
        assert!(restored.manifest.is_none());
    }

    #[test]
    fn unknown_status_name_restores_idle() {
        let restored = restore_from(PersistedState {
            update_status: Some("WARP_SPEED".into()),
            ..PersistedState::default()
        });
        assert_eq!(restored.status, UpdateStatus::Idle);
    }

    #[test]
    fn newer_schema_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STATE_FILE_NAME);
        fs::write(&path, r#"{"schema_version":99,"update_status":"DOWNLOADING"}"#).unwrap();
        assert_eq!(StateStore::open(&path).restore().status, UpdateStatus::Idle);
    }

    #[test]
    fn corrupt_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STATE_FILE_NAME);
        fs::write(&path, "{not json").unwrap();
        assert_eq!(StateStore::open(&path).restore().status, UpdateStatus::Idle);
    }
}
