use std::{
    fs, io,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::SystemTime,
};

use ota_proto::ota::v1::Timestamp;
use serde::Serialize;
use tonic::transport::{server::Router, Server};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

pub const DEFAULT_UPDATER_ADDR: &str = "127.0.0.1:50061";
pub const DEFAULT_ENGINE_ADDR: &str = "127.0.0.1:50062";

const DATA_DIR_ENV: &str = "OTA_DATA_DIR";
const LOG_ENV: &str = "OTA_LOG";

/// Trimmed value of `key`, or `None` when unset or blank.
fn non_empty_env(key: &str) -> Option<String> {
    let value = std::env::var(key).ok()?;
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

pub fn env_addr(key: &str, default: &str) -> String {
    non_empty_env(key).unwrap_or_else(|| default.to_string())
}

pub fn updater_addr() -> String {
    env_addr("OTA_UPDATER_ADDR", DEFAULT_UPDATER_ADDR)
}

pub fn engine_addr() -> String {
    env_addr("OTA_ENGINE_ADDR", DEFAULT_ENGINE_ADDR)
}

pub fn data_dir() -> PathBuf {
    if let Some(dir) = non_empty_env(DATA_DIR_ENV) {
        return PathBuf::from(dir);
    }
    match non_empty_env("HOME") {
        Some(home) => PathBuf::from(home).join(".local/share/ota-updater"),
        None => PathBuf::from("/tmp/ota-updater"),
    }
}

pub fn state_file_path(file_name: &str) -> PathBuf {
    data_dir().join("state").join(file_name)
}

/// Private storage for short-lived files handed to the update engine.
pub fn scratch_dir() -> PathBuf {
    data_dir().join("scratch")
}

pub fn cache_dir() -> PathBuf {
    data_dir().join("cache")
}

/// Writes `value` as pretty JSON next to `path` and renames it into place, so
/// readers never observe a half-written file.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let data = serde_json::to_vec_pretty(value).map_err(io::Error::other)?;
    let tmp = path.with_extension(format!("tmp-{}", Uuid::new_v4()));
    if let Err(err) = fs::write(&tmp, data) {
        let _ = fs::remove_file(&tmp);
        return Err(err);
    }
    fs::rename(&tmp, path)
}

pub fn now_millis() -> i64 {
    SystemTime::UNIX_EPOCH
        .elapsed()
        .map_or(0, |since| i64::try_from(since.as_millis()).unwrap_or(i64::MAX))
}

pub fn ts(unix_millis: i64) -> Option<Timestamp> {
    (unix_millis > 0).then_some(Timestamp { unix_millis })
}

/// Installs the fmt subscriber, filtered by `OTA_LOG` (default `info`).
pub fn init_tracing() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).try_init()
}

pub fn parse_listen_addr(raw: &str) -> Result<SocketAddr, String> {
    raw.trim()
        .parse()
        .map_err(|err| format!("invalid listen address '{raw}': {err}"))
}

/// Serves the router built by `add_service` on `addr` until Ctrl-C.
pub async fn serve_grpc<F>(
    app_name: &str,
    addr: &str,
    add_service: F,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    F: FnOnce(&mut Server) -> Router,
{
    let addr = parse_listen_addr(addr)?;
    info!("{app_name} listening on {addr}");

    let mut server = Server::builder();
    add_service(&mut server)
        .serve_with_shutdown(addr, async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!("Failed to wait for Ctrl-C: {}", err);
                std::future::pending::<()>().await;
            }
            info!("{app_name} shutting down");
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_replaces_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");

        write_json_atomic(&path, &serde_json::json!({ "status": "IDLE" })).unwrap();
        write_json_atomic(&path, &serde_json::json!({ "status": "DOWNLOADING" })).unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains("DOWNLOADING"));
        let leftovers = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().contains("tmp-"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn listen_addr_is_trimmed_and_checked() {
        assert_eq!(
            parse_listen_addr(" 127.0.0.1:50061\n"),
            Ok(SocketAddr::from(([127, 0, 0, 1], 50061)))
        );
        assert!(parse_listen_addr("localhost").is_err());
        assert!(parse_listen_addr("").is_err());
    }

    #[test]
    fn zero_millis_has_no_timestamp() {
        assert!(ts(0).is_none());
        assert_eq!(ts(42).map(|t| t.unix_millis), Some(42));
    }
}
