use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;
use tracing::warn;

use crate::manifest::{BuildInfo, ComparePolicy};

const CONFIG_FILE_NAME: &str = "updater-config.json";
const DEFAULT_SERVER_URL: &str = "https://release.calyxinstitute.org";
const DEFAULT_CHANNEL: &str = "stable";
const DEFAULT_BUILD_PROP: &str = "/system/build.prop";
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 60;

const PROP_DEVICE: &str = "ro.product.device";
const PROP_BUILD_DATE_UTC: &str = "ro.build.date.utc";
const PROP_BUILD_VERSION: &str = "ro.build.version.incremental";

#[derive(Clone, Debug)]
pub struct UpdaterConfig {
    pub server_url: String,
    pub channel: String,
    pub build: BuildInfo,
    pub compare_policy: ComparePolicy,
    /// Zero disables the manifest cache.
    pub manifest_cache_secs: u64,
    pub http_timeout_secs: u64,
    /// Zero disables periodic check-and-apply.
    pub auto_check_secs: u64,
    pub engine_addr: String,
    pub scratch_dir: PathBuf,
    pub cache_dir: PathBuf,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.into(),
            channel: DEFAULT_CHANNEL.into(),
            build: BuildInfo::default(),
            compare_policy: ComparePolicy::default(),
            manifest_cache_secs: 0,
            http_timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
            auto_check_secs: 0,
            engine_addr: ota_util::engine_addr(),
            scratch_dir: ota_util::scratch_dir(),
            cache_dir: ota_util::cache_dir(),
        }
    }
}

#[derive(Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    server_url: String,
    channel: String,
    device: String,
    build_date_utc: Option<i64>,
    build_version: String,
    build_prop: String,
    compare_policy: String,
    manifest_cache_secs: Option<u64>,
    http_timeout_secs: Option<u64>,
    auto_check_secs: Option<u64>,
    engine_addr: String,
}

impl UpdaterConfig {
    /// Defaults, then the JSON config file, then `OTA_*` environment variables.
    pub fn load() -> Self {
        let path = std::env::var("OTA_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| ota_util::state_file_path(CONFIG_FILE_NAME));
        let file = read_file_config(&path);
        let mut cfg = UpdaterConfig::default();

        set_string(&mut cfg.server_url, &file.server_url, "OTA_SERVER_URL");
        set_string(&mut cfg.channel, &file.channel, "OTA_CHANNEL");
        set_string(&mut cfg.engine_addr, &file.engine_addr, "OTA_ENGINE_ADDR");

        let mut build_prop = if file.build_prop.trim().is_empty() {
            DEFAULT_BUILD_PROP.to_string()
        } else {
            file.build_prop.clone()
        };
        if let Ok(value) = std::env::var("OTA_BUILD_PROP") {
            build_prop = value;
        }
        cfg.build = read_build_prop(Path::new(&build_prop));
        set_string(&mut cfg.build.device, &file.device, "OTA_DEVICE");
        set_string(&mut cfg.build.version, &file.build_version, "OTA_BUILD_VERSION");
        set_number(
            &mut cfg.build.build_date_utc,
            file.build_date_utc,
            "OTA_BUILD_DATE_UTC",
        );

        let mut policy = file.compare_policy.clone();
        if let Ok(value) = std::env::var("OTA_COMPARE_POLICY") {
            policy = value;
        }
        if !policy.trim().is_empty() {
            match ComparePolicy::parse(&policy) {
                Some(parsed) => cfg.compare_policy = parsed,
                None => warn!("Unknown compare policy '{}'; using build date", policy),
            }
        }

        set_number(
            &mut cfg.manifest_cache_secs,
            file.manifest_cache_secs,
            "OTA_MANIFEST_CACHE_SECS",
        );
        set_number(
            &mut cfg.http_timeout_secs,
            file.http_timeout_secs,
            "OTA_HTTP_TIMEOUT_SECS",
        );
        set_number(&mut cfg.auto_check_secs, file.auto_check_secs, "OTA_AUTO_CHECK_SECS");

        if cfg.build.device.trim().is_empty() {
            warn!("Device name is unknown; manifest lookups will fail");
        }
        cfg
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs.max(1))
    }

    pub fn auto_check_interval(&self) -> Option<Duration> {
        (self.auto_check_secs > 0).then(|| Duration::from_secs(self.auto_check_secs))
    }
}

fn read_file_config(path: &Path) -> FileConfig {
    match fs::read_to_string(path) {
        Ok(raw) => match serde_json::from_str::<FileConfig>(&raw) {
            Ok(cfg) => cfg,
            Err(err) => {
                warn!("Failed to parse {}: {}", path.display(), err);
                FileConfig::default()
            }
        },
        Err(err) => {
            if err.kind() != io::ErrorKind::NotFound {
                warn!("Failed to read {}: {}", path.display(), err);
            }
            FileConfig::default()
        }
    }
}

fn set_string(target: &mut String, file_value: &str, env_key: &str) {
    if !file_value.trim().is_empty() {
        *target = file_value.trim().to_string();
    }
    if let Ok(value) = std::env::var(env_key) {
        if !value.trim().is_empty() {
            *target = value.trim().to_string();
        }
    }
}

fn set_number<T: std::str::FromStr + Copy>(target: &mut T, file_value: Option<T>, env_key: &str) {
    if let Some(value) = file_value {
        *target = value;
    }
    if let Ok(value) = std::env::var(env_key) {
        match value.trim().parse::<T>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!("Ignoring non-numeric {}={}", env_key, value),
        }
    }
}

/// Reads the running build's identity from a `key=value` property file.
/// Missing files yield an empty identity.
pub fn read_build_prop(path: &Path) -> BuildInfo {
    match fs::read_to_string(path) {
        Ok(contents) => parse_build_prop(&contents),
        Err(err) => {
            if err.kind() != io::ErrorKind::NotFound {
                warn!("Failed to read build properties {}: {}", path.display(), err);
            }
            BuildInfo::default()
        }
    }
}

fn parse_build_prop(contents: &str) -> BuildInfo {
    let mut info = BuildInfo::default();
    for line in contents.lines() {
        let line = line.trim();
        if line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            PROP_DEVICE => info.device = value.to_string(),
            PROP_BUILD_DATE_UTC => {
                if let Ok(parsed) = value.parse::<i64>() {
                    info.build_date_utc = parsed;
                }
            }
            PROP_BUILD_VERSION => info.version = value.to_string(),
            _ => {}
        }
    }
    info
}
