#![allow(dead_code)]

use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use ota_updater::{
    engine::{EngineEvent, UpdateEngine},
    manifest::BuildInfo,
    UpdateError, UpdateManager, UpdateStatus, UpdaterConfig,
};
use tokio::sync::mpsc;

pub const DEVICE: &str = "lynx";
pub const CHANNEL: &str = "stable";
pub const RUNNING_BUILD_DATE: i64 = 1000;
pub const PACKAGE_LEN: usize = 91_000;
pub const PROPERTIES: &[u8; 20] = b"prop1=a\nprop2=b\n\n\n\n\n";
pub const PROPERTIES_OFFSET: usize = 200;

/// How the package endpoint answers range requests.
#[derive(Clone, Copy, Debug)]
pub enum RangeMode {
    Honor,
    IgnoreRange,
    Fail(u16),
    /// Fails only requests whose range starts at this offset.
    FailAt(usize),
    ShortBy(usize),
    /// Serves a range that starts this many bytes late.
    ShiftedBy(usize),
}

#[derive(Clone)]
struct ServerState {
    manifest: Arc<Mutex<Option<String>>>,
    package: Arc<Vec<u8>>,
    mode: Arc<Mutex<RangeMode>>,
    ranges: Arc<Mutex<Vec<String>>>,
    manifest_hits: Arc<AtomicUsize>,
}

/// Local HTTP server serving one manifest and one update package.
pub struct TestServer {
    pub base_url: String,
    state: ServerState,
}

impl TestServer {
    pub async fn start() -> Self {
        let state = ServerState {
            manifest: Arc::new(Mutex::new(None)),
            package: Arc::new(package_bytes()),
            mode: Arc::new(Mutex::new(RangeMode::Honor)),
            ranges: Arc::new(Mutex::new(Vec::new())),
            manifest_hits: Arc::new(AtomicUsize::new(0)),
        };
        let app = Router::new()
            .route("/pkg.zip", get(serve_package))
            .route("/:channel/:device", get(serve_manifest))
            .with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self {
            base_url: format!("http://{addr}"),
            state,
        }
    }

    pub fn package_url(&self) -> String {
        format!("{}/pkg.zip", self.base_url)
    }

    pub fn package(&self) -> &[u8] {
        &self.state.package
    }

    pub fn set_manifest(&self, raw: Option<String>) {
        *self.state.manifest.lock().unwrap() = raw;
    }

    pub fn set_mode(&self, mode: RangeMode) {
        *self.state.mode.lock().unwrap() = mode;
    }

    pub fn ranges(&self) -> Vec<String> {
        self.state.ranges.lock().unwrap().clone()
    }

    pub fn manifest_hits(&self) -> usize {
        self.state.manifest_hits.load(Ordering::SeqCst)
    }

    /// A manifest for a build newer than the running one.
    pub fn manifest_json(&self, build_date_utc: i64, authorization: &str) -> String {
        format!(
            r#"{{"name":"lynx-2024.10","url":"{url}","changelog_url":"https://example.invalid/changelog","build_date_utc":{build_date_utc},"ab_install_type":"STREAMING","ab_config":{{"verify_payload_metadata":true,"authorization":"{authorization}","property_files":[{{"filename":"payload_metadata.bin","offset":100,"size":50}},{{"filename":"payload_properties.txt","offset":200,"size":20}},{{"filename":"payload.bin","offset":1000,"size":90000}}]}}}}"#,
            url = self.package_url(),
        )
    }

    pub fn publish_newer_manifest(&self) -> String {
        let raw = self.manifest_json(2000, "");
        self.set_manifest(Some(raw.clone()));
        raw
    }
}

fn package_bytes() -> Vec<u8> {
    let mut bytes: Vec<u8> = (0..PACKAGE_LEN).map(|i| (i % 251) as u8).collect();
    bytes[PROPERTIES_OFFSET..PROPERTIES_OFFSET + PROPERTIES.len()].copy_from_slice(PROPERTIES);
    bytes
}

async fn serve_manifest(State(state): State<ServerState>) -> Response {
    state.manifest_hits.fetch_add(1, Ordering::SeqCst);
    match state.manifest.lock().unwrap().clone() {
        Some(raw) => (StatusCode::OK, raw).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn serve_package(State(state): State<ServerState>, headers: HeaderMap) -> Response {
    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    state.ranges.lock().unwrap().push(range.clone());

    let mode = *state.mode.lock().unwrap();
    let package = state.package.as_slice();
    let (start, end) = parse_range(&range).unwrap_or((0, package.len() - 1));
    let end = end.min(package.len() - 1);

    match mode {
        RangeMode::Fail(code) => StatusCode::from_u16(code).unwrap().into_response(),
        RangeMode::FailAt(offset) if offset == start => {
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
        RangeMode::FailAt(_) => partial(&package[start..=end], start, end, package.len()),
        RangeMode::IgnoreRange => (StatusCode::OK, package.to_vec()).into_response(),
        RangeMode::Honor => partial(&package[start..=end], start, end, package.len()),
        RangeMode::ShortBy(missing) => {
            let short_end = end + 1 - missing;
            partial(&package[start..short_end], start, end, package.len())
        }
        RangeMode::ShiftedBy(shift) => {
            let (start, end) = (start + shift, (end + shift).min(package.len() - 1));
            partial(&package[start..=end], start, end, package.len())
        }
    }
}

fn partial(body: &[u8], start: usize, end: usize, total: usize) -> Response {
    (
        StatusCode::PARTIAL_CONTENT,
        [(header::CONTENT_RANGE, format!("bytes {start}-{end}/{total}"))],
        body.to_vec(),
    )
        .into_response()
}

fn parse_range(value: &str) -> Option<(usize, usize)> {
    let spec = value.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()?))
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApplyCall {
    pub url: String,
    pub offset: u64,
    pub size: u64,
    pub headers: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct VerifyCall {
    pub path: PathBuf,
    pub contents: Option<Vec<u8>>,
}

/// In-process update engine that records what it was asked to do.
#[derive(Default)]
pub struct FakeEngine {
    reject_metadata: AtomicBool,
    verified: Mutex<Vec<VerifyCall>>,
    applied: Mutex<Vec<ApplyCall>>,
    suspends: AtomicUsize,
    resumes: AtomicUsize,
    events: Mutex<Option<mpsc::Sender<EngineEvent>>>,
}

impl FakeEngine {
    pub fn accepting() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn rejecting() -> Arc<Self> {
        let engine = Self::default();
        engine.reject_metadata.store(true, Ordering::SeqCst);
        Arc::new(engine)
    }

    pub fn verified(&self) -> Vec<VerifyCall> {
        self.verified.lock().unwrap().clone()
    }

    pub fn applied(&self) -> Vec<ApplyCall> {
        self.applied.lock().unwrap().clone()
    }

    pub fn suspends(&self) -> usize {
        self.suspends.load(Ordering::SeqCst)
    }

    pub fn resumes(&self) -> usize {
        self.resumes.load(Ordering::SeqCst)
    }

    pub async fn emit_status(&self, status_code: i32, progress: f32) {
        self.emit(EngineEvent::StatusUpdate {
            status_code,
            progress,
        })
        .await;
    }

    pub async fn emit(&self, event: EngineEvent) {
        let tx = self.events.lock().unwrap().clone().expect("engine not bound");
        tx.send(event).await.unwrap();
    }
}

#[tonic::async_trait]
impl UpdateEngine for FakeEngine {
    async fn verify_payload_metadata(&self, path: &Path) -> Result<bool, UpdateError> {
        self.verified.lock().unwrap().push(VerifyCall {
            path: path.to_path_buf(),
            contents: std::fs::read(path).ok(),
        });
        Ok(!self.reject_metadata.load(Ordering::SeqCst))
    }

    async fn apply_payload(
        &self,
        url: &str,
        offset: u64,
        size: u64,
        headers: Vec<String>,
    ) -> Result<(), UpdateError> {
        self.applied.lock().unwrap().push(ApplyCall {
            url: url.to_string(),
            offset,
            size,
            headers,
        });
        Ok(())
    }

    async fn suspend(&self) -> Result<(), UpdateError> {
        self.suspends.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn resume(&self) -> Result<(), UpdateError> {
        self.resumes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn bind(&self) -> mpsc::Receiver<EngineEvent> {
        let (tx, rx) = mpsc::channel(64);
        *self.events.lock().unwrap() = Some(tx);
        rx
    }
}

pub fn test_config(server: &TestServer, dir: &Path) -> UpdaterConfig {
    UpdaterConfig {
        server_url: server.base_url.clone(),
        channel: CHANNEL.into(),
        build: BuildInfo {
            device: DEVICE.into(),
            build_date_utc: RUNNING_BUILD_DATE,
            version: String::new(),
        },
        http_timeout_secs: 10,
        scratch_dir: dir.join("scratch"),
        cache_dir: dir.join("cache"),
        ..UpdaterConfig::default()
    }
}

pub fn scratch_entries(dir: &Path) -> usize {
    std::fs::read_dir(dir.join("scratch"))
        .map(|entries| entries.count())
        .unwrap_or(0)
}

pub async fn history_statuses(manager: &UpdateManager) -> Vec<UpdateStatus> {
    manager
        .history()
        .await
        .into_iter()
        .map(|event| event.status)
        .collect()
}

pub async fn wait_for_status(manager: &UpdateManager, expected: UpdateStatus) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while manager.status().await != expected {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {expected}; status is {}",
            manager.status().await
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn wait_for_progress(manager: &UpdateManager, expected: u32) {
    let mut progress = manager.watch_progress();
    tokio::time::timeout(Duration::from_secs(5), progress.wait_for(|p| *p == expected))
        .await
        .expect("timed out waiting for progress")
        .expect("progress channel closed");
}
