use std::{
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use reqwest::Client;
use tracing::{debug, info, warn};

use crate::{
    error::UpdateError,
    manifest::{BuildInfo, ComparePolicy, Manifest},
};

/// Result of a manifest lookup. Failures collapse into `NotAvailable`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ManifestOutcome {
    Available(Manifest),
    NotAvailable,
}

pub struct ManifestFetcher {
    client: Client,
    server_url: String,
    build: BuildInfo,
    policy: ComparePolicy,
    cache_dir: PathBuf,
    cache_max_age: Duration,
}

impl ManifestFetcher {
    pub fn new(
        client: Client,
        server_url: impl Into<String>,
        build: BuildInfo,
        policy: ComparePolicy,
    ) -> Self {
        Self {
            client,
            server_url: server_url.into(),
            build,
            policy,
            cache_dir: PathBuf::new(),
            cache_max_age: Duration::ZERO,
        }
    }

    /// Reuses a cached manifest younger than `max_age`. Zero disables caching.
    pub fn with_cache(mut self, cache_dir: impl Into<PathBuf>, max_age: Duration) -> Self {
        self.cache_dir = cache_dir.into();
        self.cache_max_age = max_age;
        self
    }

    pub fn build(&self) -> &BuildInfo {
        &self.build
    }

    pub fn manifest_url(&self, channel: &str) -> String {
        format!(
            "{}/{}/{}",
            self.server_url.trim_end_matches('/'),
            channel.trim_matches('/'),
            self.build.device
        )
    }

    pub fn is_newer(&self, manifest: &Manifest) -> bool {
        crate::manifest::is_newer(manifest, &self.build, self.policy)
    }

    pub async fn fetch_manifest(&self, channel: &str) -> ManifestOutcome {
        if let Some(cached) = self.read_cache(channel).await {
            return ManifestOutcome::Available(cached);
        }
        match self.fetch_remote(channel).await {
            Ok(manifest) if manifest.is_empty() => ManifestOutcome::NotAvailable,
            Ok(manifest) => {
                self.write_cache(channel, &manifest).await;
                ManifestOutcome::Available(manifest)
            }
            Err(UpdateError::Empty) => {
                debug!("Manifest for channel {} is empty", channel);
                ManifestOutcome::NotAvailable
            }
            Err(err) => {
                warn!("Manifest for channel {} unavailable: {}", channel, err);
                ManifestOutcome::NotAvailable
            }
        }
    }

    async fn fetch_remote(&self, channel: &str) -> Result<Manifest, UpdateError> {
        if self.build.device.trim().is_empty() {
            return Err(UpdateError::Invalid("device name is not configured".into()));
        }
        let url = self.manifest_url(channel);
        info!("Fetching update manifest from {}", url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| UpdateError::network("manifest request failed", e))?;
        if !resp.status().is_success() {
            return Err(UpdateError::Network(format!(
                "manifest request failed with status {}",
                resp.status()
            )));
        }
        let body = resp
            .text()
            .await
            .map_err(|e| UpdateError::network("manifest read failed", e))?;
        if body.trim().is_empty() {
            return Err(UpdateError::Empty);
        }
        Manifest::parse(&body)
    }

    fn cache_path(&self, channel: &str) -> Option<PathBuf> {
        if self.cache_max_age.is_zero() || self.cache_dir.as_os_str().is_empty() {
            return None;
        }
        let channel = sanitize(channel);
        let device = sanitize(&self.build.device);
        Some(self.cache_dir.join(format!("{channel}-{device}.json")))
    }

    async fn read_cache(&self, channel: &str) -> Option<Manifest> {
        let path = self.cache_path(channel)?;
        let meta = tokio::fs::metadata(&path).await.ok()?;
        let age = meta
            .modified()
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())?;
        if age > self.cache_max_age {
            return None;
        }
        let raw = tokio::fs::read_to_string(&path).await.ok()?;
        match Manifest::parse(&raw) {
            Ok(manifest) if !manifest.is_empty() => {
                debug!("Using cached manifest {} ({}s old)", path.display(), age.as_secs());
                Some(manifest)
            }
            Ok(_) => None,
            Err(err) => {
                warn!("Ignoring cached manifest {}: {}", path.display(), err);
                None
            }
        }
    }

    async fn write_cache(&self, channel: &str, manifest: &Manifest) {
        let Some(path) = self.cache_path(channel) else {
            return;
        };
        if let Err(err) = write_cache_file(&path, &manifest.raw_json).await {
            warn!("Failed to cache manifest {}: {}", path.display(), err);
        }
    }
}

async fn write_cache_file(path: &Path, raw: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, raw).await
}

fn sanitize(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fetcher(server: &str) -> ManifestFetcher {
        let build = BuildInfo {
            device: "lynx".into(),
            build_date_utc: 1000,
            version: String::new(),
        };
        ManifestFetcher::new(Client::new(), server, build, ComparePolicy::BuildDate)
    }

    #[test]
    fn url_joins_server_channel_and_device() {
        assert_eq!(
            fetcher("https://release.example.org/").manifest_url("beta"),
            "https://release.example.org/beta/lynx"
        );
    }

    #[test]
    fn cache_disabled_without_max_age() {
        let f = fetcher("https://release.example.org").with_cache("/tmp/cache", Duration::ZERO);
        assert!(f.cache_path("stable").is_none());
    }

    #[test]
    fn cache_names_are_path_safe() {
        let f = fetcher("https://x").with_cache("/tmp/cache", Duration::from_secs(60));
        assert_eq!(
            f.cache_path("../stable").unwrap(),
            PathBuf::from("/tmp/cache/___stable-lynx.json")
        );
    }
}
