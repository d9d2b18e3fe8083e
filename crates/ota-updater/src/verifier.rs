use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::{
    engine::UpdateEngine, error::UpdateError, manifest::PackageFile, range::RangeDownloader,
};

/// Downloads the payload metadata fragment and asks the engine to check it.
pub struct MetadataVerifier {
    downloader: RangeDownloader,
    engine: Arc<dyn UpdateEngine>,
    scratch_dir: PathBuf,
}

impl MetadataVerifier {
    pub fn new(
        downloader: RangeDownloader,
        engine: Arc<dyn UpdateEngine>,
        scratch_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            downloader,
            engine,
            scratch_dir: scratch_dir.into(),
        }
    }

    pub async fn verify(&self, url: &str, metadata: &PackageFile) -> Result<(), UpdateError> {
        tokio::fs::create_dir_all(&self.scratch_dir).await?;
        let scratch = ScratchFile::new(self.scratch_dir.join(scratch_name(url, &metadata.filename)));

        let result = self.download_and_check(url, metadata, scratch.path()).await;
        scratch.remove().await;
        result
    }

    async fn download_and_check(
        &self,
        url: &str,
        metadata: &PackageFile,
        path: &Path,
    ) -> Result<(), UpdateError> {
        self.downloader
            .fetch_range_to_file(url, metadata.offset, metadata.size, path)
            .await?;
        debug!("Downloaded {} bytes of metadata to {}", metadata.size, path.display());

        match self.engine.verify_payload_metadata(path).await {
            Ok(true) => {
                info!("Payload metadata verified");
                Ok(())
            }
            Ok(false) => Err(UpdateError::VerificationFailed),
            Err(err) => {
                warn!("Metadata verification call failed: {}", err);
                Err(UpdateError::VerificationFailed)
            }
        }
    }
}

/// Deletes its file when dropped, so an aborted verification still cleans up.
struct ScratchFile {
    path: PathBuf,
}

impl ScratchFile {
    fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    async fn remove(self) {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!("Failed to remove {}: {}", self.path.display(), err),
        }
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn scratch_name(url: &str, filename: &str) -> String {
    let digest = Sha256::digest(url.as_bytes());
    let hash: String = digest.iter().take(6).map(|b| format!("{b:02x}")).collect();
    let name: String = filename
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '_' { c } else { '_' })
        .collect();
    format!("{hash}-{name}")
}
