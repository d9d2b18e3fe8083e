use std::path::Path;

use futures_util::StreamExt;
use reqwest::{
    header::{HeaderMap, CONTENT_RANGE, RANGE},
    Client, StatusCode,
};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::{error::UpdateError, manifest::PackageFile};

/// Inclusive HTTP range for `size` bytes starting at `offset`.
pub fn range_header(offset: u64, size: u64) -> Result<String, UpdateError> {
    let end = size
        .checked_sub(1)
        .and_then(|len| offset.checked_add(len))
        .ok_or_else(|| {
            UpdateError::Invalid(format!("empty or overflowing range {offset}+{size}"))
        })?;
    Ok(format!("bytes={offset}-{end}"))
}

/// First byte position of a `Content-Range: bytes start-end/total` header.
fn content_range_start(headers: &HeaderMap) -> Option<u64> {
    let value = headers.get(CONTENT_RANGE)?.to_str().ok()?;
    let (start, _) = value.trim().strip_prefix("bytes ")?.split_once('-')?;
    start.trim().parse().ok()
}

/// Fetches byte ranges of the update package.
#[derive(Clone)]
pub struct RangeDownloader {
    client: Client,
}

impl RangeDownloader {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Buffered mode, for small fragments.
    pub async fn fetch_range(
        &self,
        url: &str,
        offset: u64,
        size: u64,
    ) -> Result<Vec<u8>, UpdateError> {
        let mut buf = Vec::with_capacity(size.min(1 << 20) as usize);
        self.copy_range(url, offset, size, &mut buf).await?;
        Ok(buf)
    }

    /// File-backed mode. `dest` is removed again if the transfer fails.
    pub async fn fetch_range_to_file(
        &self,
        url: &str,
        offset: u64,
        size: u64,
        dest: &Path,
    ) -> Result<(), UpdateError> {
        let mut file = tokio::fs::File::create(dest).await?;
        let result = async {
            self.copy_range(url, offset, size, &mut file).await?;
            file.flush().await?;
            Ok::<_, UpdateError>(())
        }
        .await;
        drop(file);
        if result.is_err() {
            let _ = tokio::fs::remove_file(dest).await;
        }
        result
    }

    /// Downloads a `key=value` property fragment and splits it into lines.
    pub async fn fetch_properties(
        &self,
        url: &str,
        file: &PackageFile,
    ) -> Result<Vec<String>, UpdateError> {
        let bytes = self.fetch_range(url, file.offset, file.size).await?;
        let text = String::from_utf8(bytes)
            .map_err(|_| UpdateError::Malformed(format!("{} is not utf-8", file.filename)))?;
        Ok(text
            .trim()
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn copy_range<W>(
        &self,
        url: &str,
        offset: u64,
        size: u64,
        out: &mut W,
    ) -> Result<u64, UpdateError>
    where
        W: AsyncWrite + Unpin,
    {
        let range = range_header(offset, size)?;
        debug!("GET {} Range: {}", url, range);

        let resp = self
            .client
            .get(url)
            .header(RANGE, range.as_str())
            .send()
            .await
            .map_err(|e| UpdateError::network("range request failed", e))?;

        let mut skip = match resp.status() {
            StatusCode::PARTIAL_CONTENT => match content_range_start(resp.headers()) {
                Some(start) if start != offset => {
                    return Err(UpdateError::Network(format!(
                        "server returned range starting at {start}, expected {offset}"
                    )))
                }
                _ => 0,
            },
            StatusCode::OK => {
                warn!("Server ignored Range header for {}; skipping {} bytes", url, offset);
                offset
            }
            other => {
                return Err(UpdateError::Network(format!(
                    "range request failed with status {other}"
                )))
            }
        };

        let mut received: u64 = 0;
        let mut stream = resp.bytes_stream();
        while received < size {
            let Some(chunk) = stream.next().await else {
                break;
            };
            let chunk = chunk.map_err(|e| UpdateError::network("range read failed", e))?;
            let mut data = &chunk[..];
            if skip > 0 {
                let n = skip.min(data.len() as u64);
                skip -= n;
                data = &data[n as usize..];
            }
            let take = (size - received).min(data.len() as u64) as usize;
            if take == 0 {
                continue;
            }
            out.write_all(&data[..take]).await?;
            received += take as u64;
        }

        if received < size {
            return Err(UpdateError::Truncated {
                expected: size,
                received,
            });
        }
        Ok(received)
    }
}
