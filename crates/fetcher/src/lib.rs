//! Fetcher: authenticated recording download into scoped temp files.

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::{Builder, TempPath};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};
use url::Url;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const READ_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("invalid recording url: {0}")]
    InvalidUrl(String),
    #[error("recording server rejected the credentials (HTTP {0})")]
    Unauthorized(u16),
    #[error("recording download failed with HTTP {0}")]
    Status(u16),
    #[error("response is not audio (content-type: {0:?})")]
    NotAudio(String),
    #[error("download failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("could not write recording: {0}")]
    Io(#[from] std::io::Error),
}

/// A downloaded recording on disk. The file is removed when this value is
/// released or dropped; removal failures are logged.
#[derive(Debug)]
pub struct TempRecording {
    path: Option<TempPath>,
}

impl TempRecording {
    pub fn new(path: TempPath) -> Self {
        Self { path: Some(path) }
    }

    pub fn path(&self) -> &Path {
        self.path.as_deref().unwrap_or_else(|| Path::new(""))
    }

    /// Delete the file now, returning the removal error instead of logging it.
    pub fn release(mut self) -> std::io::Result<()> {
        match self.path.take() {
            Some(p) => p.close(),
            None => Ok(()),
        }
    }
}

impl Drop for TempRecording {
    fn drop(&mut self) {
        if let Some(p) = self.path.take() {
            let shown = p.to_path_buf();
            if let Err(e) = p.close() {
                warn!(path = %shown.display(), error = %e, "failed to remove temporary recording");
            }
        }
    }
}

#[derive(Debug)]
pub struct FetchedRecording {
    pub final_url: String,
    pub file: TempRecording,
    pub bytes: u64,
    pub sha256: String,
    pub content_type: String,
}

/// Source of call recordings.
#[async_trait]
pub trait RecordingSource: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedRecording, FetchError>;
}

/// Downloads recordings with the CRM bearer token.
#[derive(Debug, Clone)]
pub struct HttpRecordingFetcher {
    client: reqwest::Client,
    temp_dir: Option<PathBuf>,
}

impl HttpRecordingFetcher {
    pub fn new(access_token: &str) -> Result<Self, FetchError> {
        let mut headers = HeaderMap::new();
        let auth = HeaderValue::from_str(&format!("Bearer {}", access_token.trim()))
            .map_err(|e| FetchError::InvalidUrl(format!("invalid token header: {e}")))?;
        headers.insert(AUTHORIZATION, auth);

        let client = reqwest::Client::builder()
            .user_agent("Mozilla/5.0 (compatible; callgrade-fetcher/0.1)")
            .default_headers(headers)
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(READ_TIMEOUT)
            .build()?;
        Ok(Self { client, temp_dir: None })
    }

    /// Place temp files in `dir` instead of the system temp directory.
    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = Some(dir.into());
        self
    }
}

#[async_trait]
impl RecordingSource for HttpRecordingFetcher {
    #[instrument(skip(self))]
    async fn fetch(&self, url: &str) -> Result<FetchedRecording, FetchError> {
        let parsed = Url::parse(url).map_err(|e| FetchError::InvalidUrl(e.to_string()))?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(FetchError::InvalidUrl(format!("unsupported scheme: {}", parsed.scheme())));
        }

        let resp = self.client.get(parsed.as_str()).send().await?;
        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(FetchError::Unauthorized(status.as_u16()));
        }
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        let final_url = resp.url().to_string();
        let ctype = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        if !is_audio(&ctype) {
            return Err(FetchError::NotAudio(ctype));
        }

        let mut builder = Builder::new();
        builder.prefix("callgrade-").suffix(extension_for(&ctype));
        let named = match &self.temp_dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };
        let (std_file, path) = named.into_parts();
        // From here on the path is owned by the guard, so early returns clean up.
        let recording = TempRecording::new(path);
        let mut file = tokio::fs::File::from_std(std_file);

        let mut hasher = Sha256::new();
        let mut bytes = 0u64;
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            hasher.update(&chunk);
            bytes += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        drop(file);

        let sha256 = hex::encode(hasher.finalize());
        debug!(path = %recording.path().display(), "recording written");
        info!(bytes, content_type = %ctype, sha256 = %sha256, "recording downloaded");
        Ok(FetchedRecording {
            final_url,
            file: recording,
            bytes,
            sha256,
            content_type: ctype,
        })
    }
}

/// Error pages come back as `text/html`; only audio payloads are accepted.
pub fn is_audio(content_type: &str) -> bool {
    content_type.to_ascii_lowercase().contains("audio")
}

fn extension_for(ct: &str) -> &'static str {
    let ct = ct.to_ascii_lowercase();
    if ct.contains("audio/mpeg") || ct.contains("audio/mp3") {
        ".mp3"
    } else if ct.contains("audio/mp4") || ct.contains("audio/aac") || ct.contains("audio/x-m4a") {
        ".m4a"
    } else if ct.contains("audio/flac") {
        ".flac"
    } else if ct.contains("ogg") {
        ".ogg"
    } else {
        ".wav"
    }
}
