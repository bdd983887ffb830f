use crate::archive::diff_id_of;
use crate::blob::{Blob, FileBlob};
use crate::constants::CACHE_VERSION;
use crate::error::{Error, Result, ResultExt};
use crate::paths;
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::header::{ETAG, IF_NONE_MATCH};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadOptions {
    /// Hand back the bytes as fetched instead of an auto-detected tar view.
    pub raw: bool,
    /// Hex sha256 the opened blob must hash to.
    pub validate_sha256: Option<String>,
}

impl DownloadOptions {
    pub fn raw() -> Self {
        Self {
            raw: true,
            validate_sha256: None,
        }
    }

    pub fn with_sha256(mut self, sha256: impl Into<String>) -> Self {
        let sha256 = sha256.into();
        self.validate_sha256 = (!sha256.is_empty()).then_some(sha256);
        self
    }
}

/// Anything that can turn a path or URI into a blob.
#[async_trait]
pub trait Download: Send + Sync {
    async fn download(
        &self,
        cancel: &CancellationToken,
        path_or_uri: &str,
        opts: &DownloadOptions,
    ) -> Result<Arc<dyn Blob>>;
}

/// Cache-backed downloader for local paths, `file://` and `http(s)://` URIs.
///
/// Remote content lands at `<base>/c2/<sha256(uri)>` next to a `.etag`
/// sidecar used for conditional requests.
pub struct Downloader {
    base_cache_dir: PathBuf,
    client: reqwest::Client,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Downloader {
    pub fn new(base_cache_dir: impl Into<PathBuf>) -> Self {
        Self::with_client(base_cache_dir, reqwest::Client::new())
    }

    pub fn with_client(base_cache_dir: impl Into<PathBuf>, client: reqwest::Client) -> Self {
        Self {
            base_cache_dir: base_cache_dir.into(),
            client,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn versioned_cache_dir(&self) -> PathBuf {
        self.base_cache_dir.join(CACHE_VERSION)
    }

    /// Cache file backing `uri`.
    pub fn cache_path(&self, uri: &str) -> PathBuf {
        let digest = Sha256::digest(uri.as_bytes());
        self.versioned_cache_dir().join(hex::encode(digest))
    }

    fn uri_lock(&self, uri: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock();
        Arc::clone(locks.entry(uri.to_string()).or_default())
    }

    async fn resolve(&self, cancel: &CancellationToken, path_or_uri: &str) -> Result<PathBuf> {
        if !paths::is_uri(path_or_uri) {
            let abs = paths::absolutize(Path::new(path_or_uri), Path::new(""))?;
            info!(path = %abs.display(), "Using local file");
            return Ok(abs);
        }

        match paths::scheme(path_or_uri).unwrap_or_default() {
            "file" => {
                let path = PathBuf::from(paths::uri_to_file_path(path_or_uri));
                info!(uri = %path_or_uri, path = %path.display(), "Using local file");
                Ok(path)
            }
            "http" | "https" => self.handle_http(cancel, path_or_uri).await,
            other => Err(Error::UnsupportedScheme(other.to_string())),
        }
    }

    fn release_uri_lock(&self, uri: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.locks.lock();
        // the map's reference plus ours
        if Arc::strong_count(&lock) == 2 {
            locks.remove(uri);
        }
    }

    async fn handle_http(&self, cancel: &CancellationToken, uri: &str) -> Result<PathBuf> {
        let lock = self.uri_lock(uri);
        let fetched = {
            let _guard = lock.lock().await;
            self.fetch_http(cancel, uri).await
        };
        self.release_uri_lock(uri, lock);
        fetched
    }

    async fn fetch_http(&self, cancel: &CancellationToken, uri: &str) -> Result<PathBuf> {
        let cache_dir = self.versioned_cache_dir();
        tokio::fs::create_dir_all(&cache_dir)
            .await
            .with_context(|| format!("creating cache dir {}", cache_dir.display()))?;

        let cache_path = self.cache_path(uri);
        let etag_path = etag_path(&cache_path);

        let cached_etag = match tokio::fs::read_to_string(&etag_path).await {
            Ok(etag) if cache_path.exists() => Some(etag),
            _ => None,
        };

        let mut request = self.client.get(uri);
        if let Some(etag) = cached_etag.as_deref().filter(|e| !e.is_empty()) {
            request = request.header(IF_NONE_MATCH, etag);
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            resp = request.send() => resp?,
        };

        let status = response.status();
        if status == StatusCode::NOT_MODIFIED {
            crate::log_cache_hit!(uri, cache_path);
            return Ok(cache_path);
        }
        if !status.is_success() {
            return Err(Error::DownloadFailed {
                uri: uri.to_string(),
                status: status.as_u16(),
            });
        }

        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        info!(uri = %uri, "Downloading");
        let partial = cache_path.with_extension("partial");
        let written = write_body(cancel, response, &partial).await;
        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e.context(format!("downloading '{}'", uri)));
        }

        tokio::fs::rename(&partial, &cache_path)
            .await
            .with_context(|| format!("committing cache entry {}", cache_path.display()))?;
        tokio::fs::write(&etag_path, etag.as_bytes())
            .await
            .context("writing etag")?;

        Ok(cache_path)
    }
}

fn etag_path(cache_path: &Path) -> PathBuf {
    let mut name = cache_path.as_os_str().to_os_string();
    name.push(".etag");
    PathBuf::from(name)
}

async fn write_body(
    cancel: &CancellationToken,
    response: reqwest::Response,
    dest: &Path,
) -> Result<()> {
    let mut file = tokio::fs::File::create(dest)
        .await
        .with_context(|| format!("creating {}", dest.display()))?;
    let mut body = response.bytes_stream();
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            chunk = body.next() => chunk,
        };
        match next {
            Some(chunk) => file.write_all(&chunk?).await?,
            None => break,
        }
    }
    file.flush().await?;
    Ok(())
}

#[async_trait]
impl Download for Downloader {
    async fn download(
        &self,
        cancel: &CancellationToken,
        path_or_uri: &str,
        opts: &DownloadOptions,
    ) -> Result<Arc<dyn Blob>> {
        let path = self.resolve(cancel, path_or_uri).await?;
        let blob: Arc<dyn Blob> = if opts.raw {
            Arc::new(FileBlob::raw(path))
        } else {
            Arc::new(FileBlob::new(path))
        };

        if let Some(expected) = &opts.validate_sha256 {
            validate(Arc::clone(&blob), expected).await?;
        }
        Ok(blob)
    }
}

/// Requires the diff-id of what `blob` opens to equal `sha256:<expected>`.
pub async fn validate(blob: Arc<dyn Blob>, expected: &str) -> Result<()> {
    let actual = tokio::task::spawn_blocking(move || diff_id_of(blob.open()?))
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))??;
    let expected = format!("sha256:{}", expected);
    if actual != expected {
        return Err(Error::ValidationMismatch { expected, actual });
    }
    debug!(diff_id = %actual, "Validated download");
    Ok(())
}
