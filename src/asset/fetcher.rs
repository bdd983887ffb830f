use super::locator::{locate, AssetSource};
use crate::blob::Blob;
use crate::config::PullPolicy;
use crate::constants::DEFAULT_DOWNLOAD_WORKERS;
use crate::download::{Download, DownloadJob, DownloadManager};
use crate::error::{Error, Result, ResultExt};
use crate::image::{ImageFetcher, LayoutImage, ReadableImage};
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub pull_policy: PullPolicy,
    pub working_dir: PathBuf,
}

impl FetchOptions {
    /// Default pull policy, relative to the current directory.
    pub fn new() -> Result<Self> {
        Ok(Self {
            pull_policy: PullPolicy::default(),
            working_dir: std::env::current_dir()?,
        })
    }

    pub fn with_pull_policy(mut self, pull_policy: PullPolicy) -> Self {
        self.pull_policy = pull_policy;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }
}

/// Resolves asset references of any locator kind to readable images.
pub struct AssetFetcher {
    downloads: DownloadManager,
    images: Arc<dyn ImageFetcher>,
}

impl AssetFetcher {
    pub fn new(downloader: Arc<dyn Download>, images: Arc<dyn ImageFetcher>) -> Self {
        Self::with_workers(downloader, images, DEFAULT_DOWNLOAD_WORKERS)
    }

    /// Remote packages are downloaded by a pool of `workers`.
    pub fn with_workers(
        downloader: Arc<dyn Download>,
        images: Arc<dyn ImageFetcher>,
        workers: usize,
    ) -> Self {
        Self {
            downloads: DownloadManager::new(downloader, workers),
            images,
        }
    }

    /// Fetches every reference, returning images in input order. Remote
    /// packages are downloaded up front; the first failure in input order
    /// aborts the batch.
    pub async fn fetch_assets(
        &self,
        cancel: &CancellationToken,
        names: &[String],
        opts: &FetchOptions,
    ) -> Result<Vec<Arc<dyn ReadableImage>>> {
        let sources = names
            .iter()
            .map(|name| locate(name, &opts.working_dir))
            .collect::<Result<Vec<_>>>()?;

        let jobs: Vec<DownloadJob> = sources
            .iter()
            .filter_map(|source| match source {
                AssetSource::Remote(uri) => Some(DownloadJob::new(uri.as_str(), "")),
                _ => None,
            })
            .collect();
        let (downloaded, mut download_error) = if jobs.is_empty() {
            (HashMap::new(), None)
        } else {
            let results = self.downloads.download_and_validate(cancel, jobs).await;
            let blobs = results
                .blobs
                .into_iter()
                .map(|(job, blob)| (job.uri, blob))
                .collect::<HashMap<_, _>>();
            (blobs, results.error)
        };

        let mut out = Vec::with_capacity(names.len());
        for (name, source) in names.iter().zip(sources) {
            let kind = source.kind();
            debug!(asset = %name, kind, "Fetching asset cache");
            let fetched = match source {
                AssetSource::Remote(uri) => match downloaded.get(&uri) {
                    Some(blob) => open_layout_blob(Arc::clone(blob)).await,
                    None => Err(download_error.take().unwrap_or_else(|| {
                        Error::AggregateDownload(vec![format!("'{}' was not downloaded", uri)])
                    })),
                },
                AssetSource::File(path) => open_layout_file(path).await,
                AssetSource::Image(name) => self.images.fetch(cancel, &name, opts.pull_policy).await,
            };
            let image = fetched.with_context(|| {
                format!("unable to fetch asset of type \"{}\" from '{}'", kind, name)
            })?;
            out.push(image);
        }
        info!(count = out.len(), "Fetched asset caches");
        Ok(out)
    }
}

async fn open_layout_blob(blob: Arc<dyn Blob>) -> Result<Arc<dyn ReadableImage>> {
    let image = tokio::task::spawn_blocking(move || -> Result<LayoutImage> {
        LayoutImage::from_layout_tar(blob.open()?)
    })
    .await
    .map_err(std::io::Error::other)??;
    Ok(Arc::new(image))
}

async fn open_layout_file(path: PathBuf) -> Result<Arc<dyn ReadableImage>> {
    let image = tokio::task::spawn_blocking(move || load_layout_file(&path))
        .await
        .map_err(std::io::Error::other)??;
    Ok(Arc::new(image))
}

fn load_layout_file(path: &Path) -> Result<LayoutImage> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut image = LayoutImage::from_layout_tar(BufReader::new(file))?;
    crate::image::WritableImage::rename(&mut image, &path.to_string_lossy());
    Ok(image)
}
