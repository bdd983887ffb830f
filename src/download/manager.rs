use super::downloader::{Download, DownloadOptions};
use crate::blob::Blob;
use crate::error::Error;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// One URI to fetch, with the sha256 its content must hash to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DownloadJob {
    pub uri: String,
    pub sha256: String,
}

impl DownloadJob {
    pub fn new(uri: impl Into<String>, sha256: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            sha256: sha256.into(),
        }
    }
}

struct DownloadResult {
    job: DownloadJob,
    outcome: crate::error::Result<Option<Arc<dyn Blob>>>,
}

/// Successful blobs keyed by job, plus the joined failures if any job failed.
pub struct DownloadResults {
    pub blobs: HashMap<DownloadJob, Arc<dyn Blob>>,
    pub error: Option<Error>,
}

impl DownloadResults {
    pub fn into_result(self) -> crate::error::Result<HashMap<DownloadJob, Arc<dyn Blob>>> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.blobs),
        }
    }
}

impl fmt::Debug for DownloadResults {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadResults")
            .field("blobs", &self.blobs.keys().collect::<Vec<_>>())
            .field("error", &self.error)
            .finish()
    }
}

/// Fixed-size worker pool over download jobs.
pub struct DownloadManager {
    downloader: Arc<dyn Download>,
    worker_count: usize,
}

impl DownloadManager {
    pub fn new(downloader: Arc<dyn Download>, worker_count: usize) -> Self {
        Self {
            downloader,
            worker_count: worker_count.max(1),
        }
    }

    /// Downloads every job as a raw, sha-validated blob.
    ///
    /// A failing job never stops its peers: all `jobs.len()` outcomes are
    /// collected before the failures are joined into `AggregateDownload`.
    /// Jobs with an empty URI are accepted and produce no blob.
    pub async fn download_and_validate(
        &self,
        cancel: &CancellationToken,
        jobs: Vec<DownloadJob>,
    ) -> DownloadResults {
        let total = jobs.len();
        let (job_tx, job_rx) = mpsc::channel::<DownloadJob>(total.max(1));
        let job_rx = Arc::new(Mutex::new(job_rx));
        let (result_tx, mut result_rx) = mpsc::unbounded_channel::<DownloadResult>();

        for worker in 0..self.worker_count.min(total.max(1)) {
            let downloader = Arc::clone(&self.downloader);
            let job_rx = Arc::clone(&job_rx);
            let result_tx = result_tx.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    let next = job_rx.lock().await.recv().await;
                    let Some(job) = next else { break };
                    debug!(worker, uri = %job.uri, "Picked up download job");
                    let outcome = run_job(downloader.as_ref(), &cancel, &job).await;
                    if result_tx.send(DownloadResult { job, outcome }).is_err() {
                        break;
                    }
                }
            });
        }
        drop(result_tx);

        for job in jobs {
            if job_tx.send(job).await.is_err() {
                break;
            }
        }
        drop(job_tx);

        let mut blobs = HashMap::new();
        let mut errors = Vec::new();
        for _ in 0..total {
            match result_rx.recv().await {
                Some(DownloadResult { job, outcome }) => match outcome {
                    Ok(Some(blob)) => {
                        blobs.insert(job, blob);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(uri = %job.uri, error = %e, "Download failed");
                        errors.push(e.to_string());
                    }
                },
                None => {
                    errors.push("download worker exited before reporting".to_string());
                    break;
                }
            }
        }

        DownloadResults {
            blobs,
            error: (!errors.is_empty()).then(|| Error::AggregateDownload(errors)),
        }
    }
}

async fn run_job(
    downloader: &dyn Download,
    cancel: &CancellationToken,
    job: &DownloadJob,
) -> crate::error::Result<Option<Arc<dyn Blob>>> {
    if job.uri.is_empty() {
        return Ok(None);
    }
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    let opts = DownloadOptions::raw().with_sha256(job.sha256.clone());
    downloader.download(cancel, &job.uri, &opts).await.map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::{read_all, BytesBlob};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingDownloader {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Download for CountingDownloader {
        async fn download(
            &self,
            _cancel: &CancellationToken,
            path_or_uri: &str,
            opts: &DownloadOptions,
        ) -> crate::error::Result<Arc<dyn Blob>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert!(opts.raw);
            Ok(Arc::new(BytesBlob::new(path_or_uri.as_bytes().to_vec())))
        }
    }

    #[tokio::test]
    async fn test_every_job_runs_once() {
        let downloader = Arc::new(CountingDownloader {
            calls: AtomicUsize::new(0),
        });
        let manager = DownloadManager::new(downloader.clone(), 2);
        let jobs: Vec<DownloadJob> = (0..5)
            .map(|i| DownloadJob::new(format!("https://host/{i}"), format!("sha{i}")))
            .collect();

        let results = manager
            .download_and_validate(&CancellationToken::new(), jobs.clone())
            .await;
        assert!(results.error.is_none());
        assert_eq!(results.blobs.len(), 5);
        assert_eq!(downloader.calls.load(Ordering::SeqCst), 5);
        let blob = &results.blobs[&jobs[3]];
        assert_eq!(read_all(blob.as_ref()).unwrap(), b"https://host/3");
    }

    #[tokio::test]
    async fn test_empty_job_list() {
        let manager = DownloadManager::new(
            Arc::new(CountingDownloader {
                calls: AtomicUsize::new(0),
            }),
            4,
        );
        let results = manager
            .download_and_validate(&CancellationToken::new(), Vec::new())
            .await;
        assert!(results.blobs.is_empty());
        assert!(results.error.is_none());
    }

    #[tokio::test]
    async fn test_cancelled_jobs_report_cancellation() {
        let manager = DownloadManager::new(
            Arc::new(CountingDownloader {
                calls: AtomicUsize::new(0),
            }),
            1,
        );
        let cancel = CancellationToken::new();
        cancel.cancel();
        let results = manager
            .download_and_validate(&cancel, vec![DownloadJob::new("https://host/a", "")])
            .await;
        assert!(results.blobs.is_empty());
        assert!(results.error.unwrap().to_string().contains("operation cancelled"));
    }
}
