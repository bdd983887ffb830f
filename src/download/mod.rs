//! Cache-backed downloads and the parallel download pool.

pub mod downloader;
pub mod manager;

pub use downloader::{validate, Download, DownloadOptions, Downloader};
pub use manager::{DownloadJob, DownloadManager, DownloadResults};
