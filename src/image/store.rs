//! Local store of OCI layouts, keyed by image name.

use super::layout::LayoutImage;
use super::{ImageFetcher, ReadableImage, WritableImage};
use crate::archive::sha256_bytes;
use crate::config::PullPolicy;
use crate::error::{Error, Result, ResultExt};
use async_trait::async_trait;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Image backend over layouts that were placed in the store ahead of time.
/// Pulling from registries is left to whatever fills the store.
pub struct LayoutStore {
    dir: PathBuf,
}

impl LayoutStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn layout_dir(&self, name: &str) -> PathBuf {
        self.dir.join("images").join(sha256_bytes(name.as_bytes()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.layout_dir(name).join("index.json").exists()
    }

    /// Stores `image` under `name`, replacing any earlier copy.
    pub fn import(&self, name: &str, image: &LayoutImage) -> Result<()> {
        let dest = self.layout_dir(name);
        let parent = ensure_parent(&dest)?;
        let staging = tempfile::Builder::new()
            .prefix("cnbkit-import")
            .tempdir_in(parent)?;
        image
            .write_layout(staging.path())
            .with_context(|| format!("storing image '{}'", name))?;
        if dest.exists() {
            fs::remove_dir_all(&dest)?;
        }
        fs::rename(staging.path(), &dest)?;
        Ok(())
    }
}

fn ensure_parent(path: &Path) -> Result<&Path> {
    let parent = path
        .parent()
        .ok_or_else(|| Error::Config(format!("no parent for {}", path.display())))?;
    fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    Ok(parent)
}

#[async_trait]
impl ImageFetcher for LayoutStore {
    async fn fetch(
        &self,
        cancel: &CancellationToken,
        name: &str,
        pull_policy: PullPolicy,
    ) -> Result<Arc<dyn ReadableImage>> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if !self.contains(name) {
            return Err(Error::ImageNotFound {
                name: name.to_string(),
                pull_policy,
            });
        }
        debug!(image = %name, pull_policy = %pull_policy, "Using stored image");

        let mut loaded = LayoutImage::from_layout_dir(&self.layout_dir(name))
            .with_context(|| format!("loading image '{}'", name))?;
        loaded.rename(name);
        Ok(Arc::new(loaded))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_image_is_reported() {
        let store = tempfile::tempdir().unwrap();
        let fetcher = LayoutStore::new(store.path());
        let err = fetcher
            .fetch(&CancellationToken::new(), "cnbs/assets:1", PullPolicy::Never)
            .await
            .err()
            .unwrap();
        assert_eq!(
            err.to_string(),
            "image 'cnbs/assets:1' not found in local store (pull policy never)"
        );
    }

    #[tokio::test]
    async fn test_imported_image_is_served() {
        let store = tempfile::tempdir().unwrap();
        let fetcher = LayoutStore::new(store.path());
        let image = LayoutImage::new("", "linux", "amd64")
            .unwrap()
            .with_label("io.buildpacks.some", "value");
        fetcher.import("cnbs/assets:1", &image).unwrap();
        assert!(fetcher.contains("cnbs/assets:1"));

        let fetched = fetcher
            .fetch(&CancellationToken::new(), "cnbs/assets:1", PullPolicy::Always)
            .await
            .unwrap();
        assert_eq!(
            fetched.label("io.buildpacks.some").unwrap().as_deref(),
            Some("value")
        );
    }
}
