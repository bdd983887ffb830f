//! Image abstractions consumed by the builder and asset pipelines.

pub mod layout;
pub mod oci;
pub mod store;

pub use layout::{LayerRecord, LayoutImage};
pub use store::LayoutStore;

use crate::config::PullPolicy;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Image-like source of labels and uncompressed layers.
pub trait ReadableImage: Send + Sync {
    fn label(&self, key: &str) -> Result<Option<String>>;
    fn get_layer(&self, diff_id: &str) -> Result<Box<dyn Read + Send>>;
}

/// Mutable image handle the builder and asset writer append to.
pub trait WritableImage: ReadableImage {
    fn name(&self) -> String;
    fn rename(&mut self, name: &str);
    fn env(&self, key: &str) -> Result<Option<String>>;
    fn os(&self) -> Result<String>;
    fn architecture(&self) -> Result<String>;
    fn set_label(&mut self, key: &str, value: &str) -> Result<()>;
    fn add_layer_with_diff_id(&mut self, path: &Path, diff_id: &str) -> Result<()>;
    fn set_working_dir(&mut self, dir: &str) -> Result<()>;
    fn save(&mut self) -> Result<()>;
}

/// Resolves an image name to a readable image, honouring the pull policy.
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch(
        &self,
        cancel: &CancellationToken,
        name: &str,
        pull_policy: PullPolicy,
    ) -> Result<Arc<dyn ReadableImage>>;
}

/// Decodes a JSON label. `Ok(None)` when the label is absent or empty.
pub fn get_json_label<T: DeserializeOwned>(
    image: &(impl ReadableImage + ?Sized),
    key: &str,
) -> Result<Option<T>> {
    match image.label(key)? {
        Some(raw) if !raw.trim().is_empty() => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| Error::LabelMalformed {
                label: key.to_string(),
                reason: e.to_string(),
            }),
        _ => Ok(None),
    }
}

pub fn set_json_label<T: Serialize>(
    image: &mut (impl WritableImage + ?Sized),
    key: &str,
    value: &T,
) -> Result<()> {
    let encoded = serde_json::to_string(value)?;
    image.set_label(key, &encoded)
}
