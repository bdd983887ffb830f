use super::{Asset, AssetBlob, AssetMap};
use crate::archive::read_matching_tar_entries;
use crate::blob::BytesBlob;
use crate::constants::ASSET_LAYERS_LABEL;
use crate::error::{Error, Result};
use crate::image::{get_json_label, ReadableImage};
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, OnceLock};
use tracing::debug;

fn asset_entry_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^/?(Files/)?cnb/assets/([^/]+)$").expect("static regex"))
}

/// Recovers asset blobs and their label from an image written by
/// [`AssetLayerWriter`](super::AssetLayerWriter).
#[derive(Debug, Default, Clone, Copy)]
pub struct AssetReader;

impl AssetReader {
    pub fn new() -> Self {
        Self
    }

    /// Blobs come back sorted by asset sha256. A missing label yields nothing.
    pub fn read(&self, image: &dyn ReadableImage) -> Result<(Vec<AssetBlob>, AssetMap)> {
        let metadata: AssetMap = get_json_label(image, ASSET_LAYERS_LABEL)?.unwrap_or_default();

        let mut by_layer: BTreeMap<&str, Vec<Asset>> = BTreeMap::new();
        for (sha, value) in &metadata {
            by_layer
                .entry(value.layer_diff_id.as_str())
                .or_default()
                .push(value.to_asset(sha));
        }

        let mut blobs = Vec::with_capacity(metadata.len());
        for (diff_id, assets) in by_layer {
            let layer = image.get_layer(diff_id).map_err(|e| {
                if matches!(e.root(), Error::LayerFetchFailed { .. }) {
                    e
                } else {
                    Error::LayerFetchFailed {
                        diff_id: diff_id.to_string(),
                        reason: e.to_string(),
                    }
                }
            })?;
            let entries = read_matching_tar_entries(layer, asset_entry_pattern())?;
            let mut contents: HashMap<String, Vec<u8>> = entries
                .into_iter()
                .filter_map(|(name, data)| {
                    let sha = asset_entry_pattern().captures(&name)?.get(2)?.as_str().to_string();
                    Some((sha, data))
                })
                .collect();

            for asset in assets {
                let data = contents
                    .remove(&asset.sha256)
                    .ok_or_else(|| Error::AssetMissingInLayer {
                        sha256: asset.sha256.clone(),
                        diff_id: diff_id.to_string(),
                    })?;
                debug!(asset = %asset.sha256, layer = %diff_id, "Read asset");
                blobs.push(AssetBlob::from_raw_blob(asset, Arc::new(BytesBlob::new(data)))?);
            }
        }

        blobs.sort_by(|a, b| a.sha256().cmp(b.sha256()));
        Ok((blobs, metadata))
    }
}
