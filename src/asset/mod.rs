//! Asset caches: locating, fetching, writing and reading content-addressed assets.

pub mod fetcher;
pub mod locator;
pub mod package;
pub mod reader;
pub mod writer;

pub use fetcher::{AssetFetcher, FetchOptions};
pub use locator::{locate, AssetSource};
pub use package::AssetPackage;
pub use reader::AssetReader;
pub use writer::AssetLayerWriter;

use crate::blob::{Blob, BlobReader};
use crate::error::{Result, ResultExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::sync::Arc;

/// Descriptive information about one asset, identified by its content sha256.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub sha256: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uri: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub licenses: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub homepage: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stacks: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// Value side of the `io.buildpacks.asset.layers` label.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetValue {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uri: String,
    #[serde(rename = "layerDiffID", default)]
    pub layer_diff_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub licenses: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub homepage: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stacks: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// Asset sha256 -> asset record.
pub type AssetMap = BTreeMap<String, AssetValue>;

impl Asset {
    pub fn to_value(&self, layer_diff_id: &str) -> AssetValue {
        AssetValue {
            id: self.id.clone(),
            version: self.version.clone(),
            name: self.name.clone(),
            uri: self.uri.clone(),
            layer_diff_id: layer_diff_id.to_string(),
            licenses: self.licenses.clone(),
            description: self.description.clone(),
            homepage: self.homepage.clone(),
            stacks: self.stacks.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

impl AssetValue {
    pub fn to_asset(&self, sha256: &str) -> Asset {
        Asset {
            sha256: sha256.to_string(),
            id: self.id.clone(),
            version: self.version.clone(),
            name: self.name.clone(),
            uri: self.uri.clone(),
            licenses: self.licenses.clone(),
            description: self.description.clone(),
            homepage: self.homepage.clone(),
            stacks: self.stacks.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

/// An asset's descriptor together with its bytes.
#[derive(Clone)]
pub struct AssetBlob {
    asset: Asset,
    blob: Arc<dyn Blob>,
    size: u64,
}

impl AssetBlob {
    /// Pairs `asset` with `blob`, measuring the blob once up front.
    pub fn from_raw_blob(asset: Asset, blob: Arc<dyn Blob>) -> Result<Self> {
        let size = blob
            .size()
            .with_context(|| format!("measuring asset '{}'", asset.sha256))?;
        Ok(Self { asset, blob, size })
    }

    pub fn descriptor(&self) -> &Asset {
        &self.asset
    }

    pub fn sha256(&self) -> &str {
        &self.asset.sha256
    }
}

impl Blob for AssetBlob {
    fn open(&self) -> Result<BlobReader> {
        self.blob.open()
    }

    fn size(&self) -> Result<u64> {
        Ok(self.size)
    }
}

impl fmt::Debug for AssetBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssetBlob")
            .field("asset", &self.asset)
            .field("size", &self.size)
            .finish()
    }
}

/// Reads an asset blob fully.
pub fn asset_bytes(blob: &AssetBlob) -> Result<Vec<u8>> {
    let mut reader = blob.open()?;
    let mut out = Vec::with_capacity(blob.size as usize);
    io::Read::read_to_end(&mut reader, &mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::BytesBlob;

    #[test]
    fn test_asset_value_conversions() {
        let asset = Asset {
            sha256: "abc".into(),
            id: "id".into(),
            version: "1.0".into(),
            name: "Name".into(),
            stacks: vec!["s1".into()],
            ..Default::default()
        };
        let value = asset.to_value("sha256:layer");
        assert_eq!(value.layer_diff_id, "sha256:layer");
        assert_eq!(value.to_asset("abc"), asset);

        let json = serde_json::to_value(&value).unwrap();
        assert_eq!(json["layerDiffID"], "sha256:layer");
        assert_eq!(json["stacks"][0], "s1");
    }

    #[test]
    fn test_asset_blob_reports_size() {
        let blob = AssetBlob::from_raw_blob(
            Asset {
                sha256: "abc".into(),
                ..Default::default()
            },
            Arc::new(BytesBlob::new(b"twelve bytes".to_vec())),
        )
        .unwrap();
        assert_eq!(blob.size().unwrap(), 12);
        assert_eq!(asset_bytes(&blob).unwrap(), b"twelve bytes");
    }
}
