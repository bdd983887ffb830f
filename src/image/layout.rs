//! In-memory image config over on-disk layers, persisted as an OCI image layout.

use super::oci::{
    digest_hex, OciConfig, OciDescriptor, OciHistory, OciIndex, OciManifest, CONFIG_MEDIA_TYPE,
    LAYER_MEDIA_TYPE, LAYOUT_FILE_CONTENTS, MANIFEST_MEDIA_TYPE,
};
use super::{ReadableImage, WritableImage};
use crate::archive::{is_gzip, read_tar_entry, sha256_bytes, EntryHeader, HashingWriter};
use crate::constants::NORMALIZED_MTIME;
use crate::error::{Error, Result, ResultExt};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerRecord {
    pub diff_id: String,
    pub path: PathBuf,
}

/// Image whose layers are uncompressed tars kept in a private scratch dir.
pub struct LayoutImage {
    name: String,
    config: OciConfig,
    layers: Vec<LayerRecord>,
    workspace: TempDir,
    layout_dir: Option<PathBuf>,
    saved: bool,
}

impl LayoutImage {
    pub fn new(name: &str, os: &str, architecture: &str) -> Result<Self> {
        let config = OciConfig {
            os: os.to_string(),
            architecture: architecture.to_string(),
            ..Default::default()
        };
        Ok(Self {
            name: name.to_string(),
            config,
            layers: Vec::new(),
            workspace: tempfile::Builder::new().prefix("cnbkit-image").tempdir()?,
            layout_dir: None,
            saved: false,
        })
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.set_env(key, value);
        self
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.config.config.labels.insert(key.to_string(), value.to_string());
        self
    }

    /// `save` also writes the OCI layout to `dir`.
    pub fn with_layout_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.layout_dir = Some(dir.into());
        self
    }

    pub fn set_env(&mut self, key: &str, value: &str) {
        let prefix = format!("{}=", key);
        self.config.config.env.retain(|e| !e.starts_with(&prefix));
        self.config.config.env.push(format!("{}{}", prefix, value));
    }

    pub fn set_os(&mut self, os: &str) {
        self.config.os = os.to_string();
    }

    pub fn layers(&self) -> &[LayerRecord] {
        &self.layers
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.config.config.labels
    }

    pub fn working_dir(&self) -> &str {
        &self.config.config.working_dir
    }

    pub fn is_saved(&self) -> bool {
        self.saved
    }

    /// Topmost layer holding `path`, with its header and contents.
    pub fn find_layer_entry(&self, path: &str) -> Result<(EntryHeader, Vec<u8>)> {
        for layer in self.layers.iter().rev() {
            let file = File::open(&layer.path)?;
            match read_tar_entry(BufReader::new(file), path) {
                Ok(found) => return Ok(found),
                Err(e) if e.is_entry_not_exist() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(Error::EntryNotExist(path.to_string()))
    }

    fn scratch_layer_path(&self) -> PathBuf {
        self.workspace
            .path()
            .join(format!("layer-{:04}.tar", self.layers.len()))
    }

    /// Writes `oci-layout`, `index.json` and `blobs/sha256/*` under `dir`.
    /// Layers are stored gzip-compressed.
    pub fn write_layout(&self, dir: &Path) -> Result<()> {
        let blobs_dir = dir.join("blobs").join("sha256");
        fs::create_dir_all(&blobs_dir)
            .with_context(|| format!("creating {}", blobs_dir.display()))?;

        let mut layer_descriptors = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            let descriptor = compress_layer(&layer.path, &blobs_dir)
                .with_context(|| format!("compressing layer {}", layer.diff_id))?;
            layer_descriptors.push(descriptor);
        }

        let created = chrono::DateTime::from_timestamp(NORMALIZED_MTIME as i64, 0)
            .unwrap_or_default()
            .to_rfc3339();
        let mut config = self.config.clone();
        config.rootfs.diff_ids = self.layers.iter().map(|l| l.diff_id.clone()).collect();
        config.history = self
            .layers
            .iter()
            .map(|l| OciHistory {
                created: created.clone(),
                created_by: format!("cnbkit: {}", l.diff_id),
            })
            .collect();

        let config_json = serde_json::to_vec(&config)?;
        let config_digest = write_blob(&blobs_dir, &config_json)?;

        let manifest = OciManifest {
            schema_version: 2,
            media_type: MANIFEST_MEDIA_TYPE.to_string(),
            config: OciDescriptor {
                media_type: CONFIG_MEDIA_TYPE.to_string(),
                digest: config_digest,
                size: config_json.len() as u64,
            },
            layers: layer_descriptors,
        };
        let manifest_json = serde_json::to_vec(&manifest)?;
        let manifest_digest = write_blob(&blobs_dir, &manifest_json)?;

        let index = OciIndex {
            schema_version: 2,
            media_type: String::new(),
            manifests: vec![OciDescriptor {
                media_type: MANIFEST_MEDIA_TYPE.to_string(),
                digest: manifest_digest,
                size: manifest_json.len() as u64,
            }],
        };
        fs::write(dir.join("index.json"), serde_json::to_vec(&index)?)?;
        fs::write(dir.join("oci-layout"), LAYOUT_FILE_CONTENTS)?;

        info!(path = %dir.display(), layers = self.layers.len(), "Wrote OCI layout");
        Ok(())
    }

    /// Loads the first image referenced by the layout's `index.json`.
    pub fn from_layout_dir(dir: &Path) -> Result<Self> {
        let index: OciIndex = read_json(&dir.join("index.json"))?;
        let manifest_desc = index
            .manifests
            .first()
            .ok_or_else(|| Error::InvalidDescriptor {
                kind: "oci layout".to_string(),
                reason: "index.json lists no manifests".to_string(),
            })?;
        let blobs_dir = dir.join("blobs").join("sha256");
        let manifest: OciManifest = read_json(&blobs_dir.join(digest_hex(&manifest_desc.digest)))?;
        let config: OciConfig = read_json(&blobs_dir.join(digest_hex(&manifest.config.digest)))?;

        let mut image = Self::new("", &config.os, &config.architecture)?;
        image.config = OciConfig {
            rootfs: Default::default(),
            history: Vec::new(),
            ..config
        };

        for layer in &manifest.layers {
            let blob_path = blobs_dir.join(digest_hex(&layer.digest));
            let dest = image.scratch_layer_path();
            let diff_id = decompress_layer(&blob_path, &dest)
                .with_context(|| format!("reading layer {}", layer.digest))?;
            debug!(digest = %layer.digest, diff_id = %diff_id, "Loaded layer");
            image.layers.push(LayerRecord {
                diff_id,
                path: dest,
            });
        }
        Ok(image)
    }

    /// Loads an image from a tarball of an OCI layout directory.
    pub fn from_layout_tar<R: Read>(reader: R) -> Result<Self> {
        let unpacked = tempfile::Builder::new().prefix("cnbkit-layout").tempdir()?;
        tar::Archive::new(reader)
            .unpack(unpacked.path())
            .context("unpacking OCI layout")?;
        Self::from_layout_dir(unpacked.path())
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_slice(&raw).with_context(|| format!("decoding {}", path.display()))
}

fn write_blob(blobs_dir: &Path, data: &[u8]) -> Result<String> {
    let hex = sha256_bytes(data);
    fs::write(blobs_dir.join(&hex), data)?;
    Ok(format!("sha256:{}", hex))
}

fn compress_layer(layer: &Path, blobs_dir: &Path) -> Result<OciDescriptor> {
    let staging = blobs_dir.join(".layer.partial");
    let out = File::create(&staging)?;
    let mut encoder = GzEncoder::new(HashingWriter::new(BufWriter::new(out)), Compression::default());
    let mut src = BufReader::new(File::open(layer)?);
    io::copy(&mut src, &mut encoder)?;
    let mut hashing = encoder.finish()?;
    hashing.flush()?;
    let digest = hashing.diff_id();
    let size = fs::metadata(&staging)?.len();
    fs::rename(&staging, blobs_dir.join(digest_hex(&digest)))?;
    Ok(OciDescriptor {
        media_type: LAYER_MEDIA_TYPE.to_string(),
        digest,
        size,
    })
}

/// Copies a (possibly gzipped) layer blob to `dest` uncompressed, returning its diff-id.
fn decompress_layer(blob: &Path, dest: &Path) -> Result<String> {
    let src = BufReader::new(File::open(blob)?);
    let mut reader: Box<dyn Read> = if is_gzip(blob)? {
        Box::new(GzDecoder::new(src))
    } else {
        Box::new(src)
    };
    let mut hashing = HashingWriter::new(BufWriter::new(File::create(dest)?));
    io::copy(&mut reader, &mut hashing)?;
    hashing.flush()?;
    Ok(hashing.diff_id())
}

impl ReadableImage for LayoutImage {
    fn label(&self, key: &str) -> Result<Option<String>> {
        Ok(self.config.config.labels.get(key).cloned())
    }

    fn get_layer(&self, diff_id: &str) -> Result<Box<dyn Read + Send>> {
        let layer = self
            .layers
            .iter()
            .find(|l| l.diff_id == diff_id)
            .ok_or_else(|| Error::LayerFetchFailed {
                diff_id: diff_id.to_string(),
                reason: format!("image '{}' has no such layer", self.name),
            })?;
        Ok(Box::new(BufReader::new(File::open(&layer.path)?)))
    }
}

impl WritableImage for LayoutImage {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn rename(&mut self, name: &str) {
        self.name = name.to_string();
    }

    fn env(&self, key: &str) -> Result<Option<String>> {
        let prefix = format!("{}=", key);
        Ok(self
            .config
            .config
            .env
            .iter()
            .find_map(|e| e.strip_prefix(&prefix).map(str::to_string)))
    }

    fn os(&self) -> Result<String> {
        Ok(self.config.os.clone())
    }

    fn architecture(&self) -> Result<String> {
        Ok(self.config.architecture.clone())
    }

    fn set_label(&mut self, key: &str, value: &str) -> Result<()> {
        self.config
            .config
            .labels
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    /// The layer file is copied, so callers may drop their scratch dirs afterwards.
    fn add_layer_with_diff_id(&mut self, path: &Path, diff_id: &str) -> Result<()> {
        let dest = self.scratch_layer_path();
        fs::copy(path, &dest).with_context(|| format!("adding layer {}", path.display()))?;
        self.layers.push(LayerRecord {
            diff_id: diff_id.to_string(),
            path: dest,
        });
        Ok(())
    }

    fn set_working_dir(&mut self, dir: &str) -> Result<()> {
        self.config.config.working_dir = dir.to_string();
        Ok(())
    }

    fn save(&mut self) -> Result<()> {
        if let Some(dir) = self.layout_dir.clone() {
            self.write_layout(&dir)?;
        }
        self.saved = true;
        info!(image = %self.name, "Saved image");
        Ok(())
    }
}
