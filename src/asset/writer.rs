//! Packs asset blobs into one tar layer each and records them in the
//! `io.buildpacks.asset.layers` label.

use super::{AssetBlob, AssetMap};
use crate::archive::{create_tar_with, EntryHeader, TarWriter, TarWriterFactory};
use crate::blob::Blob;
use crate::constants::{ASSETS_DIR, ASSET_LAYERS_LABEL, CNB_DIR};
use crate::error::{Error, Result, ResultExt};
use crate::image::{set_json_label, WritableImage};
use crate::log_layer_added;
use std::collections::BTreeMap;
use tempfile::TempDir;
use tracing::debug;

pub struct AssetLayerWriter {
    factory: TarWriterFactory,
    tmp_dir: Option<TempDir>,
    blobs: BTreeMap<String, AssetBlob>,
    metadata: AssetMap,
}

impl AssetLayerWriter {
    pub fn new(factory: TarWriterFactory) -> Self {
        Self {
            factory,
            tmp_dir: None,
            blobs: BTreeMap::new(),
            metadata: AssetMap::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.tmp_dir.is_some()
    }

    pub fn open(&mut self) -> Result<()> {
        if self.is_open() {
            return Err(Error::AlreadyOpen);
        }
        self.tmp_dir = Some(
            tempfile::Builder::new()
                .prefix("cnbkit-assets")
                .tempdir()?,
        );
        Ok(())
    }

    /// Stages blobs for the next `write`. A later blob with the same sha256
    /// replaces an earlier one.
    pub fn add_asset_blobs<I>(&mut self, blobs: I) -> Result<()>
    where
        I: IntoIterator<Item = AssetBlob>,
    {
        if !self.is_open() {
            return Err(Error::NotOpen("unable to add asset blobs"));
        }
        for blob in blobs {
            let sha = blob.sha256().to_string();
            self.metadata
                .insert(sha.clone(), blob.descriptor().to_value(""));
            self.blobs.insert(sha, blob);
        }
        Ok(())
    }

    /// Appends one layer per staged blob to `target` and writes the asset label.
    pub fn write(&mut self, target: &mut dyn WritableImage) -> Result<()> {
        let tmp = self
            .tmp_dir
            .as_ref()
            .ok_or(Error::NotOpen("unable to write assets"))?;

        for (index, (sha, blob)) in self.blobs.iter().enumerate() {
            let layer_path = tmp.path().join(format!("asset-{:04}.tar", index));
            let diff_id = create_tar_with(&layer_path, self.factory, |tw| write_asset_entries(tw, blob))
                .with_context(|| format!("writing layer for asset '{}'", sha))?;
            target
                .add_layer_with_diff_id(&layer_path, &diff_id)
                .with_context(|| format!("adding layer for asset '{}'", sha))?;
            log_layer_added!("asset", diff_id);

            if let Some(record) = self.metadata.get_mut(sha) {
                record.layer_diff_id = diff_id;
            }
        }

        set_json_label(target, ASSET_LAYERS_LABEL, &self.metadata)?;
        debug!(assets = self.metadata.len(), "Wrote asset layers label");
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        match self.tmp_dir.take() {
            Some(dir) => Ok(dir.close()?),
            None => Err(Error::NotOpen("unable to close writer")),
        }
    }

    /// Asset label as it stands after the last `write`.
    pub fn metadata(&self) -> &AssetMap {
        &self.metadata
    }
}

fn write_asset_entries(tw: &mut dyn TarWriter, blob: &AssetBlob) -> Result<()> {
    tw.write_entry(&EntryHeader::dir(CNB_DIR), &mut std::io::empty())?;
    tw.write_entry(&EntryHeader::dir(ASSETS_DIR), &mut std::io::empty())?;

    let header = EntryHeader::file(
        format!("{}/{}", ASSETS_DIR, blob.sha256()),
        blob.size()?,
        0o755,
    );
    let mut contents = blob.open()?;
    tw.write_entry(&header, &mut contents)?;
    Ok(())
}
