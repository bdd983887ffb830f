//! Asset caches saved as a tarball of an OCI image layout.

use super::{AssetBlob, AssetLayerWriter};
use crate::archive::{create_tar_with, write_dir_to_tar, StreamOptions, TarWriterFactory, TargetOs};
use crate::error::{Result, ResultExt};
use crate::image::{LayoutImage, WritableImage};
use crate::log_layer_added;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tracing::info;

pub struct AssetPackage {
    os: String,
    architecture: String,
    blobs: Vec<AssetBlob>,
}

impl AssetPackage {
    pub fn new(os: &str, architecture: &str) -> Result<Self> {
        os.parse::<TargetOs>()?;
        Ok(Self {
            os: os.to_string(),
            architecture: architecture.to_string(),
            blobs: Vec::new(),
        })
    }

    pub fn add_asset_blobs<I>(&mut self, blobs: I)
    where
        I: IntoIterator<Item = AssetBlob>,
    {
        self.blobs.extend(blobs);
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    /// Writes one layer per asset into a fresh layout and tars it to `path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        let factory = TarWriterFactory::new(&self.os)?;
        let scratch = tempfile::Builder::new().prefix("cnbkit-package").tempdir()?;
        let mut image = LayoutImage::new(&path.to_string_lossy(), &self.os, &self.architecture)?;

        if factory.os() == TargetOs::Windows {
            let base = scratch.path().join("windows-base.tar");
            let diff_id = create_tar_with(&base, factory, |_| Ok(()))?;
            image.add_layer_with_diff_id(&base, &diff_id)?;
            log_layer_added!("windows base", diff_id);
        }

        let mut writer = AssetLayerWriter::new(factory);
        writer.open()?;
        let written = writer
            .add_asset_blobs(self.blobs.iter().cloned())
            .and_then(|_| writer.write(&mut image));
        writer.close()?;
        written?;

        let layout = scratch.path().join("layout");
        image.write_layout(&layout)?;

        let opts = StreamOptions {
            mode: Some(0o755),
            ..Default::default()
        };
        create_tar_with(path, TarWriterFactory::posix(), |tw| {
            write_dir_to_tar(tw, &layout, &opts)
        })
        .with_context(|| format!("writing asset package {}", path.display()))?;

        info!(path = %path.display(), assets = self.blobs.len(), "Saved asset package");
        Ok(())
    }

    /// Loads a package written by [`AssetPackage::save`].
    pub fn open(path: &Path) -> Result<LayoutImage> {
        let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
        let mut image = LayoutImage::from_layout_tar(BufReader::new(file))?;
        image.rename(&path.to_string_lossy());
        Ok(image)
    }
}
