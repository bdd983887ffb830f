use crate::error::{Error, Result};
use crate::paths::{self, LocatorType};
use std::path::{Path, PathBuf};

/// Where an asset reference points once classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetSource {
    /// `http(s)://` OCI-layout tarball.
    Remote(String),
    /// Local OCI-layout tarball.
    File(PathBuf),
    /// Daemon or registry image.
    Image(String),
}

impl AssetSource {
    pub fn kind(&self) -> &'static str {
        match self {
            AssetSource::Remote(_) => "uri",
            AssetSource::File(_) => "filepath",
            AssetSource::Image(_) => "image",
        }
    }
}

/// Classifies `name` relative to `working_dir`. `file://` URIs resolve to
/// local files.
pub fn locate(name: &str, working_dir: &Path) -> Result<AssetSource> {
    match paths::classify_locator(name, working_dir) {
        LocatorType::Uri => match paths::scheme(name).unwrap_or_default() {
            "http" | "https" => Ok(AssetSource::Remote(name.to_string())),
            "file" => Ok(AssetSource::File(PathBuf::from(paths::uri_to_file_path(name)))),
            other => Err(Error::UnsupportedScheme(other.to_string())),
        },
        LocatorType::FilePath => Ok(AssetSource::File(paths::absolutize(
            Path::new(name),
            working_dir,
        )?)),
        LocatorType::Image => Ok(AssetSource::Image(name.to_string())),
        LocatorType::Invalid => Err(Error::UnknownLocator(name.to_string())),
    }
}
