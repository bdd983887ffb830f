//! Lifecycle bundles and their API compatibility descriptor.

use crate::archive::{clean_path, read_tar_entry};
use crate::blob::{Blob, BlobReader};
use crate::constants::{
    ASSUMED_LIFECYCLE_BUILDPACK_API, ASSUMED_LIFECYCLE_PLATFORM_API, ASSUMED_LIFECYCLE_VERSION,
};
use crate::error::{Error, Result, ResultExt};
use regex::Regex;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeSet;
use std::fmt;
use std::io::Read;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};
use tracing::debug;

/// Binaries every lifecycle bundle must carry.
pub const LIFECYCLE_BINARIES: &[&str] = &[
    "detector", "restorer", "analyzer", "builder", "exporter", "launcher",
];

/// `<major>.<minor>` API version as used by the buildpack and platform APIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ApiVersion {
    pub major: u64,
    pub minor: u64,
}

impl ApiVersion {
    pub const fn new(major: u64, minor: u64) -> Self {
        Self { major, minor }
    }
}

impl FromStr for ApiVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidDescriptor {
            kind: "api version".to_string(),
            reason: format!("could not parse '{}' as an API version", s),
        };
        let trimmed = s.trim().trim_start_matches('v');
        let (major, minor) = match trimmed.split_once('.') {
            Some((major, minor)) => (major, minor),
            None => (trimmed, "0"),
        };
        Ok(Self {
            major: major.parse().map_err(|_| invalid())?,
            minor: minor.parse().map_err(|_| invalid())?,
        })
    }
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl Serialize for ApiVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ApiVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiVersions {
    #[serde(default)]
    pub deprecated: Vec<ApiVersion>,
    #[serde(default)]
    pub supported: Vec<ApiVersion>,
}

impl ApiVersions {
    pub fn supported(versions: &[ApiVersion]) -> Self {
        Self {
            deprecated: Vec::new(),
            supported: versions.to_vec(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.deprecated.is_empty() && self.supported.is_empty()
    }

    pub fn contains(&self, version: &ApiVersion) -> bool {
        self.supported.contains(version) || self.deprecated.contains(version)
    }

    pub fn earliest(&self) -> Option<ApiVersion> {
        self.deprecated.iter().chain(&self.supported).min().copied()
    }

    /// Every version, ascending and deduplicated.
    pub fn all(&self) -> Vec<ApiVersion> {
        self.deprecated
            .iter()
            .chain(&self.supported)
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    fn describe(&self) -> String {
        self.all()
            .iter()
            .map(ApiVersion::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleApis {
    #[serde(default)]
    pub buildpack: ApiVersions,
    #[serde(default)]
    pub platform: ApiVersions,
}

/// Single-version API pair from descriptors predating `[apis]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleApi {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buildpack: Option<ApiVersion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<ApiVersion>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<semver::Version>,
}

/// Contents of `lifecycle.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleDescriptor {
    #[serde(rename = "lifecycle", default)]
    pub info: LifecycleInfo,
    #[serde(default)]
    pub api: LifecycleApi,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apis: Option<LifecycleApis>,
}

impl LifecycleDescriptor {
    /// Parses and normalizes a `lifecycle.toml` document.
    pub fn parse(contents: &str) -> Result<Self> {
        let descriptor: LifecycleDescriptor =
            toml::from_str(contents).context("decoding lifecycle descriptor")?;
        Ok(descriptor.compat())
    }

    /// Fills the legacy fields from `[apis]` or the other way around, one
    /// axis at a time. An axis with no `[apis]` versions keeps its legacy
    /// value and gets it as its only supported version.
    pub fn compat(mut self) -> Self {
        let mut apis = self.apis.take().unwrap_or_default();
        compat_axis(&mut self.api.buildpack, &mut apis.buildpack);
        compat_axis(&mut self.api.platform, &mut apis.platform);
        self.apis = Some(apis);
        self
    }

    /// Descriptor used for bundles without a `lifecycle.toml`.
    pub fn assumed() -> Self {
        Self {
            info: LifecycleInfo {
                version: semver::Version::parse(ASSUMED_LIFECYCLE_VERSION).ok(),
            },
            api: LifecycleApi {
                buildpack: ASSUMED_LIFECYCLE_BUILDPACK_API.parse().ok(),
                platform: ASSUMED_LIFECYCLE_PLATFORM_API.parse().ok(),
            },
            apis: None,
        }
        .compat()
    }

    pub fn buildpack_apis(&self) -> ApiVersions {
        self.apis
            .as_ref()
            .map(|a| a.buildpack.clone())
            .unwrap_or_default()
    }

    pub fn platform_apis(&self) -> ApiVersions {
        self.apis
            .as_ref()
            .map(|a| a.platform.clone())
            .unwrap_or_default()
    }

    pub fn version_string(&self) -> String {
        self.info
            .version
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default()
    }

    /// Buildpacks and extensions are both checked against the buildpack API
    /// axis. A descriptor that names no APIs accepts every module.
    pub fn validate_module(&self, kind: &str, full_name: &str, api: &ApiVersion) -> Result<()> {
        let apis = self.buildpack_apis();
        if apis.is_empty() || apis.contains(api) {
            return Ok(());
        }
        Err(Error::LifecycleIncompatible {
            kind: kind.to_string(),
            module: full_name.to_string(),
            api: api.to_string(),
            lifecycle: self.version_string(),
            supported: apis.describe(),
        })
    }
}

fn compat_axis(legacy: &mut Option<ApiVersion>, versions: &mut ApiVersions) {
    if versions.is_empty() {
        *versions = ApiVersions::supported(legacy.as_slice());
    } else {
        *legacy = versions.earliest();
    }
}

fn binary_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[^/]+/([^/]+)$").expect("static regex"))
}

/// A lifecycle bundle: a tar of `<dir>/<binary>` entries plus its descriptor.
#[derive(Clone)]
pub struct Lifecycle {
    blob: Arc<dyn Blob>,
    descriptor: LifecycleDescriptor,
}

impl fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifecycle")
            .field("descriptor", &self.descriptor)
            .finish()
    }
}

impl Lifecycle {
    pub fn new(descriptor: LifecycleDescriptor, blob: Arc<dyn Blob>) -> Self {
        Self {
            blob,
            descriptor: descriptor.compat(),
        }
    }

    /// Reads `lifecycle.toml` from the bundle and checks the binaries exist.
    /// Bundles without a descriptor get [`LifecycleDescriptor::assumed`].
    pub fn from_blob(blob: Arc<dyn Blob>) -> Result<Self> {
        let reader = blob.open().context("open lifecycle blob")?;
        let descriptor = match read_tar_entry(reader, "lifecycle.toml") {
            Ok((_, contents)) => {
                let raw = String::from_utf8_lossy(&contents);
                LifecycleDescriptor::parse(&raw)?
            }
            Err(e) if e.is_entry_not_exist() => {
                debug!("Lifecycle has no descriptor, assuming defaults");
                return Ok(Self {
                    blob,
                    descriptor: LifecycleDescriptor::assumed(),
                });
            }
            Err(e) => return Err(e.context("decode lifecycle descriptor")),
        };

        let lifecycle = Self { blob, descriptor };
        lifecycle.validate_binaries().context("validating binaries")?;
        Ok(lifecycle)
    }

    pub fn descriptor(&self) -> &LifecycleDescriptor {
        &self.descriptor
    }

    pub fn open(&self) -> Result<BlobReader> {
        self.blob.open()
    }

    fn validate_binaries(&self) -> Result<()> {
        let mut archive = tar::Archive::new(self.blob.open()?);
        let mut found = BTreeSet::new();
        for entry in archive.entries().context("failed to get next tar entry")? {
            let entry = entry.context("failed to get next tar entry")?;
            let name = clean_path(&String::from_utf8_lossy(&entry.path_bytes()));
            if let Some(binary) = binary_pattern().captures(&name).and_then(|c| c.get(1)) {
                found.insert(binary.as_str().trim_end_matches(".exe").to_string());
            }
        }
        for binary in LIFECYCLE_BINARIES {
            if !found.contains(*binary) {
                return Err(Error::InvalidLifecycle(format!(
                    "did not find '{}' in tar",
                    binary
                )));
            }
        }
        Ok(())
    }
}

/// `<dir>/<binary>` entries of a lifecycle tar, each renamed to its bare binary name.
pub(crate) fn lifecycle_binaries<R: Read>(
    reader: R,
) -> Result<Vec<(crate::archive::EntryHeader, Vec<u8>)>> {
    let mut archive = tar::Archive::new(reader);
    let mut binaries = Vec::new();
    for entry in archive.entries().context("failed to get next tar entry")? {
        let mut entry = entry.context("failed to get next tar entry")?;
        let name = clean_path(&String::from_utf8_lossy(&entry.path_bytes()));
        let Some(binary) = binary_pattern()
            .captures(&name)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
        else {
            continue;
        };
        let mut header = crate::archive::EntryHeader::from_tar(entry.header(), binary, None);
        let mut contents = Vec::new();
        entry
            .read_to_end(&mut contents)
            .with_context(|| format!("failed to read contents of '{}'", name))?;
        header.size = contents.len() as u64;
        binaries.push((header, contents));
    }
    Ok(binaries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::FileBlob;
    use std::fs;

    const LEGACY: &str = r#"
[api]
  platform = "0.2"
  buildpack = "0.3"

[lifecycle]
  version = "1.2.3"
"#;

    const MODERN: &str = r#"
[apis]
[apis.buildpack]
  deprecated = ["0.2"]
  supported = ["0.3", "0.4", "0.10"]
[apis.platform]
  deprecated = []
  supported = ["0.4", "0.3"]

[lifecycle]
  version = "0.17.0"
"#;

    fn lifecycle_dir(descriptor: Option<&str>, binaries: &[&str]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        if let Some(contents) = descriptor {
            fs::write(dir.path().join("lifecycle.toml"), contents).unwrap();
        }
        fs::create_dir(dir.path().join("lifecycle")).unwrap();
        for binary in binaries {
            fs::write(dir.path().join("lifecycle").join(binary), b"content").unwrap();
        }
        dir
    }

    #[test]
    fn test_api_version_ordering() {
        let a: ApiVersion = "0.2".parse().unwrap();
        let b: ApiVersion = "0.10".parse().unwrap();
        assert!(a < b);
        assert_eq!(b.to_string(), "0.10");
        assert_eq!("1".parse::<ApiVersion>().unwrap(), ApiVersion::new(1, 0));
        assert!("x.y".parse::<ApiVersion>().is_err());
    }

    #[test]
    fn test_legacy_descriptor_fills_sets() {
        let d = LifecycleDescriptor::parse(LEGACY).unwrap();
        assert_eq!(d.version_string(), "1.2.3");
        assert_eq!(d.buildpack_apis().supported, vec![ApiVersion::new(0, 3)]);
        assert!(d.buildpack_apis().deprecated.is_empty());
        assert_eq!(d.platform_apis().supported, vec![ApiVersion::new(0, 2)]);
    }

    #[test]
    fn test_modern_descriptor_fills_legacy_with_earliest() {
        let d = LifecycleDescriptor::parse(MODERN).unwrap();
        assert_eq!(d.api.buildpack, Some(ApiVersion::new(0, 2)));
        assert_eq!(d.api.platform, Some(ApiVersion::new(0, 3)));
    }

    #[test]
    fn test_apis_on_one_axis_keeps_legacy_on_the_other() {
        let d = LifecycleDescriptor::parse(
            "[api]\nbuildpack = \"0.2\"\nplatform = \"0.3\"\n\n[apis.platform]\nsupported = [\"0.4\"]\n",
        )
        .unwrap();
        assert_eq!(d.api.buildpack, Some(ApiVersion::new(0, 2)));
        assert_eq!(d.buildpack_apis().supported, vec![ApiVersion::new(0, 2)]);
        assert_eq!(d.api.platform, Some(ApiVersion::new(0, 4)));
        assert_eq!(d.platform_apis().supported, vec![ApiVersion::new(0, 4)]);
    }

    #[test]
    fn test_empty_apis_table_falls_back_to_legacy() {
        let d = LifecycleDescriptor::parse(
            "[api]\nbuildpack = \"0.2\"\nplatform = \"0.3\"\n\n[apis]\n",
        )
        .unwrap();
        assert_eq!(d.api.buildpack, Some(ApiVersion::new(0, 2)));
        assert_eq!(d.buildpack_apis().supported, vec![ApiVersion::new(0, 2)]);
        assert_eq!(d.platform_apis().supported, vec![ApiVersion::new(0, 3)]);

        let err = d
            .validate_module("buildpack", "bp@1", &ApiVersion::new(0, 9))
            .unwrap_err();
        assert!(matches!(err, Error::LifecycleIncompatible { .. }));
    }

    #[test]
    fn test_validate_module() {
        let d = LifecycleDescriptor::parse(MODERN).unwrap();
        assert!(d
            .validate_module("buildpack", "bp@1", &ApiVersion::new(0, 2))
            .is_ok());
        let err = d
            .validate_module("buildpack", "bp@1", &ApiVersion::new(0, 1))
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "buildpack 'bp@1' (API 0.1) is incompatible with lifecycle '0.17.0' (API(s) 0.2, 0.3, 0.4, 0.10)"
        );
        assert!(LifecycleDescriptor::default()
            .validate_module("extension", "ext@1", &ApiVersion::new(9, 9))
            .is_ok());
    }

    #[test]
    fn test_from_blob_reads_descriptor() {
        let dir = lifecycle_dir(Some(LEGACY), LIFECYCLE_BINARIES);
        let lifecycle = Lifecycle::from_blob(Arc::new(FileBlob::new(dir.path()))).unwrap();
        assert_eq!(lifecycle.descriptor().version_string(), "1.2.3");
        assert_eq!(lifecycle.descriptor().api.buildpack, Some(ApiVersion::new(0, 3)));

        let binaries = lifecycle_binaries(lifecycle.open().unwrap()).unwrap();
        let names: Vec<_> = binaries.iter().map(|(h, _)| h.name.clone()).collect();
        assert_eq!(names.len(), LIFECYCLE_BINARIES.len());
        assert!(names.contains(&"detector".to_string()));
    }

    #[test]
    fn test_from_blob_without_descriptor_assumes_defaults() {
        let dir = lifecycle_dir(None, &[]);
        let lifecycle = Lifecycle::from_blob(Arc::new(FileBlob::new(dir.path()))).unwrap();
        let d = lifecycle.descriptor();
        assert_eq!(d.version_string(), "0.3.0");
        assert_eq!(d.api.buildpack, Some(ApiVersion::new(0, 2)));
        assert_eq!(d.api.platform, Some(ApiVersion::new(0, 1)));
    }

    #[test]
    fn test_from_blob_missing_binaries() {
        let dir = lifecycle_dir(Some(LEGACY), &["analyzer", "detector", "builder"]);
        let err = Lifecycle::from_blob(Arc::new(FileBlob::new(dir.path()))).unwrap_err();
        assert!(err.to_string().starts_with("validating binaries"));
        assert!(matches!(err.root(), Error::InvalidLifecycle(_)));
    }
}
