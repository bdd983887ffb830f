//! `buildpack.toml` / `extension.toml` descriptors.

use crate::constants::{
    ASSUMED_BUILDPACK_API, BUILDPACKS_DIR, BUILDPACK_LAYERS_LABEL, DEFAULT_TARGET_ARCH,
    DEFAULT_TARGET_OS, EXTENSIONS_DIR, EXTENSION_LAYERS_LABEL,
};
use crate::error::{Error, Result, ResultExt};
use crate::lifecycle::ApiVersion;
use crate::stack::{self, Stack, WILDCARD_STACK_ID};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleKind {
    Buildpack,
    Extension,
}

impl ModuleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleKind::Buildpack => "buildpack",
            ModuleKind::Extension => "extension",
        }
    }

    /// Directory module content is laid out under.
    pub fn dist_dir(&self) -> &'static str {
        match self {
            ModuleKind::Buildpack => BUILDPACKS_DIR,
            ModuleKind::Extension => EXTENSIONS_DIR,
        }
    }

    pub fn layers_label(&self) -> &'static str {
        match self {
            ModuleKind::Buildpack => BUILDPACK_LAYERS_LABEL,
            ModuleKind::Extension => EXTENSION_LAYERS_LABEL,
        }
    }

    pub fn descriptor_file(&self) -> String {
        format!("{}.toml", self.as_str())
    }
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct License {
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uri: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleInfo {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub homepage: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub licenses: Vec<License>,
}

impl ModuleInfo {
    pub fn new(id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
            ..Default::default()
        }
    }

    /// `id@version`, or just `id` when unversioned.
    pub fn full_name(&self) -> String {
        full_name(&self.id, &self.version)
    }

    pub fn matches(&self, other: &ModuleInfo) -> bool {
        self.id == other.id && self.version == other.version
    }
}

pub fn full_name(id: &str, version: &str) -> String {
    if version.is_empty() {
        id.to_string()
    } else {
        format!("{}@{}", id, version)
    }
}

/// `id` with `/` replaced so it is usable as a single path segment.
pub fn escape_id(id: &str) -> String {
    id.replace('/', "_")
}

/// Reference to a module from an order group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModuleRef {
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub optional: bool,
}

impl ModuleRef {
    pub fn new(id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
            optional: false,
        }
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn full_name(&self) -> String {
        full_name(&self.id, &self.version)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderEntry {
    #[serde(default)]
    pub group: Vec<ModuleRef>,
}

impl OrderEntry {
    pub fn new(group: Vec<ModuleRef>) -> Self {
        Self { group }
    }
}

pub type Order = Vec<OrderEntry>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Distribution {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub versions: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub arch: String,
    #[serde(rename = "variant", default, skip_serializing_if = "String::is_empty")]
    pub arch_variant: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub distributions: Vec<Distribution>,
}

impl Target {
    fn accepts(&self, os: &str, arch: &str, distro_name: &str, distro_version: &str) -> bool {
        if self.os != os {
            return false;
        }
        if !(self.arch == "*" || self.arch.is_empty() || arch.is_empty() || self.arch == arch) {
            return false;
        }
        if self.distributions.is_empty() || distro_name.is_empty() || distro_version.is_empty() {
            return true;
        }
        self.distributions.iter().any(|d| {
            d.name == distro_name
                && (d.versions.is_empty() || d.versions.iter().any(|v| v == distro_version))
        })
    }
}

/// What a module contributes: content for a set of stacks or targets, or an
/// order over other modules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleBody {
    Leaf {
        stacks: Vec<Stack>,
        targets: Vec<Target>,
    },
    Meta {
        order: Order,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleDescriptor {
    pub kind: ModuleKind,
    pub api: ApiVersion,
    pub info: ModuleInfo,
    pub body: ModuleBody,
}

#[derive(Debug, Default, Deserialize)]
struct RawDescriptor {
    #[serde(default)]
    api: Option<ApiVersion>,
    #[serde(default)]
    buildpack: Option<ModuleInfo>,
    #[serde(default)]
    extension: Option<ModuleInfo>,
    #[serde(default)]
    stacks: Vec<Stack>,
    #[serde(default)]
    targets: Vec<Target>,
    #[serde(default)]
    order: Order,
}

impl ModuleDescriptor {
    pub fn leaf(kind: ModuleKind, info: ModuleInfo, api: ApiVersion, stacks: Vec<Stack>) -> Self {
        Self {
            kind,
            api,
            info,
            body: ModuleBody::Leaf {
                stacks,
                targets: Vec::new(),
            },
        }
    }

    pub fn meta(info: ModuleInfo, api: ApiVersion, order: Order) -> Self {
        Self {
            kind: ModuleKind::Buildpack,
            api,
            info,
            body: ModuleBody::Meta { order },
        }
    }

    pub fn with_targets(mut self, new_targets: Vec<Target>) -> Self {
        if let ModuleBody::Leaf { targets, .. } = &mut self.body {
            *targets = new_targets;
        }
        self
    }

    /// Parses a descriptor, defaulting `api` and validating the result.
    pub fn parse(kind: ModuleKind, contents: &str) -> Result<Self> {
        let file = kind.descriptor_file();
        let raw: RawDescriptor =
            toml::from_str(contents).with_context(|| format!("decoding {}", file))?;
        let api = match raw.api {
            Some(api) => api,
            None => ASSUMED_BUILDPACK_API.parse()?,
        };
        let info = match kind {
            ModuleKind::Buildpack => raw.buildpack,
            ModuleKind::Extension => raw.extension,
        }
        .unwrap_or_default();

        let invalid = |reason: String| Error::InvalidDescriptor {
            kind: kind.to_string(),
            reason,
        };
        if info.id.is_empty() {
            return Err(invalid(format!("'{}.id' is required", kind)));
        }
        if info.version.is_empty() {
            return Err(invalid(format!("'{}.version' is required", kind)));
        }

        let body = if raw.order.is_empty() {
            ModuleBody::Leaf {
                stacks: raw.stacks,
                targets: raw.targets,
            }
        } else if kind == ModuleKind::Extension {
            return Err(invalid(format!(
                "extension '{}' cannot define an 'order'",
                info.full_name()
            )));
        } else if !raw.stacks.is_empty() || !raw.targets.is_empty() {
            return Err(invalid(format!(
                "buildpack '{}': cannot have both 'targets'/'stacks' and an 'order' defined",
                info.full_name()
            )));
        } else {
            ModuleBody::Meta { order: raw.order }
        };

        Ok(Self {
            kind,
            api,
            info,
            body,
        })
    }

    pub fn full_name(&self) -> String {
        self.info.full_name()
    }

    pub fn escaped_id(&self) -> String {
        escape_id(&self.info.id)
    }

    pub fn is_meta(&self) -> bool {
        matches!(self.body, ModuleBody::Meta { .. })
    }

    pub fn order(&self) -> &[OrderEntry] {
        match &self.body {
            ModuleBody::Meta { order } => order,
            ModuleBody::Leaf { .. } => &[],
        }
    }

    pub fn stacks(&self) -> &[Stack] {
        match &self.body {
            ModuleBody::Leaf { stacks, .. } => stacks,
            ModuleBody::Meta { .. } => &[],
        }
    }

    pub fn targets(&self) -> &[Target] {
        match &self.body {
            ModuleBody::Leaf { targets, .. } => targets,
            ModuleBody::Meta { .. } => &[],
        }
    }

    /// Checks the module runs on `stack_id` given the mixins the stack provides.
    /// Extensions, meta modules and target-only modules always pass.
    pub fn ensure_stack_support(
        &self,
        stack_id: &str,
        provided_mixins: &[String],
        validate_run_stage: bool,
    ) -> Result<()> {
        if self.kind == ModuleKind::Extension || self.stacks().is_empty() {
            return Ok(());
        }
        let declared = self
            .stacks()
            .iter()
            .find(|s| s.id == stack_id || s.id == WILDCARD_STACK_ID)
            .ok_or_else(|| Error::StackUnsupported {
                module: self.full_name(),
                stack: stack_id.to_string(),
            })?;

        let mut missing = stack::missing_mixins(&declared.mixins, provided_mixins, validate_run_stage);
        if missing.is_empty() {
            return Ok(());
        }
        missing.sort();
        Err(Error::MixinUnsatisfied {
            module: self.full_name(),
            mixins: missing,
        })
    }

    /// Checks the module declares a target matching the given platform.
    pub fn ensure_target_support(
        &self,
        os: &str,
        arch: &str,
        distro_name: &str,
        distro_version: &str,
    ) -> Result<()> {
        if self.targets().is_empty() {
            if self.kind == ModuleKind::Extension || self.is_meta() || !self.stacks().is_empty() {
                return Ok(());
            }
            if os == DEFAULT_TARGET_OS && arch == DEFAULT_TARGET_ARCH {
                return Ok(());
            }
        }
        if self
            .targets()
            .iter()
            .any(|t| t.accepts(os, arch, distro_name, distro_version))
        {
            return Ok(());
        }
        Err(Error::TargetUnsupported {
            kind: self.kind.to_string(),
            module: self.full_name(),
            os: os.to_string(),
            arch: arch.to_string(),
            distro_name: distro_name.to_string(),
            distro_version: distro_version.to_string(),
        })
    }
}
