//! Label documents carried by a builder image.

use crate::lifecycle::{ApiVersion, LifecycleApi, LifecycleApis, LifecycleDescriptor, LifecycleInfo};
use crate::module::{ModuleDescriptor, ModuleInfo, Order, Target};
use crate::stack::Stack;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// `io.buildpacks.builder.metadata`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuilderMetadata {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub buildpacks: Vec<ModuleInfo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extensions: Vec<ModuleInfo>,
    #[serde(default)]
    pub stack: StackMetadata,
    #[serde(default)]
    pub lifecycle: LifecycleMetadata,
    #[serde(default)]
    pub created_by: CreatorMetadata,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<RunImageMetadata>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackMetadata {
    #[serde(default)]
    pub run_image: RunImageMetadata,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunImageMetadata {
    #[serde(default)]
    pub image: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mirrors: Vec<String>,
}

impl RunImageMetadata {
    pub fn new(image: impl Into<String>, mirrors: Vec<String>) -> Self {
        Self {
            image: image.into(),
            mirrors,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatorMetadata {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
}

impl CreatorMetadata {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleMetadata {
    #[serde(flatten)]
    pub info: LifecycleInfo,
    #[serde(default)]
    pub api: LifecycleApi,
    #[serde(default)]
    pub apis: LifecycleApis,
}

impl LifecycleMetadata {
    pub fn descriptor(&self) -> LifecycleDescriptor {
        LifecycleDescriptor {
            info: self.info.clone(),
            api: self.api.clone(),
            apis: (!self.apis.buildpack.is_empty() || !self.apis.platform.is_empty())
                .then(|| self.apis.clone()),
        }
        .compat()
    }
}

impl From<&LifecycleDescriptor> for LifecycleMetadata {
    fn from(descriptor: &LifecycleDescriptor) -> Self {
        Self {
            info: descriptor.info.clone(),
            api: descriptor.api.clone(),
            apis: LifecycleApis {
                buildpack: descriptor.buildpack_apis(),
                platform: descriptor.platform_apis(),
            },
        }
    }
}

/// One module's entry in `io.buildpacks.{buildpack,extension}.layers`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleLayerInfo {
    pub api: ApiVersion,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stacks: Vec<Stack>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<Target>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub order: Order,
    #[serde(rename = "layerDiffID")]
    pub layer_diff_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub homepage: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
}

impl ModuleLayerInfo {
    pub fn new(descriptor: &ModuleDescriptor, layer_diff_id: impl Into<String>) -> Self {
        Self {
            api: descriptor.api,
            stacks: descriptor.stacks().to_vec(),
            targets: descriptor.targets().to_vec(),
            order: descriptor.order().to_vec(),
            layer_diff_id: layer_diff_id.into(),
            homepage: descriptor.info.homepage.clone(),
            name: descriptor.info.name.clone(),
        }
    }
}

/// id → version → layer record.
pub type ModuleLayers = BTreeMap<String, BTreeMap<String, ModuleLayerInfo>>;

/// Records as `(info, order)` pairs, for walking nested orders.
pub(crate) fn layer_orders(layers: &ModuleLayers) -> Vec<(ModuleInfo, Order)> {
    layers
        .iter()
        .flat_map(|(id, versions)| {
            versions.iter().map(move |(version, record)| {
                (ModuleInfo::new(id.as_str(), version.as_str()), record.order.clone())
            })
        })
        .collect()
}

/// `/cnb/stack.toml`
#[derive(Debug, Serialize)]
pub(crate) struct StackToml<'a> {
    #[serde(rename = "run-image")]
    pub run_image: &'a RunImageMetadata,
}

/// `/cnb/run.toml`
#[derive(Debug, Serialize)]
pub(crate) struct RunToml<'a> {
    pub images: &'a [RunImageMetadata],
}
