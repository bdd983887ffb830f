//! Builder images: a stack build image extended with lifecycle, modules,
//! order, stack and env layers.

mod layers;
pub mod metadata;
mod module_layers;
pub mod order;

pub use metadata::{
    BuilderMetadata, CreatorMetadata, LifecycleMetadata, ModuleLayerInfo, ModuleLayers,
    RunImageMetadata, StackMetadata,
};
pub use order::{render_order_toml, resolve_order};

use crate::archive::TarWriterFactory;
use crate::config::BuilderConfig;
use crate::constants::{
    BUILDPACK_ORDER_LABEL, DEFAULT_CREATOR_NAME, DISTRO_NAME_LABEL, DISTRO_VERSION_LABEL, ENV_GID,
    ENV_UID, EXTENSION_ORDER_LABEL, LAYERS_DIR, METADATA_LABEL, MIXINS_LABEL, STACK_ID_LABEL,
};
use crate::error::{Error, Result, ResultExt};
use crate::image::{get_json_label, set_json_label, WritableImage};
use crate::lifecycle::{Lifecycle, LifecycleDescriptor};
use crate::log_layer_added;
use crate::module::{check_order_cycles, BuildModule, ModuleInfo, ModuleKind, ModuleManager, Order};
use crate::stack;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::{debug, info};

pub struct Builder<I: WritableImage> {
    image: I,
    factory: TarWriterFactory,
    config: BuilderConfig,
    lifecycle: Option<Lifecycle>,
    lifecycle_descriptor: LifecycleDescriptor,
    buildpacks: ModuleManager,
    extensions: ModuleManager,
    buildpack_layers: ModuleLayers,
    extension_layers: ModuleLayers,
    metadata: BuilderMetadata,
    mixins: Vec<String>,
    env: BTreeMap<String, String>,
    uid: u64,
    gid: u64,
    stack_id: String,
    os: String,
    architecture: String,
    distro_name: String,
    distro_version: String,
    order: Order,
    order_extensions: Order,
    replace_order: bool,
}

impl<I: WritableImage> Builder<I> {
    /// Reads builder state from the labels and env of `image`, renaming it
    /// to `name` when one is given.
    pub fn new(mut image: I, name: Option<&str>, config: BuilderConfig) -> Result<Self> {
        let metadata: BuilderMetadata = match get_json_label(&image, METADATA_LABEL)? {
            Some(metadata) => metadata,
            None if config.require_metadata => {
                return Err(Error::MissingLabel(METADATA_LABEL.to_string()))
            }
            None => BuilderMetadata::default(),
        };

        let os = image.os()?;
        let architecture = image.architecture()?;
        let factory = TarWriterFactory::new(&os)?;

        let uid = user_id(&image, ENV_UID)?;
        let gid = user_id(&image, ENV_GID)?;

        let stack_id = image
            .label(STACK_ID_LABEL)?
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Error::MissingLabel(STACK_ID_LABEL.to_string()))?;

        let mixins: Vec<String> = get_json_label(&image, MIXINS_LABEL)?.unwrap_or_default();
        let order: Order = get_json_label(&image, BUILDPACK_ORDER_LABEL)?.unwrap_or_default();
        let order_extensions: Order = get_json_label(&image, EXTENSION_ORDER_LABEL)?.unwrap_or_default();
        let buildpack_layers: ModuleLayers =
            get_json_label(&image, ModuleKind::Buildpack.layers_label())?.unwrap_or_default();
        let extension_layers: ModuleLayers =
            get_json_label(&image, ModuleKind::Extension.layers_label())?.unwrap_or_default();
        let distro_name = image.label(DISTRO_NAME_LABEL)?.unwrap_or_default();
        let distro_version = image.label(DISTRO_VERSION_LABEL)?.unwrap_or_default();

        if let Some(name) = name {
            if name != image.name() {
                image.rename(name);
            }
        }

        Ok(Self {
            lifecycle_descriptor: metadata.lifecycle.descriptor(),
            buildpacks: ModuleManager::new(config.flatten, config.depth),
            extensions: ModuleManager::new(config.flatten, config.depth),
            image,
            factory,
            config,
            lifecycle: None,
            buildpack_layers,
            extension_layers,
            metadata,
            mixins,
            env: BTreeMap::new(),
            uid,
            gid,
            stack_id,
            os,
            architecture,
            distro_name,
            distro_version,
            order,
            order_extensions,
            replace_order: false,
        })
    }

    pub fn name(&self) -> String {
        self.image.name()
    }

    pub fn image(&self) -> &I {
        &self.image
    }

    pub fn into_image(self) -> I {
        self.image
    }

    pub fn description(&self) -> &str {
        &self.metadata.description
    }

    pub fn lifecycle_descriptor(&self) -> &LifecycleDescriptor {
        &self.lifecycle_descriptor
    }

    pub fn buildpacks(&self) -> &[ModuleInfo] {
        &self.metadata.buildpacks
    }

    pub fn extensions(&self) -> &[ModuleInfo] {
        &self.metadata.extensions
    }

    pub fn created_by(&self) -> &CreatorMetadata {
        &self.metadata.created_by
    }

    pub fn order(&self) -> &Order {
        &self.order
    }

    pub fn order_extensions(&self) -> &Order {
        &self.order_extensions
    }

    pub fn stack(&self) -> &StackMetadata {
        &self.metadata.stack
    }

    pub fn run_images(&self) -> &[RunImageMetadata] {
        &self.metadata.images
    }

    pub fn stack_id(&self) -> &str {
        &self.stack_id
    }

    pub fn mixins(&self) -> &[String] {
        &self.mixins
    }

    pub fn uid(&self) -> u64 {
        self.uid
    }

    pub fn gid(&self) -> u64 {
        self.gid
    }

    pub fn buildpack_layers(&self) -> &ModuleLayers {
        &self.buildpack_layers
    }

    pub fn extension_layers(&self) -> &ModuleLayers {
        &self.extension_layers
    }

    pub fn metadata(&self) -> &BuilderMetadata {
        &self.metadata
    }

    pub fn add_buildpack(&mut self, module: BuildModule) {
        self.add_buildpacks(module, Vec::new());
    }

    /// Adds a (meta) buildpack with the modules its order pulls in. Flattening
    /// groups are computed relative to `main`.
    pub fn add_buildpacks(&mut self, main: BuildModule, deps: Vec<BuildModule>) {
        self.metadata.buildpacks.push(main.descriptor().info.clone());
        self.metadata
            .buildpacks
            .extend(deps.iter().map(|d| d.descriptor().info.clone()));
        self.buildpacks.add_modules(main, deps);
    }

    pub fn add_extension(&mut self, module: BuildModule) {
        self.metadata.extensions.push(module.descriptor().info.clone());
        self.extensions.add_modules(module, Vec::new());
    }

    pub fn set_lifecycle(&mut self, lifecycle: Lifecycle) {
        self.lifecycle_descriptor = lifecycle.descriptor().clone();
        self.lifecycle = Some(lifecycle);
    }

    pub fn set_order(&mut self, order: Order) {
        self.order = order;
        self.replace_order = true;
    }

    pub fn set_order_extensions(&mut self, order: Order) {
        self.order_extensions = order;
        self.replace_order = true;
    }

    pub fn set_env(&mut self, env: BTreeMap<String, String>) {
        self.env = env;
    }

    pub fn set_description(&mut self, description: &str) {
        self.metadata.description = description.to_string();
    }

    pub fn set_stack(&mut self, run_image: RunImageMetadata) {
        self.metadata.stack = StackMetadata { run_image };
    }

    pub fn set_run_images(&mut self, images: Vec<RunImageMetadata>) {
        self.metadata.images = images;
    }

    /// Writes every builder layer and label onto the image and saves it.
    pub fn save(&mut self, creator: CreatorMetadata) -> Result<()> {
        let scratch = tempfile::Builder::new()
            .prefix("create-builder-scratch")
            .tempdir()?;
        let tmp = scratch.path();

        let dirs = tmp.join("dirs.tar");
        let diff_id = layers::dirs_layer(&dirs, self.factory, self.uid, self.gid)?;
        self.add_layer(&dirs, &diff_id, "default dirs")?;

        if let Some(lifecycle) = self.lifecycle.clone() {
            self.metadata.lifecycle = LifecycleMetadata::from(lifecycle.descriptor());
            let path = tmp.join("lifecycle.tar");
            let diff_id = layers::lifecycle_layer(&path, self.factory, lifecycle.open()?)?;
            self.add_layer(&path, &diff_id, "lifecycle")?;
        }

        self.validate_buildpacks().context("validating buildpacks")?;
        self.validate_extensions().context("validating extensions")?;

        for kind in [ModuleKind::Buildpack, ModuleKind::Extension] {
            self.add_module_layers(kind, tmp)?;
        }

        if self.replace_order {
            let order = resolve_order(ModuleKind::Buildpack, &self.metadata.buildpacks, &self.order)
                .context("processing order")?;
            let order_extensions =
                resolve_order(ModuleKind::Extension, &self.metadata.extensions, &self.order_extensions)
                    .context("processing extensions order")?;

            let path = tmp.join("order.tar");
            let contents = render_order_toml(&order, &order_extensions);
            let diff_id = layers::order_layer(&path, self.factory, &contents)?;
            self.add_layer(&path, &diff_id, "order")?;

            set_json_label(&mut self.image, BUILDPACK_ORDER_LABEL, &order)?;
            set_json_label(&mut self.image, EXTENSION_ORDER_LABEL, &order_extensions)?;
            self.order = order;
            self.order_extensions = order_extensions;
        }

        let run_image = self.default_run_image();
        let path = tmp.join("stack.tar");
        let diff_id = layers::stack_layer(&path, self.factory, &run_image)?;
        self.add_layer(&path, &diff_id, "stack")?;

        let images = if self.metadata.images.is_empty() && !run_image.image.is_empty() {
            vec![run_image]
        } else {
            self.metadata.images.clone()
        };
        let path = tmp.join("run.tar");
        let diff_id = layers::run_layer(&path, self.factory, &images)?;
        self.add_layer(&path, &diff_id, "run")?;

        let path = tmp.join("env.tar");
        let diff_id = layers::env_layer(&path, self.factory, &self.env)?;
        self.add_layer(&path, &diff_id, "env")?;

        self.metadata.created_by = CreatorMetadata {
            name: if creator.name.is_empty() {
                DEFAULT_CREATOR_NAME.to_string()
            } else {
                creator.name
            },
            version: creator.version,
        };
        dedup_infos(&mut self.metadata.buildpacks);
        dedup_infos(&mut self.metadata.extensions);
        set_json_label(&mut self.image, METADATA_LABEL, &self.metadata)?;
        set_json_label(&mut self.image, MIXINS_LABEL, &self.mixins)?;

        self.image
            .set_working_dir(LAYERS_DIR)
            .context("failed to set working dir")?;
        self.image.save()?;
        info!(image = %self.image.name(), "Saved builder");
        Ok(())
    }

    fn add_layer(&mut self, path: &Path, diff_id: &str, what: &str) -> Result<()> {
        self.image
            .add_layer_with_diff_id(path, diff_id)
            .with_context(|| format!("adding {} layer", what))?;
        log_layer_added!(what, diff_id);
        Ok(())
    }

    fn default_run_image(&self) -> RunImageMetadata {
        if !self.metadata.stack.run_image.image.is_empty() {
            return self.metadata.stack.run_image.clone();
        }
        self.metadata.images.first().cloned().unwrap_or_default()
    }

    fn validate_buildpacks(&self) -> Result<()> {
        let modules = self.buildpacks.all_modules();
        let build_mixins = stack::build_mixins(&self.mixins);
        let known: BTreeSet<String> = self.metadata.buildpacks.iter().map(ModuleInfo::full_name).collect();
        let known_ids: BTreeSet<&str> = self.metadata.buildpacks.iter().map(|i| i.id.as_str()).collect();

        for module in &modules {
            let descriptor = module.descriptor();
            self.lifecycle_descriptor.validate_module(
                descriptor.kind.as_str(),
                &descriptor.full_name(),
                &descriptor.api,
            )?;

            if descriptor.is_meta() {
                for module_ref in descriptor.order().iter().flat_map(|e| &e.group) {
                    let present = if module_ref.version.is_empty() {
                        known_ids.contains(module_ref.id.as_str())
                    } else {
                        known.contains(&module_ref.full_name())
                    };
                    if !present {
                        return Err(Error::MissingDependency {
                            reference: module_ref.full_name(),
                        });
                    }
                }
            } else {
                descriptor.ensure_stack_support(&self.stack_id, &build_mixins, false)?;
                descriptor.ensure_target_support(
                    &self.os,
                    &self.architecture,
                    &self.distro_name,
                    &self.distro_version,
                )?;
            }
        }

        let mut graph = metadata::layer_orders(&self.buildpack_layers);
        graph.extend(
            modules
                .iter()
                .map(|m| (m.descriptor().info.clone(), m.descriptor().order().to_vec())),
        );
        check_order_cycles(graph.iter().map(|(info, order)| (info, order.as_slice())))
    }

    fn validate_extensions(&self) -> Result<()> {
        for module in self.extensions.all_modules() {
            let descriptor = module.descriptor();
            self.lifecycle_descriptor.validate_module(
                descriptor.kind.as_str(),
                &descriptor.full_name(),
                &descriptor.api,
            )?;
        }
        Ok(())
    }
}

fn user_id(image: &(impl WritableImage + ?Sized), name: &str) -> Result<u64> {
    let value = image
        .env(name)?
        .ok_or_else(|| Error::MissingEnv {
            image: image.name(),
            name: name.to_string(),
        })?;
    value.trim().parse().map_err(|_| Error::NonIntegerId {
        name: name.to_string(),
        value,
    })
}

/// Sorted by id then version, without repeats.
fn dedup_infos(infos: &mut Vec<ModuleInfo>) {
    infos.sort_by(|a, b| (&a.id, &a.version).cmp(&(&b.id, &b.version)));
    infos.dedup_by(|a, b| a.matches(b));
    debug!(modules = infos.len(), "Recorded module metadata");
}
