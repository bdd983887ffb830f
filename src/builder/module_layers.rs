//! Module layers: per-module tars built in parallel, checked against what the
//! image already carries, optionally flattened, then appended in name order.

use super::layers::whiteout_layer;
use super::metadata::ModuleLayerInfo;
use super::Builder;
use crate::archive::{layer_diff_id, merge_tars};
use crate::error::{Result, ResultExt};
use crate::image::{set_json_label, WritableImage};
use crate::module::{BuildModule, ModuleKind};
use crate::{log_layer_added, log_module_override};
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone)]
struct StagedModule {
    module: BuildModule,
    tar_path: PathBuf,
    diff_id: String,
}

impl<I: WritableImage> Builder<I> {
    pub(super) fn add_module_layers(&mut self, kind: ModuleKind, tmp: &Path) -> Result<()> {
        let manager = match kind {
            ModuleKind::Buildpack => &self.buildpacks,
            ModuleKind::Extension => &self.extensions,
        };
        let modules = manager.all_modules();
        if modules.is_empty() {
            return Ok(());
        }
        let groups: Vec<Vec<String>> = manager
            .flatten_groups()
            .iter()
            .map(|group| group.iter().map(BuildModule::full_name).collect())
            .collect();

        let kind_dir = tmp.join(format!("{}s", kind));
        let staged = self.create_module_tars(&modules, &kind_dir)?;
        let mut staged = self.resolve_collisions(kind, staged, &kind_dir)?;
        let flattened = self.flatten_modules(kind, &mut staged, &groups, &kind_dir)?;

        let mut layers = match kind {
            ModuleKind::Buildpack => self.buildpack_layers.clone(),
            ModuleKind::Extension => self.extension_layers.clone(),
        };
        let mut emitted = BTreeSet::new();
        for (name, entry) in &staged {
            let already_added = emitted.contains(&entry.diff_id);
            if !(already_added && flattened.contains(name)) {
                self.image
                    .add_layer_with_diff_id(&entry.tar_path, &entry.diff_id)
                    .with_context(|| format!("adding layer tar for {} '{}'", kind, name))?;
                log_layer_added!(name.as_str(), entry.diff_id);
                emitted.insert(entry.diff_id.clone());
            }

            let descriptor = entry.module.descriptor();
            layers
                .entry(descriptor.info.id.clone())
                .or_default()
                .insert(
                    descriptor.info.version.clone(),
                    ModuleLayerInfo::new(descriptor, entry.diff_id.clone()),
                );
        }

        set_json_label(&mut self.image, kind.layers_label(), &layers)?;
        match kind {
            ModuleKind::Buildpack => self.buildpack_layers = layers,
            ModuleKind::Extension => self.extension_layers = layers,
        }
        Ok(())
    }

    /// One tar per module, each in its own directory. Results keep input order.
    fn create_module_tars(&self, modules: &[BuildModule], kind_dir: &Path) -> Result<Vec<StagedModule>> {
        let factory = self.factory;
        modules
            .par_iter()
            .enumerate()
            .map(|(index, module)| -> Result<StagedModule> {
                let dir = kind_dir.join(format!("{:04}", index));
                fs::create_dir_all(&dir)
                    .with_context(|| format!("creating {}", dir.display()))?;
                let (tar_path, diff_id) = module.to_layer_tar(&dir, factory)?;
                Ok(StagedModule {
                    module: module.clone(),
                    tar_path,
                    diff_id,
                })
            })
            .collect()
    }

    /// Drops modules already on the image with identical content and hides
    /// replaced versions behind a whiteout. Later modules win over earlier
    /// ones with the same full name.
    fn resolve_collisions(
        &mut self,
        kind: ModuleKind,
        staged: Vec<StagedModule>,
        kind_dir: &Path,
    ) -> Result<BTreeMap<String, StagedModule>> {
        let existing = match kind {
            ModuleKind::Buildpack => &self.buildpack_layers,
            ModuleKind::Extension => &self.extension_layers,
        };

        let mut whiteouts = Vec::new();
        let mut by_name: BTreeMap<String, StagedModule> = BTreeMap::new();
        for entry in staged {
            let info = entry.module.descriptor().info.clone();
            let name = info.full_name();

            if let Some(record) = existing.get(&info.id).and_then(|v| v.get(&info.version)) {
                if record.layer_diff_id == entry.diff_id {
                    debug!(kind = %kind, module = %name, "Module already present on image, skipping");
                    continue;
                }
                if !whiteouts.contains(&info) {
                    log_module_override!(kind, name, "already exists on builder with different contents");
                    whiteouts.push(info.clone());
                }
            }

            match by_name.get(&name) {
                Some(previous) if previous.diff_id == entry.diff_id => {}
                Some(_) => {
                    log_module_override!(kind, name, "added more than once with different contents");
                    by_name.insert(name, entry);
                }
                None => {
                    by_name.insert(name, entry);
                }
            }
        }

        for (index, info) in whiteouts.iter().enumerate() {
            let path = kind_dir.join(format!("whiteout-{:04}.tar", index));
            let diff_id = whiteout_layer(&path, self.factory, kind, &info.id, &info.version)?;
            self.image
                .add_layer_with_diff_id(&path, &diff_id)
                .with_context(|| format!("adding whiteout layer for {} '{}'", kind, info.full_name()))?;
            log_layer_added!("whiteout", diff_id);
        }
        Ok(by_name)
    }

    /// Merges flattened modules into shared tars and repoints them at it.
    /// Returns the names of every module that now shares a layer.
    fn flatten_modules(
        &self,
        kind: ModuleKind,
        staged: &mut BTreeMap<String, StagedModule>,
        groups: &[Vec<String>],
        kind_dir: &Path,
    ) -> Result<BTreeSet<String>> {
        let mut flattened = BTreeSet::new();
        if !self.config.flatten {
            return Ok(flattened);
        }

        let candidates: Vec<BTreeSet<String>> = if self.config.flatten_all_modules() {
            vec![staged.keys().cloned().collect()]
        } else {
            groups
                .iter()
                .map(|group| group.iter().cloned().collect())
                .collect()
        };

        for (index, members) in candidates.into_iter().enumerate() {
            let members: Vec<String> = members
                .into_iter()
                .filter(|name| staged.contains_key(name) && !self.config.exclude.contains(name))
                .collect();
            if members.len() < 2 {
                continue;
            }

            let sources: Vec<PathBuf> = members
                .iter()
                .filter_map(|name| staged.get(name).map(|s| s.tar_path.clone()))
                .collect();
            let merged = kind_dir.join(format!("flatten-{:04}.tar", index));
            merge_tars(&merged, &sources)
                .with_context(|| format!("flattening {}s", kind))?;
            let diff_id = layer_diff_id(&merged)?;
            debug!(kind = %kind, modules = members.len(), diff_id = %diff_id, "Flattened modules");

            for name in members {
                if let Some(entry) = staged.get_mut(&name) {
                    entry.tar_path = merged.clone();
                    entry.diff_id = diff_id.clone();
                }
                flattened.insert(name);
            }
        }
        Ok(flattened)
    }
}
