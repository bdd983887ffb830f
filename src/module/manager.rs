//! Groups modules into layers, optionally flattening them.

use super::BuildModule;
use std::collections::BTreeSet;

/// Modules waiting to be written, split into those that get a layer of their
/// own and groups that share one.
#[derive(Debug, Clone, Default)]
pub struct ModuleManager {
    modules: Vec<BuildModule>,
    flatten_groups: Vec<Vec<BuildModule>>,
    flatten: bool,
    max_depth: i32,
}

impl ModuleManager {
    /// `max_depth < 0` with `flatten` places every module in a single group.
    pub fn new(flatten: bool, max_depth: i32) -> Self {
        Self {
            flatten,
            max_depth,
            ..Default::default()
        }
    }

    pub fn add_modules(&mut self, main: BuildModule, deps: Vec<BuildModule>) {
        let mut all = Vec::with_capacity(deps.len() + 1);
        all.push(main.clone());

        if !self.flatten {
            all.extend(deps);
            self.modules.extend(all);
            return;
        }

        if self.max_depth < 0 {
            all.extend(deps);
            match self.flatten_groups.first_mut() {
                Some(group) => group.extend(all),
                None => self.flatten_groups.push(all),
            }
            return;
        }

        for group in self.flatten_groups_for(&main, &deps, 0) {
            if group.len() == 1 {
                self.modules.extend(group);
            } else {
                self.flatten_groups.push(group);
            }
        }
    }

    /// Modules that get their own layer.
    pub fn modules(&self) -> &[BuildModule] {
        &self.modules
    }

    pub fn flatten_groups(&self) -> &[Vec<BuildModule>] {
        &self.flatten_groups
    }

    /// Every module added, grouped or not, in insertion order.
    pub fn all_modules(&self) -> Vec<BuildModule> {
        self.modules
            .iter()
            .chain(self.flatten_groups.iter().flatten())
            .cloned()
            .collect()
    }

    pub fn is_flatten(&self, module: &BuildModule) -> bool {
        let name = module.full_name();
        self.flatten_groups
            .iter()
            .flatten()
            .any(|m| m.full_name() == name)
    }

    fn flatten_groups_for(
        &self,
        main: &BuildModule,
        deps: &[BuildModule],
        depth: i32,
    ) -> Vec<Vec<BuildModule>> {
        if !main.descriptor().is_meta() {
            return vec![vec![main.clone()]];
        }

        if depth >= self.max_depth {
            let mut group = vec![main.clone()];
            group.extend(reachable(main, deps));
            return vec![group];
        }

        let (children, rest) = children_of(main, deps);
        let mut groups = vec![vec![main.clone()]];
        for child in &children {
            groups.extend(self.flatten_groups_for(child, &rest, depth + 1));
        }
        groups
    }
}

/// Direct order members of `main` found in `deps`, then the deps left over.
fn children_of(main: &BuildModule, deps: &[BuildModule]) -> (Vec<BuildModule>, Vec<BuildModule>) {
    let mut names = BTreeSet::new();
    let mut children = Vec::new();
    for entry in main.descriptor().order() {
        for module_ref in &entry.group {
            let name = module_ref.full_name();
            if names.contains(&name) {
                continue;
            }
            if let Some(dep) = deps.iter().find(|d| d.full_name() == name) {
                names.insert(name);
                children.push(dep.clone());
            }
        }
    }
    let rest = deps
        .iter()
        .filter(|d| !names.contains(&d.full_name()))
        .cloned()
        .collect();
    (children, rest)
}

/// Every dep reachable from `main` through nested orders, in dep order.
fn reachable(main: &BuildModule, deps: &[BuildModule]) -> Vec<BuildModule> {
    let mut found: BTreeSet<String> = BTreeSet::new();
    let mut pending = vec![main.clone()];
    while let Some(module) = pending.pop() {
        for entry in module.descriptor().order() {
            for module_ref in &entry.group {
                let name = module_ref.full_name();
                if found.contains(&name) {
                    continue;
                }
                if let Some(dep) = deps.iter().find(|d| d.full_name() == name) {
                    found.insert(name);
                    pending.push(dep.clone());
                }
            }
        }
    }
    deps.iter()
        .filter(|d| found.contains(&d.full_name()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::BytesBlob;
    use crate::lifecycle::ApiVersion;
    use crate::module::{ModuleDescriptor, ModuleInfo, ModuleKind, ModuleRef, OrderEntry};
    use std::sync::Arc;

    fn leaf(id: &str) -> BuildModule {
        BuildModule::new(
            ModuleDescriptor::leaf(
                ModuleKind::Buildpack,
                ModuleInfo::new(id, "1"),
                ApiVersion::new(0, 9),
                Vec::new(),
            ),
            Arc::new(BytesBlob::default()),
        )
    }

    fn meta(id: &str, members: &[&str]) -> BuildModule {
        let group = members.iter().map(|m| ModuleRef::new(*m, "1")).collect();
        BuildModule::new(
            ModuleDescriptor::meta(
                ModuleInfo::new(id, "1"),
                ApiVersion::new(0, 9),
                vec![OrderEntry::new(group)],
            ),
            Arc::new(BytesBlob::default()),
        )
    }

    fn names(modules: &[BuildModule]) -> Vec<String> {
        modules.iter().map(|m| m.full_name()).collect()
    }

    // meta-a -> [meta-b, leaf-c], meta-b -> [leaf-d, leaf-e]
    fn tree() -> (BuildModule, Vec<BuildModule>) {
        (
            meta("meta-a", &["meta-b", "leaf-c"]),
            vec![
                meta("meta-b", &["leaf-d", "leaf-e"]),
                leaf("leaf-c"),
                leaf("leaf-d"),
                leaf("leaf-e"),
            ],
        )
    }

    #[test]
    fn test_no_flatten_keeps_every_module() {
        let (main, deps) = tree();
        let mut manager = ModuleManager::new(false, 0);
        manager.add_modules(main, deps);
        assert_eq!(manager.modules().len(), 5);
        assert!(manager.flatten_groups().is_empty());
    }

    #[test]
    fn test_flatten_everything() {
        let mut manager = ModuleManager::new(true, -1);
        let (main, deps) = tree();
        manager.add_modules(main, deps);
        manager.add_modules(leaf("other"), Vec::new());
        assert!(manager.modules().is_empty());
        assert_eq!(manager.flatten_groups().len(), 1);
        assert_eq!(manager.flatten_groups()[0].len(), 6);
        assert!(manager.is_flatten(&leaf("other")));
    }

    #[test]
    fn test_flatten_at_depth_zero() {
        let mut manager = ModuleManager::new(true, 0);
        let (main, deps) = tree();
        manager.add_modules(main, deps);
        assert!(manager.modules().is_empty());
        assert_eq!(
            names(&manager.flatten_groups()[0]),
            vec!["meta-a@1", "meta-b@1", "leaf-c@1", "leaf-d@1", "leaf-e@1"]
        );
    }

    #[test]
    fn test_flatten_at_depth_one() {
        let mut manager = ModuleManager::new(true, 1);
        let (main, deps) = tree();
        manager.add_modules(main, deps);

        assert_eq!(names(manager.modules()), vec!["meta-a@1", "leaf-c@1"]);
        assert_eq!(manager.flatten_groups().len(), 1);
        assert_eq!(
            names(&manager.flatten_groups()[0]),
            vec!["meta-b@1", "leaf-d@1", "leaf-e@1"]
        );
        assert!(manager.is_flatten(&leaf("leaf-d")));
        assert!(!manager.is_flatten(&leaf("leaf-c")));
        assert_eq!(manager.all_modules().len(), 5);
    }
}
