use cnbkit::archive::EntryKind;
use cnbkit::blob::FileBlob;
use cnbkit::builder::{Builder, CreatorMetadata, ModuleLayers, RunImageMetadata};
use cnbkit::config::BuilderConfig;
use cnbkit::constants::{
    BUILDPACK_LAYERS_LABEL, BUILDPACK_ORDER_LABEL, METADATA_LABEL, MIXINS_LABEL, NORMALIZED_MTIME,
    STACK_ID_LABEL,
};
use cnbkit::error::Error;
use cnbkit::image::{get_json_label, LayoutImage, ReadableImage};
use cnbkit::lifecycle::Lifecycle;
use cnbkit::module::{BuildModule, ModuleKind, ModuleRef, OrderEntry};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

const STACK: &str = "\n[[stacks]]\nid = \"some.stack.id\"\n";

fn base_image() -> LayoutImage {
    LayoutImage::new("some/builder", "linux", "amd64")
        .unwrap()
        .with_env("CNB_USER_ID", "1234")
        .with_env("CNB_GROUP_ID", "4321")
        .with_label(STACK_ID_LABEL, "some.stack.id")
}

fn module(
    dir: &Path,
    kind: ModuleKind,
    id: &str,
    version: &str,
    body: &str,
    contents: &str,
) -> BuildModule {
    let root = dir.join(format!("{}-{}-{}", kind, id.replace('/', "_"), version));
    fs::create_dir_all(root.join("bin")).unwrap();
    fs::write(
        root.join(format!("{}.toml", kind)),
        format!(
            "api = \"0.8\"\n\n[{}]\nid = \"{}\"\nversion = \"{}\"\n{}",
            kind, id, version, body
        ),
    )
    .unwrap();
    fs::write(root.join("bin/build"), contents).unwrap();
    BuildModule::from_root_blob(kind, Arc::new(FileBlob::new(&root))).unwrap()
}

fn buildpack(dir: &Path, id: &str, version: &str) -> BuildModule {
    module(dir, ModuleKind::Buildpack, id, version, STACK, "#!/bin/sh\necho build")
}

fn meta_buildpack(dir: &Path, id: &str, members: &[(&str, &str)]) -> BuildModule {
    let mut body = String::from("\n[[order]]\n");
    for (member, version) in members {
        body.push_str(&format!(
            "[[order.group]]\nid = \"{}\"\nversion = \"{}\"\n",
            member, version
        ));
    }
    module(dir, ModuleKind::Buildpack, id, "1", &body, "")
}

fn lifecycle(dir: &Path, supported: &str) -> Lifecycle {
    let root = dir.join("lifecycle-bundle");
    fs::create_dir_all(root.join("lifecycle")).unwrap();
    fs::write(
        root.join("lifecycle.toml"),
        format!(
            "[apis]\n[apis.buildpack]\nsupported = [{}]\n[apis.platform]\nsupported = [\"0.12\"]\n\n[lifecycle]\nversion = \"0.17.0\"\n",
            supported
        ),
    )
    .unwrap();
    for binary in ["detector", "restorer", "analyzer", "builder", "exporter", "launcher"] {
        fs::write(root.join("lifecycle").join(binary), binary).unwrap();
    }
    Lifecycle::from_blob(Arc::new(FileBlob::new(&root))).unwrap()
}

fn save(builder: &mut Builder<LayoutImage>) -> cnbkit::Result<()> {
    builder.save(CreatorMetadata::new("", "1.2.5"))
}

#[test]
fn test_empty_builder_save() {
    let mut builder = Builder::new(base_image(), None, BuilderConfig::default()).unwrap();
    assert_eq!(builder.uid(), 1234);
    assert_eq!(builder.gid(), 4321);
    assert_eq!(builder.stack_id(), "some.stack.id");
    save(&mut builder).unwrap();

    let image = builder.into_image();
    assert!(image.is_saved());
    assert_eq!(image.working_dir(), "/layers");

    let metadata: serde_json::Value = get_json_label(&image, METADATA_LABEL).unwrap().unwrap();
    assert_eq!(metadata["createdBy"]["name"], "Pack CLI");
    assert_eq!(metadata["createdBy"]["version"], "1.2.5");

    let (workspace, _) = image.find_layer_entry("/workspace").unwrap();
    assert_eq!((workspace.uid, workspace.gid), (1234, 4321));
    assert_eq!(workspace.mtime, NORMALIZED_MTIME);
    let (layers, _) = image.find_layer_entry("/layers").unwrap();
    assert_eq!((layers.uid, layers.gid, layers.mode), (1234, 4321, 0o755));
    for dir in ["/cnb", "/cnb/buildpacks", "/platform", "/platform/env"] {
        let (header, _) = image.find_layer_entry(dir).unwrap();
        assert_eq!(header.kind, EntryKind::Dir, "{}", dir);
        assert_eq!((header.uid, header.gid), (0, 0), "{}", dir);
        assert_eq!(header.mtime, NORMALIZED_MTIME, "{}", dir);
    }
    assert_eq!(image.label(MIXINS_LABEL).unwrap().as_deref(), Some("[]"));
}

#[test]
fn test_construction_errors() {
    let image = LayoutImage::new("some/builder", "linux", "amd64")
        .unwrap()
        .with_env("CNB_GROUP_ID", "4321")
        .with_label(STACK_ID_LABEL, "some.stack.id");
    let err = Builder::new(image, None, BuilderConfig::default()).err().unwrap();
    assert!(matches!(err, Error::MissingEnv { name, .. } if name == "CNB_USER_ID"));

    let image = base_image().with_env("CNB_GROUP_ID", "not-a-number");
    let err = Builder::new(image, None, BuilderConfig::default()).err().unwrap();
    assert_eq!(
        err.to_string(),
        "failed to parse 'CNB_GROUP_ID', value 'not-a-number' should be an integer"
    );

    let image = LayoutImage::new("some/builder", "linux", "amd64")
        .unwrap()
        .with_env("CNB_USER_ID", "1")
        .with_env("CNB_GROUP_ID", "1");
    let err = Builder::new(image, None, BuilderConfig::default()).err().unwrap();
    assert!(matches!(err, Error::MissingLabel(label) if label == STACK_ID_LABEL));

    let config = BuilderConfig {
        require_metadata: true,
        ..Default::default()
    };
    let err = Builder::new(base_image(), None, config).err().unwrap();
    assert!(matches!(err, Error::MissingLabel(label) if label == METADATA_LABEL));
}

#[test]
fn test_rename_on_construction() {
    let builder = Builder::new(base_image(), Some("other/builder"), BuilderConfig::default()).unwrap();
    assert_eq!(builder.name(), "other/builder");
}

#[test]
fn test_order_with_implicit_version() {
    let dir = TempDir::new().unwrap();
    let mut builder = Builder::new(base_image(), None, BuilderConfig::default()).unwrap();
    builder.add_buildpack(buildpack(dir.path(), "buildpack-1-id", "1"));
    builder.add_buildpack(buildpack(dir.path(), "buildpack-2-id", "1"));
    builder.set_order(vec![OrderEntry::new(vec![
        ModuleRef::new("buildpack-1-id", ""),
        ModuleRef::new("buildpack-2-id", "1").optional(),
    ])]);
    save(&mut builder).unwrap();

    let image = builder.into_image();
    let (_, contents) = image.find_layer_entry("/cnb/order.toml").unwrap();
    assert_eq!(
        String::from_utf8(contents).unwrap(),
        "[[order]]\n\n  [[order.group]]\n    id = \"buildpack-1-id\"\n    version = \"1\"\n\n  [[order.group]]\n    id = \"buildpack-2-id\"\n    version = \"1\"\n    optional = true\n"
    );
    assert_eq!(
        image.label(BUILDPACK_ORDER_LABEL).unwrap().unwrap(),
        r#"[{"group":[{"id":"buildpack-1-id","version":"1"},{"id":"buildpack-2-id","version":"1","optional":true}]}]"#
    );
}

#[test]
fn test_ambiguous_order_fails() {
    let dir = TempDir::new().unwrap();
    let mut builder = Builder::new(base_image(), None, BuilderConfig::default()).unwrap();
    builder.add_buildpack(buildpack(dir.path(), "buildpack-1-id", "1"));
    builder.add_buildpack(buildpack(dir.path(), "buildpack-1-id", "2"));
    builder.set_order(vec![OrderEntry::new(vec![ModuleRef::new("buildpack-1-id", "")])]);

    let err = save(&mut builder).unwrap_err();
    assert!(matches!(err.root(), Error::AmbiguousVersion { id } if id == "buildpack-1-id"));
    assert!(err.to_string().starts_with("processing order: "));
}

#[test]
fn test_module_layers_and_label() {
    let dir = TempDir::new().unwrap();
    let mut builder = Builder::new(base_image(), None, BuilderConfig::default()).unwrap();
    builder.add_buildpack(buildpack(dir.path(), "acme/node", "1.0.0"));
    builder.add_buildpack(buildpack(dir.path(), "acme/java", "2.0.0"));
    save(&mut builder).unwrap();

    let image = builder.into_image();
    let (header, contents) = image
        .find_layer_entry("/cnb/buildpacks/acme_node/1.0.0/bin/build")
        .unwrap();
    assert_eq!(header.mode, 0o755);
    assert_eq!(header.uid, 0);
    assert_eq!(contents, b"#!/bin/sh\necho build");

    let label: ModuleLayers = get_json_label(&image, BUILDPACK_LAYERS_LABEL).unwrap().unwrap();
    let node = &label["acme/node"]["1.0.0"];
    let java = &label["acme/java"]["2.0.0"];
    assert_ne!(node.layer_diff_id, java.layer_diff_id);
    assert_eq!(node.stacks[0].id, "some.stack.id");
    let diff_ids: Vec<&str> = image.layers().iter().map(|l| l.diff_id.as_str()).collect();
    assert!(diff_ids.contains(&node.layer_diff_id.as_str()));
    assert!(diff_ids.contains(&java.layer_diff_id.as_str()));

    // sorted by full name: acme/java before acme/node
    let java_pos = diff_ids.iter().position(|d| *d == java.layer_diff_id).unwrap();
    let node_pos = diff_ids.iter().position(|d| *d == node.layer_diff_id).unwrap();
    assert!(java_pos < node_pos);

    let metadata: serde_json::Value = get_json_label(&image, METADATA_LABEL).unwrap().unwrap();
    assert_eq!(metadata["buildpacks"][0]["id"], "acme/java");
    assert_eq!(metadata["buildpacks"][1]["id"], "acme/node");
}

#[test]
fn test_existing_module_is_skipped_or_whited_out() {
    let dir = TempDir::new().unwrap();
    let mut builder = Builder::new(base_image(), None, BuilderConfig::default()).unwrap();
    builder.add_buildpack(buildpack(dir.path(), "acme/node", "1.0.0"));
    save(&mut builder).unwrap();
    let image = builder.into_image();
    let first_save = image.layers().len();

    // same contents: nothing new beyond the fixed layers
    let mut builder = Builder::new(image, None, BuilderConfig::default()).unwrap();
    builder.add_buildpack(buildpack(dir.path(), "acme/node", "1.0.0"));
    save(&mut builder).unwrap();
    let image = builder.into_image();
    let second_save = image.layers().len();
    assert_eq!(second_save - first_save, first_save - 1);
    assert!(image
        .find_layer_entry("/cnb/buildpacks/acme_node/.wh.1.0.0")
        .unwrap_err()
        .is_entry_not_exist());

    // different contents: whiteout plus a fresh module layer
    let changed_dir = TempDir::new().unwrap();
    let changed = module(
        changed_dir.path(),
        ModuleKind::Buildpack,
        "acme/node",
        "1.0.0",
        STACK,
        "#!/bin/sh\necho changed",
    );
    let mut builder = Builder::new(image, None, BuilderConfig::default()).unwrap();
    builder.add_buildpack(changed);
    save(&mut builder).unwrap();
    let image = builder.into_image();
    assert_eq!(image.layers().len() - second_save, first_save + 1);
    assert!(image.find_layer_entry("/cnb/buildpacks/acme_node/.wh.1.0.0").is_ok());
    let (_, contents) = image
        .find_layer_entry("/cnb/buildpacks/acme_node/1.0.0/bin/build")
        .unwrap();
    assert_eq!(contents, b"#!/bin/sh\necho changed");
}

fn module_layer_count(image: &LayoutImage) -> usize {
    let label: ModuleLayers = get_json_label(image, BUILDPACK_LAYERS_LABEL).unwrap().unwrap();
    let mut ids: Vec<String> = label
        .values()
        .flat_map(|versions| versions.values().map(|r| r.layer_diff_id.clone()))
        .collect();
    ids.sort();
    ids.dedup();
    ids.iter()
        .filter(|id| image.layers().iter().any(|l| &l.diff_id == *id))
        .count()
}

#[test]
fn test_flatten_all_modules() {
    let dir = TempDir::new().unwrap();
    let mut builder = Builder::new(base_image(), None, BuilderConfig::flatten_all()).unwrap();
    for id in ["bp-a", "bp-b", "bp-c"] {
        builder.add_buildpack(buildpack(dir.path(), id, "1"));
    }
    save(&mut builder).unwrap();

    let image = builder.into_image();
    assert_eq!(module_layer_count(&image), 1);
    assert_eq!(image.layers().len(), 5);
    for id in ["bp-a", "bp-b", "bp-c"] {
        let path = format!("/cnb/buildpacks/{}/1/bin/build", id);
        assert!(image.find_layer_entry(&path).is_ok(), "{}", path);
    }
}

#[test]
fn test_flatten_with_exclude() {
    let dir = TempDir::new().unwrap();
    let config = BuilderConfig::flatten_all().with_exclude(["bp-c@1"]);
    let mut builder = Builder::new(base_image(), None, config).unwrap();
    for id in ["bp-a", "bp-b", "bp-c"] {
        builder.add_buildpack(buildpack(dir.path(), id, "1"));
    }
    save(&mut builder).unwrap();

    let image = builder.into_image();
    assert_eq!(module_layer_count(&image), 2);
    let label: ModuleLayers = get_json_label(&image, BUILDPACK_LAYERS_LABEL).unwrap().unwrap();
    assert_eq!(label["bp-a"]["1"].layer_diff_id, label["bp-b"]["1"].layer_diff_id);
    assert_ne!(label["bp-a"]["1"].layer_diff_id, label["bp-c"]["1"].layer_diff_id);
}

#[test]
fn test_flatten_meta_buildpack_at_depth() {
    let dir = TempDir::new().unwrap();
    let mut builder = Builder::new(base_image(), None, BuilderConfig::flatten_depth(0)).unwrap();
    builder.add_buildpacks(
        meta_buildpack(dir.path(), "meta", &[("bp-a", "1"), ("bp-b", "1")]),
        vec![
            buildpack(dir.path(), "bp-a", "1"),
            buildpack(dir.path(), "bp-b", "1"),
        ],
    );
    builder.add_buildpack(buildpack(dir.path(), "standalone", "1"));
    save(&mut builder).unwrap();

    let image = builder.into_image();
    assert_eq!(module_layer_count(&image), 2);
    let label: ModuleLayers = get_json_label(&image, BUILDPACK_LAYERS_LABEL).unwrap().unwrap();
    assert_eq!(label["meta"]["1"].layer_diff_id, label["bp-a"]["1"].layer_diff_id);
    assert_eq!(label["meta"]["1"].order[0].group.len(), 2);
}

#[test]
fn test_validation_failures() {
    let dir = TempDir::new().unwrap();

    let mut builder = Builder::new(base_image(), None, BuilderConfig::default()).unwrap();
    builder.add_buildpack(meta_buildpack(dir.path(), "meta", &[("missing-bp", "1")]));
    let err = save(&mut builder).unwrap_err();
    assert!(matches!(err.root(), Error::MissingDependency { reference } if reference == "missing-bp@1"));
    assert!(err.to_string().starts_with("validating buildpacks: "));

    let mut builder = Builder::new(base_image(), None, BuilderConfig::default()).unwrap();
    builder.add_buildpack(module(
        dir.path(),
        ModuleKind::Buildpack,
        "other-stack-bp",
        "1",
        "\n[[stacks]]\nid = \"other.stack\"\n",
        "",
    ));
    let err = save(&mut builder).unwrap_err();
    assert!(matches!(err.root(), Error::StackUnsupported { .. }));

    let image = base_image().with_label(MIXINS_LABEL, r#"["mixinA", "build:mixinB"]"#);
    let mut builder = Builder::new(image, None, BuilderConfig::default()).unwrap();
    builder.add_buildpack(module(
        dir.path(),
        ModuleKind::Buildpack,
        "mixin-bp",
        "1",
        "\n[[stacks]]\nid = \"some.stack.id\"\nmixins = [\"mixinA\", \"build:mixinB\", \"mixinC\", \"run:mixinD\"]\n",
        "",
    ));
    let err = save(&mut builder).unwrap_err();
    assert!(matches!(err.root(), Error::MixinUnsatisfied { mixins, .. } if mixins == &vec!["mixinC".to_string()]));

    let image = LayoutImage::new("some/builder", "linux", "arm64")
        .unwrap()
        .with_env("CNB_USER_ID", "1")
        .with_env("CNB_GROUP_ID", "1")
        .with_label(STACK_ID_LABEL, "some.stack.id");
    let mut builder = Builder::new(image, None, BuilderConfig::default()).unwrap();
    builder.add_buildpack(module(dir.path(), ModuleKind::Buildpack, "no-targets", "1", "", ""));
    let err = save(&mut builder).unwrap_err();
    assert!(matches!(err.root(), Error::TargetUnsupported { arch, .. } if arch == "arm64"));
}

#[test]
fn test_cyclic_meta_buildpacks() {
    let dir = TempDir::new().unwrap();
    let mut builder = Builder::new(base_image(), None, BuilderConfig::default()).unwrap();
    builder.add_buildpack(meta_buildpack(dir.path(), "meta-a", &[("meta-b", "1")]));
    builder.add_buildpack(meta_buildpack(dir.path(), "meta-b", &[("meta-a", "1")]));
    let err = save(&mut builder).unwrap_err();
    assert!(matches!(err.root(), Error::CyclicOrder { module, .. } if module == "meta-a@1"));
}

#[test]
fn test_lifecycle_layer_and_compatibility() {
    let dir = TempDir::new().unwrap();

    let mut builder = Builder::new(base_image(), None, BuilderConfig::default()).unwrap();
    builder.set_lifecycle(lifecycle(dir.path(), "\"0.2\", \"0.3\""));
    builder.add_buildpack(buildpack(dir.path(), "bp", "1"));
    let err = save(&mut builder).unwrap_err();
    assert_eq!(
        err.root().to_string(),
        "buildpack 'bp@1' (API 0.8) is incompatible with lifecycle '0.17.0' (API(s) 0.2, 0.3)"
    );

    let mut builder = Builder::new(base_image(), None, BuilderConfig::default()).unwrap();
    builder.set_lifecycle(lifecycle(dir.path(), "\"0.7\", \"0.8\""));
    builder.add_buildpack(buildpack(dir.path(), "bp", "1"));
    save(&mut builder).unwrap();
    assert_eq!(builder.lifecycle_descriptor().version_string(), "0.17.0");

    let image = builder.into_image();
    let (_, detector) = image.find_layer_entry("/cnb/lifecycle/detector").unwrap();
    assert_eq!(detector, b"detector");
    let (link, _) = image.find_layer_entry("/lifecycle").unwrap();
    assert_eq!(link.kind, EntryKind::Symlink);
    assert_eq!(link.link_name.as_deref(), Some("/cnb/lifecycle"));

    let metadata: serde_json::Value = get_json_label(&image, METADATA_LABEL).unwrap().unwrap();
    assert_eq!(metadata["lifecycle"]["version"], "0.17.0");
    assert_eq!(metadata["lifecycle"]["api"]["buildpack"], "0.7");
    assert_eq!(metadata["lifecycle"]["apis"]["buildpack"]["supported"][1], "0.8");
}

#[test]
fn test_env_stack_and_run_layers() {
    let mut builder = Builder::new(base_image(), None, BuilderConfig::default()).unwrap();
    let mut env = BTreeMap::new();
    env.insert("SOME_KEY".to_string(), "some-val".to_string());
    env.insert("OTHER_KEY".to_string(), "other-val".to_string());
    builder.set_env(env);
    builder.set_description("some description");
    builder.set_stack(RunImageMetadata::new("some/run", vec!["mirror/run".to_string()]));
    save(&mut builder).unwrap();

    let image = builder.into_image();
    let (header, contents) = image.find_layer_entry("/platform/env/SOME_KEY").unwrap();
    assert_eq!(header.mode, 0o644);
    assert_eq!(contents, b"some-val");

    let (_, stack) = image.find_layer_entry("/cnb/stack.toml").unwrap();
    let stack: toml::Value = toml::from_str(&String::from_utf8(stack).unwrap()).unwrap();
    assert_eq!(stack["run-image"]["image"].as_str(), Some("some/run"));

    let (_, run) = image.find_layer_entry("/cnb/run.toml").unwrap();
    let run: toml::Value = toml::from_str(&String::from_utf8(run).unwrap()).unwrap();
    assert_eq!(run["images"][0]["mirrors"][0].as_str(), Some("mirror/run"));

    let metadata: serde_json::Value = get_json_label(&image, METADATA_LABEL).unwrap().unwrap();
    assert_eq!(metadata["description"], "some description");
    assert_eq!(metadata["stack"]["runImage"]["image"], "some/run");
}

#[test]
fn test_extensions_and_extension_order() {
    let dir = TempDir::new().unwrap();
    let mut builder = Builder::new(base_image(), None, BuilderConfig::default()).unwrap();
    builder.add_buildpack(buildpack(dir.path(), "bp", "1"));
    builder.add_extension(module(dir.path(), ModuleKind::Extension, "ext", "1", "", ""));
    builder.set_order(vec![OrderEntry::new(vec![ModuleRef::new("bp", "1")])]);
    builder.set_order_extensions(vec![OrderEntry::new(vec![ModuleRef::new("ext", "")])]);
    save(&mut builder).unwrap();

    assert_eq!(builder.extensions()[0].id, "ext");
    assert_eq!(builder.order_extensions()[0].group[0].version, "1");

    let image = builder.into_image();
    assert!(image.find_layer_entry("/cnb/extensions/ext/1/extension.toml").is_ok());
    let (_, order) = image.find_layer_entry("/cnb/order.toml").unwrap();
    let order = String::from_utf8(order).unwrap();
    assert!(order.contains("[[order-extensions]]\n\n  [[order-extensions.group]]\n    id = \"ext\"\n    version = \"1\"\n    optional = true\n"));
}

#[test]
fn test_windows_builder() {
    let image = LayoutImage::new("some/builder", "windows", "amd64")
        .unwrap()
        .with_env("CNB_USER_ID", "1")
        .with_env("CNB_GROUP_ID", "1")
        .with_label(STACK_ID_LABEL, "some.stack.id");
    let dir = TempDir::new().unwrap();
    let mut builder = Builder::new(image, None, BuilderConfig::default()).unwrap();
    builder.set_lifecycle(lifecycle(dir.path(), "\"0.8\""));
    save(&mut builder).unwrap();

    let image = builder.into_image();
    assert!(image.find_layer_entry("Files/workspace").is_ok());
    assert!(image.find_layer_entry("Files/cnb/lifecycle/detector").is_ok());
    assert!(image.find_layer_entry("Files/lifecycle").unwrap_err().is_entry_not_exist());
}
