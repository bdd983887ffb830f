//! Single-purpose layer tars written during a builder save.

use super::metadata::{RunImageMetadata, RunToml, StackToml};
use crate::archive::{create_single_file_tar, create_tar_with, EntryHeader, TarWriterFactory, TargetOs};
use crate::blob::BlobReader;
use crate::constants::{
    BUILDPACKS_DIR, CNB_DIR, COMPAT_LIFECYCLE_DIR, EXTENSIONS_DIR, LAYERS_DIR, LIFECYCLE_DIR,
    ORDER_PATH, PLATFORM_DIR, PLATFORM_ENV_DIR, RUN_PATH, STACK_PATH, WORKSPACE_DIR,
};
use crate::error::{Result, ResultExt};
use crate::lifecycle::lifecycle_binaries;
use crate::module::{escape_id, ModuleKind};
use std::collections::BTreeMap;
use std::io;
use std::path::Path;

/// Workspace and layers dirs owned by the build user; the rest root-owned.
pub(crate) fn dirs_layer(dest: &Path, factory: TarWriterFactory, uid: u64, gid: u64) -> Result<String> {
    create_tar_with(dest, factory, |tw| {
        for dir in [WORKSPACE_DIR, LAYERS_DIR] {
            tw.write_entry(&EntryHeader::dir(dir).with_owner(uid, gid), &mut io::empty())
                .with_context(|| format!("creating '{}' dir in layer", dir))?;
        }
        for dir in [CNB_DIR, BUILDPACKS_DIR, EXTENSIONS_DIR, PLATFORM_DIR, PLATFORM_ENV_DIR] {
            tw.write_entry(&EntryHeader::dir(dir), &mut io::empty())
                .with_context(|| format!("creating '{}' dir in layer", dir))?;
        }
        Ok(())
    })
}

/// Lifecycle binaries under `/cnb/lifecycle`, plus the `/lifecycle` link on
/// POSIX images.
pub(crate) fn lifecycle_layer(dest: &Path, factory: TarWriterFactory, lifecycle: BlobReader) -> Result<String> {
    let binaries = lifecycle_binaries(lifecycle).context("embedding lifecycle tar")?;
    create_tar_with(dest, factory, |tw| {
        tw.write_entry(&EntryHeader::dir(LIFECYCLE_DIR), &mut io::empty())?;
        for (mut header, contents) in binaries {
            header.name = format!("{}/{}", LIFECYCLE_DIR, header.name);
            header.normalize(true);
            tw.write_entry(&header, &mut contents.as_slice())
                .with_context(|| format!("failed to write header for '{}'", header.name))?;
        }
        if factory.os() == TargetOs::Linux {
            tw.write_entry(&EntryHeader::symlink(COMPAT_LIFECYCLE_DIR, LIFECYCLE_DIR), &mut io::empty())?;
        }
        Ok(())
    })
}

pub(crate) fn order_layer(dest: &Path, factory: TarWriterFactory, contents: &str) -> Result<String> {
    create_single_file_tar(dest, ORDER_PATH, contents.as_bytes(), factory)
        .context("failed to create order.toml layer tar")
}

pub(crate) fn stack_layer(dest: &Path, factory: TarWriterFactory, run_image: &RunImageMetadata) -> Result<String> {
    let contents = toml::to_string(&StackToml { run_image }).context("failed to marshal stack.toml")?;
    create_single_file_tar(dest, STACK_PATH, contents.as_bytes(), factory)
        .context("failed to create stack.toml layer tar")
}

pub(crate) fn run_layer(dest: &Path, factory: TarWriterFactory, images: &[RunImageMetadata]) -> Result<String> {
    let contents = toml::to_string(&RunToml { images }).context("failed to marshal run.toml")?;
    create_single_file_tar(dest, RUN_PATH, contents.as_bytes(), factory)
        .context("failed to create run.toml layer tar")
}

/// One `/platform/env/<name>` file per variable, in name order.
pub(crate) fn env_layer(dest: &Path, factory: TarWriterFactory, env: &BTreeMap<String, String>) -> Result<String> {
    create_tar_with(dest, factory, |tw| {
        for (name, value) in env {
            let header = EntryHeader::file(format!("{}/{}", PLATFORM_ENV_DIR, name), value.len() as u64, 0o644);
            tw.write_entry(&header, &mut value.as_bytes())
                .with_context(|| format!("writing env var '{}'", name))?;
        }
        Ok(())
    })
}

/// Empty `.wh.<version>` marker hiding a module version already on the image.
pub(crate) fn whiteout_layer(
    dest: &Path,
    factory: TarWriterFactory,
    kind: ModuleKind,
    id: &str,
    version: &str,
) -> Result<String> {
    let path = format!("{}/{}/.wh.{}", kind.dist_dir(), escape_id(id), version);
    create_single_file_tar(dest, &path, &[], factory)
        .with_context(|| format!("creating whiteout for {} '{}@{}'", kind, id, version))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{read_tar_entry, EntryKind};
    use std::fs::File;

    #[test]
    fn test_dirs_layer_ownership() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("dirs.tar");
        dirs_layer(&dest, TarWriterFactory::posix(), 1234, 4321).unwrap();

        let (workspace, _) = read_tar_entry(File::open(&dest).unwrap(), WORKSPACE_DIR).unwrap();
        assert_eq!((workspace.uid, workspace.gid, workspace.mode), (1234, 4321, 0o755));
        let (cnb, _) = read_tar_entry(File::open(&dest).unwrap(), CNB_DIR).unwrap();
        assert_eq!((cnb.uid, cnb.gid), (0, 0));
        assert_eq!(cnb.mtime, crate::constants::NORMALIZED_MTIME);
    }

    #[test]
    fn test_stack_and_run_toml() {
        let dir = tempfile::tempdir().unwrap();
        let run_image = RunImageMetadata::new("some/run", vec!["some/mirror".to_string()]);

        let stack = dir.path().join("stack.tar");
        stack_layer(&stack, TarWriterFactory::posix(), &run_image).unwrap();
        let (_, contents) = read_tar_entry(File::open(&stack).unwrap(), STACK_PATH).unwrap();
        let parsed: toml::Value = toml::from_str(&String::from_utf8(contents).unwrap()).unwrap();
        assert_eq!(parsed["run-image"]["image"].as_str(), Some("some/run"));

        let run = dir.path().join("run.tar");
        run_layer(&run, TarWriterFactory::posix(), std::slice::from_ref(&run_image)).unwrap();
        let (_, contents) = read_tar_entry(File::open(&run).unwrap(), RUN_PATH).unwrap();
        let parsed: toml::Value = toml::from_str(&String::from_utf8(contents).unwrap()).unwrap();
        assert_eq!(parsed["images"][0]["mirrors"][0].as_str(), Some("some/mirror"));
    }

    #[test]
    fn test_whiteout_path() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("wh.tar");
        whiteout_layer(&dest, TarWriterFactory::posix(), ModuleKind::Buildpack, "acme/node", "1.0.0").unwrap();
        let (header, contents) =
            read_tar_entry(File::open(&dest).unwrap(), "/cnb/buildpacks/acme_node/.wh.1.0.0").unwrap();
        assert_eq!(header.kind, EntryKind::File);
        assert!(contents.is_empty());
    }
}
