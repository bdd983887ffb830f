//! Buildpacks and extensions as they are handed to the builder.

pub mod descriptor;
pub mod manager;
pub mod order;

pub use descriptor::{
    escape_id, full_name, Distribution, License, ModuleBody, ModuleDescriptor, ModuleInfo,
    ModuleKind, ModuleRef, Order, OrderEntry, Target,
};
pub use manager::ModuleManager;
pub use order::check_order_cycles;

use crate::archive::read::read_header;
use crate::archive::{
    clean_path, create_tar_with, generate_tar, read_tar_entry, EntryHeader, EntryKind, TarWriter,
    TarWriterFactory,
};
use crate::blob::{Blob, BlobReader};
use crate::error::{Result, ResultExt};
use std::fmt;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const EXECUTABLE_ENTRIES: &[&str] = &["bin/build", "bin/detect", "bin/generate"];

/// A module descriptor paired with its content.
///
/// The blob yields a tar laid out under
/// `/cnb/<kind>s/<escaped id>/<version>/`.
#[derive(Clone)]
pub struct BuildModule {
    descriptor: Arc<ModuleDescriptor>,
    blob: Arc<dyn Blob>,
}

impl fmt::Debug for BuildModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildModule")
            .field("kind", &self.descriptor.kind)
            .field("module", &self.descriptor.full_name())
            .finish()
    }
}

impl BuildModule {
    /// Wraps content that is already laid out for the builder.
    pub fn new(descriptor: ModuleDescriptor, blob: Arc<dyn Blob>) -> Self {
        Self {
            descriptor: Arc::new(descriptor),
            blob,
        }
    }

    /// Reads `<kind>.toml` from the root of `blob` and re-roots its content
    /// under the module's directory on the builder.
    pub fn from_root_blob(kind: ModuleKind, blob: Arc<dyn Blob>) -> Result<Self> {
        let file = kind.descriptor_file();
        let (_, contents) = read_tar_entry(blob.open()?, &file)
            .with_context(|| format!("reading {}", file))?;
        let contents = String::from_utf8_lossy(&contents);
        let descriptor = Arc::new(ModuleDescriptor::parse(kind, &contents)?);

        let dist = DistBlob {
            descriptor: Arc::clone(&descriptor),
            root: blob,
        };
        Ok(Self {
            descriptor,
            blob: Arc::new(dist),
        })
    }

    pub fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }

    pub fn kind(&self) -> ModuleKind {
        self.descriptor.kind
    }

    pub fn full_name(&self) -> String {
        self.descriptor.full_name()
    }

    pub fn open(&self) -> Result<BlobReader> {
        self.blob.open()
    }

    /// Copies the module into `<dest_dir>/<escaped id>.<version>.tar` through a
    /// writer from `factory` and returns the path with its diff-id.
    pub fn to_layer_tar(&self, dest_dir: &Path, factory: TarWriterFactory) -> Result<(PathBuf, String)> {
        let info = &self.descriptor.info;
        let path = dest_dir.join(format!("{}.{}.tar", self.descriptor.escaped_id(), info.version));
        let reader = self.open()?;
        let diff_id = create_tar_with(&path, factory, |tw| copy_entries(reader, tw))
            .with_context(|| format!("creating layer tar for {} '{}'", self.kind(), self.full_name()))?;
        Ok((path, diff_id))
    }
}

fn copy_entries<R: Read>(reader: R, tw: &mut dyn TarWriter) -> Result<()> {
    let mut archive = tar::Archive::new(reader);
    for entry in archive.entries().context("failed to get next tar entry")? {
        let mut entry = entry.context("failed to get next tar entry")?;
        let header = read_header(&mut entry)?;
        if header.kind == EntryKind::File {
            tw.write_entry(&header, &mut entry)?;
        } else {
            tw.write_entry(&header, &mut io::empty())?;
        }
    }
    Ok(())
}

/// Root-layout module content presented in builder layout.
struct DistBlob {
    descriptor: Arc<ModuleDescriptor>,
    root: Arc<dyn Blob>,
}

impl Blob for DistBlob {
    fn open(&self) -> Result<BlobReader> {
        let root = self.root.open()?;
        let descriptor = Arc::clone(&self.descriptor);
        Ok(Box::new(generate_tar(TarWriterFactory::posix(), move |tw| {
            write_dist_entries(tw, &descriptor, root)
        })))
    }
}

fn write_dist_entries(
    tw: &mut dyn TarWriter,
    descriptor: &ModuleDescriptor,
    root: BlobReader,
) -> Result<()> {
    let parent = format!("{}/{}", descriptor.kind.dist_dir(), descriptor.escaped_id());
    let base = format!("{}/{}", parent, descriptor.info.version);
    tw.write_entry(&EntryHeader::dir(parent), &mut io::empty())?;
    tw.write_entry(&EntryHeader::dir(base.as_str()), &mut io::empty())?;

    let mut archive = tar::Archive::new(root);
    for entry in archive.entries().context("failed to get next tar entry")? {
        let mut entry = entry.context("failed to get next tar entry")?;
        let mut header = read_header(&mut entry)?;
        let name = clean_path(&header.name);
        let name = name.trim_start_matches('/');
        if name.is_empty() || name == "." {
            continue;
        }
        header.normalize(true);
        header.mode = dist_mode(&header, name);
        header.name = format!("{}/{}", base, name);

        if header.kind == EntryKind::File {
            tw.write_entry(&header, &mut entry)?;
        } else {
            tw.write_entry(&header, &mut io::empty())?;
        }
    }
    Ok(())
}

fn dist_mode(header: &EntryHeader, name: &str) -> u32 {
    if header.kind == EntryKind::Dir
        || EXECUTABLE_ENTRIES.contains(&name)
        || header.mode & 0o111 != 0
    {
        0o755
    } else {
        0o644
    }
}
