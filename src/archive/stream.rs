//! Lazily streamed tars of directories and zip files.

use super::writer::{EntryHeader, EntryKind, TarWriter, TarWriterFactory};
use crate::constants::NORMALIZED_MTIME;
use crate::error::{Error, Result, ResultExt};
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use walkdir::WalkDir;

const PIPE_DEPTH: usize = 16;
const ZIP_SYMLINK_TYPE: u32 = 0o120000;
const ZIP_TYPE_MASK: u32 = 0o170000;

pub type FileFilter = Arc<dyn Fn(&Path) -> bool + Send + Sync>;

/// How a tree is laid into an archive. `mode: None` keeps on-disk modes.
#[derive(Clone)]
pub struct StreamOptions {
    pub base_path: String,
    pub uid: u64,
    pub gid: u64,
    pub mode: Option<u32>,
    pub normalize_mod_time: bool,
    pub filter: Option<FileFilter>,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            base_path: String::new(),
            uid: 0,
            gid: 0,
            mode: None,
            normalize_mod_time: true,
            filter: None,
        }
    }
}

impl StreamOptions {
    fn tar_path(&self, rel: &str) -> String {
        let base = self.base_path.trim_end_matches('/');
        if base.is_empty() && !self.base_path.starts_with('/') {
            rel.to_string()
        } else {
            format!("{}/{}", base, rel)
        }
    }

    fn included(&self, path: &Path) -> bool {
        self.filter.as_ref().map_or(true, |f| f(path))
    }

    fn mtime(&self, on_disk: u64) -> u64 {
        if self.normalize_mod_time {
            NORMALIZED_MTIME
        } else {
            on_disk
        }
    }
}

/// Read end of an in-process pipe fed by a generator thread.
pub struct PipeReader {
    rx: Receiver<io::Result<Vec<u8>>>,
    chunk: Vec<u8>,
    pos: usize,
    done: bool,
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pos >= self.chunk.len() {
            if self.done {
                return Ok(0);
            }
            match self.rx.recv() {
                Ok(Ok(chunk)) => {
                    self.chunk = chunk;
                    self.pos = 0;
                }
                Ok(Err(e)) => {
                    self.done = true;
                    return Err(e);
                }
                Err(_) => {
                    self.done = true;
                    return Ok(0);
                }
            }
        }
        let n = buf.len().min(self.chunk.len() - self.pos);
        buf[..n].copy_from_slice(&self.chunk[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

struct PipeWriter {
    tx: SyncSender<io::Result<Vec<u8>>>,
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .send(Ok(buf.to_vec()))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "tar stream reader closed"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Runs `f` on a background thread against a fresh tar writer and returns the
/// read end of the produced archive. Failures surface as read errors.
pub fn generate_tar<F>(factory: TarWriterFactory, f: F) -> PipeReader
where
    F: FnOnce(&mut dyn TarWriter) -> Result<()> + Send + 'static,
{
    let (tx, rx) = sync_channel(PIPE_DEPTH);
    let err_tx = tx.clone();
    std::thread::spawn(move || {
        let result = {
            let mut tw = factory.new_writer(PipeWriter { tx });
            f(tw.as_mut()).and_then(|_| tw.finish().map_err(Error::from))
        };
        if let Err(e) = result {
            let _ = err_tx.send(Err(e.into()));
        }
    });
    PipeReader {
        rx,
        chunk: Vec::new(),
        pos: 0,
        done: false,
    }
}

pub fn stream_dir_as_tar(
    src_dir: impl Into<PathBuf>,
    opts: StreamOptions,
    factory: TarWriterFactory,
) -> PipeReader {
    let src_dir = src_dir.into();
    generate_tar(factory, move |tw| write_dir_to_tar(tw, &src_dir, &opts))
}

pub fn stream_zip_as_tar(
    zip_path: impl Into<PathBuf>,
    opts: StreamOptions,
    factory: TarWriterFactory,
) -> PipeReader {
    let zip_path = zip_path.into();
    generate_tar(factory, move |tw| write_zip_to_tar(tw, &zip_path, &opts))
}

#[cfg(unix)]
fn disk_mode(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn disk_mode(meta: &std::fs::Metadata) -> u32 {
    if meta.is_dir() {
        0o755
    } else if meta.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

#[cfg(unix)]
fn inode_key(meta: &std::fs::Metadata) -> Option<(u64, u64)> {
    use std::os::unix::fs::MetadataExt;
    (meta.nlink() > 1).then(|| (meta.dev(), meta.ino()))
}

#[cfg(not(unix))]
fn inode_key(_meta: &std::fs::Metadata) -> Option<(u64, u64)> {
    None
}

#[cfg(unix)]
fn is_special(file_type: &std::fs::FileType) -> bool {
    use std::os::unix::fs::FileTypeExt;
    file_type.is_socket() || file_type.is_fifo() || file_type.is_block_device() || file_type.is_char_device()
}

#[cfg(not(unix))]
fn is_special(_file_type: &std::fs::FileType) -> bool {
    false
}

/// Writes the contents of `src_dir` (not the directory itself) under `opts.base_path`.
pub fn write_dir_to_tar(tw: &mut dyn TarWriter, src_dir: &Path, opts: &StreamOptions) -> Result<()> {
    let mut hardlinks: HashMap<(u64, u64), String> = HashMap::new();

    let walker = WalkDir::new(src_dir)
        .follow_links(false)
        .sort_by_file_name()
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| opts.included(e.path()));

    for entry in walker {
        let entry = entry.map_err(io::Error::from).context("walking directory")?;
        let file_type = entry.file_type();
        if is_special(&file_type) {
            continue;
        }

        let rel = entry
            .path()
            .strip_prefix(src_dir)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?
            .to_string_lossy()
            .replace('\\', "/");
        let name = opts.tar_path(&rel);
        let meta = entry
            .path()
            .symlink_metadata()
            .with_context(|| format!("reading metadata of {}", entry.path().display()))?;
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map_or(NORMALIZED_MTIME, |d| d.as_secs());

        let mut header = if file_type.is_symlink() {
            let target = std::fs::read_link(entry.path())?;
            EntryHeader::symlink(name.clone(), target.to_string_lossy().replace('\\', "/"))
        } else if file_type.is_dir() {
            EntryHeader::dir(name.clone())
        } else {
            EntryHeader::file(name.clone(), meta.len(), 0)
        };
        header.mode = opts.mode.unwrap_or_else(|| disk_mode(&meta));
        header.uid = opts.uid;
        header.gid = opts.gid;
        header.mtime = opts.mtime(mtime);

        if header.kind == EntryKind::File {
            if let Some(key) = inode_key(&meta) {
                if let Some(first) = hardlinks.get(&key) {
                    header.kind = EntryKind::Hardlink;
                    header.size = 0;
                    header.link_name = Some(first.clone());
                    tw.write_entry(&header, &mut io::empty())?;
                    continue;
                }
                hardlinks.insert(key, name.clone());
            }
            let mut file = File::open(entry.path())
                .with_context(|| format!("opening {}", entry.path().display()))?;
            tw.write_entry(&header, &mut file)
                .with_context(|| format!("writing '{}'", name))?;
        } else {
            tw.write_entry(&header, &mut io::empty())
                .with_context(|| format!("writing '{}'", name))?;
        }
    }
    Ok(())
}

/// Writes every member of the zip at `zip_path`, sorted by name, under `opts.base_path`.
pub fn write_zip_to_tar(tw: &mut dyn TarWriter, zip_path: &Path, opts: &StreamOptions) -> Result<()> {
    let file = File::open(zip_path).with_context(|| format!("opening {}", zip_path.display()))?;
    let mut archive = zip::ZipArchive::new(file)?;

    let mut members: Vec<(String, usize)> = (0..archive.len())
        .map(|i| archive.by_index_raw(i).map(|f| (f.name().to_string(), i)))
        .collect::<std::result::Result<_, _>>()?;
    members.sort();

    for (raw_name, index) in members {
        let rel = raw_name.trim_start_matches("./").trim_end_matches('/').to_string();
        if rel.is_empty() || !opts.included(Path::new(&rel)) {
            continue;
        }
        let mut member = archive.by_index(index)?;
        let unix_mode = member.unix_mode();
        let mtime = member
            .last_modified()
            .and_then(zip_mtime)
            .unwrap_or(NORMALIZED_MTIME);
        let name = opts.tar_path(&rel);

        let is_symlink = unix_mode.is_some_and(|m| m & ZIP_TYPE_MASK == ZIP_SYMLINK_TYPE);
        let mut header = if member.is_dir() {
            EntryHeader::dir(name.clone())
        } else if is_symlink {
            let mut target = String::new();
            member.read_to_string(&mut target)?;
            EntryHeader::symlink(name.clone(), target)
        } else {
            EntryHeader::file(name.clone(), member.size(), 0)
        };
        // zips written on MS-DOS/FAT carry no unix mode
        let on_disk = unix_mode.map_or(0o777, |m| m & 0o7777);
        header.mode = opts.mode.unwrap_or(on_disk);
        header.uid = opts.uid;
        header.gid = opts.gid;
        header.mtime = opts.mtime(mtime);

        if header.kind == EntryKind::File {
            tw.write_entry(&header, &mut member)
        } else {
            tw.write_entry(&header, &mut io::empty())
        }
        .with_context(|| format!("writing '{}'", name))?;
    }
    Ok(())
}

fn zip_mtime(dt: zip::DateTime) -> Option<u64> {
    let date = chrono::NaiveDate::from_ymd_opt(dt.year().into(), dt.month().into(), dt.day().into())?;
    let time = date.and_hms_opt(dt.hour().into(), dt.minute().into(), dt.second().into())?;
    u64::try_from(time.and_utc().timestamp()).ok()
}
