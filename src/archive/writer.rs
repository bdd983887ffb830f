//! OS-tuned tar writers.
//!
//! Entry names are written verbatim (absolute `/cnb/...` names included), so the
//! header name field is filled by hand and PAX records carry anything longer.

use crate::constants::NORMALIZED_MTIME;
use crate::error::{Error, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::collections::HashSet;
use std::fmt;
use std::io::{self, Read, Write};
use std::str::FromStr;

const NAME_FIELD_LEN: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
    Hardlink,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryHeader {
    pub name: String,
    pub kind: EntryKind,
    pub mode: u32,
    pub uid: u64,
    pub gid: u64,
    pub size: u64,
    pub mtime: u64,
    pub link_name: Option<String>,
    /// Extra PAX records carried through verbatim (e.g. `MSWINDOWS.rawsd`)
    pub pax: Vec<(String, Vec<u8>)>,
}

impl EntryHeader {
    pub fn dir(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: EntryKind::Dir,
            mode: 0o755,
            uid: 0,
            gid: 0,
            size: 0,
            mtime: NORMALIZED_MTIME,
            link_name: None,
            pax: Vec::new(),
        }
    }

    pub fn file(name: impl Into<String>, size: u64, mode: u32) -> Self {
        Self {
            kind: EntryKind::File,
            size,
            mode,
            ..Self::dir(name)
        }
    }

    pub fn symlink(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            kind: EntryKind::Symlink,
            mode: 0o777,
            link_name: Some(target.into()),
            ..Self::dir(name)
        }
    }

    pub fn with_owner(mut self, uid: u64, gid: u64) -> Self {
        self.uid = uid;
        self.gid = gid;
        self
    }

    /// Root ownership, no user/group names and optionally the fixed mod time.
    pub fn normalize(&mut self, normalize_mtime: bool) {
        self.uid = 0;
        self.gid = 0;
        if normalize_mtime {
            self.mtime = NORMALIZED_MTIME;
        }
    }

    /// Build from a header read back out of an archive. `name` is the resolved
    /// entry path (PAX/GNU long names already applied).
    pub fn from_tar(header: &tar::Header, name: String, link_name: Option<String>) -> Self {
        let kind = match header.entry_type() {
            tar::EntryType::Directory => EntryKind::Dir,
            tar::EntryType::Symlink => EntryKind::Symlink,
            tar::EntryType::Link => EntryKind::Hardlink,
            _ => EntryKind::File,
        };
        Self {
            name,
            kind,
            mode: header.mode().unwrap_or(0o644),
            uid: header.uid().unwrap_or(0),
            gid: header.gid().unwrap_or(0),
            size: if kind == EntryKind::File {
                header.size().unwrap_or(0)
            } else {
                0
            },
            mtime: header.mtime().unwrap_or(NORMALIZED_MTIME),
            link_name,
            pax: Vec::new(),
        }
    }
}

/// Sink for tar entries; `finish` writes the archive trailer.
pub trait TarWriter: Send {
    fn write_entry(&mut self, header: &EntryHeader, data: &mut dyn Read) -> io::Result<()>;
    fn finish(&mut self) -> io::Result<()>;
}

/// Writes `header` under `name` with the fields taken verbatim.
fn append_raw<W: Write>(
    builder: &mut tar::Builder<W>,
    entry: &EntryHeader,
    name: &str,
    data: &mut dyn Read,
) -> io::Result<()> {
    let mut header = tar::Header::new_ustar();
    header.set_entry_type(match entry.kind {
        EntryKind::File => tar::EntryType::Regular,
        EntryKind::Dir => tar::EntryType::Directory,
        EntryKind::Symlink => tar::EntryType::Symlink,
        EntryKind::Hardlink => tar::EntryType::Link,
    });
    header.set_mode(entry.mode);
    header.set_uid(entry.uid);
    header.set_gid(entry.gid);
    header.set_mtime(entry.mtime);
    let size = if entry.kind == EntryKind::File {
        entry.size
    } else {
        0
    };
    header.set_size(size);

    let mut pax: Vec<(String, Vec<u8>)> = entry.pax.clone();
    if !set_name_field(&mut header, name) {
        pax.push(("path".to_string(), name.as_bytes().to_vec()));
        set_name_field(&mut header, truncate(name));
    }
    if let Some(link) = &entry.link_name {
        if link.len() <= NAME_FIELD_LEN {
            header.set_link_name(link)?;
        } else {
            pax.push(("linkpath".to_string(), link.as_bytes().to_vec()));
            header.set_link_name(truncate(link))?;
        }
    }
    if !pax.is_empty() {
        builder.append_pax_extensions(pax.iter().map(|(k, v)| (k.as_str(), v.as_slice())))?;
    }
    header.set_cksum();

    let mut exact = ExactReader {
        inner: data,
        remaining: size,
    };
    builder.append(&header, &mut exact)
}

/// Yields exactly `remaining` bytes, failing if the source ends early.
struct ExactReader<'a> {
    inner: &'a mut dyn Read,
    remaining: u64,
}

impl Read for ExactReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let max = buf.len().min(self.remaining.min(usize::MAX as u64) as usize);
        let n = self.inner.read(&mut buf[..max])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("entry data ended {} bytes short", self.remaining),
            ));
        }
        self.remaining -= n as u64;
        Ok(n)
    }
}

fn set_name_field(header: &mut tar::Header, name: &str) -> bool {
    let field = &mut header.as_old_mut().name;
    let bytes = name.as_bytes();
    if bytes.len() > field.len() {
        return false;
    }
    field.fill(0);
    field[..bytes.len()].copy_from_slice(bytes);
    true
}

fn truncate(name: &str) -> &str {
    let mut end = NAME_FIELD_LEN.min(name.len());
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

/// Plain POSIX writer.
pub struct PosixTarWriter<W: Write> {
    builder: tar::Builder<W>,
}

impl<W: Write> PosixTarWriter<W> {
    pub fn new(w: W) -> Self {
        Self {
            builder: tar::Builder::new(w),
        }
    }
}

impl<W: Write + Send> TarWriter for PosixTarWriter<W> {
    fn write_entry(&mut self, header: &EntryHeader, data: &mut dyn Read) -> io::Result<()> {
        append_raw(&mut self.builder, header, &header.name, data)
    }

    fn finish(&mut self) -> io::Result<()> {
        self.builder.finish()
    }
}

const WINDOWS_ADMINISTRATORS_RID: u32 = 544;
const WINDOWS_USERS_RID: u32 = 545;

/// Windows layer writer: every path lives under `Files/`, a `Hives` dir is
/// present, parents are created once and ownership is carried as a raw
/// security descriptor.
pub struct WindowsTarWriter<W: Write> {
    builder: tar::Builder<W>,
    initialized: bool,
    written_dirs: HashSet<String>,
}

impl<W: Write> WindowsTarWriter<W> {
    pub fn new(w: W) -> Self {
        Self {
            builder: tar::Builder::new(w),
            initialized: false,
            written_dirs: HashSet::new(),
        }
    }

    fn initialize(&mut self) -> io::Result<()> {
        if self.initialized {
            return Ok(());
        }
        self.initialized = true;
        for dir in ["Files", "Hives"] {
            append_raw(&mut self.builder, &EntryHeader::dir(dir), dir, &mut io::empty())?;
            self.written_dirs.insert(dir.to_string());
        }
        Ok(())
    }

    fn write_parents(&mut self, name: &str) -> io::Result<()> {
        let mut parent = String::new();
        let segments: Vec<&str> = name.split('/').collect();
        for segment in &segments[..segments.len().saturating_sub(1)] {
            if !parent.is_empty() {
                parent.push('/');
            }
            parent.push_str(segment);
            if self.written_dirs.insert(parent.clone()) {
                let mut header = EntryHeader::dir(parent.clone());
                header.pax.push(rawsd_record(0, 0));
                append_raw(&mut self.builder, &header, &parent, &mut io::empty())?;
            }
        }
        Ok(())
    }
}

/// `Files/` + name with any leading `/`, `./` or backslashes normalized.
pub fn windows_layer_path(name: &str) -> String {
    let slashed = name.replace('\\', "/");
    let trimmed = slashed.trim_start_matches("./").trim_start_matches('/');
    if trimmed.is_empty() {
        "Files".to_string()
    } else {
        format!("Files/{}", trimmed.trim_end_matches('/'))
    }
}

impl<W: Write + Send> TarWriter for WindowsTarWriter<W> {
    fn write_entry(&mut self, header: &EntryHeader, data: &mut dyn Read) -> io::Result<()> {
        self.initialize()?;
        if !matches!(header.kind, EntryKind::File | EntryKind::Dir) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "invalid header type for '{}': must be either directory or regular file",
                    header.name
                ),
            ));
        }

        let name = windows_layer_path(&header.name);
        self.write_parents(&name)?;
        if header.kind == EntryKind::Dir && !self.written_dirs.insert(name.clone()) {
            return Ok(());
        }

        let mut entry = header.clone();
        entry.name = name.clone();
        entry.pax.push(rawsd_record(header.uid, header.gid));
        append_raw(&mut self.builder, &entry, &name, data)
    }

    fn finish(&mut self) -> io::Result<()> {
        self.initialize()?;
        self.builder.finish()
    }
}

fn rawsd_record(uid: u64, gid: u64) -> (String, Vec<u8>) {
    let rid = if uid == 0 && gid == 0 {
        WINDOWS_ADMINISTRATORS_RID
    } else {
        WINDOWS_USERS_RID
    };
    (
        "MSWINDOWS.rawsd".to_string(),
        STANDARD.encode(security_descriptor(rid)).into_bytes(),
    )
}

/// Self-relative security descriptor with owner and group BUILTIN\<rid>.
fn security_descriptor(rid: u32) -> Vec<u8> {
    let sid = builtin_sid(rid);
    let owner_offset: u32 = 20;
    let group_offset = owner_offset + sid.len() as u32;

    let mut sd = Vec::with_capacity(20 + sid.len() * 2);
    sd.push(1); // revision
    sd.push(0);
    sd.extend_from_slice(&0x8000u16.to_le_bytes()); // SE_SELF_RELATIVE
    sd.extend_from_slice(&owner_offset.to_le_bytes());
    sd.extend_from_slice(&group_offset.to_le_bytes());
    sd.extend_from_slice(&0u32.to_le_bytes());
    sd.extend_from_slice(&0u32.to_le_bytes());
    sd.extend_from_slice(&sid);
    sd.extend_from_slice(&sid);
    sd
}

/// S-1-5-32-<rid>
fn builtin_sid(rid: u32) -> Vec<u8> {
    let mut sid = vec![1, 2, 0, 0, 0, 0, 0, 5];
    sid.extend_from_slice(&32u32.to_le_bytes());
    sid.extend_from_slice(&rid.to_le_bytes());
    sid
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TargetOs {
    #[default]
    Linux,
    Windows,
}

impl FromStr for TargetOs {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "linux" => Ok(TargetOs::Linux),
            "windows" => Ok(TargetOs::Windows),
            other => Err(Error::UnsupportedOs(other.to_string())),
        }
    }
}

impl fmt::Display for TargetOs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetOs::Linux => write!(f, "linux"),
            TargetOs::Windows => write!(f, "windows"),
        }
    }
}

/// Hands out the tar writer matching the image OS.
#[derive(Debug, Clone, Copy, Default)]
pub struct TarWriterFactory {
    os: TargetOs,
}

impl TarWriterFactory {
    pub fn new(os: &str) -> Result<Self> {
        Ok(Self { os: os.parse()? })
    }

    pub fn posix() -> Self {
        Self {
            os: TargetOs::Linux,
        }
    }

    pub fn os(&self) -> TargetOs {
        self.os
    }

    pub fn new_writer<'a, W: Write + Send + 'a>(&self, w: W) -> Box<dyn TarWriter + 'a> {
        match self.os {
            TargetOs::Linux => Box::new(PosixTarWriter::new(w)),
            TargetOs::Windows => Box::new(WindowsTarWriter::new(w)),
        }
    }
}
