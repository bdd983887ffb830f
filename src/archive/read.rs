use super::writer::EntryHeader;
use crate::error::{Error, Result, ResultExt};
use regex::Regex;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

const ZIP_MAGIC: [u8; 4] = [b'P', b'K', 0x03, 0x04];
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Lexical path cleaning: drops empty and `.` segments and resolves `..`.
pub fn clean_path(name: &str) -> String {
    let absolute = name.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for segment in name.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if parts.last().is_some_and(|p| *p != "..") {
                    parts.pop();
                } else if !absolute {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }
    let joined = parts.join("/");
    match (absolute, joined.is_empty()) {
        (true, _) => format!("/{}", joined),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}

fn entry_name(entry: &tar::Entry<'_, impl Read>) -> String {
    String::from_utf8_lossy(&entry.path_bytes()).to_string()
}

fn entry_link_name(entry: &tar::Entry<'_, impl Read>) -> Option<String> {
    entry
        .link_name_bytes()
        .map(|b| String::from_utf8_lossy(&b).to_string())
}

/// Header of `entry` as an `EntryHeader`, keeping Windows PAX ownership records.
pub(crate) fn read_header(entry: &mut tar::Entry<'_, impl Read>) -> Result<EntryHeader> {
    let mut header = EntryHeader::from_tar(entry.header(), entry_name(entry), entry_link_name(entry));
    if let Some(extensions) = entry.pax_extensions()? {
        for ext in extensions {
            let ext = ext?;
            if ext.key_bytes().starts_with(b"MSWINDOWS.") {
                let key = String::from_utf8_lossy(ext.key_bytes()).to_string();
                header.pax.push((key, ext.value_bytes().to_vec()));
            }
        }
    }
    Ok(header)
}

/// Finds `entry_path` (stored either as `path` or `./path`) and returns its header and contents.
pub fn read_tar_entry<R: Read>(reader: R, entry_path: &str) -> Result<(EntryHeader, Vec<u8>)> {
    let mut archive = tar::Archive::new(reader);
    let dotted = format!("./{}", entry_path);
    for entry in archive.entries().context("failed to get next tar entry")? {
        let mut entry = entry.context("failed to get next tar entry")?;
        let name = entry_name(&entry);
        if name == entry_path || name == dotted {
            let header = read_header(&mut entry)?;
            let mut buf = Vec::with_capacity(header.size as usize);
            entry
                .read_to_end(&mut buf)
                .with_context(|| format!("failed to read contents of '{}'", entry_path))?;
            return Ok((header, buf));
        }
    }
    Err(Error::EntryNotExist(entry_path.to_string()))
}

/// Every entry whose cleaned name matches `pattern`, keyed by that cleaned name.
pub fn read_matching_tar_entries<R: Read>(
    reader: R,
    pattern: &Regex,
) -> Result<BTreeMap<String, Vec<u8>>> {
    let mut archive = tar::Archive::new(reader);
    let mut found = BTreeMap::new();
    for entry in archive.entries().context("failed to get next tar entry")? {
        let mut entry = entry.context("failed to get next tar entry")?;
        let name = clean_path(&entry_name(&entry));
        if !pattern.is_match(&name) {
            continue;
        }
        let mut buf = Vec::new();
        entry
            .read_to_end(&mut buf)
            .with_context(|| format!("failed to read contents of '{}'", name))?;
        found.insert(name, buf);
    }
    Ok(found)
}

fn has_magic(path: &Path, magic: &[u8]) -> Result<bool> {
    let mut file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut buf = vec![0u8; magic.len()];
    let mut read = 0;
    while read < buf.len() {
        match file.read(&mut buf[read..])? {
            0 => return Ok(false),
            n => read += n,
        }
    }
    Ok(buf == magic)
}

pub fn is_zip(path: &Path) -> Result<bool> {
    has_magic(path, &ZIP_MAGIC)
}

pub fn is_gzip(path: &Path) -> Result<bool> {
    has_magic(path, &GZIP_MAGIC)
}
