//! Filesystem path <-> `file://` URI conversion and locator classification.

use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PathStyle {
    Posix,
    Windows,
}

#[cfg(windows)]
const HOST_STYLE: PathStyle = PathStyle::Windows;
#[cfg(not(windows))]
const HOST_STYLE: PathStyle = PathStyle::Posix;

fn uri_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z][A-Za-z0-9+.\-]*://.*$").expect("static regex"))
}

/// Docker-style reference: `[host[:port]/]path[:tag][@digest]`.
fn image_ref_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        let component = r"[a-z0-9]+(?:(?:[._]|__|[-]*)[a-z0-9]+)*";
        let domain = r"(?:[a-zA-Z0-9](?:[a-zA-Z0-9-]*[a-zA-Z0-9])?)(?:\.(?:[a-zA-Z0-9](?:[a-zA-Z0-9-]*[a-zA-Z0-9])?))*(?::[0-9]+)?";
        let tag = r"[\w][\w.-]{0,127}";
        let digest = r"[A-Za-z][A-Za-z0-9]*(?:[-_+.][A-Za-z][A-Za-z0-9]*)*:[0-9a-fA-F]{32,}";
        let pattern = format!(
            r"^(?:{domain}/)?{component}(?:/{component})*(?::{tag})?(?:@{digest})?$"
        );
        Regex::new(&pattern).expect("static regex")
    })
}

pub fn is_uri(s: &str) -> bool {
    uri_regex().is_match(s)
}

pub fn scheme(uri: &str) -> Option<&str> {
    uri.split_once("://").map(|(scheme, _)| scheme)
}

pub fn is_dir(path: &Path) -> bool {
    path.is_dir()
}

/// Absolute form of `path`, resolved against `relative_to` (or the working directory).
pub fn absolutize(path: &Path, relative_to: &Path) -> std::io::Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let base = if relative_to.as_os_str().is_empty() {
        std::env::current_dir()?
    } else if relative_to.is_absolute() {
        relative_to.to_path_buf()
    } else {
        std::env::current_dir()?.join(relative_to)
    };
    Ok(base.join(path))
}

pub fn file_path_to_uri(path: &Path, relative_to: &Path) -> std::io::Result<String> {
    let abs = absolutize(path, relative_to)?;
    Ok(path_to_uri(&abs.to_string_lossy(), HOST_STYLE))
}

fn path_to_uri(abs: &str, style: PathStyle) -> String {
    match style {
        PathStyle::Posix => format!("file://{}", escape_path(abs)),
        PathStyle::Windows => {
            let slashed = abs.replace('\\', "/");
            match slashed.strip_prefix("//") {
                // UNC share: \\host\share\x -> file://host/share/x
                Some(unc) => format!("file://{}", escape_path(unc)),
                None => format!("file:///{}", escape_path(&slashed)),
            }
        }
    }
}

pub fn uri_to_file_path(uri: &str) -> String {
    uri_to_path(uri, HOST_STYLE)
}

fn uri_to_path(uri: &str, style: PathStyle) -> String {
    let raw = uri.strip_prefix("file://").unwrap_or(uri);
    let unescaped = unescape_path(raw);
    match style {
        PathStyle::Posix => unescaped,
        PathStyle::Windows => {
            let native = unescaped.replace('/', "\\");
            match native.strip_prefix('\\') {
                Some(drive) => drive.to_string(),
                None => format!("\\\\{}", native),
            }
        }
    }
}

fn escape_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for b in path.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' | b'/' | b':' => {
                out.push(b as char)
            }
            other => out.push_str(&format!("%{:02X}", other)),
        }
    }
    out
}

fn unescape_path(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).unwrap_or("");
            if let Ok(v) = u8::from_str_radix(hex, 16) {
                out.push(v);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).to_string()
}

pub fn is_image_reference(s: &str) -> bool {
    !s.is_empty() && image_ref_regex().is_match(s)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocatorType {
    Uri,
    FilePath,
    Image,
    Invalid,
}

/// URI first, then an existing local file, then an image reference.
pub fn classify_locator(s: &str, relative_to: &Path) -> LocatorType {
    if is_uri(s) {
        return LocatorType::Uri;
    }
    if let Ok(abs) = absolutize(Path::new(s), relative_to) {
        if abs.is_file() {
            return LocatorType::FilePath;
        }
    }
    if is_image_reference(s) {
        return LocatorType::Image;
    }
    LocatorType::Invalid
}
