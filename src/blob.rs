//! Re-openable byte sources.

use crate::archive::{is_gzip, is_zip, stream_dir_as_tar, stream_zip_as_tar, StreamOptions, TarWriterFactory};
use crate::error::{Result, ResultExt};
use flate2::read::GzDecoder;
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub type BlobReader = Box<dyn Read + Send>;

/// A byte source where every `open` starts a fresh stream at offset 0.
pub trait Blob: Send + Sync {
    fn open(&self) -> Result<BlobReader>;

    /// Byte length of what `open` yields. The default drains one stream.
    fn size(&self) -> Result<u64> {
        let mut reader = self.open()?;
        Ok(io::copy(&mut reader, &mut io::sink())?)
    }
}

impl fmt::Debug for dyn Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Blob")
    }
}

/// File or directory on disk.
///
/// Non-raw blobs present their content as an uncompressed tar: directories and
/// zips are streamed, gzip files are decompressed and anything else is passed
/// through. Raw blobs always yield the file bytes unchanged.
#[derive(Debug, Clone)]
pub struct FileBlob {
    path: PathBuf,
    raw: bool,
}

impl FileBlob {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            raw: false,
        }
    }

    pub fn raw(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            raw: true,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_raw(&self) -> bool {
        self.raw
    }
}

impl Blob for FileBlob {
    fn open(&self) -> Result<BlobReader> {
        if self.raw {
            let file = File::open(&self.path)
                .with_context(|| format!("opening blob {}", self.path.display()))?;
            return Ok(Box::new(BufReader::new(file)));
        }

        if self.path.is_dir() {
            let opts = StreamOptions {
                base_path: ".".to_string(),
                ..Default::default()
            };
            return Ok(Box::new(stream_dir_as_tar(
                &self.path,
                opts,
                TarWriterFactory::posix(),
            )));
        }

        if is_gzip(&self.path)? {
            let file = File::open(&self.path)
                .with_context(|| format!("opening blob {}", self.path.display()))?;
            return Ok(Box::new(GzDecoder::new(BufReader::new(file))));
        }

        if is_zip(&self.path)? {
            let opts = StreamOptions {
                base_path: "/".to_string(),
                normalize_mod_time: false,
                ..Default::default()
            };
            return Ok(Box::new(stream_zip_as_tar(
                &self.path,
                opts,
                TarWriterFactory::posix(),
            )));
        }

        let file = File::open(&self.path)
            .with_context(|| format!("opening blob {}", self.path.display()))?;
        Ok(Box::new(BufReader::new(file)))
    }

    fn size(&self) -> Result<u64> {
        if self.raw {
            let meta = std::fs::metadata(&self.path)
                .with_context(|| format!("reading size of {}", self.path.display()))?;
            return Ok(meta.len());
        }
        let mut reader = self.open()?;
        Ok(io::copy(&mut reader, &mut io::sink())?)
    }
}

/// In-memory blob; clones share the buffer.
#[derive(Debug, Clone, Default)]
pub struct BytesBlob {
    data: Arc<Vec<u8>>,
}

impl BytesBlob {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: Arc::new(data.into()),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }
}

struct SharedBytes {
    data: Arc<Vec<u8>>,
    pos: usize,
}

impl Read for SharedBytes {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let rest = &self.data[self.pos.min(self.data.len())..];
        let n = rest.len().min(buf.len());
        buf[..n].copy_from_slice(&rest[..n]);
        self.pos += n;
        Ok(n)
    }
}

impl Blob for BytesBlob {
    fn open(&self) -> Result<BlobReader> {
        Ok(Box::new(SharedBytes {
            data: Arc::clone(&self.data),
            pos: 0,
        }))
    }

    fn size(&self) -> Result<u64> {
        Ok(self.data.len() as u64)
    }
}

/// Reads a blob fully into memory.
pub fn read_all(blob: &dyn Blob) -> Result<Vec<u8>> {
    let mut reader = blob.open()?;
    let mut out = Vec::new();
    reader.read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::read_tar_entry;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    #[test]
    fn test_bytes_blob_reopens_from_start() {
        let blob = BytesBlob::new(b"some contents".to_vec());
        assert_eq!(read_all(&blob).unwrap(), b"some contents");
        assert_eq!(read_all(&blob).unwrap(), b"some contents");
        assert_eq!(blob.size().unwrap(), 13);
    }

    #[test]
    fn test_raw_file_blob_passes_bytes_through() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.tgz");
        let mut gz = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
        gz.write_all(b"inner").unwrap();
        gz.finish().unwrap();

        let raw = FileBlob::raw(&path);
        let on_disk = std::fs::read(&path).unwrap();
        assert_eq!(read_all(&raw).unwrap(), on_disk);
        assert_eq!(raw.size().unwrap(), on_disk.len() as u64);

        let decoded = FileBlob::new(&path);
        assert_eq!(read_all(&decoded).unwrap(), b"inner");
    }

    #[test]
    fn test_dir_blob_opens_as_tar() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("buildpack.toml"), "[buildpack]\nid = \"bp\"").unwrap();

        let blob = FileBlob::new(dir.path());
        let (_, contents) = read_tar_entry(blob.open().unwrap(), "buildpack.toml").unwrap();
        assert_eq!(contents, b"[buildpack]\nid = \"bp\"");
        assert_eq!(read_all(&blob).unwrap(), read_all(&blob).unwrap());
    }
}
