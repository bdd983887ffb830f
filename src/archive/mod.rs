pub mod merge;
pub mod read;
pub mod stream;
pub mod writer;

pub use merge::merge_tars;
pub use read::{clean_path, is_gzip, is_zip, read_matching_tar_entries, read_tar_entry};
pub use stream::{
    generate_tar, stream_dir_as_tar, stream_zip_as_tar, write_dir_to_tar, write_zip_to_tar,
    FileFilter, PipeReader, StreamOptions,
};
pub use writer::{EntryHeader, EntryKind, TarWriter, TarWriterFactory, TargetOs};

use crate::error::{Result, ResultExt};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::Path;

pub fn sha256_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Tee writer: everything written is hashed on the way through.
pub struct HashingWriter<W: Write> {
    inner: W,
    hasher: Sha256,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    /// `sha256:<hex>` of the bytes written so far.
    pub fn diff_id(&self) -> String {
        format!("sha256:{}", hex::encode(self.hasher.clone().finalize()))
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// `sha256:<hex>` of an uncompressed stream.
pub fn diff_id_of<R: Read>(mut reader: R) -> Result<String> {
    let mut hasher = Sha256::new();
    io::copy(&mut reader, &mut hasher)?;
    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}

/// Diff-id of an uncompressed layer tar on disk.
pub fn layer_diff_id(tar_path: &Path) -> Result<String> {
    let file =
        File::open(tar_path).with_context(|| format!("opening layer {}", tar_path.display()))?;
    diff_id_of(file).with_context(|| format!("hashing layer {}", tar_path.display()))
}

/// Writes a tar holding one regular file, returning its diff-id.
pub fn create_single_file_tar(
    dest: &Path,
    path_in_tar: &str,
    contents: &[u8],
    factory: TarWriterFactory,
) -> Result<String> {
    create_tar_with(dest, factory, |tw| {
        let header = EntryHeader::file(path_in_tar, contents.len() as u64, 0o644);
        tw.write_entry(&header, &mut &contents[..])?;
        Ok(())
    })
}

/// Creates `dest`, lets `f` populate it through a writer from `factory` and
/// returns the diff-id computed while writing.
pub fn create_tar_with<F>(dest: &Path, factory: TarWriterFactory, f: F) -> Result<String>
where
    F: FnOnce(&mut dyn TarWriter) -> Result<()>,
{
    let file = File::create(dest).with_context(|| format!("creating {}", dest.display()))?;
    let mut hashing = HashingWriter::new(BufWriter::new(file));
    {
        let mut tw = factory.new_writer(&mut hashing);
        f(tw.as_mut())?;
        tw.finish()?;
    }
    hashing.flush()?;
    Ok(hashing.diff_id())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hashing_writer_matches_layer_diff_id() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("single.tar");
        let diff_id =
            create_single_file_tar(&dest, "/cnb/order.toml", b"[[order]]\n", TarWriterFactory::posix())
                .unwrap();
        assert!(diff_id.starts_with("sha256:"));
        assert_eq!(diff_id, layer_diff_id(&dest).unwrap());
    }

    #[test]
    fn test_sha256_bytes() {
        assert_eq!(
            sha256_bytes(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_single_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("asset.tar");
        create_single_file_tar(&dest, "/cnb/assets/abc", b"payload", TarWriterFactory::posix())
            .unwrap();
        let (_, contents) = read_tar_entry(File::open(&dest).unwrap(), "/cnb/assets/abc").unwrap();
        assert_eq!(contents, b"payload");
    }
}
