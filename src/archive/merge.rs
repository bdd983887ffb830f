use super::read::read_header;
use super::writer::{EntryKind, PosixTarWriter, TarWriter};
use crate::error::{Result, ResultExt};
use std::collections::HashSet;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Concatenates `sources` into a single archive at `dest`.
///
/// Headers are copied as they are. Directory entries already emitted by an
/// earlier source are dropped, as are nameless entries, so shared parents such
/// as `/cnb/buildpacks` appear once.
pub fn merge_tars(dest: &Path, sources: &[PathBuf]) -> Result<()> {
    let out = File::create(dest).with_context(|| format!("creating {}", dest.display()))?;
    let mut out = BufWriter::new(out);
    {
        let mut tw = PosixTarWriter::new(&mut out);
        let mut seen_dirs: HashSet<String> = HashSet::new();

        for source in sources {
            let file =
                File::open(source).with_context(|| format!("opening {}", source.display()))?;
            let mut archive = tar::Archive::new(file);
            for entry in archive
                .entries()
                .with_context(|| format!("reading {}", source.display()))?
            {
                let mut entry = entry.context("failed to get next tar entry")?;
                let header = read_header(&mut entry)?;
                if header.name.is_empty() {
                    continue;
                }
                if header.kind == EntryKind::Dir && !seen_dirs.insert(header.name.clone()) {
                    continue;
                }
                if header.kind == EntryKind::File {
                    tw.write_entry(&header, &mut entry)
                } else {
                    tw.write_entry(&header, &mut io::empty())
                }
                .with_context(|| format!("merging '{}'", header.name))?;
            }
        }
        tw.finish()?;
    }
    out.flush()?;
    Ok(())
}
