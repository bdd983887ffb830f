use cnbkit::archive::{
    create_tar_with, diff_id_of, layer_diff_id, merge_tars, read_matching_tar_entries,
    read_tar_entry, stream_dir_as_tar, EntryHeader, EntryKind, StreamOptions, TarWriterFactory,
};
use cnbkit::constants::NORMALIZED_MTIME;
use regex::Regex;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::Path;
use tempfile::tempdir;

fn populate(dir: &Path) {
    fs::create_dir_all(dir.join("bin")).unwrap();
    fs::write(dir.join("buildpack.toml"), "api = \"0.8\"").unwrap();
    fs::write(dir.join("bin/detect"), "#!/bin/sh").unwrap();
    fs::write(dir.join("bin/build"), "#!/bin/sh").unwrap();
}

fn read_stream(dir: &Path, opts: StreamOptions) -> Vec<u8> {
    let mut out = Vec::new();
    stream_dir_as_tar(dir, opts, TarWriterFactory::posix())
        .read_to_end(&mut out)
        .unwrap();
    out
}

#[test]
fn test_directory_stream_is_deterministic() {
    let a = tempdir().unwrap();
    let b = tempdir().unwrap();
    populate(a.path());
    populate(b.path());

    let opts = StreamOptions {
        base_path: "/cnb/buildpacks/bp".to_string(),
        mode: Some(0o755),
        ..Default::default()
    };
    let first = read_stream(a.path(), opts.clone());
    let second = read_stream(b.path(), opts);
    assert_eq!(diff_id_of(&first[..]).unwrap(), diff_id_of(&second[..]).unwrap());

    let (header, contents) = read_tar_entry(&first[..], "/cnb/buildpacks/bp/bin/build").unwrap();
    assert_eq!(header.mtime, NORMALIZED_MTIME);
    assert_eq!(header.mode, 0o755);
    assert_eq!(contents, b"#!/bin/sh");
}

#[test]
fn test_stream_entries_are_sorted() {
    let dir = tempdir().unwrap();
    populate(dir.path());
    let bytes = read_stream(dir.path(), StreamOptions::default());

    let mut archive = tar::Archive::new(&bytes[..]);
    let names: Vec<String> = archive
        .entries()
        .unwrap()
        .map(|e| String::from_utf8_lossy(&e.unwrap().path_bytes()).to_string())
        .collect();
    assert_eq!(names, ["bin", "bin/build", "bin/detect", "buildpack.toml"]);
}

#[test]
fn test_merge_drops_repeated_directories() {
    let dir = tempdir().unwrap();
    let factory = TarWriterFactory::posix();
    let mut sources = Vec::new();
    for name in ["a", "b"] {
        let path = dir.path().join(format!("{}.tar", name));
        create_tar_with(&path, factory, |tw| {
            tw.write_entry(&EntryHeader::dir("/cnb"), &mut io::empty())?;
            tw.write_entry(&EntryHeader::dir("/cnb/buildpacks"), &mut io::empty())?;
            let body = format!("{} contents", name);
            let header = EntryHeader::file(format!("/cnb/buildpacks/{}", name), body.len() as u64, 0o644);
            tw.write_entry(&header, &mut body.as_bytes())?;
            Ok(())
        })
        .unwrap();
        sources.push(path);
    }

    let merged = dir.path().join("merged.tar");
    merge_tars(&merged, &sources).unwrap();

    let mut archive = tar::Archive::new(File::open(&merged).unwrap());
    let names: Vec<String> = archive
        .entries()
        .unwrap()
        .map(|e| String::from_utf8_lossy(&e.unwrap().path_bytes()).to_string())
        .collect();
    assert_eq!(
        names,
        ["/cnb", "/cnb/buildpacks", "/cnb/buildpacks/a", "/cnb/buildpacks/b"]
    );

    let pattern = Regex::new(r"^/cnb/buildpacks/[ab]$").unwrap();
    let files = read_matching_tar_entries(File::open(&merged).unwrap(), &pattern).unwrap();
    assert_eq!(files["/cnb/buildpacks/b"], b"b contents");

    // same inputs, same layer
    let again = dir.path().join("again.tar");
    merge_tars(&again, &sources).unwrap();
    assert_eq!(layer_diff_id(&merged).unwrap(), layer_diff_id(&again).unwrap());
}

#[test]
fn test_windows_writer_layout() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("windows.tar");
    let factory = TarWriterFactory::new("windows").unwrap();
    create_tar_with(&path, factory, |tw| {
        let header = EntryHeader::file("/cnb/order.toml", 2, 0o644);
        tw.write_entry(&header, &mut &b"[]"[..])?;
        Ok(())
    })
    .unwrap();

    let (hives, _) = read_tar_entry(File::open(&path).unwrap(), "Hives").unwrap();
    assert_eq!(hives.kind, EntryKind::Dir);
    let (cnb, _) = read_tar_entry(File::open(&path).unwrap(), "Files/cnb").unwrap();
    assert_eq!(cnb.kind, EntryKind::Dir);
    let (_, order) = read_tar_entry(File::open(&path).unwrap(), "Files/cnb/order.toml").unwrap();
    assert_eq!(order, b"[]");

    let err = create_tar_with(&dir.path().join("link.tar"), factory, |tw| {
        tw.write_entry(&EntryHeader::symlink("/a", "/b"), &mut io::empty())?;
        Ok(())
    })
    .unwrap_err();
    assert!(err.to_string().contains("must be either directory or regular file"));
}
