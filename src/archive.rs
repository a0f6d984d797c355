//! Deterministic packing and unpacking of directory trees.
//!
//! Archives are plain tar entry streams. Entries are emitted in
//! lexicographic order of their unix-slash relative paths and carry fixed
//! ownership, so packing the same tree twice yields byte-identical
//! archives and stable content hashes.

use crate::{
    error::{CacheError, Result},
    utils,
};
use std::{
    collections::BTreeSet,
    fs,
    io::{BufReader, BufWriter},
    path::Path,
    time::UNIX_EPOCH,
};
use walkdir::WalkDir;

/// Mode recorded for files with any user-execute bit set on the source.
const MODE_EXECUTABLE: u32 = 0o755;
/// Mode recorded for all other files.
const MODE_REGULAR: u32 = 0o644;

/// Packs the files under `src_dir` matching `glob` into `dst_file`.
///
/// Returns `true` iff at least one file matched; no archive is written
/// otherwise. With `preserve_permissions` only executability is recorded:
/// any user-execute bit on the source maps to `0755`, everything else to
/// `0644`. Without `preserve_timestamps` every entry carries the epoch,
/// keeping archives hash-stable across runs.
pub fn pack(
    src_dir: &Path,
    dst_file: &Path,
    glob: Option<&str>,
    preserve_permissions: bool,
    preserve_timestamps: bool,
) -> Result<bool> {
    let pattern = glob
        .map(glob::Pattern::new)
        .transpose()
        .map_err(|err| CacheError::config(format!("invalid archive glob: {err}")))?;

    // Relative unix paths of matched files, and of every directory on the
    // way to one. BTreeSet gives the lexicographic entry order.
    let mut files = BTreeSet::new();
    let mut dirs = BTreeSet::new();
    for entry in WalkDir::new(src_dir).follow_links(false) {
        let entry = entry.map_err(|err| {
            CacheError::io(err.into_io_error().unwrap_or_else(|| io_other("walk failed")), src_dir)
        })?;
        let rel = match entry.path().strip_prefix(src_dir) {
            Ok(rel) if !rel.as_os_str().is_empty() => utils::to_unix_string(rel),
            _ => continue,
        };
        if entry.file_type().is_dir() {
            if pattern.is_none() {
                dirs.insert(rel);
            }
        } else if entry.file_type().is_file() {
            if pattern.as_ref().map_or(true, |p| p.matches(&rel)) {
                if pattern.is_some() {
                    let mut ancestor = Path::new(&rel).parent();
                    while let Some(dir) = ancestor.filter(|d| !d.as_os_str().is_empty()) {
                        dirs.insert(utils::to_unix_string(dir));
                        ancestor = dir.parent();
                    }
                }
                files.insert(rel);
            }
        }
    }

    if files.is_empty() {
        trace!(src = %src_dir.display(), "nothing matched, skipping archive");
        return Ok(false);
    }

    utils::create_parent_dir_all(dst_file)?;
    let out = fs::File::create(dst_file).map_err(|err| CacheError::io(err, dst_file))?;
    let mut builder = tar::Builder::new(BufWriter::new(out));

    let mut entries: Vec<(&String, bool)> = Vec::with_capacity(dirs.len() + files.len());
    if preserve_timestamps {
        entries.extend(dirs.iter().map(|d| (d, true)));
    }
    entries.extend(files.iter().map(|f| (f, false)));
    entries.sort_by(|a, b| a.0.cmp(b.0));

    for (rel, is_dir) in entries {
        let src = src_dir.join(rel);
        let meta = fs::metadata(&src).map_err(|err| CacheError::io(err, &src))?;

        let mut header = tar::Header::new_gnu();
        header.set_uid(0);
        header.set_gid(0);
        header.set_mtime(if preserve_timestamps {
            meta.modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map_or(0, |d| d.as_secs())
        } else {
            0
        });

        if is_dir {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_size(0);
            header.set_mode(MODE_EXECUTABLE);
            builder
                .append_data(&mut header, format!("{rel}/"), std::io::empty())
                .map_err(|err| CacheError::io(err, dst_file))?;
        } else {
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(meta.len());
            header.set_mode(file_mode(&meta, preserve_permissions));
            let reader = fs::File::open(&src).map_err(|err| CacheError::io(err, &src))?;
            builder
                .append_data(&mut header, rel, BufReader::new(reader))
                .map_err(|err| CacheError::io(err, dst_file))?;
        }
    }

    builder.finish().map_err(|err| CacheError::io(err, dst_file))?;
    trace!(archive = %dst_file.display(), files = files.len(), "packed directory tree");
    Ok(true)
}

/// Unpacks `src_file` into `dst_dir`.
///
/// Every entry path is validated before anything is extracted; an entry
/// whose normalized destination escapes `dst_dir` aborts the operation
/// with [`CacheError::Security`] and leaves the destination untouched.
pub fn unpack(
    src_file: &Path,
    dst_dir: &Path,
    preserve_permissions: bool,
    preserve_timestamps: bool,
) -> Result<()> {
    let mut archive = open(src_file)?;
    for entry in archive.entries().map_err(|err| CacheError::io(err, src_file))? {
        let entry = entry.map_err(|err| CacheError::io(err, src_file))?;
        let path = entry.path().map_err(|err| CacheError::io(err, src_file))?.into_owned();
        if path.is_absolute() || !utils::is_within(dst_dir, &dst_dir.join(&path)) {
            return Err(CacheError::security(path));
        }
    }

    fs::create_dir_all(dst_dir).map_err(|err| CacheError::io(err, dst_dir))?;
    let mut archive = open(src_file)?;
    archive.set_preserve_permissions(preserve_permissions);
    archive.set_preserve_mtime(preserve_timestamps);
    archive.unpack(dst_dir).map_err(|err| CacheError::io(err, src_file))?;
    trace!(archive = %src_file.display(), dst = %dst_dir.display(), "unpacked archive");
    Ok(())
}

fn open(src_file: &Path) -> Result<tar::Archive<BufReader<fs::File>>> {
    let file = fs::File::open(src_file).map_err(|err| CacheError::io(err, src_file))?;
    Ok(tar::Archive::new(BufReader::new(file)))
}

#[cfg(unix)]
fn file_mode(meta: &fs::Metadata, preserve_permissions: bool) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    if preserve_permissions && meta.permissions().mode() & 0o100 != 0 {
        MODE_EXECUTABLE
    } else {
        MODE_REGULAR
    }
}

#[cfg(not(unix))]
fn file_mode(_meta: &fs::Metadata, _preserve_permissions: bool) -> u32 {
    MODE_REGULAR
}

fn io_other(msg: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, msg.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::tempdir;

    fn sample_tree(root: &Path) {
        fs::create_dir_all(root.join("sub/inner")).unwrap();
        fs::write(root.join("a.txt"), b"alpha").unwrap();
        fs::write(root.join("sub/b.txt"), b"beta").unwrap();
        fs::write(root.join("sub/inner/c.bin"), b"gamma").unwrap();
    }

    fn entry_paths(archive: &Path) -> Vec<String> {
        let mut ar = open(archive).unwrap();
        ar.entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn pack_is_deterministic() {
        let tmp = tempdir("archive").unwrap();
        let src = tmp.path().join("src");
        sample_tree(&src);

        let first = tmp.path().join("first.tar");
        let second = tmp.path().join("second.tar");
        assert!(pack(&src, &first, None, false, false).unwrap());
        assert!(pack(&src, &second, None, false, false).unwrap());
        assert_eq!(fs::read(&first).unwrap(), fs::read(&second).unwrap());
    }

    #[test]
    fn entries_are_lexicographically_ordered() {
        let tmp = tempdir("archive").unwrap();
        let src = tmp.path().join("src");
        sample_tree(&src);

        let dst = tmp.path().join("out.tar");
        assert!(pack(&src, &dst, None, false, false).unwrap());
        let paths = entry_paths(&dst);
        let mut sorted = paths.clone();
        sorted.sort();
        assert_eq!(paths, sorted);
    }

    #[test]
    fn glob_selects_files_and_reports_empty_match() {
        let tmp = tempdir("archive").unwrap();
        let src = tmp.path().join("src");
        sample_tree(&src);

        let dst = tmp.path().join("txt.tar");
        assert!(pack(&src, &dst, Some("**/*.txt"), false, false).unwrap());
        let paths = entry_paths(&dst);
        assert!(paths.iter().all(|p| p.ends_with(".txt")));
        assert_eq!(paths.len(), 2);

        let none = tmp.path().join("none.tar");
        assert!(!pack(&src, &none, Some("**/*.jar"), false, false).unwrap());
        assert!(!none.exists());
    }

    #[test]
    fn round_trip_restores_contents() {
        let tmp = tempdir("archive").unwrap();
        let src = tmp.path().join("src");
        sample_tree(&src);

        let dst = tmp.path().join("out.tar");
        assert!(pack(&src, &dst, None, false, false).unwrap());

        let unpacked = tmp.path().join("unpacked");
        unpack(&dst, &unpacked, false, false).unwrap();
        assert_eq!(fs::read(unpacked.join("a.txt")).unwrap(), b"alpha");
        assert_eq!(fs::read(unpacked.join("sub/inner/c.bin")).unwrap(), b"gamma");
    }

    #[test]
    #[cfg(unix)]
    fn executability_only_modes() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempdir("archive").unwrap();
        let src = tmp.path().join("src");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("run.sh"), b"#!/bin/sh\n").unwrap();
        fs::write(src.join("data.txt"), b"x").unwrap();
        fs::set_permissions(src.join("run.sh"), fs::Permissions::from_mode(0o740)).unwrap();
        fs::set_permissions(src.join("data.txt"), fs::Permissions::from_mode(0o664)).unwrap();

        let dst = tmp.path().join("out.tar");
        assert!(pack(&src, &dst, None, true, false).unwrap());

        let mut ar = open(&dst).unwrap();
        for entry in ar.entries().unwrap() {
            let entry = entry.unwrap();
            let mode = entry.header().mode().unwrap();
            match entry.path().unwrap().to_string_lossy().as_ref() {
                "run.sh" => assert_eq!(mode, MODE_EXECUTABLE),
                "data.txt" => assert_eq!(mode, MODE_REGULAR),
                other => panic!("unexpected entry {other}"),
            }
        }
    }

    #[test]
    fn escaping_entry_is_rejected_before_extraction() {
        let tmp = tempdir("archive").unwrap();
        let evil = tmp.path().join("evil.tar");

        let out = fs::File::create(&evil).unwrap();
        let mut builder = tar::Builder::new(out);
        let payload = b"owned";
        let mut header = tar::Header::new_gnu();
        let path = b"../../../etc/target";
        header.as_old_mut().name[..path.len()].copy_from_slice(path);
        header.set_size(payload.len() as u64);
        header.set_mode(MODE_REGULAR);
        header.set_cksum();
        builder.append(&header, &payload[..]).unwrap();
        builder.finish().unwrap();

        let dst = tmp.path().join("dst");
        let err = unpack(&evil, &dst, false, false).unwrap_err();
        assert!(matches!(err, CacheError::Security { .. }));
        assert!(!dst.exists() || fs::read_dir(&dst).unwrap().next().is_none());
    }
}
