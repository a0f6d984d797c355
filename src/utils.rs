//! Utility functions

use crate::error::{CacheError, CacheIoError, Result};
use path_slash::PathExt;
use serde::{de::DeserializeOwned, Serialize};
use std::{
    fs,
    io::Write,
    path::{Component, Path, PathBuf},
    time::SystemTime,
};

/// Declaration prepended to every persisted XML document.
pub const XML_DECLARATION: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n";

/// Canonicalize the path, platform-agnostic.
///
/// On windows this will ensure the path only consists of `/` separators.
pub fn canonicalize(path: impl AsRef<Path>) -> Result<PathBuf, CacheIoError> {
    let path = path.as_ref();
    let res = dunce::canonicalize(path);
    #[cfg(windows)]
    let res = res.map(|p| {
        use path_slash::PathBufExt;
        PathBuf::from(p.to_slash_lossy().as_ref())
    });
    res.map_err(|err| CacheIoError::new(err, path))
}

/// Canonicalizes the path, returning the input unchanged if it does not exist.
pub fn canonicalized(path: impl Into<PathBuf>) -> PathBuf {
    let path = path.into();
    canonicalize(&path).unwrap_or(path)
}

/// Lexically cleans the given path.
///
/// Resolves `.` and `..` components and collapses repeated separators
/// without touching the file system, so it also works for paths that do
/// not exist yet. A `..` that would climb above the first component is
/// kept as-is.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = Vec::new();
    for component in path.components() {
        match component {
            Component::Prefix(..) | Component::RootDir | Component::Normal(..) => {
                out.push(component);
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if let Some(Component::Normal(..)) = out.last() {
                    out.pop();
                } else {
                    out.push(component);
                }
            }
        }
    }
    out.iter().collect()
}

/// Returns whether `path`, after lexical normalization, stays under `base`.
pub fn is_within(base: &Path, path: &Path) -> bool {
    normalize_path(path).starts_with(normalize_path(base))
}

/// Relativizes `path` against `base` if it is an absolute path under it.
///
/// Paths outside the base directory (or already relative ones) are
/// returned unchanged after normalization.
pub fn relativize(base: &Path, path: &Path) -> PathBuf {
    let normalized = normalize_path(path);
    if normalized.is_absolute() {
        if let Ok(rel) = normalized.strip_prefix(&normalize_path(base)) {
            return rel.to_path_buf();
        }
    }
    normalized
}

/// Renders the path with unix separators, the form used in persisted
/// artifact descriptors and digest items.
pub fn to_unix_string(path: &Path) -> String {
    path.to_slash_lossy().into_owned()
}

/// Creates the parent directory of the `file` and all its ancestors if it
/// does not exist.
pub fn create_parent_dir_all(file: &Path) -> Result<()> {
    if let Some(parent) = file.parent() {
        fs::create_dir_all(parent).map_err(|err| CacheError::io(err, parent))?;
    }
    Ok(())
}

/// Creates the file if missing and bumps its modification time to now.
/// The creation time, where the platform records one, is preserved.
pub fn touch(path: &Path) -> Result<()> {
    let file = fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)
        .map_err(|err| CacheError::io(err, path))?;
    file.set_modified(SystemTime::now()).map_err(|err| CacheError::io(err, path))?;
    Ok(())
}

/// Reads the creation and modification timestamps of a file.
///
/// Filesystems without a birth time fall back to the modification time,
/// which degrades the negative-lookup throttle to its shortest band.
pub fn file_times(path: &Path) -> Result<(SystemTime, SystemTime)> {
    let meta = fs::metadata(path).map_err(|err| CacheError::io(err, path))?;
    let modified = meta.modified().map_err(|err| CacheError::io(err, path))?;
    let created = meta.created().unwrap_or(modified);
    Ok((created, modified))
}

/// Serializes the value as an indented XML document with declaration.
pub fn to_xml_string<T: Serialize>(value: &T) -> Result<String> {
    let mut body = String::new();
    let mut ser = quick_xml::se::Serializer::new(&mut body);
    ser.indent(' ', 2);
    value.serialize(ser)?;
    let mut out = String::with_capacity(XML_DECLARATION.len() + body.len() + 1);
    out.push_str(XML_DECLARATION);
    out.push_str(&body);
    out.push('\n');
    Ok(out)
}

/// Deserializes a value from an XML document.
pub fn from_xml_str<T: DeserializeOwned>(xml: &str) -> Result<T> {
    quick_xml::de::from_str(xml).map_err(Into::into)
}

/// Reads the XML file and deserializes it into the provided type.
pub fn read_xml_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path).map_err(|err| CacheError::io(err, path))?;
    from_xml_str(&content)
}

/// Serializes the value to XML and publishes it atomically.
pub fn write_xml_file<T: Serialize>(value: &T, path: &Path) -> Result<()> {
    let xml = to_xml_string(value)?;
    write_file_atomic(xml.as_bytes(), path)
}

/// Writes `bytes` to a temporary sibling file and renames it into place,
/// so readers never observe a partially written file.
pub fn write_file_atomic(bytes: &[u8], path: &Path) -> Result<()> {
    create_parent_dir_all(path)?;
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp =
        tempfile::NamedTempFile::new_in(parent).map_err(|err| CacheError::io(err, parent))?;
    tmp.write_all(bytes).map_err(|err| CacheError::io(err, tmp.path().to_path_buf()))?;
    tmp.persist(path).map_err(|err| CacheError::io(err.error, path))?;
    Ok(())
}

/// Copies `src` into `dst` through a temporary sibling, publishing atomically.
pub fn copy_file_atomic(src: &Path, dst: &Path) -> Result<u64> {
    create_parent_dir_all(dst)?;
    let parent = dst.parent().unwrap_or_else(|| Path::new("."));
    let tmp =
        tempfile::NamedTempFile::new_in(parent).map_err(|err| CacheError::io(err, parent))?;
    let size = fs::copy(src, tmp.path()).map_err(|err| CacheError::io(err, src))?;
    tmp.persist(dst).map_err(|err| CacheError::io(err.error, dst))?;
    Ok(size)
}

/// Creates a new named tempdir.
#[cfg(test)]
pub fn tempdir(name: &str) -> Result<tempfile::TempDir, CacheIoError> {
    tempfile::Builder::new().prefix(name).tempdir().map_err(|err| CacheIoError::new(err, name))
}
