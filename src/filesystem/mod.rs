// src/filesystem/mod.rs

//! Filesystem primitives shared by the manifest store, transports and the
//! version switch
//!
//! Every mutable file this crate owns is replaced with write-to-temp then
//! rename, so concurrent readers see either the complete old content or the
//! complete new content.

use crate::error::{Error, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use tracing::warn;

/// Atomically write `data` to `path`
///
/// With `overwrite == false` the final step is a no-clobber link, so two
/// racing writers cannot both succeed; the loser gets
/// `io::ErrorKind::AlreadyExists`.
pub fn write_atomic(path: &Path, data: &[u8], overwrite: bool) -> io::Result<()> {
    let parent = path.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(parent)?;

    let mut temp = tempfile::Builder::new()
        .prefix(".tmp-")
        .tempfile_in(parent)?;
    temp.write_all(data)?;
    temp.as_file().sync_all()?;

    if overwrite {
        temp.persist(path).map_err(|e| e.error)?;
    } else {
        temp.persist_noclobber(path).map_err(|e| e.error)?;
    }

    sync_dir(parent);
    Ok(())
}

/// Atomically write a value as pretty JSON
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T, overwrite: bool) -> io::Result<()> {
    let mut json = serde_json::to_vec_pretty(value).map_err(io::Error::other)?;
    json.push(b'\n');
    write_atomic(path, &json, overwrite)
}

/// Read a JSON document, `None` if the file does not exist
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Fsync a directory so a rename inside it is durable
///
/// Not all filesystems support this; failures are ignored.
pub fn sync_dir(dir: &Path) {
    if let Ok(handle) = File::open(dir) {
        let _ = handle.sync_all();
    }
}

/// Join a relative POSIX path onto `root`, rejecting anything that could
/// land outside of it
pub fn safe_join(root: &Path, relative: &str) -> Result<PathBuf> {
    let mut normalized = PathBuf::new();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(c) => normalized.push(c),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                warn!("Path traversal attempt detected: {}", relative);
                return Err(Error::InvalidInput(format!(
                    "path escapes its root: {}",
                    relative
                )));
            }
        }
    }

    if normalized.as_os_str().is_empty() {
        return Err(Error::InvalidInput(format!(
            "empty path after normalization: '{}'",
            relative
        )));
    }

    Ok(root.join(normalized))
}

/// Remove a directory tree, tolerating it being already gone
pub fn remove_dir_all_quiet(path: &Path) {
    if let Err(e) = fs::remove_dir_all(path)
        && e.kind() != io::ErrorKind::NotFound
    {
        warn!("Failed to remove {}: {}", path.display(), e);
    }
}
