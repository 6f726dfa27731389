// src/transport/fetch.rs

//! Resumable, verified download of one key into a local file

use super::Transport;
use crate::error::{Error, Result};
use crate::filesystem::sync_dir;
use crate::hash::{Checksum, hash_file};
use crate::progress::ProgressTracker;
use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Staging path of an in-progress download
pub fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(OsString::from)
        .unwrap_or_default();
    name.push(".partial");
    dest.with_file_name(name)
}

/// Download `key` to `dest`, verifying it against `expected`
///
/// Bytes land in `<dest>.partial` first. A failed download leaves that
/// file in place and the next call continues from its length. A complete
/// download that does not hash to `expected` is discarded. If `dest`
/// already holds the expected content nothing is transferred.
pub fn fetch_to_file(
    transport: &dyn Transport,
    key: &str,
    dest: &Path,
    expected: &Checksum,
    progress: &dyn ProgressTracker,
) -> Result<()> {
    if dest.is_file() {
        let (existing, _) = hash_file(expected.algorithm, dest)?;
        if &existing == expected {
            debug!("{} already present at {}", key, dest.display());
            return Ok(());
        }
        warn!("Discarding stale {}", dest.display());
        fs::remove_file(dest)?;
    }

    let parent = dest
        .parent()
        .ok_or_else(|| Error::InvalidInput(format!("{} has no parent", dest.display())))?;
    fs::create_dir_all(parent)?;

    let partial = partial_path(dest);
    let mut offset = fs::metadata(&partial).map(|m| m.len()).unwrap_or(0);

    let remote_size = transport.size(key)?.ok_or_else(|| Error::not_found(key))?;
    if offset > remote_size {
        warn!("Partial download of {} is larger than the object, restarting", key);
        offset = 0;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(&partial)?;
    file.set_len(offset)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut writer = BufWriter::new(file);

    if offset > 0 {
        info!("Resuming {} at byte {} of {}", key, offset, remote_size);
    }
    progress.set_length(remote_size);
    progress.set_position(offset);

    transport.get(key, &mut writer, offset, progress)?;
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    drop(file);

    let (actual, size) = hash_file(expected.algorithm, &partial)?;
    if &actual != expected {
        fs::remove_file(&partial)?;
        return Err(Error::terminal(
            key,
            format!(
                "downloaded content does not verify: expected {}, got {} ({} bytes)",
                expected, actual, size
            ),
        ));
    }

    fs::rename(&partial, dest)?;
    sync_dir(parent);
    debug!("Fetched {} to {}", key, dest.display());
    Ok(())
}
