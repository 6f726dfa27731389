// src/archive/extract.rs

//! Verified extraction into a versioned directory
//!
//! Entries are written into a temporary sibling of the destination and
//! hashed on the way to disk. Only when every file, the file set and the
//! whole-archive checksum match the manifest is the staging directory
//! renamed onto the destination. A failed extraction never leaves anything
//! at the destination path.

use super::entry_path;
use crate::compression::create_decoder_auto;
use crate::error::{Error, Result};
use crate::filesystem::{safe_join, sync_dir};
use crate::hash::{HashingReader, HashingWriter};
use crate::manifest::ComponentManifest;
use std::collections::BTreeSet;
use std::fs::{self, File, Permissions};
use std::io::{self, BufWriter, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tracing::{debug, info, warn};

type CommitHook = Box<dyn Fn(&Path) -> Result<()> + Send + Sync>;

/// Archive extractor
#[derive(Default)]
pub struct Extractor {
    before_commit: Option<CommitHook>,
}

impl std::fmt::Debug for Extractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Extractor")
            .field("before_commit", &self.before_commit.is_some())
            .finish()
    }
}

impl Extractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `hook` on the verified staging directory right before the rename
    ///
    /// An error from the hook aborts the extraction and the staging
    /// directory is discarded.
    pub fn before_commit<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Path) -> Result<()> + Send + Sync + 'static,
    {
        self.before_commit = Some(Box::new(hook));
        self
    }

    /// Extract `reader` to `dest_dir`, which must not exist yet
    pub fn extract<R: Read>(&self, reader: R, dest_dir: &Path, manifest: &ComponentManifest) -> Result<()> {
        if dest_dir.exists() {
            return Err(Error::conflict(dest_dir.display().to_string()));
        }
        let parent = dest_dir
            .parent()
            .ok_or_else(|| Error::InvalidInput(format!("{} has no parent", dest_dir.display())))?;
        fs::create_dir_all(parent)?;

        let staging = tempfile::Builder::new().prefix(".extract-").tempdir_in(parent)?;
        debug!("Staging {} in {}", manifest.id(), staging.path().display());

        self.unpack_verified(reader, staging.path(), manifest)?;

        if let Some(hook) = &self.before_commit {
            hook(staging.path())?;
        }

        fs::rename(staging.path(), dest_dir)?;
        // The staging path is gone; dropping the guard is a no-op.
        drop(staging);
        sync_dir(parent);

        info!("Extracted {} to {}", manifest.id(), dest_dir.display());
        Ok(())
    }

    fn unpack_verified<R: Read>(&self, reader: R, staging: &Path, manifest: &ComponentManifest) -> Result<()> {
        let entity = manifest.id().to_string();
        let mut hashing = HashingReader::new(reader, manifest.archive_checksum.algorithm);
        let mut seen = BTreeSet::new();

        {
            let (_, decoder) = create_decoder_auto(&mut hashing)?;
            let mut archive = tar::Archive::new(decoder);

            for entry in archive.entries()? {
                let mut entry = entry?;
                let entry_type = entry.header().entry_type();
                if entry_type.is_dir() {
                    continue;
                }

                let path = entry_path(&entry).map_err(|e| {
                    warn!("Unsafe archive entry in {}: {}", entity, e);
                    Error::integrity(
                        entity.clone(),
                        String::from_utf8_lossy(&entry.path_bytes()).into_owned(),
                    )
                })?;
                let record = manifest
                    .file(&path)
                    .ok_or_else(|| Error::integrity(entity.clone(), path.clone()))?;
                if !entry_type.is_file() || !seen.insert(path.clone()) {
                    return Err(Error::integrity(entity.clone(), path));
                }

                let target = safe_join(staging, &path)?;
                if let Some(dir) = target.parent() {
                    fs::create_dir_all(dir)?;
                }

                let file = File::create(&target)?;
                let mut writer = HashingWriter::new(BufWriter::new(file), record.checksum.algorithm);
                io::copy(&mut entry, &mut writer)?;
                writer.flush()?;
                let (checksum, size, inner) = writer.finish();
                let file = inner.into_inner().map_err(|e| e.into_error())?;
                file.set_permissions(Permissions::from_mode(record.mode))?;
                file.sync_all()?;

                if checksum != record.checksum || size != record.size {
                    warn!("Checksum mismatch for {} in {}", path, entity);
                    return Err(Error::integrity(entity.clone(), path));
                }
            }
        }

        if let Some(missing) = manifest.files.iter().find(|f| !seen.contains(&f.path)) {
            return Err(Error::integrity(entity, missing.path.clone()));
        }

        hashing.drain()?;
        let (archive_checksum, archive_size, _) = hashing.finish();
        if archive_checksum != manifest.archive_checksum || archive_size != manifest.archive_size {
            return Err(Error::integrity(entity, manifest.archive_file.clone()));
        }
        Ok(())
    }
}
