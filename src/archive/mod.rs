// src/archive/mod.rs

//! Component archive codec
//!
//! A component archive is a tar stream of regular files, in manifest order,
//! with normalized headers (mtime 0, uid/gid 0, no owner names), wrapped in
//! one of the [`CompressionFormat`](crate::compression::CompressionFormat)s. The compression is detected from the
//! payload's magic bytes on read, so an archive can be extracted without the
//! manifest telling it how it was packed.
//!
//! - [`builder`]: walk a source directory and produce archive + manifest
//! - [`verify`]: stream an archive (or an extracted directory) against a manifest
//! - [`extract`]: stage, verify, then rename into place

pub mod builder;
pub mod extract;
pub mod verify;

pub use builder::{ArchiveBuilder, BuildOptions, DEFAULT_EXCLUDES};
pub use extract::Extractor;
pub use verify::{VerificationResult, verify_archive, verify_directory};

use crate::error::{Error, Result};
use crate::hash::hash_file;
use crate::manifest::{ComponentManifest, ManifestStore, validate_relative_path};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read};
use std::path::Path;
use tracing::{info, warn};

/// Relative path of a tar entry as a validated POSIX string
pub(crate) fn entry_path<R: Read>(entry: &tar::Entry<'_, R>) -> Result<String> {
    let path = entry.path()?;
    let path = path
        .to_str()
        .ok_or_else(|| Error::InvalidInput(format!("non UTF-8 archive path: {}", path.display())))?
        .trim_end_matches('/')
        .to_string();
    validate_relative_path(&path)?;
    Ok(path)
}

/// Package `source_dir` as `type:version` into the store's `dist/<type>/<version>/`
///
/// The archive is written to a temp file next to its final name, renamed
/// into place, and only then is the manifest stored. A conflict on the
/// identity is detected before any archive bytes are produced.
pub fn pack(
    store: &ManifestStore,
    source_dir: &Path,
    component_type: &str,
    version: &str,
    options: &BuildOptions,
    force: bool,
) -> Result<ComponentManifest> {
    if !force && store.has_component(component_type, version) {
        return Err(Error::conflict(format!("{}:{}", component_type, version)));
    }

    let dist = store.archive_dir(component_type, version);
    fs::create_dir_all(&dist)?;
    let temp = tempfile::Builder::new().prefix(".pack-").tempfile_in(&dist)?;

    let builder = ArchiveBuilder::new(component_type, version, source_dir).with_options(options.clone());
    let (manifest, writer) = builder.build(BufWriter::new(temp))?;
    let temp = writer.into_inner().map_err(|e| e.into_error())?;
    temp.as_file().sync_all()?;

    let archive_path = store.archive_path(&manifest);
    if force {
        temp.persist(&archive_path).map_err(|e| e.error)?;
    } else {
        match temp.persist_noclobber(&archive_path) {
            Ok(_) => {}
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => {
                if store.has_component(component_type, version) {
                    return Err(Error::conflict(manifest.id().to_string()));
                }
                // Archive left behind by an interrupted pack, no manifest owns it
                warn!("Replacing orphaned archive {}", archive_path.display());
                e.file.persist(&archive_path).map_err(|e| e.error)?;
            }
            Err(e) => return Err(e.error.into()),
        }
    }

    store.put_component(&manifest, force)?;
    info!(
        "Packed {} ({} files, {} bytes, {})",
        manifest.id(),
        manifest.files.len(),
        manifest.archive_size,
        manifest.compression
    );
    Ok(manifest)
}

/// Re-check a stored archive against its manifest
pub fn verify_stored(store: &ManifestStore, manifest: &ComponentManifest) -> Result<VerificationResult> {
    let path = store.archive_path(manifest);
    let file = File::open(&path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => Error::not_found(path.display().to_string()),
        _ => e.into(),
    })?;
    verify_archive(BufReader::new(file), manifest)
}

/// Whether the archive file on disk still has the checksum the manifest records
pub fn archive_checksum_matches(path: &Path, manifest: &ComponentManifest) -> Result<bool> {
    let (checksum, size) = hash_file(manifest.archive_checksum.algorithm, path)?;
    Ok(checksum == manifest.archive_checksum && size == manifest.archive_size)
}
