// src/archive/verify.rs

//! Streaming verification of archives and extracted directories

use super::entry_path;
use crate::compression::create_decoder_auto;
use crate::error::{Error, Result};
use crate::filesystem::safe_join;
use crate::hash::{HashingReader, hash_file, hash_reader};
use crate::manifest::ComponentManifest;
use rayon::prelude::*;
use std::collections::BTreeSet;
use std::io::Read;
use std::path::Path;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Outcome of checking content against a manifest
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerificationResult {
    pub ok: bool,
    /// Paths whose content differs, are missing, or are not in the manifest
    pub mismatched_files: Vec<String>,
    /// Whether the whole-archive checksum matched (always true for directories)
    pub archive_checksum_ok: bool,
}

impl VerificationResult {
    fn from_parts(mut mismatched_files: Vec<String>, archive_checksum_ok: bool) -> Self {
        mismatched_files.sort();
        mismatched_files.dedup();
        Self {
            ok: mismatched_files.is_empty() && archive_checksum_ok,
            mismatched_files,
            archive_checksum_ok,
        }
    }

    /// First offending path, or the archive file name when only the archive checksum is off
    pub fn first_problem<'a>(&'a self, manifest: &'a ComponentManifest) -> Option<&'a str> {
        if let Some(path) = self.mismatched_files.first() {
            Some(path.as_str())
        } else if !self.archive_checksum_ok {
            Some(manifest.archive_file.as_str())
        } else {
            None
        }
    }

    /// Convert a failed result into an `Integrity` error
    pub fn into_result(self, manifest: &ComponentManifest) -> Result<()> {
        match self.first_problem(manifest) {
            Some(path) => Err(Error::integrity(manifest.id().to_string(), path)),
            None => Ok(()),
        }
    }
}

/// Verify an archive stream against a manifest
///
/// Every entry is hashed while it streams past; memory use is bounded by
/// the read buffer, not by the payload.
pub fn verify_archive<R: Read>(reader: R, manifest: &ComponentManifest) -> Result<VerificationResult> {
    let mut hashing = HashingReader::new(reader, manifest.archive_checksum.algorithm);
    let mut mismatched = Vec::new();
    let mut seen = BTreeSet::new();

    {
        let (_, decoder) = create_decoder_auto(&mut hashing)?;
        let mut archive = tar::Archive::new(decoder);

        for entry in archive.entries()? {
            let entry = entry?;
            let entry_type = entry.header().entry_type();
            if entry_type.is_dir() {
                continue;
            }

            let path = match entry_path(&entry) {
                Ok(path) => path,
                Err(e) => {
                    warn!("Rejecting archive entry: {}", e);
                    mismatched.push(String::from_utf8_lossy(&entry.path_bytes()).into_owned());
                    continue;
                }
            };

            let Some(record) = manifest.file(&path) else {
                debug!("Entry {} is not in the manifest", path);
                mismatched.push(path);
                continue;
            };

            if !entry_type.is_file() {
                mismatched.push(path);
                continue;
            }

            let (checksum, size) = hash_reader(record.checksum.algorithm, entry)?;
            if checksum != record.checksum || size != record.size {
                debug!("Content mismatch for {}", path);
                mismatched.push(path.clone());
            }
            seen.insert(path);
        }
    }

    hashing.drain()?;
    let (archive_checksum, archive_size, _) = hashing.finish();

    mismatched.extend(
        manifest
            .files
            .iter()
            .filter(|f| !seen.contains(&f.path))
            .map(|f| f.path.clone()),
    );

    let archive_ok = archive_checksum == manifest.archive_checksum && archive_size == manifest.archive_size;
    if !archive_ok {
        warn!("Archive checksum mismatch for {}", manifest.id());
    }
    Ok(VerificationResult::from_parts(mismatched, archive_ok))
}

/// Verify an extracted directory against a manifest
///
/// Files not listed in the manifest count as mismatches.
pub fn verify_directory(dir: &Path, manifest: &ComponentManifest) -> Result<VerificationResult> {
    if !dir.is_dir() {
        return Err(Error::not_found(dir.display().to_string()));
    }

    let mut mismatched = manifest
        .files
        .par_iter()
        .map(|record| {
            let path = safe_join(dir, &record.path)?;
            if !path.is_file() {
                return Ok(Some(record.path.clone()));
            }
            let (checksum, size) = hash_file(record.checksum.algorithm, &path)?;
            Ok((checksum != record.checksum || size != record.size).then(|| record.path.clone()))
        })
        .collect::<Result<Vec<_>>>()?
        .into_iter()
        .flatten()
        .collect::<Vec<_>>();

    for entry in WalkDir::new(dir).follow_links(false) {
        let entry = entry.map_err(|e| Error::InvalidInput(format!("cannot walk {}: {}", dir.display(), e)))?;
        if entry.file_type().is_dir() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(dir)
            .map(|p| p.to_string_lossy().replace('\\', "/"))
            .unwrap_or_default();
        if manifest.file(&relative).is_none() {
            debug!("Unexpected file {} in {}", relative, dir.display());
            mismatched.push(relative);
        }
    }

    Ok(VerificationResult::from_parts(mismatched, true))
}
