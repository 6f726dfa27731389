// src/archive/builder.rs

//! Build a component archive and its manifest from a source directory
//!
//! File order is the lexicographic order of relative POSIX paths, so the
//! same content always yields the same archive bytes no matter how the
//! filesystem enumerates the directory. Hashing runs on a bounded worker
//! pool and the results are re-sorted before anything is written.

use crate::compression::{CompressionFormat, create_encoder};
use crate::error::{Error, Result};
use crate::hash::{HashAlgorithm, HashingReader, HashingWriter, hash_file};
use crate::manifest::{
    ComponentManifest, FileRecord, MANIFEST_SCHEMA_VERSION, validate_component_type,
    validate_version,
};
use chrono::Utc;
use glob::Pattern;
use rayon::prelude::*;
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::{DirEntry, WalkDir};

/// Patterns excluded when no explicit list is configured
///
/// A trailing `/` matches a directory anywhere in the tree; other patterns
/// match a file's name or its full relative path.
pub const DEFAULT_EXCLUDES: &[&str] = &["*.log", "*.tmp", "*.pyc", "__pycache__/", ".git/", ".DS_Store"];

/// Options controlling archive construction
#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub exclude: Vec<String>,
    pub compression: CompressionFormat,
    pub level: i32,
    pub hash: HashAlgorithm,
    /// Hash worker threads; 0 means one per available core
    pub workers: usize,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            exclude: DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect(),
            compression: CompressionFormat::Gzip,
            level: 6,
            hash: HashAlgorithm::Sha256,
            workers: 0,
        }
    }
}

/// Compiled exclude list
struct ExcludeSet {
    files: Vec<Pattern>,
    dirs: Vec<Pattern>,
}

impl ExcludeSet {
    fn compile(patterns: &[String]) -> Result<Self> {
        let mut set = Self {
            files: Vec::new(),
            dirs: Vec::new(),
        };
        for raw in patterns {
            let (target, text) = match raw.strip_suffix('/') {
                Some(dir) => (&mut set.dirs, dir),
                None => (&mut set.files, raw.as_str()),
            };
            let pattern = Pattern::new(text)
                .map_err(|e| Error::InvalidInput(format!("bad exclude pattern '{}': {}", raw, e)))?;
            target.push(pattern);
        }
        Ok(set)
    }

    fn excludes_dir(&self, name: &str, relative: &str) -> bool {
        self.dirs
            .iter()
            .any(|p| p.matches(name) || p.matches(relative))
    }

    fn excludes_file(&self, name: &str, relative: &str) -> bool {
        self.files
            .iter()
            .any(|p| p.matches(name) || p.matches(relative))
    }
}

/// Builder for one `(type, version)` archive
pub struct ArchiveBuilder {
    component_type: String,
    version: String,
    source_dir: PathBuf,
    options: BuildOptions,
}

impl ArchiveBuilder {
    pub fn new(component_type: &str, version: &str, source_dir: &Path) -> Self {
        Self {
            component_type: component_type.to_string(),
            version: version.to_string(),
            source_dir: source_dir.to_path_buf(),
            options: BuildOptions::default(),
        }
    }

    pub fn with_options(mut self, options: BuildOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_compression(mut self, compression: CompressionFormat, level: i32) -> Self {
        self.options.compression = compression;
        self.options.level = level;
        self
    }

    pub fn with_excludes(mut self, exclude: Vec<String>) -> Self {
        self.options.exclude = exclude;
        self
    }

    /// Write the archive to `writer` and return its manifest and the writer
    ///
    /// Fails with `EmptySource` when nothing is left after exclusion, and
    /// with `Integrity` if a file changes between hashing and archiving.
    pub fn build<W: Write>(&self, writer: W) -> Result<(ComponentManifest, W)> {
        validate_component_type(&self.component_type)?;
        validate_version(&self.version)?;

        let sources = self.scan_source_files()?;
        if sources.is_empty() {
            return Err(Error::EmptySource {
                path: self.source_dir.display().to_string(),
            });
        }

        let files = self.hash_files(&sources)?;
        let total_size = files.iter().map(|f| f.size).sum();
        debug!(
            "Hashed {} files ({} bytes) for {}:{}",
            files.len(),
            total_size,
            self.component_type,
            self.version
        );

        let (archive_checksum, archive_size, writer) = self.write_archive(&files, writer)?;

        let manifest = ComponentManifest {
            schema_version: MANIFEST_SCHEMA_VERSION.to_string(),
            component_type: self.component_type.clone(),
            version: self.version.clone(),
            files,
            archive_checksum,
            archive_file: ComponentManifest::archive_file_name(
                &self.component_type,
                &self.version,
                self.options.compression,
            ),
            archive_size,
            compression: self.options.compression,
            hash_algorithm: self.options.hash,
            total_size,
            created_at: Utc::now(),
        };
        manifest.validate()?;

        info!(
            "Built archive for {} ({} files, {} -> {} bytes)",
            manifest.id(),
            manifest.files.len(),
            total_size,
            archive_size
        );
        Ok((manifest, writer))
    }

    /// Regular files under the source, as `(relative POSIX path, absolute path)`
    fn scan_source_files(&self) -> Result<Vec<(String, PathBuf)>> {
        if !self.source_dir.is_dir() {
            return Err(Error::not_found(self.source_dir.display().to_string()));
        }

        let excludes = ExcludeSet::compile(&self.options.exclude)?;
        let root = self.source_dir.as_path();
        let mut files = Vec::new();

        let keep = |entry: &DirEntry| {
            if entry.depth() == 0 || !entry.file_type().is_dir() {
                return true;
            }
            match relative_posix(root, entry.path()) {
                Ok(rel) => !excludes.excludes_dir(&entry.file_name().to_string_lossy(), &rel),
                Err(_) => true,
            }
        };

        for entry in WalkDir::new(root).follow_links(false).into_iter().filter_entry(keep) {
            let entry = entry.map_err(|e| match e.into_io_error() {
                Some(io) => Error::Io(io),
                None => Error::InvalidInput("filesystem loop in source directory".to_string()),
            })?;
            if entry.depth() == 0 {
                continue;
            }

            let file_type = entry.file_type();
            if file_type.is_symlink() {
                warn!("Skipping symlink {}", entry.path().display());
                continue;
            }
            if !file_type.is_file() {
                continue;
            }

            let relative = relative_posix(root, entry.path())?;
            if excludes.excludes_file(&entry.file_name().to_string_lossy(), &relative) {
                debug!("Excluded {}", relative);
                continue;
            }
            files.push((relative, entry.into_path()));
        }

        files.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(files)
    }

    fn hash_files(&self, sources: &[(String, PathBuf)]) -> Result<Vec<FileRecord>> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.options.workers)
            .build()
            .map_err(|e| Error::InvalidInput(format!("cannot start hash workers: {}", e)))?;
        let algorithm = self.options.hash;

        let mut records = pool.install(|| {
            sources
                .par_iter()
                .map(|(relative, path)| {
                    let mode = path.metadata()?.permissions().mode() & 0o7777;
                    let (checksum, size) = hash_file(algorithm, path)?;
                    Ok(FileRecord {
                        path: relative.clone(),
                        size,
                        checksum,
                        mode,
                    })
                })
                .collect::<Result<Vec<_>>>()
        })?;

        // Completion order is arbitrary
        records.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(records)
    }

    fn write_archive<W: Write>(
        &self,
        files: &[FileRecord],
        writer: W,
    ) -> Result<(crate::hash::Checksum, u64, W)> {
        let hashing = HashingWriter::new(writer, self.options.hash);
        let encoder = create_encoder(hashing, self.options.compression, self.options.level)?;
        let mut tar = tar::Builder::new(encoder);

        for record in files {
            let path = self.source_dir.join(&record.path);
            let file = File::open(&path)?;
            let mut reader = HashingReader::new(BufReader::new(file).take(record.size), record.checksum.algorithm);

            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Regular);
            header.set_mode(record.mode);
            header.set_size(record.size);
            header.set_mtime(0);
            header.set_uid(0);
            header.set_gid(0);

            tar.append_data(&mut header, &record.path, &mut reader)?;

            let (checksum, written, _) = reader.finish();
            if written != record.size || checksum != record.checksum {
                warn!("{} changed while it was being packed", path.display());
                return Err(Error::integrity(
                    format!("{}:{}", self.component_type, self.version),
                    record.path.clone(),
                ));
            }
        }

        let encoder = tar.into_inner()?;
        let hashing = encoder.finish()?;
        Ok(hashing.finish())
    }
}

/// Relative path of `path` under `root`, POSIX separators, UTF-8 only
fn relative_posix(root: &Path, path: &Path) -> Result<String> {
    let relative = path
        .strip_prefix(root)
        .map_err(|_| Error::InvalidInput(format!("{} is outside {}", path.display(), root.display())))?;

    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str().ok_or_else(|| {
                Error::InvalidInput(format!("non UTF-8 file name: {}", path.display()))
            })?),
            _ => {
                return Err(Error::InvalidInput(format!(
                    "unexpected path component in {}",
                    path.display()
                )));
            }
        }
    }
    Ok(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write(root: &Path, relative: &str, content: &[u8]) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_build_lists_sorted_files() {
        let src = TempDir::new().unwrap();
        write(src.path(), "b.bin", &[0u8; 10]);
        write(src.path(), "a.txt", b"hi");
        write(src.path(), "sub/c.txt", b"nested");

        let (manifest, bytes) = ArchiveBuilder::new("model", "1.0.0", src.path())
            .build(Vec::new())
            .unwrap();

        let paths: Vec<_> = manifest.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["a.txt", "b.bin", "sub/c.txt"]);
        assert_eq!(manifest.file("b.bin").unwrap().size, 10);
        assert_eq!(manifest.total_size, 18);
        assert_eq!(manifest.archive_size, bytes.len() as u64);
        assert_eq!(manifest.archive_file, "model-1.0.0.tar.gz");
        assert_eq!(
            manifest.archive_checksum,
            crate::hash::hash_bytes(HashAlgorithm::Sha256, &bytes)
        );
    }

    #[test]
    fn test_default_excludes() {
        let src = TempDir::new().unwrap();
        write(src.path(), "keep.txt", b"k");
        write(src.path(), "run.log", b"l");
        write(src.path(), ".git/HEAD", b"ref");
        write(src.path(), "pkg/__pycache__/m.pyc", b"c");
        write(src.path(), "pkg/mod.py", b"m");

        let (manifest, _) = ArchiveBuilder::new("runtime", "1", src.path())
            .build(Vec::new())
            .unwrap();
        let paths: Vec<_> = manifest.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["keep.txt", "pkg/mod.py"]);
    }

    #[test]
    fn test_empty_after_exclusion() {
        let src = TempDir::new().unwrap();
        write(src.path(), "only.tmp", b"x");

        let err = ArchiveBuilder::new("config", "1.0.0", src.path())
            .build(Vec::new())
            .unwrap_err();
        assert!(matches!(err, Error::EmptySource { .. }));
    }

    #[test]
    fn test_symlinks_are_skipped() {
        let src = TempDir::new().unwrap();
        write(src.path(), "real.txt", b"data");
        std::os::unix::fs::symlink("real.txt", src.path().join("link.txt")).unwrap();

        let (manifest, _) = ArchiveBuilder::new("model", "1.0.0", src.path())
            .build(Vec::new())
            .unwrap();
        assert_eq!(manifest.files.len(), 1);
        assert_eq!(manifest.files[0].path, "real.txt");
    }

    #[test]
    fn test_build_is_deterministic_across_formats() {
        let src = TempDir::new().unwrap();
        write(src.path(), "w/layer0.bin", &[3u8; 4096]);
        write(src.path(), "w/layer1.bin", &[4u8; 4096]);

        for format in [CompressionFormat::None, CompressionFormat::Gzip, CompressionFormat::Zstd] {
            let builder = ArchiveBuilder::new("model", "2.0", src.path())
                .with_compression(format, format.default_level());
            let (first, a) = builder.build(Vec::new()).unwrap();
            let (second, b) = builder.build(Vec::new()).unwrap();
            assert_eq!(a, b, "format {format}");
            assert_eq!(first.archive_checksum, second.archive_checksum);
            assert_eq!(first.files, second.files);
        }
    }

    #[test]
    fn test_invalid_identity_rejected() {
        let src = TempDir::new().unwrap();
        write(src.path(), "a", b"a");
        assert!(matches!(
            ArchiveBuilder::new("9bad", "1.0", src.path()).build(Vec::new()),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            ArchiveBuilder::new("model", "../1.0", src.path()).build(Vec::new()),
            Err(Error::InvalidInput(_))
        ));
    }
}
