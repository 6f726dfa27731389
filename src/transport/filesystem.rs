// src/transport/filesystem.rs

//! Transport over a plain directory tree
//!
//! Each key maps to a file under the root. Writes land in a temp file in
//! the destination directory and are renamed over the key only after the
//! content hashed to the expected checksum. An optional timeout bounds each
//! `put`/`get` call and is checked between copied chunks.

use super::retry::RetryPolicy;
use super::{COPY_BUFFER_SIZE, Transport, transfer_error, validate_key};
use crate::error::{Error, Result};
use crate::filesystem::sync_dir;
use crate::hash::{Checksum, HashingWriter};
use crate::progress::ProgressTracker;
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info};
use walkdir::WalkDir;

const TEMP_PREFIX: &str = ".tmp-";

/// Directory-backed transport
#[derive(Debug, Clone)]
pub struct FilesystemTransport {
    root: PathBuf,
    retry: RetryPolicy,
    timeout: Option<Duration>,
}

impl FilesystemTransport {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            retry: RetryPolicy::default(),
            timeout: None,
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Bound every `put`/`get` call; expiry yields a retryable error
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn deadline(&self) -> Option<Instant> {
        self.timeout.map(|t| Instant::now() + t)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn key_path(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }
}

fn check_deadline(deadline: Option<Instant>, key: &str) -> Result<()> {
    match deadline {
        Some(d) if Instant::now() >= d => Err(Error::retryable(key, "transfer timed out")),
        _ => Ok(()),
    }
}

impl Transport for FilesystemTransport {
    fn name(&self) -> &str {
        "filesystem"
    }

    fn put(
        &self,
        key: &str,
        source: &mut dyn Read,
        expected: &Checksum,
        progress: &dyn ProgressTracker,
    ) -> Result<()> {
        let path = self.key_path(key)?;
        let deadline = self.deadline();
        let parent = path.parent().unwrap_or(&self.root);
        fs::create_dir_all(parent).map_err(|e| transfer_error(key, e))?;

        let temp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(parent)
            .map_err(|e| transfer_error(key, e))?;
        let mut writer = HashingWriter::new(BufWriter::new(temp), expected.algorithm);

        let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
        loop {
            check_deadline(deadline, key)?;
            let n = match source.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(transfer_error(key, e)),
            };
            writer.write_all(&buffer[..n]).map_err(|e| transfer_error(key, e))?;
            progress.increment(n as u64);
        }

        let (checksum, size, inner) = writer.finish();
        if &checksum != expected {
            return Err(Error::terminal(
                key,
                format!("checksum mismatch: expected {}, got {}", expected, checksum),
            ));
        }

        let temp = inner.into_inner().map_err(|e| transfer_error(key, e.into_error()))?;
        temp.as_file().sync_all().map_err(|e| transfer_error(key, e))?;
        temp.persist(&path).map_err(|e| transfer_error(key, e.error))?;
        sync_dir(parent);

        info!("Stored {} ({} bytes) in {}", key, size, self.root.display());
        Ok(())
    }

    fn get(
        &self,
        key: &str,
        dest: &mut dyn Write,
        offset: u64,
        progress: &dyn ProgressTracker,
    ) -> Result<u64> {
        let path = self.key_path(key)?;
        let deadline = self.deadline();
        let mut written = 0u64;

        self.retry.run(key, |attempt| {
            let position = offset + written;
            if attempt > 1 {
                debug!("Resuming {} at byte {}", key, position);
            }

            let mut file = File::open(&path).map_err(|e| transfer_error(key, e))?;
            file.seek(SeekFrom::Start(position))
                .map_err(|e| transfer_error(key, e))?;

            let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
            loop {
                check_deadline(deadline, key)?;
                let n = match file.read(&mut buffer) {
                    Ok(0) => return Ok(()),
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(transfer_error(key, e)),
                };
                // Failures writing to the local destination are not transport
                // failures and are not retried
                dest.write_all(&buffer[..n])?;
                written += n as u64;
                progress.increment(n as u64);
            }
        })?;

        dest.flush()?;
        debug!("Fetched {} ({} bytes from offset {})", key, written, offset);
        Ok(written)
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.key_path(key)?.is_file())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for entry in WalkDir::new(&self.root).follow_links(false) {
            let entry = entry.map_err(|e| Error::terminal(prefix, e.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            if entry.file_name().to_string_lossy().starts_with(TEMP_PREFIX) {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            let key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if key.starts_with(prefix) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn delete(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.key_path(key)?) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(transfer_error(key, e)),
        }
    }

    fn size(&self, key: &str) -> Result<Option<u64>> {
        match fs::metadata(self.key_path(key)?) {
            Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(transfer_error(key, e)),
        }
    }
}
