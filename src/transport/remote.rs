// src/transport/remote.rs

//! Transport over an [`ObjectStore`]
//!
//! Uploads that fit in one part go out as a single `put_object`; anything
//! larger becomes a multipart upload, which the provider only makes visible
//! on completion. Each request is retried with backoff. Downloads are a
//! sequence of ranged reads, so a failed read resumes at the first byte not
//! yet written.

use super::object::ObjectStore;
use super::retry::RetryPolicy;
use super::{Transport, transfer_error, validate_key};
use crate::error::{Error, Result};
use crate::hash::{Checksum, Hasher};
use crate::progress::ProgressTracker;
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Smallest part size accepted
pub const MIN_PART_SIZE: usize = 1024;

/// Transport that speaks the object store contract
pub struct RemoteTransport<S: ObjectStore> {
    store: S,
    part_size: usize,
    retry: RetryPolicy,
    timeout: Option<Duration>,
}

impl<S: ObjectStore> RemoteTransport<S> {
    pub fn new(store: S, part_size: usize) -> Self {
        Self {
            store,
            part_size: part_size.max(MIN_PART_SIZE),
            retry: RetryPolicy::default(),
            timeout: None,
        }
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

    pub fn store(&self) -> &S {
        &self.store
    }

    fn deadline(&self) -> Option<Instant> {
        self.timeout.map(|t| Instant::now() + t)
    }

    fn check_deadline(deadline: Option<Instant>, key: &str) -> Result<()> {
        match deadline {
            Some(d) if Instant::now() >= d => Err(Error::retryable(key, "transfer timed out")),
            _ => Ok(()),
        }
    }

    /// Fill `buffer` from `source` until full or end of stream
    fn read_part(source: &mut dyn Read, buffer: &mut [u8], key: &str) -> Result<usize> {
        let mut filled = 0;
        while filled < buffer.len() {
            match source.read(&mut buffer[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(transfer_error(key, e)),
            }
        }
        Ok(filled)
    }

    fn checksum_mismatch(key: &str, expected: &Checksum, actual: &Checksum) -> Error {
        Error::terminal(
            key,
            format!("checksum mismatch: expected {}, got {}", expected, actual),
        )
    }

    /// Upload every part, then complete; the caller aborts on error
    #[allow(clippy::too_many_arguments)]
    fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        source: &mut dyn Read,
        first: Vec<u8>,
        expected: &Checksum,
        deadline: Option<Instant>,
        progress: &dyn ProgressTracker,
    ) -> Result<u64> {
        let mut hasher = Hasher::new(expected.algorithm);
        let mut part = first;
        let mut part_number = 1u32;
        let mut total = 0u64;

        while !part.is_empty() {
            Self::check_deadline(deadline, key)?;

            let what = format!("{} part {}", key, part_number);
            self.retry
                .run(&what, |_| self.store.upload_part(upload_id, part_number, &part))?;
            debug!("Uploaded {} ({} bytes)", what, part.len());

            hasher.update(&part);
            total += part.len() as u64;
            progress.increment(part.len() as u64);

            part_number += 1;
            part.resize(self.part_size, 0);
            let n = Self::read_part(source, &mut part, key)?;
            part.truncate(n);
        }

        let local = hasher.finalize();
        if &local != expected {
            return Err(Self::checksum_mismatch(key, expected, &local));
        }

        Self::check_deadline(deadline, key)?;
        self.retry.run(key, |_| {
            self.store.complete_multipart(upload_id, expected.algorithm)
        })?;
        Ok(total)
    }

    /// Confirm the provider stored exactly what was sent
    fn confirm(&self, key: &str, size: u64, expected: &Checksum) -> Result<()> {
        let meta = self
            .retry
            .run(key, |_| self.store.head(key))?
            .ok_or_else(|| Error::terminal(key, "object missing after upload"))?;

        let checksum_ok = meta.checksum.as_ref() == Some(expected);
        if meta.size != size || !checksum_ok {
            warn!(
                "Stored object {} does not match what was sent (size {} vs {}), deleting it",
                key, meta.size, size
            );
            if let Err(e) = self.store.delete(key) {
                warn!("Failed to delete mismatched object {}: {}", key, e);
            }
            let actual = meta
                .checksum
                .map(|c| c.to_string())
                .unwrap_or_else(|| "no checksum".to_string());
            return Err(Error::terminal(
                key,
                format!("stored object does not verify: expected {}, provider reports {}", expected, actual),
            ));
        }
        Ok(())
    }
}

impl<S: ObjectStore> Transport for RemoteTransport<S> {
    fn name(&self) -> &str {
        self.store.name()
    }

    fn put(
        &self,
        key: &str,
        source: &mut dyn Read,
        expected: &Checksum,
        progress: &dyn ProgressTracker,
    ) -> Result<()> {
        validate_key(key)?;
        let deadline = self.deadline();

        let mut first = vec![0u8; self.part_size];
        let n = Self::read_part(source, &mut first, key)?;
        first.truncate(n);

        let size = if n < self.part_size {
            let mut hasher = Hasher::new(expected.algorithm);
            hasher.update(&first);
            let local = hasher.finalize();
            if &local != expected {
                return Err(Self::checksum_mismatch(key, expected, &local));
            }

            Self::check_deadline(deadline, key)?;
            self.retry
                .run(key, |_| self.store.put_object(key, &first, expected.algorithm))?;
            progress.increment(n as u64);
            n as u64
        } else {
            let upload_id = self.retry.run(key, |_| self.store.create_multipart(key))?;
            debug!("Started multipart upload {} for {}", upload_id, key);

            match self.upload_parts(key, &upload_id, source, first, expected, deadline, progress) {
                Ok(size) => size,
                Err(e) => {
                    warn!("Aborting multipart upload {} for {}: {}", upload_id, key, e);
                    if let Err(abort) = self.store.abort_multipart(&upload_id) {
                        warn!("Failed to abort upload {}: {}", upload_id, abort);
                    }
                    return Err(e);
                }
            }
        };

        self.confirm(key, size, expected)?;
        info!("Uploaded {} ({} bytes) to {}", key, size, self.store.name());
        Ok(())
    }

    fn get(
        &self,
        key: &str,
        dest: &mut dyn Write,
        offset: u64,
        progress: &dyn ProgressTracker,
    ) -> Result<u64> {
        validate_key(key)?;
        let deadline = self.deadline();

        let size = self
            .retry
            .run(key, |_| self.store.head(key))?
            .ok_or_else(|| Error::not_found(key))?
            .size;
        if offset > size {
            return Err(Error::terminal(
                key,
                format!("resume offset {} is past the object size {}", offset, size),
            ));
        }

        let mut position = offset;
        while position < size {
            Self::check_deadline(deadline, key)?;

            let end = (position + self.part_size as u64).min(size);
            // Each retry re-reads from `position`, the first byte not yet written
            let chunk = self
                .retry
                .run(key, |_| self.store.get_range(key, position..end))?;
            if chunk.is_empty() {
                return Err(Error::terminal(
                    key,
                    format!("provider returned no data at offset {}", position),
                ));
            }

            dest.write_all(&chunk)?;
            position += chunk.len() as u64;
            progress.increment(chunk.len() as u64);
        }

        dest.flush()?;
        debug!("Fetched {} ({} bytes from offset {})", key, position - offset, offset);
        Ok(position - offset)
    }

    fn exists(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        Ok(self.retry.run(key, |_| self.store.head(key))?.is_some())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .retry
            .run(prefix, |_| self.store.list(prefix))?
            .into_iter()
            .map(|m| m.key)
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn delete(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        self.retry.run(key, |_| self.store.delete(key))
    }

    fn size(&self, key: &str) -> Result<Option<u64>> {
        validate_key(key)?;
        Ok(self.retry.run(key, |_| self.store.head(key))?.map(|m| m.size))
    }
}
