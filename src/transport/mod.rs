// src/transport/mod.rs

//! Storage transports
//!
//! A [`Transport`] moves archive bytes between this host and a storage
//! location addressed by `/`-separated keys. The release composer and the
//! deployer only ever talk to this trait; which backend sits behind it is
//! decided once, by [`open`], from configuration.
//!
//! Contract shared by every backend:
//! - `put` followed by `get` of the same key yields byte-identical content
//! - `put` never leaves a partially written key visible
//! - failures surface as `Transfer { retryable }`, or `NotFound` for a
//!   missing key

pub mod fetch;
pub mod filesystem;
pub mod object;
pub mod remote;
pub mod retry;

pub use fetch::fetch_to_file;
pub use filesystem::FilesystemTransport;
pub use object::{LocalObjectStore, MemoryObjectStore, ObjectMeta, ObjectStore};
pub use remote::RemoteTransport;
pub use retry::RetryPolicy;

use crate::config::{RetryConfig, StorageConfig, StorageKind};
use crate::error::{Error, Result};
use crate::hash::Checksum;
use crate::progress::{ProgressTracker, SilentProgress};
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;
use tracing::info;

/// Copy buffer size for transports
pub(crate) const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Uniform put/get/list contract over a storage backend
pub trait Transport: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &str;

    /// Store everything `source` yields under `key`
    ///
    /// Succeeds only once the stored bytes are confirmed to hash to
    /// `expected`. Replaces any existing object.
    fn put(
        &self,
        key: &str,
        source: &mut dyn Read,
        expected: &Checksum,
        progress: &dyn ProgressTracker,
    ) -> Result<()>;

    /// Write the object's bytes from `offset` on into `dest`
    ///
    /// Returns the number of bytes written. A read that fails mid-way is
    /// retried from the first byte not yet handed to `dest`.
    fn get(
        &self,
        key: &str,
        dest: &mut dyn Write,
        offset: u64,
        progress: &dyn ProgressTracker,
    ) -> Result<u64>;

    fn exists(&self, key: &str) -> Result<bool>;

    /// Keys starting with `prefix`, sorted
    fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Remove a key; removing a missing key succeeds
    fn delete(&self, key: &str) -> Result<()>;

    /// Size of the stored object, `None` if absent
    fn size(&self, key: &str) -> Result<Option<u64>>;
}

/// Build the transport selected by configuration
pub fn open(storage: &StorageConfig, retry: &RetryConfig) -> Result<Box<dyn Transport>> {
    let policy = RetryPolicy::from(retry);
    let transport: Box<dyn Transport> = match storage.kind {
        StorageKind::Filesystem => {
            let mut local = FilesystemTransport::new(&storage.root)?.with_retry(policy);
            if let Some(timeout) = storage.timeout() {
                local = local.with_timeout(timeout);
            }
            Box::new(local)
        }
        StorageKind::Object => {
            let store = LocalObjectStore::open(&storage.root)?;
            let mut remote = RemoteTransport::new(store, storage.part_size).with_retry(policy);
            if let Some(timeout) = storage.timeout() {
                remote = remote.with_timeout(timeout);
            }
            Box::new(remote)
        }
    };
    info!(
        "Using {} transport at {}",
        transport.name(),
        storage.root.display()
    );
    Ok(transport)
}

/// Upload a local file
pub fn put_file(transport: &dyn Transport, key: &str, path: &Path, expected: &Checksum) -> Result<()> {
    let mut reader = BufReader::new(File::open(path)?);
    transport.put(key, &mut reader, expected, &SilentProgress::new())
}

/// Upload an in-memory payload, computing its checksum
pub fn put_bytes(transport: &dyn Transport, key: &str, data: &[u8]) -> Result<Checksum> {
    let checksum = crate::hash::hash_bytes(Default::default(), data);
    transport.put(key, &mut io::Cursor::new(data), &checksum, &SilentProgress::new())?;
    Ok(checksum)
}

/// Download a whole object into memory (manifests, small records)
pub fn get_bytes(transport: &dyn Transport, key: &str) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    transport.get(key, &mut buffer, 0, &SilentProgress::new())?;
    Ok(buffer)
}

/// Storage keys are relative `/`-separated paths without `.` or `..`
pub fn validate_key(key: &str) -> Result<()> {
    let valid = !key.is_empty()
        && !key.starts_with('/')
        && !key.ends_with('/')
        && !key.contains('\\')
        && key.split('/').all(|seg| !seg.is_empty() && seg != "." && seg != "..");
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!("invalid storage key '{}'", key)))
    }
}

/// Classify an I/O failure against `key`
pub(crate) fn transfer_error(key: &str, err: io::Error) -> Error {
    use io::ErrorKind::*;
    match err.kind() {
        NotFound => Error::not_found(key),
        TimedOut | Interrupted | WouldBlock | ConnectionReset | ConnectionAborted | BrokenPipe
        | UnexpectedEof => Error::retryable(key, err.to_string()),
        _ => Error::terminal(key, err.to_string()),
    }
}

/// Storage key layout of a release
pub mod keys {
    /// `<release>/release.json`
    pub fn release_manifest(release: &str) -> String {
        format!("{}/release.json", release)
    }

    /// `<release>/<type>/<version>/`
    pub fn component_prefix(release: &str, component_type: &str, version: &str) -> String {
        format!("{}/{}/{}", release, component_type, version)
    }

    /// `<release>/<type>/<version>/<archive_file>`
    pub fn component_archive(release: &str, component_type: &str, version: &str, archive_file: &str) -> String {
        format!("{}/{}", component_prefix(release, component_type, version), archive_file)
    }

    /// `<release>/<type>/<version>/manifest.json`
    pub fn component_manifest(release: &str, component_type: &str, version: &str) -> String {
        format!("{}/manifest.json", component_prefix(release, component_type, version))
    }
}
