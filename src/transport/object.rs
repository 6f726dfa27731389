// src/transport/object.rs

//! Object storage provider contract
//!
//! [`ObjectStore`] is the narrow set of calls a cloud object store offers:
//! single-shot puts, multipart uploads that only become visible on
//! completion, ranged reads and metadata lookups. Providers compute a
//! content checksum server-side when asked to, so the uploader can confirm
//! what was actually stored.
//!
//! Two implementations ship here: [`MemoryObjectStore`] for tests, with
//! fault injection, and [`LocalObjectStore`], a bucket kept in a directory.

use crate::error::{Error, Result};
use crate::filesystem::{read_json, write_atomic, write_json_atomic};
use crate::hash::{Checksum, HashAlgorithm, Hasher, hash_bytes};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use tracing::debug;
use walkdir::WalkDir;

/// Metadata about a stored object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub key: String,
    pub size: u64,
    /// Checksum computed by the store on write
    pub checksum: Option<Checksum>,
    pub last_modified: DateTime<Utc>,
}

/// Provider contract for remote object storage
pub trait ObjectStore: Send + Sync {
    /// Provider name for logs
    fn name(&self) -> &str;

    /// Object metadata, `None` if absent
    fn head(&self, key: &str) -> Result<Option<ObjectMeta>>;

    /// Read `range` of an object; the end is clamped to the object size
    fn get_range(&self, key: &str, range: Range<u64>) -> Result<Vec<u8>>;

    /// Store a whole object in one request
    fn put_object(&self, key: &str, data: &[u8], checksum_algorithm: HashAlgorithm) -> Result<()>;

    /// Start a multipart upload, returning its id
    fn create_multipart(&self, key: &str) -> Result<String>;

    /// Upload one part (1-based part numbers; re-uploading a part replaces it)
    fn upload_part(&self, upload_id: &str, part_number: u32, data: &[u8]) -> Result<()>;

    /// Assemble parts in order and make the object visible
    fn complete_multipart(&self, upload_id: &str, checksum_algorithm: HashAlgorithm) -> Result<()>;

    /// Discard an upload and its parts
    fn abort_multipart(&self, upload_id: &str) -> Result<()>;

    fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>>;

    /// Delete an object; deleting a missing object succeeds
    fn delete(&self, key: &str) -> Result<()>;
}

fn range_of(len: usize, range: &Range<u64>, key: &str) -> Result<Range<usize>> {
    let start = usize::try_from(range.start).unwrap_or(usize::MAX);
    if start > len {
        return Err(Error::terminal(
            key,
            format!("range start {} exceeds object length {}", start, len),
        ));
    }
    let end = usize::try_from(range.end).unwrap_or(usize::MAX).min(len);
    if end < start {
        return Err(Error::terminal(key, format!("range end {} is before start {}", end, start)));
    }
    Ok(start..end)
}

// =============================================================================
// In-memory store
// =============================================================================

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    checksum: Checksum,
    last_modified: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Upload {
    key: String,
    parts: BTreeMap<u32, Vec<u8>>,
}

#[derive(Debug, Default)]
struct Faults {
    failing_parts: u32,
    range_reads_before_failure: Option<u32>,
    failing_range_reads: u32,
    corrupt_next_write: bool,
}

#[derive(Debug, Default)]
struct MemoryInner {
    objects: HashMap<String, StoredObject>,
    uploads: HashMap<String, Upload>,
    next_upload: u64,
}

/// In-memory object store for tests
///
/// Clones share state. Fault injection makes the next calls fail with a
/// retryable `Transfer` error, the way a flaky network would.
#[derive(Debug, Clone, Default)]
pub struct MemoryObjectStore {
    inner: Arc<RwLock<MemoryInner>>,
    faults: Arc<Mutex<Faults>>,
    stats: Arc<Mutex<MemoryStats>>,
}

/// Call counters of a [`MemoryObjectStore`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub parts_uploaded: u32,
    pub range_reads: u32,
    pub bytes_served: u64,
    pub aborted_uploads: u32,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` part uploads
    pub fn fail_next_part_uploads(&self, count: u32) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.failing_parts = count;
        }
    }

    /// After `after` successful ranged reads, fail the next `count`
    pub fn fail_range_reads_after(&self, after: u32, count: u32) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.range_reads_before_failure = Some(after);
            faults.failing_range_reads = count;
        }
    }

    /// Store the next completed object with one byte flipped
    pub fn corrupt_next_write(&self) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.corrupt_next_write = true;
        }
    }

    pub fn stats(&self) -> MemoryStats {
        self.stats.lock().map(|s| *s).unwrap_or_default()
    }

    /// Uploads created but neither completed nor aborted
    pub fn pending_uploads(&self) -> usize {
        self.inner.read().map(|i| i.uploads.len()).unwrap_or(0)
    }

    /// Raw bytes of a stored object
    pub fn object_bytes(&self, key: &str) -> Option<Vec<u8>> {
        self.inner
            .read()
            .ok()
            .and_then(|i| i.objects.get(key).map(|o| o.data.clone()))
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, MemoryInner>> {
        self.inner
            .read()
            .map_err(|_| Error::Lock("object store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, MemoryInner>> {
        self.inner
            .write()
            .map_err(|_| Error::Lock("object store lock poisoned".to_string()))
    }

    fn faults(&self) -> Result<std::sync::MutexGuard<'_, Faults>> {
        self.faults
            .lock()
            .map_err(|_| Error::Lock("fault state poisoned".to_string()))
    }

    fn record(&self, f: impl FnOnce(&mut MemoryStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            f(&mut stats);
        }
    }

    fn store(&self, key: &str, mut data: Vec<u8>, algorithm: HashAlgorithm) -> Result<()> {
        {
            let mut faults = self.faults()?;
            if faults.corrupt_next_write {
                faults.corrupt_next_write = false;
                if let Some(byte) = data.first_mut() {
                    *byte ^= 0xff;
                }
            }
        }
        // Checksum of what was actually stored, as a provider reports it
        let checksum = hash_bytes(algorithm, &data);
        self.write()?.objects.insert(
            key.to_string(),
            StoredObject {
                data,
                checksum,
                last_modified: Utc::now(),
            },
        );
        Ok(())
    }
}

impl ObjectStore for MemoryObjectStore {
    fn name(&self) -> &str {
        "object:memory"
    }

    fn head(&self, key: &str) -> Result<Option<ObjectMeta>> {
        Ok(self.read()?.objects.get(key).map(|o| ObjectMeta {
            key: key.to_string(),
            size: o.data.len() as u64,
            checksum: Some(o.checksum.clone()),
            last_modified: o.last_modified,
        }))
    }

    fn get_range(&self, key: &str, range: Range<u64>) -> Result<Vec<u8>> {
        {
            let mut faults = self.faults()?;
            if let Some(remaining) = faults.range_reads_before_failure {
                if remaining == 0 && faults.failing_range_reads > 0 {
                    faults.failing_range_reads -= 1;
                    return Err(Error::retryable(key, "connection reset during ranged read"));
                }
                faults.range_reads_before_failure = Some(remaining.saturating_sub(1));
            }
        }

        let inner = self.read()?;
        let object = inner.objects.get(key).ok_or_else(|| Error::not_found(key))?;
        let range = range_of(object.data.len(), &range, key)?;
        let bytes = object.data[range].to_vec();
        self.record(|s| {
            s.range_reads += 1;
            s.bytes_served += bytes.len() as u64;
        });
        Ok(bytes)
    }

    fn put_object(&self, key: &str, data: &[u8], checksum_algorithm: HashAlgorithm) -> Result<()> {
        self.store(key, data.to_vec(), checksum_algorithm)
    }

    fn create_multipart(&self, key: &str) -> Result<String> {
        let mut inner = self.write()?;
        inner.next_upload += 1;
        let id = format!("upload-{}", inner.next_upload);
        inner.uploads.insert(
            id.clone(),
            Upload {
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );
        Ok(id)
    }

    fn upload_part(&self, upload_id: &str, part_number: u32, data: &[u8]) -> Result<()> {
        {
            let mut faults = self.faults()?;
            if faults.failing_parts > 0 {
                faults.failing_parts -= 1;
                return Err(Error::retryable(
                    upload_id,
                    format!("timeout uploading part {}", part_number),
                ));
            }
        }

        let mut inner = self.write()?;
        let upload = inner
            .uploads
            .get_mut(upload_id)
            .ok_or_else(|| Error::terminal(upload_id, "no such upload"))?;
        upload.parts.insert(part_number, data.to_vec());
        drop(inner);
        self.record(|s| s.parts_uploaded += 1);
        Ok(())
    }

    fn complete_multipart(&self, upload_id: &str, checksum_algorithm: HashAlgorithm) -> Result<()> {
        let upload = self
            .write()?
            .uploads
            .remove(upload_id)
            .ok_or_else(|| Error::terminal(upload_id, "no such upload"))?;
        let data: Vec<u8> = upload.parts.into_values().flatten().collect();
        self.store(&upload.key, data, checksum_algorithm)
    }

    fn abort_multipart(&self, upload_id: &str) -> Result<()> {
        self.write()?.uploads.remove(upload_id);
        self.record(|s| s.aborted_uploads += 1);
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let inner = self.read()?;
        let mut metas: Vec<_> = inner
            .objects
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, o)| ObjectMeta {
                key: k.clone(),
                size: o.data.len() as u64,
                checksum: Some(o.checksum.clone()),
                last_modified: o.last_modified,
            })
            .collect();
        metas.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(metas)
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.write()?.objects.remove(key);
        Ok(())
    }
}

// =============================================================================
// Directory-backed bucket
// =============================================================================

/// Sidecar metadata of a stored object
#[derive(Debug, Serialize, Deserialize)]
struct LocalMeta {
    checksum: Checksum,
    last_modified: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct LocalUpload {
    key: String,
}

/// Bucket emulation in a local directory
///
/// Layout: `objects/<key>`, `meta/<key>.json`, `uploads/<id>/<part>`.
/// Objects become visible by rename, so readers never see a partial one.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        for dir in ["objects", "meta", "uploads"] {
            fs::create_dir_all(root.join(dir))?;
        }
        Ok(Self { root })
    }

    fn object_path(&self, key: &str) -> Result<PathBuf> {
        super::validate_key(key)?;
        Ok(self.root.join("objects").join(key))
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        self.root.join("meta").join(format!("{}.json", key))
    }

    fn upload_dir(&self, upload_id: &str) -> Result<PathBuf> {
        if upload_id.is_empty() || !upload_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(Error::terminal(upload_id, "invalid upload id"));
        }
        Ok(self.root.join("uploads").join(upload_id))
    }

    /// Move a finished temp file into place and record its checksum
    fn commit(&self, key: &str, temp: tempfile::NamedTempFile, checksum: Checksum) -> Result<()> {
        let path = self.object_path(key)?;
        temp.as_file().sync_all()?;
        temp.persist(&path).map_err(|e| e.error)?;
        let meta = LocalMeta {
            checksum,
            last_modified: Utc::now(),
        };
        write_json_atomic(&self.meta_path(key), &meta, true)?;
        Ok(())
    }

    fn temp_for(&self, key: &str) -> Result<tempfile::NamedTempFile> {
        let path = self.object_path(key)?;
        let parent = path.parent().unwrap_or(&self.root);
        fs::create_dir_all(parent)?;
        Ok(tempfile::Builder::new().prefix(".tmp-").tempfile_in(parent)?)
    }

    fn meta_of(&self, key: &str, path: &Path) -> Result<Option<ObjectMeta>> {
        let stat = match fs::metadata(path) {
            Ok(stat) => stat,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(super::transfer_error(key, e)),
        };
        let sidecar: Option<LocalMeta> = read_json(&self.meta_path(key))?;
        Ok(Some(ObjectMeta {
            key: key.to_string(),
            size: stat.len(),
            checksum: sidecar.as_ref().map(|m| m.checksum.clone()),
            last_modified: sidecar
                .map(|m| m.last_modified)
                .unwrap_or_else(Utc::now),
        }))
    }
}

impl ObjectStore for LocalObjectStore {
    fn name(&self) -> &str {
        "object:local"
    }

    fn head(&self, key: &str) -> Result<Option<ObjectMeta>> {
        let path = self.object_path(key)?;
        self.meta_of(key, &path)
    }

    fn get_range(&self, key: &str, range: Range<u64>) -> Result<Vec<u8>> {
        let path = self.object_path(key)?;
        let mut file = File::open(&path).map_err(|e| super::transfer_error(key, e))?;
        let len = file.metadata()?.len() as usize;
        let range = range_of(len, &range, key)?;

        file.seek(SeekFrom::Start(range.start as u64))
            .map_err(|e| super::transfer_error(key, e))?;
        let mut buffer = vec![0u8; range.len()];
        file.read_exact(&mut buffer)
            .map_err(|e| super::transfer_error(key, e))?;
        Ok(buffer)
    }

    fn put_object(&self, key: &str, data: &[u8], checksum_algorithm: HashAlgorithm) -> Result<()> {
        let mut temp = self.temp_for(key)?;
        temp.write_all(data)?;
        self.commit(key, temp, hash_bytes(checksum_algorithm, data))
    }

    fn create_multipart(&self, key: &str) -> Result<String> {
        self.object_path(key)?;
        let id = format!("upload-{}", uuid::Uuid::new_v4().simple());
        let dir = self.upload_dir(&id)?;
        fs::create_dir_all(&dir)?;
        write_json_atomic(&dir.join("upload.json"), &LocalUpload { key: key.to_string() }, false)?;
        debug!("Created multipart upload {} for {}", id, key);
        Ok(id)
    }

    fn upload_part(&self, upload_id: &str, part_number: u32, data: &[u8]) -> Result<()> {
        let dir = self.upload_dir(upload_id)?;
        if !dir.is_dir() {
            return Err(Error::terminal(upload_id, "no such upload"));
        }
        write_atomic(&dir.join(format!("{:05}.part", part_number)), data, true)?;
        Ok(())
    }

    fn complete_multipart(&self, upload_id: &str, checksum_algorithm: HashAlgorithm) -> Result<()> {
        let dir = self.upload_dir(upload_id)?;
        let upload: LocalUpload = read_json(&dir.join("upload.json"))?
            .ok_or_else(|| Error::terminal(upload_id, "no such upload"))?;

        let mut parts: Vec<PathBuf> = fs::read_dir(&dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "part"))
            .collect();
        parts.sort();

        let temp = self.temp_for(&upload.key)?;
        let mut hasher = Hasher::new(checksum_algorithm);
        let mut writer = BufWriter::new(temp);
        for part in &parts {
            let data = fs::read(part)?;
            hasher.update(&data);
            writer.write_all(&data)?;
        }
        let temp = writer.into_inner().map_err(|e| e.into_error())?;
        self.commit(&upload.key, temp, hasher.finalize())?;

        fs::remove_dir_all(&dir)?;
        Ok(())
    }

    fn abort_multipart(&self, upload_id: &str) -> Result<()> {
        let dir = self.upload_dir(upload_id)?;
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let objects = self.root.join("objects");
        let mut metas = Vec::new();
        for entry in WalkDir::new(&objects).follow_links(false) {
            let entry = entry.map_err(|e| Error::terminal(prefix, e.to_string()))?;
            if !entry.file_type().is_file() || entry.file_name().to_string_lossy().starts_with(".tmp-") {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&objects) else {
                continue;
            };
            let key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if key.starts_with(prefix)
                && let Some(meta) = self.meta_of(&key, entry.path())?
            {
                metas.push(meta);
            }
        }
        metas.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(metas)
    }

    fn delete(&self, key: &str) -> Result<()> {
        for path in [self.object_path(key)?, self.meta_path(key)] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(super::transfer_error(key, e)),
            }
        }
        Ok(())
    }
}
