// src/manifest/store.rs

//! On-disk manifest store
//!
//! Layout under the workspace root:
//!
//! ```text
//! manifests/<type>/<version>.manifest.json
//! releases/<release>.release.json
//! dist/<type>/<version>/<archive_file>
//! ```
//!
//! Type and version are separate path segments. Both may contain `-`, so
//! joining them into one name would let two identities share a file.
//!
//! The store is the only writer of these files. Writes go through
//! temp-then-rename, and identity conflicts are detected by the final
//! no-clobber rename itself, so two concurrent packers of the same
//! `(type, version)` cannot both win.

use super::types::{
    ComponentManifest, ComponentRef, ReleaseManifest, validate_component_type, validate_version,
};
use crate::error::{Error, Result};
use crate::filesystem::{read_json, write_json_atomic};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

const MANIFEST_SUFFIX: &str = ".manifest.json";
const RELEASE_SUFFIX: &str = ".release.json";

/// Manifest store rooted at a workspace directory
#[derive(Debug, Clone)]
pub struct ManifestStore {
    root: PathBuf,
}

impl ManifestStore {
    /// Open (and create if needed) a store at `root`
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        for dir in ["manifests", "releases", "dist"] {
            fs::create_dir_all(root.join(dir))?;
        }
        debug!("Opened manifest store at {}", root.display());
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifests_dir(&self) -> PathBuf {
        self.root.join("manifests")
    }

    pub fn releases_dir(&self) -> PathBuf {
        self.root.join("releases")
    }

    /// Directory holding packaged archives
    pub fn dist_dir(&self) -> PathBuf {
        self.root.join("dist")
    }

    /// Directory holding the archive of one `(type, version)`
    pub fn archive_dir(&self, component_type: &str, version: &str) -> PathBuf {
        self.dist_dir().join(component_type).join(version)
    }

    /// Path of the archive a manifest describes
    pub fn archive_path(&self, manifest: &ComponentManifest) -> PathBuf {
        self.archive_dir(&manifest.component_type, &manifest.version)
            .join(&manifest.archive_file)
    }

    fn component_path(&self, component_type: &str, version: &str) -> PathBuf {
        self.manifests_dir()
            .join(component_type)
            .join(format!("{}{}", version, MANIFEST_SUFFIX))
    }

    fn release_path(&self, release_version: &str) -> PathBuf {
        self.releases_dir()
            .join(format!("{}{}", release_version, RELEASE_SUFFIX))
    }

    // =========================================================================
    // Component manifests
    // =========================================================================

    /// Persist a component manifest
    ///
    /// Fails with `Conflict` if the identity already exists and `force` is
    /// not set. With `force` the prior manifest is replaced whole.
    pub fn put_component(&self, manifest: &ComponentManifest, force: bool) -> Result<()> {
        manifest.validate()?;
        let path = self.component_path(&manifest.component_type, &manifest.version);

        match write_json_atomic(&path, manifest, force) {
            Ok(()) => {
                info!("Stored component manifest {}", manifest.id());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                Err(Error::conflict(manifest.id().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Whether a component manifest exists
    pub fn has_component(&self, component_type: &str, version: &str) -> bool {
        self.component_path(component_type, version).is_file()
    }

    /// Load a component manifest
    pub fn get_component(&self, component_type: &str, version: &str) -> Result<ComponentManifest> {
        validate_component_type(component_type)?;
        validate_version(version)?;

        let id = ComponentRef::new(component_type, version);
        let manifest: ComponentManifest = read_json(&self.component_path(component_type, version))?
            .ok_or_else(|| Error::not_found(id.to_string()))?;

        // The filename is derived from the identity; a mismatch means the
        // file was edited or copied by hand.
        if manifest.id() != id {
            return Err(Error::InvalidInput(format!(
                "manifest file for {} describes {}",
                id,
                manifest.id()
            )));
        }
        Ok(manifest)
    }

    /// List component manifests, optionally restricted to one type
    ///
    /// Sorted by type, then version string. Unreadable files are skipped
    /// with a warning.
    pub fn list_components(&self, component_type: Option<&str>) -> Result<Vec<ComponentManifest>> {
        if let Some(t) = component_type {
            validate_component_type(t)?;
        }
        let mut manifests = Vec::new();

        let root = match component_type {
            Some(t) => self.manifests_dir().join(t),
            None => self.manifests_dir(),
        };
        let depth = if component_type.is_some() { 1 } else { 2 };

        for entry in WalkDir::new(&root).min_depth(depth).max_depth(depth) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) if e.io_error().is_some_and(|io| io.kind() == io::ErrorKind::NotFound) => {
                    continue;
                }
                Err(e) => return Err(io::Error::from(e).into()),
            };
            let path = entry.path();
            let is_manifest = entry.file_type().is_file()
                && path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.ends_with(MANIFEST_SUFFIX));
            if !is_manifest {
                continue;
            }

            match read_json::<ComponentManifest>(path) {
                Ok(Some(m)) => {
                    if component_type.is_none_or(|t| t == m.component_type) {
                        manifests.push(m);
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("Skipping unreadable manifest {}: {}", path.display(), e),
            }
        }

        manifests.sort_by(|a, b| {
            (&a.component_type, &a.version).cmp(&(&b.component_type, &b.version))
        });
        Ok(manifests)
    }

    /// Remove a component manifest and its archive
    ///
    /// Fails with `Conflict` if any stored release still references it.
    pub fn delete_component(&self, component_type: &str, version: &str) -> Result<()> {
        let manifest = self.get_component(component_type, version)?;

        for release in self.list_releases()? {
            if release
                .components
                .iter()
                .any(|c| c.component_type == component_type && c.version == version)
            {
                return Err(Error::conflict(format!(
                    "{} is referenced by release {}",
                    manifest.id(),
                    release.release_version
                )));
            }
        }

        fs::remove_file(self.component_path(component_type, version))?;
        match fs::remove_file(self.archive_path(&manifest)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        // Empty per-identity directories only; anything else stays
        let _ = fs::remove_dir(self.archive_dir(component_type, version));
        info!("Deleted component {}", manifest.id());
        Ok(())
    }

    // =========================================================================
    // Release manifests
    // =========================================================================

    /// Persist a release manifest
    ///
    /// Every referenced component must exist with a matching archive
    /// checksum. Fails with `Conflict` if the release exists and `force`
    /// is not set.
    pub fn put_release(&self, manifest: &ReleaseManifest, force: bool) -> Result<()> {
        manifest.validate()?;

        for component in &manifest.components {
            let stored = self.get_component(&component.component_type, &component.version)?;
            if stored.archive_checksum != component.archive_checksum {
                warn!(
                    "Release {} pins {} at {} but the stored manifest has {}",
                    manifest.release_version,
                    component.id(),
                    component.archive_checksum,
                    stored.archive_checksum
                );
                return Err(Error::integrity(component.id().to_string(), stored.archive_file));
            }
        }

        let path = self.release_path(&manifest.release_version);
        match write_json_atomic(&path, manifest, force) {
            Ok(()) => {
                info!("Stored release manifest {}", manifest.release_version);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                Err(Error::conflict(manifest.release_version.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn has_release(&self, release_version: &str) -> bool {
        self.release_path(release_version).is_file()
    }

    /// Load a release manifest
    pub fn get_release(&self, release_version: &str) -> Result<ReleaseManifest> {
        validate_version(release_version)?;
        read_json(&self.release_path(release_version))?
            .ok_or_else(|| Error::not_found(format!("release {}", release_version)))
    }

    /// List all release manifests, sorted by creation time
    pub fn list_releases(&self) -> Result<Vec<ReleaseManifest>> {
        let mut releases = Vec::new();

        for entry in fs::read_dir(self.releases_dir())? {
            let path = entry?.path();
            let is_release = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(RELEASE_SUFFIX));
            if !is_release {
                continue;
            }
            match read_json::<ReleaseManifest>(&path) {
                Ok(Some(r)) => releases.push(r),
                Ok(None) => {}
                Err(e) => warn!("Skipping unreadable release {}: {}", path.display(), e),
            }
        }

        releases.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(releases)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::CompressionFormat;
    use crate::hash::{HashAlgorithm, hash_bytes};
    use crate::manifest::types::{FileRecord, MANIFEST_SCHEMA_VERSION, ReleaseComponent};
    use chrono::Utc;
    use tempfile::TempDir;

    fn manifest(component_type: &str, version: &str, content: &[u8]) -> ComponentManifest {
        ComponentManifest {
            schema_version: MANIFEST_SCHEMA_VERSION.to_string(),
            component_type: component_type.to_string(),
            version: version.to_string(),
            files: vec![FileRecord {
                path: "data.bin".to_string(),
                size: content.len() as u64,
                checksum: hash_bytes(HashAlgorithm::Sha256, content),
                mode: 0o644,
            }],
            archive_checksum: hash_bytes(HashAlgorithm::Sha256, content),
            archive_file: ComponentManifest::archive_file_name(
                component_type,
                version,
                CompressionFormat::Gzip,
            ),
            archive_size: 10,
            compression: CompressionFormat::Gzip,
            hash_algorithm: HashAlgorithm::Sha256,
            total_size: content.len() as u64,
            created_at: Utc::now(),
        }
    }

    fn release(version: &str, components: &[&ComponentManifest]) -> ReleaseManifest {
        ReleaseManifest {
            schema_version: MANIFEST_SCHEMA_VERSION.to_string(),
            release_version: version.to_string(),
            components: components
                .iter()
                .map(|m| ReleaseComponent {
                    component_type: m.component_type.clone(),
                    version: m.version.clone(),
                    archive_checksum: m.archive_checksum.clone(),
                })
                .collect(),
            description: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_put_get_component() {
        let temp = TempDir::new().unwrap();
        let store = ManifestStore::open(temp.path()).unwrap();
        let m = manifest("model", "1.0.0", b"v1");

        store.put_component(&m, false).unwrap();
        let loaded = store.get_component("model", "1.0.0").unwrap();
        assert_eq!(loaded, m);
        assert!(temp.path().join("manifests/model/1.0.0.manifest.json").exists());
    }

    #[test]
    fn test_dashed_identities_do_not_share_files() {
        let temp = TempDir::new().unwrap();
        let store = ManifestStore::open(temp.path()).unwrap();
        let first = manifest("model-x", "1", b"first");
        let second = manifest("model", "x-1", b"second");

        store.put_component(&first, false).unwrap();
        store.put_component(&second, false).unwrap();

        assert_eq!(store.get_component("model-x", "1").unwrap(), first);
        assert_eq!(store.get_component("model", "x-1").unwrap(), second);
        assert_ne!(store.archive_path(&first), store.archive_path(&second));
        assert_eq!(store.list_components(None).unwrap().len(), 2);
        assert_eq!(store.list_components(Some("model")).unwrap(), vec![second]);
    }

    #[test]
    fn test_put_component_conflict_and_force() {
        let temp = TempDir::new().unwrap();
        let store = ManifestStore::open(temp.path()).unwrap();

        store.put_component(&manifest("model", "1.0.0", b"v1"), false).unwrap();

        let replacement = manifest("model", "1.0.0", b"v1-rebuilt");
        let err = store.put_component(&replacement, false).unwrap_err();
        assert!(matches!(err, Error::Conflict { ref entity } if entity == "model:1.0.0"));
        assert_ne!(store.get_component("model", "1.0.0").unwrap(), replacement);

        store.put_component(&replacement, true).unwrap();
        assert_eq!(store.get_component("model", "1.0.0").unwrap(), replacement);
    }

    #[test]
    fn test_get_missing_component() {
        let temp = TempDir::new().unwrap();
        let store = ManifestStore::open(temp.path()).unwrap();
        let err = store.get_component("config", "1.0.0").unwrap_err();
        assert!(matches!(err, Error::NotFound { ref entity } if entity == "config:1.0.0"));
    }

    #[test]
    fn test_list_components_filters_by_type() {
        let temp = TempDir::new().unwrap();
        let store = ManifestStore::open(temp.path()).unwrap();
        store.put_component(&manifest("model", "1.0.1", b"b"), false).unwrap();
        store.put_component(&manifest("model", "1.0.0", b"a"), false).unwrap();
        store.put_component(&manifest("config", "2.0", b"c"), false).unwrap();
        fs::write(store.manifests_dir().join("notes.txt"), "ignored").unwrap();

        let all = store.list_components(None).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].component_type, "config");

        let models = store.list_components(Some("model")).unwrap();
        let versions: Vec<_> = models.iter().map(|m| m.version.as_str()).collect();
        assert_eq!(versions, vec!["1.0.0", "1.0.1"]);
    }

    #[test]
    fn test_put_release_checks_references() {
        let temp = TempDir::new().unwrap();
        let store = ManifestStore::open(temp.path()).unwrap();
        let model = manifest("model", "1.0.0", b"a");
        let missing = manifest("config", "1.0.0", b"c");
        store.put_component(&model, false).unwrap();

        let err = store
            .put_release(&release("2024.01.20", &[&model, &missing]), false)
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { ref entity } if entity == "config:1.0.0"));
        assert!(!store.has_release("2024.01.20"));

        let mut stale = model.clone();
        stale.archive_checksum = hash_bytes(HashAlgorithm::Sha256, b"other");
        let err = store
            .put_release(&release("2024.01.20", &[&stale]), false)
            .unwrap_err();
        assert!(matches!(err, Error::Integrity { .. }));

        store.put_release(&release("2024.01.20", &[&model]), false).unwrap();
        let err = store
            .put_release(&release("2024.01.20", &[&model]), false)
            .unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
        store.put_release(&release("2024.01.20", &[&model]), true).unwrap();

        assert_eq!(store.get_release("2024.01.20").unwrap().components.len(), 1);
    }

    #[test]
    fn test_delete_component_refuses_when_referenced() {
        let temp = TempDir::new().unwrap();
        let store = ManifestStore::open(temp.path()).unwrap();
        let model = manifest("model", "1.0.0", b"a");
        let orphan = manifest("model", "0.9.0", b"z");
        store.put_component(&model, false).unwrap();
        store.put_component(&orphan, false).unwrap();
        store.put_release(&release("r1", &[&model]), false).unwrap();

        assert!(matches!(
            store.delete_component("model", "1.0.0"),
            Err(Error::Conflict { .. })
        ));
        store.delete_component("model", "0.9.0").unwrap();
        assert!(!store.has_component("model", "0.9.0"));
    }
}
