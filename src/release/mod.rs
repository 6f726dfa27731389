// src/release/mod.rs

//! Release composition
//!
//! A release pins one version of each of several component types. Composing
//! it resolves every reference against the manifest store, re-checks each
//! local archive, uploads archives and component manifests into the
//! release's storage namespace, and writes the release manifest last. Any
//! failure before that final write leaves no release behind.

use crate::archive::archive_checksum_matches;
use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::manifest::{
    ComponentManifest, ComponentRef, MANIFEST_SCHEMA_VERSION, ManifestStore, ReleaseComponent,
    ReleaseManifest, validate_version,
};
use crate::progress::{ProgressTracker, SilentProgress};
use crate::transport::{Transport, keys, put_bytes, put_file};
use chrono::Utc;
use rayon::prelude::*;
use std::collections::HashSet;
use tracing::{debug, info};

/// Options for [`ReleaseComposer::compose`]
#[derive(Debug, Clone)]
pub struct ComposeOptions {
    /// Replace an existing release of the same version
    pub force: bool,
    /// Component uploads in flight at once
    pub concurrency: usize,
    pub description: Option<String>,
    pub cancel: CancelToken,
}

impl Default for ComposeOptions {
    fn default() -> Self {
        Self {
            force: false,
            concurrency: 4,
            description: None,
            cancel: CancelToken::new(),
        }
    }
}

/// Composes releases from a manifest store onto a transport
pub struct ReleaseComposer<'a> {
    store: &'a ManifestStore,
    transport: &'a dyn Transport,
    progress: Option<&'a dyn ProgressTracker>,
    silent: SilentProgress,
}

impl<'a> ReleaseComposer<'a> {
    pub fn new(store: &'a ManifestStore, transport: &'a dyn Transport) -> Self {
        Self {
            store,
            transport,
            progress: None,
            silent: SilentProgress::new(),
        }
    }

    /// Report one unit per uploaded component
    pub fn with_progress(mut self, progress: &'a dyn ProgressTracker) -> Self {
        self.progress = Some(progress);
        self
    }

    fn progress(&self) -> &dyn ProgressTracker {
        match self.progress {
            Some(progress) => progress,
            None => &self.silent,
        }
    }

    /// Compose `release_version` from `components`
    ///
    /// Fails fast with `NotFound` naming the first unknown `type:version`,
    /// with `Conflict` if the release exists and `force` is not set, and
    /// with the first terminal transfer error. In every failure case the
    /// release manifest is not written.
    pub fn compose(
        &self,
        release_version: &str,
        components: &[ComponentRef],
        options: &ComposeOptions,
    ) -> Result<ReleaseManifest> {
        validate_version(release_version)?;
        if components.is_empty() {
            return Err(Error::InvalidInput(format!(
                "release {} names no components",
                release_version
            )));
        }
        let mut types = HashSet::new();
        if let Some(dup) = components.iter().find(|c| !types.insert(c.component_type.as_str())) {
            return Err(Error::InvalidInput(format!(
                "release {} lists component type '{}' more than once",
                release_version, dup.component_type
            )));
        }

        // (1) every reference resolves
        let manifests = components
            .iter()
            .map(|c| self.store.get_component(&c.component_type, &c.version))
            .collect::<Result<Vec<_>>>()?;

        // (2) the release is new, or force was given
        if !options.force
            && (self.store.has_release(release_version)
                || self.transport.exists(&keys::release_manifest(release_version))?)
        {
            return Err(Error::conflict(release_version));
        }

        // (3) publish every component
        options.cancel.check()?;
        self.progress().set_length(manifests.len() as u64);
        self.upload_components(release_version, &manifests, options)?;

        // (4) the release manifest, last
        let release = ReleaseManifest {
            schema_version: MANIFEST_SCHEMA_VERSION.to_string(),
            release_version: release_version.to_string(),
            components: manifests
                .iter()
                .map(|m| ReleaseComponent {
                    component_type: m.component_type.clone(),
                    version: m.version.clone(),
                    archive_checksum: m.archive_checksum.clone(),
                })
                .collect(),
            description: options.description.clone(),
            created_at: Utc::now(),
        };
        release.validate()?;

        options.cancel.check()?;
        let json = serde_json::to_vec_pretty(&release)?;
        put_bytes(self.transport, &keys::release_manifest(release_version), &json)?;
        self.store.put_release(&release, options.force)?;

        self.progress()
            .finish_with_message(&format!("release {} published", release_version));
        info!(
            "Composed release {} with {} components via {}",
            release_version,
            release.components.len(),
            self.transport.name()
        );
        Ok(release)
    }

    fn upload_components(
        &self,
        release_version: &str,
        manifests: &[ComponentManifest],
        options: &ComposeOptions,
    ) -> Result<()> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(options.concurrency.max(1))
            .build()
            .map_err(|e| Error::InvalidInput(format!("cannot start upload workers: {}", e)))?;

        pool.install(|| {
            manifests
                .par_iter()
                .try_for_each(|m| self.upload_component(release_version, m, &options.cancel))
        })
    }

    fn upload_component(&self, release_version: &str, manifest: &ComponentManifest, cancel: &CancelToken) -> Result<()> {
        cancel.check()?;

        let archive = self.store.archive_path(manifest);
        if !archive.is_file() {
            return Err(Error::not_found(archive.display().to_string()));
        }
        if !archive_checksum_matches(&archive, manifest)? {
            return Err(Error::integrity(manifest.id().to_string(), manifest.archive_file.clone()));
        }

        let (component_type, version) = (&manifest.component_type, &manifest.version);
        let archive_key = keys::component_archive(release_version, component_type, version, &manifest.archive_file);
        debug!("Uploading {} to {}", manifest.id(), archive_key);
        put_file(self.transport, &archive_key, &archive, &manifest.archive_checksum)?;

        let json = serde_json::to_vec_pretty(manifest)?;
        put_bytes(
            self.transport,
            &keys::component_manifest(release_version, component_type, version),
            &json,
        )?;

        self.progress().increment(1);
        self.progress().set_message(&format!("published {}", manifest.id()));
        Ok(())
    }
}

/// Component references parsed from `type:version` strings
pub fn parse_refs<S: AsRef<str>>(specs: &[S]) -> Result<Vec<ComponentRef>> {
    specs.iter().map(|s| s.as_ref().parse()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{BuildOptions, pack};
    use crate::transport::{FilesystemTransport, MemoryObjectStore, RemoteTransport, RetryPolicy};
    use std::fs;
    use tempfile::TempDir;

    fn workspace() -> (TempDir, ManifestStore) {
        let temp = TempDir::new().unwrap();
        let store = ManifestStore::open(temp.path().join("ws")).unwrap();
        (temp, store)
    }

    fn pack_component(temp: &TempDir, store: &ManifestStore, component_type: &str, version: &str) -> ComponentManifest {
        let src = temp.path().join(format!("src-{}-{}", component_type, version));
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("payload.bin"), format!("{component_type} {version}")).unwrap();
        pack(store, &src, component_type, version, &BuildOptions::default(), false).unwrap()
    }

    #[test]
    fn test_compose_publishes_archives_then_manifest() {
        let (temp, store) = workspace();
        let model = pack_component(&temp, &store, "model", "1.0.0");
        pack_component(&temp, &store, "config", "1.0.0");
        let transport = FilesystemTransport::new(temp.path().join("remote")).unwrap();

        let refs = parse_refs(&["model:1.0.0", "config:1.0.0"]).unwrap();
        let release = ReleaseComposer::new(&store, &transport)
            .compose("2024.01.20", &refs, &ComposeOptions::default())
            .unwrap();

        assert_eq!(release.components.len(), 2);
        assert_eq!(release.components[0].archive_checksum, model.archive_checksum);
        assert!(store.has_release("2024.01.20"));
        assert_eq!(
            transport.list("2024.01.20/").unwrap(),
            vec![
                "2024.01.20/config/1.0.0/config-1.0.0.tar.gz".to_string(),
                "2024.01.20/config/1.0.0/manifest.json".to_string(),
                "2024.01.20/model/1.0.0/manifest.json".to_string(),
                "2024.01.20/model/1.0.0/model-1.0.0.tar.gz".to_string(),
                "2024.01.20/release.json".to_string(),
            ]
        );
    }

    #[test]
    fn test_missing_component_writes_nothing() {
        let (temp, store) = workspace();
        pack_component(&temp, &store, "model", "1.0.0");
        let transport = FilesystemTransport::new(temp.path().join("remote")).unwrap();

        let refs = parse_refs(&["model:1.0.0", "config:1.0.0"]).unwrap();
        let err = ReleaseComposer::new(&store, &transport)
            .compose("2024.01.20", &refs, &ComposeOptions::default())
            .unwrap_err();

        assert!(matches!(err, Error::NotFound { ref entity } if entity == "config:1.0.0"));
        assert!(!store.has_release("2024.01.20"));
        assert!(transport.list("").unwrap().is_empty());
    }

    #[test]
    fn test_existing_release_conflicts_without_force() {
        let (temp, store) = workspace();
        pack_component(&temp, &store, "model", "1.0.0");
        let transport = FilesystemTransport::new(temp.path().join("remote")).unwrap();
        let refs = parse_refs(&["model:1.0.0"]).unwrap();
        let composer = ReleaseComposer::new(&store, &transport);

        composer.compose("r1", &refs, &ComposeOptions::default()).unwrap();
        let err = composer.compose("r1", &refs, &ComposeOptions::default()).unwrap_err();
        assert!(matches!(err, Error::Conflict { ref entity } if entity == "r1"));

        let forced = ComposeOptions {
            force: true,
            description: Some("rebuilt".to_string()),
            ..Default::default()
        };
        let release = composer.compose("r1", &refs, &forced).unwrap();
        assert_eq!(store.get_release("r1").unwrap().description, release.description);
    }

    #[test]
    fn test_tampered_archive_is_not_published() {
        let (temp, store) = workspace();
        let model = pack_component(&temp, &store, "model", "1.0.0");
        fs::write(store.archive_path(&model), b"tampered").unwrap();
        let transport = FilesystemTransport::new(temp.path().join("remote")).unwrap();

        let err = ReleaseComposer::new(&store, &transport)
            .compose("r1", &parse_refs(&["model:1.0.0"]).unwrap(), &ComposeOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::Integrity { .. }));
        assert!(!store.has_release("r1"));
    }

    #[test]
    fn test_terminal_upload_failure_aborts_composition() {
        let (temp, store) = workspace();
        pack_component(&temp, &store, "model", "1.0.0");
        let remote = MemoryObjectStore::new();
        let transport = RemoteTransport::new(remote.clone(), 1024).with_retry(RetryPolicy::immediate(2));
        remote.corrupt_next_write();

        let err = ReleaseComposer::new(&store, &transport)
            .compose("r1", &parse_refs(&["model:1.0.0"]).unwrap(), &ComposeOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::Transfer { retryable: false, .. }));
        assert!(!store.has_release("r1"));
        assert!(remote.object_bytes("r1/release.json").is_none());
    }

    #[test]
    fn test_cancelled_before_upload() {
        let (temp, store) = workspace();
        pack_component(&temp, &store, "model", "1.0.0");
        let transport = FilesystemTransport::new(temp.path().join("remote")).unwrap();
        let options = ComposeOptions::default();
        options.cancel.cancel();

        let err = ReleaseComposer::new(&store, &transport)
            .compose("r1", &parse_refs(&["model:1.0.0"]).unwrap(), &options)
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(!store.has_release("r1"));
    }
}
