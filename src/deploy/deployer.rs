// src/deploy/deployer.rs

//! Deploy coordinator
//!
//! Each component of a release runs its own pipeline:
//!
//! ```text
//! Validating -> Fetching -> Extracting -> Switching -> Complete
//!      \            \            \             \
//!       `------------`------------`-------------`--> Failed
//! ```
//!
//! Pipelines are independent. A failure is recorded in the report against
//! that component only; components already switched stay switched so an
//! operator can re-run the deploy for just the failed ones.
//!
//! A deployer reads from one or more sources in priority order. When a
//! source cannot serve the release or a component (missing key, transfer
//! failure, content that does not verify) the next one is tried; local
//! failures never fall over.

use super::TargetLayout;
use super::links::{self, AliasLink};
use super::log::SwitchReason;
use super::switch::VersionSwitch;
use crate::archive::{Extractor, verify_directory};
use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::filesystem::{remove_dir_all_quiet, write_json_atomic};
use crate::manifest::{
    ComponentManifest, ReleaseComponent, ReleaseManifest, validate_component_type, validate_version,
};
use crate::progress::{ProgressTracker, SilentProgress};
use crate::transport::{Transport, fetch_to_file, get_bytes, keys};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::HashSet;
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use strum_macros::Display;
use tracing::{debug, info, warn};

/// Pipeline stage of one component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DeployState {
    Validating,
    Fetching,
    Extracting,
    Switching,
    Complete,
    Failed,
}

/// Result of one component's pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ComponentOutcome {
    /// Alias now points at the release's version
    Deployed {
        /// False when an intact versioned directory was reused
        extracted: bool,
    },
    /// Version was already current and verified intact
    SkippedAlreadyCurrent,
    Failed {
        /// Stage the pipeline was in when it failed
        state: DeployState,
        error: String,
        retryable: bool,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentReport {
    pub component_type: String,
    pub version: String,
    #[serde(flatten)]
    pub outcome: ComponentOutcome,
}

/// Per-component outcomes of one deploy, in release order
#[derive(Debug, Clone, Serialize)]
pub struct DeployReport {
    pub release_version: String,
    pub components: Vec<ComponentReport>,
}

impl DeployReport {
    pub fn is_success(&self) -> bool {
        self.failed().next().is_none()
    }

    pub fn failed(&self) -> impl Iterator<Item = &ComponentReport> {
        self.components
            .iter()
            .filter(|c| matches!(c.outcome, ComponentOutcome::Failed { .. }))
    }

    pub fn component(&self, component_type: &str) -> Option<&ComponentReport> {
        self.components
            .iter()
            .find(|c| c.component_type == component_type)
    }
}

/// Options for [`Deployer::deploy`]
#[derive(Debug, Clone)]
pub struct DeployOptions {
    /// Restrict to these component types; empty means all. Repeated
    /// types are deployed once.
    pub components: Vec<String>,
    /// Component pipelines run at once
    pub concurrency: usize,
    pub cancel: CancelToken,
}

impl Default for DeployOptions {
    fn default() -> Self {
        Self {
            components: Vec::new(),
            concurrency: 4,
            cancel: CancelToken::new(),
        }
    }
}

/// Whether a source-side failure should move on to the next source
fn fails_over(err: &Error) -> bool {
    matches!(
        err,
        Error::NotFound { .. } | Error::Integrity { .. } | Error::Transfer { .. } | Error::Json(_)
    )
}

/// Deploys releases from transports onto a target root
pub struct Deployer<'a> {
    sources: Vec<&'a dyn Transport>,
    layout: TargetLayout,
    extractor: Extractor,
    links: Vec<AliasLink>,
    progress: Option<&'a dyn ProgressTracker>,
    silent: SilentProgress,
}

impl<'a> Deployer<'a> {
    pub fn new(transport: &'a dyn Transport, target_root: impl Into<PathBuf>) -> Self {
        Self {
            sources: vec![transport],
            layout: TargetLayout::new(target_root),
            extractor: Extractor::new(),
            links: Vec::new(),
            progress: None,
            silent: SilentProgress::new(),
        }
    }

    /// Source tried after every source added before it
    pub fn with_fallback(mut self, transport: &'a dyn Transport) -> Self {
        self.sources.push(transport);
        self
    }

    /// Aliases kept pointing at `current/<type>` of the deployed components
    pub fn with_links(mut self, links: Vec<AliasLink>) -> Self {
        self.links = links;
        self
    }

    pub fn with_extractor(mut self, extractor: Extractor) -> Self {
        self.extractor = extractor;
        self
    }

    /// Report one unit per finished component
    pub fn with_progress(mut self, progress: &'a dyn ProgressTracker) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn layout(&self) -> &TargetLayout {
        &self.layout
    }

    fn progress(&self) -> &dyn ProgressTracker {
        match self.progress {
            Some(progress) => progress,
            None => &self.silent,
        }
    }

    /// Deploy `release_version`
    ///
    /// Release-level problems (release missing, a filtered component not in
    /// the release) fail the whole call with `NotFound`. Everything after
    /// that is reported per component.
    pub fn deploy(&self, release_version: &str, options: &DeployOptions) -> Result<DeployReport> {
        let release = self.load_release(release_version)?;

        let selected: Vec<&ReleaseComponent> = if options.components.is_empty() {
            release.components.iter().collect()
        } else {
            let mut seen = HashSet::new();
            let mut selected = Vec::new();
            for component_type in &options.components {
                let entry = release.component(component_type).ok_or_else(|| {
                    Error::not_found(format!("{} in release {}", component_type, release_version))
                })?;
                if seen.insert(component_type.as_str()) {
                    selected.push(entry);
                } else {
                    debug!("Ignoring repeated component filter '{}'", component_type);
                }
            }
            selected
        };

        info!(
            "Deploying release {} ({} components) to {}",
            release_version,
            selected.len(),
            self.layout.root().display()
        );
        self.progress().set_length(selected.len() as u64);

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(options.concurrency.max(1))
            .build()
            .map_err(|e| Error::InvalidInput(format!("cannot start deploy workers: {}", e)))?;

        let components = pool.install(|| {
            selected
                .par_iter()
                .map(|entry| self.deploy_component(release_version, entry, &options.cancel))
                .collect::<Vec<_>>()
        });

        let report = DeployReport {
            release_version: release_version.to_string(),
            components,
        };
        let failed = report.failed().count();
        if failed == 0 {
            self.progress()
                .finish_with_message(&format!("release {} deployed", release_version));
        } else {
            self.progress().finish_with_error(&format!(
                "release {}: {} of {} components failed",
                release_version,
                failed,
                report.components.len()
            ));
        }
        Ok(report)
    }

    /// Run `op` against each source in priority order until one serves it
    fn with_failover<T>(&self, what: &str, mut op: impl FnMut(&dyn Transport) -> Result<T>) -> Result<T> {
        let Some((last, earlier)) = self.sources.split_last() else {
            return Err(Error::InvalidInput("deployer has no sources".to_string()));
        };
        for source in earlier {
            match op(*source) {
                Ok(value) => return Ok(value),
                Err(e) if fails_over(&e) => {
                    warn!("{} unavailable from {}: {}, trying next source", what, source.name(), e);
                }
                Err(e) => return Err(e),
            }
        }
        op(*last)
    }

    fn load_release(&self, release_version: &str) -> Result<ReleaseManifest> {
        validate_version(release_version)?;
        self.with_failover(&format!("release {}", release_version), |source| {
            self.load_release_from(source, release_version)
        })
    }

    fn load_release_from(&self, source: &dyn Transport, release_version: &str) -> Result<ReleaseManifest> {
        let bytes = match get_bytes(source, &keys::release_manifest(release_version)) {
            Ok(bytes) => bytes,
            Err(Error::NotFound { .. }) => {
                return Err(Error::not_found(format!("release {}", release_version)));
            }
            Err(e) => return Err(e),
        };
        let release: ReleaseManifest = serde_json::from_slice(&bytes)?;
        release.validate()?;
        if release.release_version != release_version {
            return Err(Error::InvalidInput(format!(
                "release manifest at {} describes release {}",
                keys::release_manifest(release_version),
                release.release_version
            )));
        }
        Ok(release)
    }

    fn deploy_component(&self, release_version: &str, entry: &ReleaseComponent, cancel: &CancelToken) -> ComponentReport {
        let mut state = DeployState::Validating;
        let outcome = match self.run_pipeline(release_version, entry, cancel, &mut state) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("{} failed while {}: {}", entry.id(), state, e);
                ComponentOutcome::Failed {
                    state,
                    error: e.to_string(),
                    retryable: e.is_retryable(),
                }
            }
        };

        self.progress().increment(1);
        ComponentReport {
            component_type: entry.component_type.clone(),
            version: entry.version.clone(),
            outcome,
        }
    }

    fn run_pipeline(
        &self,
        release_version: &str,
        entry: &ReleaseComponent,
        cancel: &CancelToken,
        state: &mut DeployState,
    ) -> Result<ComponentOutcome> {
        let (component_type, version) = (entry.component_type.as_str(), entry.version.as_str());
        let id = entry.id().to_string();

        // Validating
        cancel.check()?;
        validate_component_type(component_type)?;
        validate_version(version)?;

        let version_dir = self.layout.version_dir(component_type, version);
        let installed = self.layout.installed_manifest(component_type, version)?;
        if let Some(manifest) = &installed
            && manifest.archive_checksum != entry.archive_checksum
        {
            return Err(Error::integrity(
                id,
                self.layout.manifest_path(component_type, version).display().to_string(),
            ));
        }

        let is_current = self
            .layout
            .registry_log(component_type)
            .last()?
            .is_some_and(|event| event.version == version);
        if is_current
            && self.layout.linked_version(component_type).as_deref() == Some(version)
            && let Some(manifest) = &installed
            && version_dir.is_dir()
        {
            verify_directory(&version_dir, manifest)?.into_result(manifest)?;
            *state = DeployState::Switching;
            links::refresh(&self.layout, &self.links, component_type)?;
            debug!("{} is already current", id);
            *state = DeployState::Complete;
            return Ok(ComponentOutcome::SkippedAlreadyCurrent);
        }

        // Fetching
        *state = DeployState::Fetching;
        cancel.check()?;
        let (manifest, staged) = self.with_failover(&id, |source| {
            let manifest = match &installed {
                Some(manifest) => manifest.clone(),
                None => self.fetch_manifest(source, release_version, entry)?,
            };
            let staged = if version_dir.exists() {
                None
            } else {
                Some(self.fetch_archive(source, release_version, &manifest)?)
            };
            Ok((manifest, staged))
        })?;

        // Extracting
        *state = DeployState::Extracting;
        cancel.check()?;
        let extracted = match &staged {
            Some(archive) => {
                let reader = BufReader::new(File::open(archive)?);
                self.extractor.extract(reader, &version_dir, &manifest)?;
                true
            }
            None => {
                verify_directory(&version_dir, &manifest)?.into_result(&manifest)?;
                debug!("Reusing intact {}", version_dir.display());
                false
            }
        };
        write_json_atomic(&self.layout.manifest_path(component_type, version), &manifest, true)?;
        if let Some(archive) = staged
            && let Some(dir) = archive.parent()
        {
            remove_dir_all_quiet(dir);
        }

        // Switching
        *state = DeployState::Switching;
        cancel.check()?;
        VersionSwitch::new(&self.layout).with_links(&self.links).activate(
            component_type,
            version,
            SwitchReason::Deploy,
            Some(release_version),
        )?;

        *state = DeployState::Complete;
        info!("Deployed {} from release {}", id, release_version);
        Ok(ComponentOutcome::Deployed { extracted })
    }

    /// Component manifest published with the release, checked against it
    fn fetch_manifest(
        &self,
        source: &dyn Transport,
        release_version: &str,
        entry: &ReleaseComponent,
    ) -> Result<ComponentManifest> {
        let key = keys::component_manifest(release_version, &entry.component_type, &entry.version);
        let manifest: ComponentManifest = serde_json::from_slice(&get_bytes(source, &key)?)?;
        manifest.validate()?;

        if manifest.component_type != entry.component_type
            || manifest.version != entry.version
            || manifest.archive_checksum != entry.archive_checksum
        {
            return Err(Error::integrity(entry.id().to_string(), key));
        }
        Ok(manifest)
    }

    /// Download the archive into staging, resuming an earlier attempt
    ///
    /// The staged bytes are verified against the archive checksum, so an
    /// attempt interrupted on one source may be finished from another.
    fn fetch_archive(
        &self,
        source: &dyn Transport,
        release_version: &str,
        manifest: &ComponentManifest,
    ) -> Result<PathBuf> {
        let (component_type, version) = (&manifest.component_type, &manifest.version);
        let dest = self
            .layout
            .staging_dir()
            .join(release_version)
            .join(component_type)
            .join(version)
            .join(&manifest.archive_file);

        let key = keys::component_archive(release_version, component_type, version, &manifest.archive_file);
        fetch_to_file(
            source,
            &key,
            &dest,
            &manifest.archive_checksum,
            &SilentProgress::new(),
        )?;
        Ok(dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{BuildOptions, pack};
    use crate::manifest::{ComponentRef, ManifestStore};
    use crate::release::{ComposeOptions, ReleaseComposer};
    use crate::transport::FilesystemTransport;
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        temp: TempDir,
        store: ManifestStore,
        transport: FilesystemTransport,
    }

    impl Fixture {
        fn new() -> Self {
            let temp = TempDir::new().unwrap();
            let store = ManifestStore::open(temp.path().join("ws")).unwrap();
            let transport = FilesystemTransport::new(temp.path().join("remote")).unwrap();
            Self { temp, store, transport }
        }

        fn target(&self) -> PathBuf {
            self.temp.path().join("target")
        }

        fn publish(&self, release: &str, components: &[(&str, &str)]) {
            let mut refs = Vec::new();
            for (component_type, version) in components {
                if !self.store.has_component(component_type, version) {
                    let src = self.temp.path().join(format!("src-{}-{}", component_type, version));
                    fs::create_dir_all(src.join("data")).unwrap();
                    fs::write(src.join("VERSION"), version).unwrap();
                    fs::write(src.join("data/blob.bin"), vec![7u8; 4096]).unwrap();
                    pack(&self.store, &src, component_type, version, &BuildOptions::default(), false).unwrap();
                }
                refs.push(ComponentRef::new(*component_type, *version));
            }
            ReleaseComposer::new(&self.store, &self.transport)
                .compose(release, &refs, &ComposeOptions::default())
                .unwrap();
        }
    }

    #[test]
    fn test_deploy_then_redeploy_is_skipped() {
        let fx = Fixture::new();
        fx.publish("r1", &[("model", "1.0.0"), ("config", "1.0.0")]);
        let deployer = Deployer::new(&fx.transport, fx.target());

        let report = deployer.deploy("r1", &DeployOptions::default()).unwrap();
        assert!(report.is_success());
        for component in &report.components {
            assert_eq!(component.outcome, ComponentOutcome::Deployed { extracted: true });
        }
        assert_eq!(
            fs::read_to_string(fx.target().join("current/model/VERSION")).unwrap(),
            "1.0.0"
        );
        assert!(!deployer.layout().staging_dir().join("r1/model/1.0.0").exists());

        let again = deployer.deploy("r1", &DeployOptions::default()).unwrap();
        for component in &again.components {
            assert_eq!(component.outcome, ComponentOutcome::SkippedAlreadyCurrent);
        }
    }

    #[test]
    fn test_unknown_release_and_filter() {
        let fx = Fixture::new();
        fx.publish("r1", &[("model", "1.0.0")]);
        let deployer = Deployer::new(&fx.transport, fx.target());

        let err = deployer.deploy("r9", &DeployOptions::default()).unwrap_err();
        assert!(matches!(err, Error::NotFound { ref entity } if entity == "release r9"));

        let options = DeployOptions {
            components: vec!["runtime".to_string()],
            ..Default::default()
        };
        let err = deployer.deploy("r1", &options).unwrap_err();
        assert!(matches!(err, Error::NotFound { ref entity } if entity.contains("runtime")));
        assert!(!fx.target().join("deployments").exists());
    }

    #[test]
    fn test_filter_deploys_only_named_components() {
        let fx = Fixture::new();
        fx.publish("r1", &[("model", "1.0.0"), ("config", "1.0.0")]);
        let options = DeployOptions {
            components: vec!["config".to_string()],
            ..Default::default()
        };

        let report = Deployer::new(&fx.transport, fx.target()).deploy("r1", &options).unwrap();
        assert_eq!(report.components.len(), 1);
        assert!(fx.target().join("current/config").exists());
        assert!(!fx.target().join("current/model").exists());
    }

    #[test]
    fn test_one_failure_does_not_stop_siblings() {
        let fx = Fixture::new();
        fx.publish("r1", &[("model", "1.0.0"), ("config", "1.0.0")]);
        let model = fx.store.get_component("model", "1.0.0").unwrap();
        fx.transport
            .delete(&keys::component_archive("r1", "model", "1.0.0", &model.archive_file))
            .unwrap();

        let report = Deployer::new(&fx.transport, fx.target())
            .deploy("r1", &DeployOptions::default())
            .unwrap();
        assert!(!report.is_success());

        let failed = report.component("model").unwrap();
        assert!(matches!(
            failed.outcome,
            ComponentOutcome::Failed { state: DeployState::Fetching, retryable: false, .. }
        ));
        assert_eq!(
            report.component("config").unwrap().outcome,
            ComponentOutcome::Deployed { extracted: true }
        );
    }

    #[test]
    fn test_corrupt_existing_version_is_not_overwritten() {
        let fx = Fixture::new();
        fx.publish("r1", &[("model", "1.0.0")]);
        let deployer = Deployer::new(&fx.transport, fx.target());
        deployer.deploy("r1", &DeployOptions::default()).unwrap();

        let version_file = deployer.layout().version_dir("model", "1.0.0").join("VERSION");
        fs::write(&version_file, "tampered").unwrap();

        let report = deployer.deploy("r1", &DeployOptions::default()).unwrap();
        match &report.component("model").unwrap().outcome {
            ComponentOutcome::Failed { error, retryable, .. } => {
                assert!(error.contains("VERSION"));
                assert!(!retryable);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(fs::read_to_string(&version_file).unwrap(), "tampered");
    }

    #[test]
    fn test_repeated_filter_deploys_once() {
        let fx = Fixture::new();
        fx.publish("r1", &[("model", "1.0.0"), ("config", "1.0.0")]);
        let options = DeployOptions {
            components: vec!["model".to_string(), "model".to_string()],
            ..Default::default()
        };

        let report = Deployer::new(&fx.transport, fx.target()).deploy("r1", &options).unwrap();
        assert!(report.is_success());
        assert_eq!(report.components.len(), 1);
        assert_eq!(
            report.components[0].outcome,
            ComponentOutcome::Deployed { extracted: true }
        );
        assert!(!fx.target().join("current/config").exists());
    }

    /// Publish `release` to a second storage directory as well
    fn mirror(fx: &Fixture, release: &str, components: &[(&str, &str)]) -> FilesystemTransport {
        let mirror = FilesystemTransport::new(fx.temp.path().join("mirror")).unwrap();
        let refs: Vec<_> = components
            .iter()
            .map(|(t, v)| ComponentRef::new(*t, *v))
            .collect();
        let options = ComposeOptions {
            force: true,
            ..Default::default()
        };
        ReleaseComposer::new(&fx.store, &mirror)
            .compose(release, &refs, &options)
            .unwrap();
        mirror
    }

    #[test]
    fn test_release_missing_from_primary_is_read_from_fallback() {
        let fx = Fixture::new();
        fx.publish("r1", &[("model", "1.0.0")]);
        let empty = FilesystemTransport::new(fx.temp.path().join("empty")).unwrap();

        let report = Deployer::new(&empty, fx.target())
            .with_fallback(&fx.transport)
            .deploy("r1", &DeployOptions::default())
            .unwrap();
        assert!(report.is_success());
        assert_eq!(
            fs::read_to_string(fx.target().join("current/model/VERSION")).unwrap(),
            "1.0.0"
        );

        let err = Deployer::new(&empty, fx.target())
            .deploy("r1", &DeployOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[test]
    fn test_component_fetch_falls_over_to_next_source() {
        let fx = Fixture::new();
        fx.publish("r1", &[("model", "1.0.0"), ("config", "1.0.0")]);
        let mirror = mirror(&fx, "r1", &[("model", "1.0.0"), ("config", "1.0.0")]);
        let model = fx.store.get_component("model", "1.0.0").unwrap();
        let archive_key = keys::component_archive("r1", "model", "1.0.0", &model.archive_file);
        fx.transport.delete(&archive_key).unwrap();

        let report = Deployer::new(&fx.transport, fx.target())
            .with_fallback(&mirror)
            .deploy("r1", &DeployOptions::default())
            .unwrap();
        assert!(report.is_success());
        assert_eq!(
            report.component("model").unwrap().outcome,
            ComponentOutcome::Deployed { extracted: true }
        );
    }

    #[test]
    fn test_every_source_failing_reports_the_component() {
        let fx = Fixture::new();
        fx.publish("r1", &[("model", "1.0.0")]);
        let mirror = mirror(&fx, "r1", &[("model", "1.0.0")]);
        let model = fx.store.get_component("model", "1.0.0").unwrap();
        let archive_key = keys::component_archive("r1", "model", "1.0.0", &model.archive_file);
        fx.transport.delete(&archive_key).unwrap();
        mirror.delete(&archive_key).unwrap();

        let report = Deployer::new(&fx.transport, fx.target())
            .with_fallback(&mirror)
            .deploy("r1", &DeployOptions::default())
            .unwrap();
        assert!(matches!(
            report.component("model").unwrap().outcome,
            ComponentOutcome::Failed { state: DeployState::Fetching, retryable: false, .. }
        ));
        assert!(!fx.target().join("current/model").exists());
    }

    #[test]
    fn test_aliases_follow_deploys_and_are_restored_on_redeploy() {
        let fx = Fixture::new();
        fx.publish("r1", &[("model", "1.0.0")]);
        let alias = fx.target().join("serving/model");
        let deployer = Deployer::new(&fx.transport, fx.target())
            .with_links(vec![AliasLink::new("serving/model", "model")]);

        deployer.deploy("r1", &DeployOptions::default()).unwrap();
        assert_eq!(fs::read_to_string(alias.join("VERSION")).unwrap(), "1.0.0");

        fs::remove_file(&alias).unwrap();
        let report = deployer.deploy("r1", &DeployOptions::default()).unwrap();
        assert_eq!(
            report.component("model").unwrap().outcome,
            ComponentOutcome::SkippedAlreadyCurrent
        );
        assert_eq!(fs::read_to_string(alias.join("VERSION")).unwrap(), "1.0.0");
    }

    #[test]
    fn test_cancelled_components_are_retryable_failures() {
        let fx = Fixture::new();
        fx.publish("r1", &[("model", "1.0.0")]);
        let options = DeployOptions::default();
        options.cancel.cancel();

        let report = Deployer::new(&fx.transport, fx.target()).deploy("r1", &options).unwrap();
        assert_eq!(
            report.component("model").unwrap().outcome,
            ComponentOutcome::Failed {
                state: DeployState::Validating,
                error: Error::Cancelled.to_string(),
                retryable: true,
            }
        );
    }
}
