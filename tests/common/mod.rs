// tests/common/mod.rs

//! Shared test utilities and helpers for integration tests.

#![allow(dead_code)]

use depot::archive::pack;
use depot::manifest::ComponentRef;
use depot::{
    BuildOptions, ComponentManifest, ComposeOptions, DeployOptions, DeployReport, Deployer,
    FilesystemTransport, ManifestStore, ReleaseComposer, ReleaseManifest, Transport,
};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use walkdir::WalkDir;

/// Workspace, storage and target root under one temp dir.
///
/// Keep the struct alive for the duration of the test.
pub struct TestEnv {
    pub temp: TempDir,
    pub store: ManifestStore,
    pub transport: Box<dyn Transport>,
}

impl TestEnv {
    /// Environment publishing to a directory-backed transport
    pub fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let transport = FilesystemTransport::new(temp.path().join("storage")).unwrap();
        Self::with_transport(temp, Box::new(transport))
    }

    pub fn with_transport(temp: TempDir, transport: Box<dyn Transport>) -> Self {
        let store = ManifestStore::open(temp.path().join("workspace")).unwrap();
        Self {
            temp,
            store,
            transport,
        }
    }

    pub fn target(&self) -> PathBuf {
        self.temp.path().join("target")
    }

    /// Create a source tree named `name` containing `files`
    pub fn source(&self, name: &str, files: &[(&str, &[u8])]) -> PathBuf {
        let dir = self.temp.path().join("sources").join(name);
        write_tree(&dir, files);
        dir
    }

    /// Pack a small component whose `VERSION` file holds the version
    pub fn pack(&self, component_type: &str, version: &str) -> ComponentManifest {
        let src = self.source(
            &format!("{}-{}", component_type, version),
            &[
                ("VERSION", version.as_bytes()),
                ("data/weights.bin", &pseudo_random(4096, version.len() as u64)),
            ],
        );
        pack(&self.store, &src, component_type, version, &BuildOptions::default(), false).unwrap()
    }

    pub fn publish(&self, release: &str, components: &[&str]) -> ReleaseManifest {
        let refs: Vec<ComponentRef> = components.iter().map(|c| c.parse().unwrap()).collect();
        ReleaseComposer::new(&self.store, self.transport.as_ref())
            .compose(release, &refs, &ComposeOptions::default())
            .unwrap()
    }

    pub fn deployer(&self) -> Deployer<'_> {
        Deployer::new(self.transport.as_ref(), self.target())
    }

    pub fn deploy(&self, release: &str) -> DeployReport {
        self.deployer().deploy(release, &DeployOptions::default()).unwrap()
    }
}

pub fn write_tree(root: &Path, files: &[(&str, &[u8])]) {
    for (path, content) in files {
        let full = root.join(path);
        fs::create_dir_all(full.parent().unwrap()).unwrap();
        fs::write(full, content).unwrap();
    }
}

/// Relative path -> content of every regular file under `root`
pub fn read_tree(root: &Path) -> BTreeMap<String, Vec<u8>> {
    WalkDir::new(root)
        .into_iter()
        .map(|e| e.unwrap())
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            let rel = e.path().strip_prefix(root).unwrap().to_string_lossy().replace('\\', "/");
            (rel, fs::read(e.path()).unwrap())
        })
        .collect()
}

/// Incompressible deterministic bytes
pub fn pseudo_random(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    (0..len)
        .map(|_| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            (state >> 33) as u8
        })
        .collect()
}

/// Content of `current/<type>/VERSION` at the target
pub fn current_version(target: &Path, component_type: &str) -> String {
    fs::read_to_string(target.join("current").join(component_type).join("VERSION")).unwrap()
}
