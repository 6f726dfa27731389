// src/deploy/mod.rs

//! Deployment of releases onto a target directory
//!
//! A target root looks like this:
//!
//! ```text
//! <root>/
//!   deployments/<type>/<version>/...   extracted, immutable
//!   current/<type> -> ../deployments/<type>/<version>
//!   .depot/registry/<type>.log         switch log
//!   .depot/locks/<type>.lock
//!   .depot/manifests/<type>/<version>.json
//!   .depot/staging/                    resumable downloads
//! ```

pub mod deployer;
pub mod links;
pub mod lock;
pub mod log;
pub mod switch;

pub use deployer::{ComponentOutcome, ComponentReport, DeployOptions, DeployReport, DeployState, Deployer};
pub use links::AliasLink;
pub use lock::ComponentLock;
pub use log::{RegistryLog, SwitchEvent, SwitchReason};
pub use switch::VersionSwitch;

use crate::error::Result;
use crate::filesystem::read_json;
use crate::manifest::{ComponentManifest, validate_component_type, validate_version};
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const STATE_DIR: &str = ".depot";

/// Paths of one deployment target
#[derive(Debug, Clone)]
pub struct TargetLayout {
    root: PathBuf,
}

impl TargetLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn deployments_dir(&self) -> PathBuf {
        self.root.join("deployments")
    }

    pub fn component_dir(&self, component_type: &str) -> PathBuf {
        self.deployments_dir().join(component_type)
    }

    pub fn version_dir(&self, component_type: &str, version: &str) -> PathBuf {
        self.component_dir(component_type).join(version)
    }

    pub fn current_dir(&self) -> PathBuf {
        self.root.join("current")
    }

    pub fn current_link(&self, component_type: &str) -> PathBuf {
        self.current_dir().join(component_type)
    }

    /// Alias target, relative to `current/`
    pub fn link_target(component_type: &str, version: &str) -> PathBuf {
        Path::new("..")
            .join("deployments")
            .join(component_type)
            .join(version)
    }

    pub fn registry_log(&self, component_type: &str) -> RegistryLog {
        RegistryLog::new(
            self.root
                .join(STATE_DIR)
                .join("registry")
                .join(format!("{}.log", component_type)),
        )
    }

    pub fn lock_path(&self, component_type: &str) -> PathBuf {
        self.root
            .join(STATE_DIR)
            .join("locks")
            .join(format!("{}.lock", component_type))
    }

    pub fn manifest_path(&self, component_type: &str, version: &str) -> PathBuf {
        self.root
            .join(STATE_DIR)
            .join("manifests")
            .join(component_type)
            .join(format!("{}.json", version))
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.root.join(STATE_DIR).join("staging")
    }

    /// Manifest of an extracted version, if one was recorded
    pub fn installed_manifest(&self, component_type: &str, version: &str) -> Result<Option<ComponentManifest>> {
        read_json(&self.manifest_path(component_type, version))
    }

    /// Version the alias points at, read from the link itself
    pub fn linked_version(&self, component_type: &str) -> Option<String> {
        let target = fs::read_link(self.current_link(component_type)).ok()?;
        target
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
    }

    /// Versioned directories present on disk
    pub fn versions_on_disk(&self, component_type: &str) -> Result<Vec<String>> {
        let mut versions = list_dir_names(&self.component_dir(component_type), true)?;
        versions.retain(|v| validate_version(v).is_ok());
        versions.sort();
        Ok(versions)
    }

    /// Component types with a deployment directory or a switch log
    pub fn component_types(&self) -> Result<Vec<String>> {
        let mut types: BTreeSet<String> = list_dir_names(&self.deployments_dir(), true)?
            .into_iter()
            .collect();
        for name in list_dir_names(&self.root.join(STATE_DIR).join("registry"), false)? {
            if let Some(component_type) = name.strip_suffix(".log") {
                types.insert(component_type.to_string());
            }
        }
        Ok(types
            .into_iter()
            .filter(|t| validate_component_type(t).is_ok())
            .collect())
    }
}

/// Names in `dir`, skipping hidden entries; a missing dir is empty
fn list_dir_names(dir: &Path, dirs_only: bool) -> Result<Vec<String>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        if dirs_only && !entry.file_type()?.is_dir() {
            continue;
        }
        names.push(name);
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_layout_paths() {
        let layout = TargetLayout::new("/srv/app");
        assert_eq!(
            layout.version_dir("model", "1.0.0"),
            PathBuf::from("/srv/app/deployments/model/1.0.0")
        );
        assert_eq!(layout.current_link("model"), PathBuf::from("/srv/app/current/model"));
        assert_eq!(
            TargetLayout::link_target("model", "1.0.0"),
            PathBuf::from("../deployments/model/1.0.0")
        );
        assert_eq!(
            layout.registry_log("model").path(),
            Path::new("/srv/app/.depot/registry/model.log")
        );
        assert_eq!(
            layout.manifest_path("model", "1.0.0"),
            PathBuf::from("/srv/app/.depot/manifests/model/1.0.0.json")
        );
    }

    #[test]
    fn test_scans_skip_hidden_entries() {
        let temp = TempDir::new().unwrap();
        let layout = TargetLayout::new(temp.path());
        assert!(layout.component_types().unwrap().is_empty());

        fs::create_dir_all(layout.version_dir("model", "1.0.1")).unwrap();
        fs::create_dir_all(layout.version_dir("model", "1.0.0")).unwrap();
        fs::create_dir_all(layout.component_dir("model").join(".extract-abc")).unwrap();
        fs::create_dir_all(layout.root().join(".depot/registry")).unwrap();
        fs::write(layout.root().join(".depot/registry/config.log"), b"").unwrap();

        assert_eq!(layout.versions_on_disk("model").unwrap(), vec!["1.0.0", "1.0.1"]);
        assert_eq!(layout.component_types().unwrap(), vec!["config", "model"]);
    }
}
