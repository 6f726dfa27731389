// src/registry/mod.rs

//! Version registry of a deployment target
//!
//! Answers which versions of each component are on disk, which one is
//! current and how it got there. Everything is derived from the switch logs
//! and the `deployments/` directory, so the answers survive restarts. The
//! registry also moves the alias by hand (`switch`, `rollback`) and removes
//! old versions when an operator asks for it (`prune`).

use crate::deploy::{AliasLink, ComponentLock, SwitchEvent, SwitchReason, TargetLayout, VersionSwitch};
use crate::error::{Error, Result};
use crate::manifest::{validate_component_type, validate_version};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use tracing::info;

/// One version of a component known at the target
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionInfo {
    pub component_type: String,
    pub version: String,
    /// First time the version was made current, if ever
    pub deployed_at: Option<DateTime<Utc>>,
    pub is_current: bool,
    /// Versioned directory still present
    pub on_disk: bool,
}

/// Registry view of one target root
#[derive(Debug, Clone)]
pub struct Registry {
    layout: TargetLayout,
    links: Vec<AliasLink>,
}

impl Registry {
    pub fn open(target_root: impl Into<PathBuf>) -> Self {
        Self {
            layout: TargetLayout::new(target_root),
            links: Vec::new(),
        }
    }

    /// Aliases refreshed by `switch` and `rollback`
    pub fn with_links(mut self, links: Vec<AliasLink>) -> Self {
        self.links = links;
        self
    }

    pub fn layout(&self) -> &TargetLayout {
        &self.layout
    }

    /// Versions per component type, oldest deployment first
    ///
    /// Versions on disk that were never switched to sort last.
    pub fn list(&self, component_type: Option<&str>) -> Result<Vec<VersionInfo>> {
        let types = match component_type {
            Some(t) => {
                validate_component_type(t)?;
                vec![t.to_string()]
            }
            None => self.layout.component_types()?,
        };

        let mut all = Vec::new();
        for component_type in types {
            all.extend(self.list_component(&component_type)?);
        }
        Ok(all)
    }

    fn list_component(&self, component_type: &str) -> Result<Vec<VersionInfo>> {
        let history = self.history(component_type)?;
        let current = history.last().map(|event| event.version.clone());
        let on_disk = self.layout.versions_on_disk(component_type)?;

        let mut first_seen: HashMap<&str, DateTime<Utc>> = HashMap::new();
        for event in &history {
            first_seen.entry(event.version.as_str()).or_insert(event.switched_at);
        }

        let mut versions: Vec<String> = first_seen.keys().map(|v| v.to_string()).collect();
        for version in &on_disk {
            if !first_seen.contains_key(version.as_str()) {
                versions.push(version.clone());
            }
        }

        let mut infos: Vec<VersionInfo> = versions
            .into_iter()
            .map(|version| VersionInfo {
                component_type: component_type.to_string(),
                deployed_at: first_seen.get(version.as_str()).copied(),
                is_current: current.as_deref() == Some(version.as_str()),
                on_disk: on_disk.contains(&version),
                version,
            })
            .collect();
        infos.sort_by(|a, b| {
            (a.deployed_at.is_none(), a.deployed_at, &a.version)
                .cmp(&(b.deployed_at.is_none(), b.deployed_at, &b.version))
        });
        Ok(infos)
    }

    /// Current version of `component_type`, from its switch log
    pub fn current(&self, component_type: &str) -> Result<Option<String>> {
        validate_component_type(component_type)?;
        Ok(self
            .layout
            .registry_log(component_type)
            .last()?
            .map(|event| event.version))
    }

    /// Every switch of `component_type`, oldest first
    pub fn history(&self, component_type: &str) -> Result<Vec<SwitchEvent>> {
        validate_component_type(component_type)?;
        self.layout.registry_log(component_type).read_all()
    }

    /// Point `current/<type>` at an already extracted version
    ///
    /// Never fetches or extracts. Returns `None` if the version was already
    /// current.
    pub fn switch(&self, component_type: &str, version: &str) -> Result<Option<SwitchEvent>> {
        VersionSwitch::new(&self.layout)
            .with_links(&self.links)
            .activate(component_type, version, SwitchReason::Switch, None)
    }

    /// Switch back to the version current before the latest switch
    pub fn rollback(&self, component_type: &str) -> Result<Option<SwitchEvent>> {
        let history = self.history(component_type)?;
        if history.len() < 2 {
            return Err(Error::NoHistory {
                component: component_type.to_string(),
            });
        }
        let target = &history[history.len() - 2].version;
        VersionSwitch::new(&self.layout)
            .with_links(&self.links)
            .activate(component_type, target, SwitchReason::Rollback, None)
    }

    /// Remove the oldest non-current versions, keeping `keep` of them
    ///
    /// Returns the removed versions. The current version is never removed.
    pub fn prune(&self, component_type: &str, keep: usize) -> Result<Vec<String>> {
        validate_component_type(component_type)?;
        let _lock = ComponentLock::acquire(self.layout.lock_path(component_type))?;

        let candidates: Vec<VersionInfo> = self
            .list_component(component_type)?
            .into_iter()
            .filter(|info| info.on_disk && !info.is_current)
            .collect();
        if candidates.len() <= keep {
            return Ok(Vec::new());
        }

        // Never-switched versions count as oldest
        let mut ordered = candidates;
        ordered.sort_by(|a, b| {
            (a.deployed_at.is_some(), a.deployed_at, &a.version)
                .cmp(&(b.deployed_at.is_some(), b.deployed_at, &b.version))
        });

        let remove_count = ordered.len() - keep;
        let mut removed = Vec::new();
        for info in ordered.into_iter().take(remove_count) {
            validate_version(&info.version)?;
            fs::remove_dir_all(self.layout.version_dir(component_type, &info.version))?;
            let manifest = self.layout.manifest_path(component_type, &info.version);
            if manifest.exists() {
                fs::remove_file(manifest)?;
            }
            info!("Pruned {}:{}", component_type, info.version);
            removed.push(info.version);
        }
        Ok(removed)
    }
}
