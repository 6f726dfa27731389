// src/deploy/switch.rs

//! Atomic repoint of `current/<type>` plus its log record
//!
//! The new alias is created as a temp symlink beside the old one and renamed
//! over it, so `current/<type>` always resolves to some complete version.
//! The rename and the log append happen under the component lock; if the
//! append fails the alias is put back where it was. Configured
//! [`AliasLink`]s of the component are refreshed once the switch is
//! recorded.

use super::TargetLayout;
use super::links::{self, AliasLink};
use super::lock::ComponentLock;
use super::log::{SwitchEvent, SwitchReason};
use crate::error::{Error, Result};
use crate::filesystem::sync_dir;
use crate::manifest::{validate_component_type, validate_version};
use chrono::Utc;
use std::fs;
use std::os::unix::fs::symlink;
use std::path::Path;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Moves the `current` alias of components at one target
#[derive(Debug, Clone, Copy)]
pub struct VersionSwitch<'a> {
    layout: &'a TargetLayout,
    links: &'a [AliasLink],
}

impl<'a> VersionSwitch<'a> {
    pub fn new(layout: &'a TargetLayout) -> Self {
        Self { layout, links: &[] }
    }

    /// Keep these aliases pointing at `current/<type>` as well
    pub fn with_links(mut self, links: &'a [AliasLink]) -> Self {
        self.links = links;
        self
    }

    /// Make `version` the current version of `component_type`
    ///
    /// The versioned directory must already exist. Returns the recorded
    /// event, or `None` when the version was already current.
    pub fn activate(
        &self,
        component_type: &str,
        version: &str,
        reason: SwitchReason,
        source_release: Option<&str>,
    ) -> Result<Option<SwitchEvent>> {
        validate_component_type(component_type)?;
        validate_version(version)?;

        if !self.layout.version_dir(component_type, version).is_dir() {
            return Err(Error::not_found(format!("{}:{}", component_type, version)));
        }

        let _lock = ComponentLock::acquire(self.layout.lock_path(component_type))?;

        let log = self.layout.registry_log(component_type);
        let current = log.last()?.map(|event| event.version);
        let link = self.layout.current_link(component_type);
        let previous_target = fs::read_link(&link).ok();
        let target = TargetLayout::link_target(component_type, version);

        if current.as_deref() == Some(version) {
            if previous_target.as_deref() != Some(target.as_path()) {
                warn!(
                    "Alias of {} disagrees with its log, repointing to {}",
                    component_type, version
                );
                repoint(&link, &target)?;
            }
            links::refresh(self.layout, self.links, component_type)?;
            debug!("{}:{} is already current", component_type, version);
            return Ok(None);
        }

        repoint(&link, &target)?;

        let event = SwitchEvent {
            component_type: component_type.to_string(),
            version: version.to_string(),
            previous_version: current,
            source_release: source_release.map(str::to_string),
            reason,
            switched_at: Utc::now(),
        };

        if let Err(e) = log.append(&event) {
            warn!("Failed to record switch of {}, restoring alias: {}", component_type, e);
            let restored = match &previous_target {
                Some(previous) => repoint(&link, previous),
                None => fs::remove_file(&link).map_err(Error::from),
            };
            if let Err(restore_err) = restored {
                warn!("Failed to restore alias of {}: {}", component_type, restore_err);
            }
            return Err(e);
        }
        links::refresh(self.layout, self.links, component_type)?;

        info!(
            "Switched {} from {} to {} ({})",
            component_type,
            event.previous_version.as_deref().unwrap_or("none"),
            version,
            reason
        );
        Ok(Some(event))
    }
}

/// Replace the symlink at `link` with one pointing at `target`
pub(super) fn repoint(link: &Path, target: &Path) -> Result<()> {
    let dir = link
        .parent()
        .ok_or_else(|| Error::InvalidInput(format!("{} has no parent", link.display())))?;
    fs::create_dir_all(dir)?;

    let name = link
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp = dir.join(format!(".{}.{}.tmp", name, Uuid::new_v4().simple()));

    symlink(target, &temp)?;
    if let Err(e) = fs::rename(&temp, link) {
        let _ = fs::remove_file(&temp);
        return Err(e.into());
    }
    sync_dir(dir);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn target_with(versions: &[&str]) -> (TempDir, TargetLayout) {
        let temp = TempDir::new().unwrap();
        let layout = TargetLayout::new(temp.path());
        for version in versions {
            let dir = layout.version_dir("model", version);
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join("VERSION"), version).unwrap();
        }
        (temp, layout)
    }

    fn resolved(layout: &TargetLayout) -> String {
        fs::read_to_string(layout.current_link("model").join("VERSION")).unwrap()
    }

    #[test]
    fn test_switch_repoints_and_records() {
        let (_temp, layout) = target_with(&["1.0.0", "1.0.1"]);
        let switch = VersionSwitch::new(&layout);

        let first = switch
            .activate("model", "1.0.0", SwitchReason::Deploy, Some("r1"))
            .unwrap()
            .unwrap();
        assert_eq!(first.previous_version, None);
        assert_eq!(resolved(&layout), "1.0.0");

        let second = switch
            .activate("model", "1.0.1", SwitchReason::Switch, None)
            .unwrap()
            .unwrap();
        assert_eq!(second.previous_version.as_deref(), Some("1.0.0"));
        assert_eq!(resolved(&layout), "1.0.1");
        assert_eq!(
            fs::read_link(layout.current_link("model")).unwrap(),
            TargetLayout::link_target("model", "1.0.1")
        );

        let log = layout.registry_log("model").read_all().unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].source_release.as_deref(), Some("r1"));

        let leftovers: Vec<_> = fs::read_dir(layout.current_dir())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[test]
    fn test_switch_to_current_is_noop() {
        let (_temp, layout) = target_with(&["1.0.0"]);
        let switch = VersionSwitch::new(&layout);
        switch.activate("model", "1.0.0", SwitchReason::Deploy, None).unwrap();

        let again = switch.activate("model", "1.0.0", SwitchReason::Switch, None).unwrap();
        assert!(again.is_none());
        assert_eq!(layout.registry_log("model").read_all().unwrap().len(), 1);
    }

    #[test]
    fn test_missing_version_dir() {
        let (_temp, layout) = target_with(&["1.0.0"]);
        let err = VersionSwitch::new(&layout)
            .activate("model", "2.0.0", SwitchReason::Switch, None)
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { ref entity } if entity == "model:2.0.0"));
        assert!(fs::symlink_metadata(layout.current_link("model")).is_err());
    }

    #[test]
    fn test_switch_refreshes_configured_aliases() {
        let (temp, layout) = target_with(&["1.0.0", "1.0.1"]);
        let aliases = vec![AliasLink::new("serving/model", "model")];
        let switch = VersionSwitch::new(&layout).with_links(&aliases);
        let alias = temp.path().join("serving/model");

        switch.activate("model", "1.0.0", SwitchReason::Deploy, None).unwrap();
        assert_eq!(fs::read_to_string(alias.join("VERSION")).unwrap(), "1.0.0");

        switch.activate("model", "1.0.1", SwitchReason::Switch, None).unwrap();
        assert_eq!(fs::read_to_string(alias.join("VERSION")).unwrap(), "1.0.1");

        // A removed alias comes back even when nothing is switched
        fs::remove_file(&alias).unwrap();
        assert!(switch.activate("model", "1.0.1", SwitchReason::Switch, None).unwrap().is_none());
        assert_eq!(fs::read_to_string(alias.join("VERSION")).unwrap(), "1.0.1");
    }

    #[test]
    fn test_alias_is_repaired_from_log() {
        let (_temp, layout) = target_with(&["1.0.0", "1.0.1"]);
        let switch = VersionSwitch::new(&layout);
        switch.activate("model", "1.0.0", SwitchReason::Deploy, None).unwrap();

        repoint(
            &layout.current_link("model"),
            &TargetLayout::link_target("model", "1.0.1"),
        )
        .unwrap();

        assert!(switch.activate("model", "1.0.0", SwitchReason::Switch, None).unwrap().is_none());
        assert_eq!(resolved(&layout), "1.0.0");
    }
}
