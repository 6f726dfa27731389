// src/deploy/links.rs

//! Operator-defined aliases that follow `current/<type>`
//!
//! An alias is a symlink at an arbitrary path pointing at the absolute path
//! of a component's `current/<type>` link. Because it targets the alias and
//! not a versioned directory, switching versions never has to touch it; it
//! only has to exist. [`refresh`] creates missing aliases and repairs ones
//! that point elsewhere.

use super::TargetLayout;
use super::switch::repoint;
use crate::error::{Error, Result};
use crate::manifest::validate_component_type;
use serde::Deserialize;
use std::fs;
use std::io;
use std::path::{Component, PathBuf};
use tracing::{debug, info};

/// Top-level names at a target root that belong to depot
const RESERVED: [&str; 3] = ["current", "deployments", ".depot"];

/// Extra symlink kept pointing at `current/<component>`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AliasLink {
    /// Where the symlink lives; relative paths resolve against the target root
    pub path: PathBuf,
    /// Component type whose current version it exposes
    pub component: String,
}

impl AliasLink {
    pub fn new(path: impl Into<PathBuf>, component: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            component: component.into(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_component_type(&self.component)?;
        if self.path.as_os_str().is_empty() {
            return Err(Error::InvalidInput(format!(
                "alias for '{}' has an empty path",
                self.component
            )));
        }
        if self.path.is_relative() {
            let escapes = self
                .path
                .components()
                .any(|c| matches!(c, Component::ParentDir));
            let reserved = self
                .path
                .components()
                .next()
                .is_some_and(|c| RESERVED.iter().any(|r| c.as_os_str() == *r));
            if escapes || reserved {
                return Err(Error::InvalidInput(format!(
                    "alias path '{}' must stay outside current/, deployments/ and .depot/",
                    self.path.display()
                )));
            }
        }
        Ok(())
    }

    /// Absolute location of the symlink for `layout`
    pub fn resolve(&self, layout: &TargetLayout) -> Result<PathBuf> {
        let path = if self.path.is_absolute() {
            self.path.clone()
        } else {
            layout.root().join(&self.path)
        };
        Ok(std::path::absolute(path)?)
    }
}

/// Make every alias of `component_type` point at its `current` link
///
/// Returns the aliases that were created or repointed. A regular file or
/// directory already sitting at an alias path is never replaced.
pub fn refresh(layout: &TargetLayout, links: &[AliasLink], component_type: &str) -> Result<Vec<PathBuf>> {
    let target = std::path::absolute(layout.current_link(component_type))?;
    let mut updated = Vec::new();

    for link in links.iter().filter(|l| l.component == component_type) {
        link.validate()?;
        let path = link.resolve(layout)?;

        match fs::symlink_metadata(&path) {
            Ok(meta) if meta.file_type().is_symlink() => {
                if fs::read_link(&path)? == target {
                    debug!("Alias {} already points at {}", path.display(), target.display());
                    continue;
                }
            }
            Ok(_) => {
                return Err(Error::conflict(format!(
                    "alias {} is not a symlink",
                    path.display()
                )));
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        repoint(&path, &target)?;
        info!("Alias {} -> {}", path.display(), target.display());
        updated.push(path);
    }
    Ok(updated)
}
