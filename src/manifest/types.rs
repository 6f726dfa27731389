// src/manifest/types.rs

//! Component and release manifest records
//!
//! Both records are plain JSON documents. Readers ignore fields they do not
//! know, so a manifest written by a newer engine stays readable here.

use crate::compression::CompressionFormat;
use crate::error::{Error, Result};
use crate::hash::{Checksum, HashAlgorithm};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Schema version written into every manifest
pub const MANIFEST_SCHEMA_VERSION: &str = "1.0";

/// Maximum length of a component type name
pub const MAX_COMPONENT_TYPE_LEN: usize = 50;

/// Maximum length of a component or release version string
pub const MAX_VERSION_LEN: usize = 128;

fn default_schema_version() -> String {
    MANIFEST_SCHEMA_VERSION.to_string()
}

/// One file inside a component archive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// POSIX-style path relative to the archive root
    pub path: String,
    /// File size in bytes
    pub size: u64,
    /// Content checksum
    pub checksum: Checksum,
    /// Unix permission bits
    pub mode: u32,
}

/// Manifest of one packaged `(type, version)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentManifest {
    #[serde(default = "default_schema_version")]
    pub schema_version: String,

    #[serde(rename = "type")]
    pub component_type: String,

    pub version: String,

    /// Files sorted by relative path
    pub files: Vec<FileRecord>,

    /// Checksum of the compressed archive bytes
    pub archive_checksum: Checksum,

    /// Archive file name, e.g. `model-1.0.0.tar.gz`
    pub archive_file: String,

    /// Archive size in bytes
    pub archive_size: u64,

    pub compression: CompressionFormat,

    #[serde(default)]
    pub hash_algorithm: HashAlgorithm,

    /// Sum of the uncompressed file sizes
    #[serde(default)]
    pub total_size: u64,

    pub created_at: DateTime<Utc>,
}

impl ComponentManifest {
    /// Identity of this manifest
    pub fn id(&self) -> ComponentRef {
        ComponentRef::new(&self.component_type, &self.version)
    }

    /// Look up a file record by relative path
    pub fn file(&self, path: &str) -> Option<&FileRecord> {
        self.files
            .binary_search_by(|f| f.path.as_str().cmp(path))
            .ok()
            .map(|i| &self.files[i])
    }

    /// Check the record's own invariants (identifiers, paths, ordering)
    pub fn validate(&self) -> Result<()> {
        validate_component_type(&self.component_type)?;
        validate_version(&self.version)?;

        for file in &self.files {
            validate_relative_path(&file.path)?;
        }

        if self.files.windows(2).any(|w| w[0].path >= w[1].path) {
            return Err(Error::InvalidInput(format!(
                "{}: file list is not strictly sorted by path",
                self.id()
            )));
        }

        Ok(())
    }

    /// Deterministic archive file name for a component
    ///
    /// Not unique on its own (`model-x:1` and `model:x-1` share it); it is
    /// only ever stored under a `<type>/<version>/` directory or key prefix.
    pub fn archive_file_name(component_type: &str, version: &str, compression: CompressionFormat) -> String {
        format!("{}-{}.{}", component_type, version, compression.archive_extension())
    }
}

/// A `(type, version)` reference, written `type:version`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ComponentRef {
    #[serde(rename = "type")]
    pub component_type: String,
    pub version: String,
}

impl ComponentRef {
    pub fn new(component_type: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            component_type: component_type.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for ComponentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.component_type, self.version)
    }
}

impl FromStr for ComponentRef {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (component_type, version) = s.split_once(':').ok_or_else(|| {
            Error::InvalidInput(format!("expected type:version, got '{}'", s))
        })?;
        validate_component_type(component_type)?;
        validate_version(version)?;
        Ok(Self::new(component_type, version))
    }
}

/// A component pinned by a release
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseComponent {
    #[serde(rename = "type")]
    pub component_type: String,
    pub version: String,
    pub archive_checksum: Checksum,
}

impl ReleaseComponent {
    pub fn id(&self) -> ComponentRef {
        ComponentRef::new(&self.component_type, &self.version)
    }
}

/// Manifest of one release
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseManifest {
    #[serde(default = "default_schema_version")]
    pub schema_version: String,

    pub release_version: String,

    pub components: Vec<ReleaseComponent>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    pub created_at: DateTime<Utc>,
}

impl ReleaseManifest {
    /// Find the entry for a component type
    pub fn component(&self, component_type: &str) -> Option<&ReleaseComponent> {
        self.components
            .iter()
            .find(|c| c.component_type == component_type)
    }

    pub fn validate(&self) -> Result<()> {
        validate_version(&self.release_version)?;
        for (i, c) in self.components.iter().enumerate() {
            validate_component_type(&c.component_type)?;
            validate_version(&c.version)?;
            if self.components[..i]
                .iter()
                .any(|o| o.component_type == c.component_type)
            {
                return Err(Error::InvalidInput(format!(
                    "release {} lists component type '{}' more than once",
                    self.release_version, c.component_type
                )));
            }
        }
        Ok(())
    }
}

/// Component types: a letter followed by letters, digits, `_` or `-`
pub fn validate_component_type(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        && name.len() <= MAX_COMPONENT_TYPE_LEN;

    if !valid {
        return Err(Error::InvalidInput(format!(
            "invalid component type '{}': must start with a letter and contain only \
             letters, digits, '_' or '-' (max {} chars)",
            name, MAX_COMPONENT_TYPE_LEN
        )));
    }
    Ok(())
}

/// Versions are opaque but must be usable as a single path segment
pub fn validate_version(version: &str) -> Result<()> {
    let valid = !version.is_empty()
        && version.len() <= MAX_VERSION_LEN
        && version != "."
        && !version.contains("..")
        && !version
            .chars()
            .any(|c| c == '/' || c == '\\' || c == ':' || c.is_whitespace() || c.is_control());

    if !valid {
        return Err(Error::InvalidInput(format!(
            "invalid version '{}': must be 1-{} chars without separators, whitespace or '..'",
            version, MAX_VERSION_LEN
        )));
    }
    Ok(())
}

/// Canonical relative POSIX path that cannot escape the archive root
///
/// Every `/`-separated segment must be a plain name, so `a//b`, `a/./b`
/// and trailing slashes are rejected along with `..` and absolute paths.
pub fn validate_relative_path(path: &str) -> Result<()> {
    if path.is_empty() || path.contains('\\') {
        return Err(Error::InvalidInput(format!("invalid archive path '{}'", path)));
    }

    if path
        .split('/')
        .any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        return Err(Error::InvalidInput(format!(
            "archive path '{}' must not contain empty, '.', '..' or root segments",
            path
        )));
    }
    Ok(())
}
