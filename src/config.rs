// src/config.rs
//! Configuration file parsing
//!
//! Supports a TOML configuration file with the following sections:
//! - [workspace] - Where manifests, releases and archives live
//! - [pack] - Compression, hashing and exclude patterns for new archives
//! - [storage] - Which transport backend to publish to and fetch from
//! - [retry] - Backoff policy for retryable transfer failures
//! - [deploy] - Deployment target root, concurrency, fallback storage
//!   (`[[deploy.mirrors]]`) and extra aliases (`[[deploy.links]]`)
//!
//! Every key is optional and unknown keys are ignored.

use crate::archive::{BuildOptions, DEFAULT_EXCLUDES};
use crate::compression::CompressionFormat;
use crate::deploy::AliasLink;
use crate::error::{Error, Result};
use crate::hash::HashAlgorithm;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Environment variable naming a configuration file
pub const CONFIG_ENV: &str = "DEPOT_CONFIG";

/// File looked up in the working directory when nothing else is given
pub const DEFAULT_CONFIG_FILE: &str = "depot.toml";

/// TOML configuration file structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DepotConfig {
    #[serde(default)]
    pub workspace: WorkspaceSection,

    #[serde(default)]
    pub pack: PackSection,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub deploy: DeploySection,
}

/// Workspace section
#[derive(Debug, Clone, Deserialize)]
pub struct WorkspaceSection {
    /// Holds `manifests/`, `releases/` and `dist/`
    #[serde(default = "default_workspace_root")]
    pub root: PathBuf,
}

impl Default for WorkspaceSection {
    fn default() -> Self {
        Self {
            root: default_workspace_root(),
        }
    }
}

fn default_workspace_root() -> PathBuf {
    PathBuf::from(".depot-workspace")
}

/// Packing section
#[derive(Debug, Clone, Deserialize)]
pub struct PackSection {
    #[serde(default)]
    pub compression: CompressionFormat,

    #[serde(default = "default_level")]
    pub level: i32,

    #[serde(default)]
    pub hash: HashAlgorithm,

    #[serde(default = "default_excludes")]
    pub exclude: Vec<String>,

    /// Hash worker threads (0 = one per core)
    #[serde(default)]
    pub workers: usize,
}

impl Default for PackSection {
    fn default() -> Self {
        Self {
            compression: CompressionFormat::default(),
            level: default_level(),
            hash: HashAlgorithm::default(),
            exclude: default_excludes(),
            workers: 0,
        }
    }
}

impl PackSection {
    pub fn build_options(&self) -> BuildOptions {
        BuildOptions {
            exclude: self.exclude.clone(),
            compression: self.compression,
            level: self.level,
            hash: self.hash,
            workers: self.workers,
        }
    }
}

fn default_level() -> i32 {
    6
}

fn default_excludes() -> Vec<String> {
    DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect()
}

/// Storage backend kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// Plain directory tree, one file per key
    #[default]
    Filesystem,
    /// Object store with multipart uploads (directory-backed bucket)
    Object,
}

/// Storage section
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub kind: StorageKind,

    #[serde(default = "default_storage_root")]
    pub root: PathBuf,

    /// Multipart part size in bytes
    #[serde(default = "default_part_size")]
    pub part_size: usize,

    /// Per-transfer timeout
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            kind: StorageKind::default(),
            root: default_storage_root(),
            part_size: default_part_size(),
            timeout_secs: None,
        }
    }
}

impl StorageConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

fn default_storage_root() -> PathBuf {
    PathBuf::from(".depot-storage")
}

fn default_part_size() -> usize {
    8 * 1024 * 1024
}

/// Retry section
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    5000
}

/// Deploy section
#[derive(Debug, Clone, Deserialize)]
pub struct DeploySection {
    #[serde(default = "default_target_root")]
    pub target_root: PathBuf,

    /// Components fetched and extracted in parallel
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Storage tried, in order, when `[storage]` cannot serve a release
    #[serde(default)]
    pub mirrors: Vec<StorageConfig>,

    /// Symlinks kept pointing at `current/<component>`
    #[serde(default)]
    pub links: Vec<AliasLink>,
}

impl Default for DeploySection {
    fn default() -> Self {
        Self {
            target_root: default_target_root(),
            concurrency: default_concurrency(),
            mirrors: Vec::new(),
            links: Vec::new(),
        }
    }
}

fn default_target_root() -> PathBuf {
    PathBuf::from("/opt/depot")
}

fn default_concurrency() -> usize {
    4
}

impl DepotConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: DepotConfig = toml::from_str(&content)?;
        config.validate()?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Resolve the configuration to use
    ///
    /// An explicit path wins, then `$DEPOT_CONFIG`, then `./depot.toml`.
    /// With none of them present the defaults apply.
    pub fn discover(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return Self::load(Path::new(&path));
        }
        let local = Path::new(DEFAULT_CONFIG_FILE);
        if local.is_file() {
            return Self::load(local);
        }
        debug!("No configuration file found, using defaults");
        Ok(Self::default())
    }

    pub fn validate(&self) -> Result<()> {
        for storage in std::iter::once(&self.storage).chain(&self.deploy.mirrors) {
            if storage.part_size < 1024 {
                return Err(Error::InvalidInput(format!(
                    "part_size of storage at {} must be at least 1024 bytes, got {}",
                    storage.root.display(),
                    storage.part_size
                )));
            }
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::InvalidInput("retry.max_attempts must be at least 1".to_string()));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(Error::InvalidInput(
                "retry.base_delay_ms must be <= retry.max_delay_ms".to_string(),
            ));
        }
        if self.deploy.concurrency == 0 {
            return Err(Error::InvalidInput("deploy.concurrency must be at least 1".to_string()));
        }
        for (i, link) in self.deploy.links.iter().enumerate() {
            link.validate()?;
            if self.deploy.links[..i].iter().any(|other| other.path == link.path) {
                return Err(Error::InvalidInput(format!(
                    "deploy.links lists {} more than once",
                    link.path.display()
                )));
            }
        }
        Ok(())
    }
}
