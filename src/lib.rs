// src/lib.rs

//! Depot
//!
//! Versioned packaging, release composition and atomic deployment of
//! independently versioned components (models, configs, runtimes...).
//!
//! # Architecture
//!
//! - Components: a directory packed into a compressed, checksummed archive
//!   plus a manifest listing every file with its size, mode and checksum
//! - Releases: a named set pinning one version per component type,
//!   published through a swappable storage transport
//! - Deployments: per-component pipelines that fetch, verify, extract and
//!   atomically switch a `current/<type>` alias
//! - Registry: an append-only switch log per component, the single source
//!   of truth for what is current and what to roll back to

pub mod archive;
pub mod cancel;
pub mod compression;
pub mod config;
pub mod deploy;
mod error;
pub mod filesystem;
pub mod hash;
pub mod manifest;
pub mod progress;
pub mod registry;
pub mod release;
pub mod transport;

pub use archive::{ArchiveBuilder, BuildOptions, Extractor, VerificationResult};
pub use cancel::CancelToken;
pub use compression::CompressionFormat;
pub use config::DepotConfig;
pub use deploy::{
    AliasLink, ComponentOutcome, DeployOptions, DeployReport, Deployer, SwitchEvent, SwitchReason,
};
pub use error::{Error, Result};
pub use hash::{Checksum, HashAlgorithm, Hasher};
pub use manifest::{ComponentManifest, ComponentRef, ManifestStore, ReleaseManifest};
pub use progress::{
    CallbackProgress, CliProgress, LogProgress, ProgressEvent, ProgressTracker, ProgressUnit,
    SilentProgress,
};
pub use registry::{Registry, VersionInfo};
pub use release::{ComposeOptions, ReleaseComposer};
pub use transport::{FilesystemTransport, RemoteTransport, RetryPolicy, Transport};
