// src/error.rs

//! Error taxonomy for packaging, publishing and deployment
//!
//! Every variant names the entity it concerns (`type:version`, a release
//! version, a storage key or a file path) so an operator can tell what to
//! fix. Only transfer errors are ever retried, and only when flagged
//! retryable.

use thiserror::Error;

use crate::compression::CompressionError;
use crate::hash::HashError;

/// Result alias used throughout the library
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Missing component, release, version or storage key
    #[error("not found: {entity}")]
    NotFound { entity: String },

    /// Identity collision without force
    #[error("already exists: {entity} (use force to overwrite)")]
    Conflict { entity: String },

    /// Checksum mismatch, names the first offending file
    #[error("integrity check failed for {entity}: {path}")]
    Integrity { entity: String, path: String },

    /// Storage or network failure
    #[error("transfer of '{key}' failed ({}): {message}", if *retryable { "retryable" } else { "terminal" })]
    Transfer {
        key: String,
        retryable: bool,
        message: String,
    },

    /// Nothing left to package after exclusion
    #[error("no files to package in {path}")]
    EmptySource { path: String },

    /// Rollback requested with fewer than two switch events
    #[error("no previous version to roll back to for component '{component}'")]
    NoHistory { component: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("lock error: {0}")]
    Lock(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Hash(#[from] HashError),

    #[error(transparent)]
    Compression(#[from] CompressionError),
}

impl Error {
    pub fn not_found(entity: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.into(),
        }
    }

    pub fn conflict(entity: impl Into<String>) -> Self {
        Self::Conflict {
            entity: entity.into(),
        }
    }

    pub fn integrity(entity: impl Into<String>, path: impl Into<String>) -> Self {
        Self::Integrity {
            entity: entity.into(),
            path: path.into(),
        }
    }

    pub fn retryable(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transfer {
            key: key.into(),
            retryable: true,
            message: message.into(),
        }
    }

    pub fn terminal(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transfer {
            key: key.into(),
            retryable: false,
            message: message.into(),
        }
    }

    /// Whether re-running the same operation may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transfer { retryable: true, .. } | Self::Cancelled)
    }
}
