// src/manifest/mod.rs

//! Component and release manifests and the store that owns them

pub mod store;
pub mod types;

pub use store::ManifestStore;
pub use types::{
    ComponentManifest, ComponentRef, FileRecord, MANIFEST_SCHEMA_VERSION, ReleaseComponent,
    ReleaseManifest, validate_component_type, validate_relative_path, validate_version,
};
