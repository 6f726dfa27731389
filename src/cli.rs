// src/cli.rs
//! CLI definitions for depot
//!
//! This module contains all command-line interface definitions using clap.
//! The actual command implementations are in the `commands` module.

use clap::{Parser, Subcommand};
use depot::CompressionFormat;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "depot")]
#[command(version)]
#[command(about = "Package, publish and atomically deploy versioned components", long_about = None)]
pub struct Cli {
    /// Configuration file (default: $DEPOT_CONFIG, then ./depot.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Package a directory as a component version
    Pack {
        /// Component type (e.g. model, config, runtime)
        component_type: String,

        /// Component version
        version: String,

        /// Directory to package
        source: PathBuf,

        /// Replace an existing component of the same version
        #[arg(short, long)]
        force: bool,

        /// Compression: none, gzip, zstd or xz
        #[arg(long)]
        compression: Option<CompressionFormat>,

        /// Compression level
        #[arg(long)]
        level: Option<i32>,

        /// Additional exclude pattern (repeatable; trailing '/' for directories)
        #[arg(short, long)]
        exclude: Vec<String>,
    },

    /// Re-check a packaged component's archive against its manifest
    Verify {
        component_type: String,
        version: String,
    },

    /// List packaged components
    Components {
        /// Only this component type
        component_type: Option<String>,
    },

    /// List composed releases
    Releases,

    /// Compose and publish a release from packaged components
    Publish {
        /// Release version (e.g. 2024.01.20)
        release: String,

        /// Components as type:version
        #[arg(required = true)]
        components: Vec<String>,

        /// Replace an existing release of the same version
        #[arg(short, long)]
        force: bool,

        /// Free-form release description
        #[arg(short, long)]
        description: Option<String>,
    },

    /// Deploy a published release to the target root
    Deploy {
        release: String,

        /// Only deploy this component type (repeatable)
        #[arg(long = "component")]
        components: Vec<String>,

        /// Deployment target root (overrides [deploy] target_root)
        #[arg(short, long)]
        target: Option<PathBuf>,
    },

    /// List versions present at the target
    Versions {
        component_type: Option<String>,

        #[arg(short, long)]
        target: Option<PathBuf>,
    },

    /// Show the switch history of a component
    History {
        component_type: String,

        #[arg(short, long)]
        target: Option<PathBuf>,
    },

    /// Point a component at an already deployed version
    Switch {
        component_type: String,
        version: String,

        #[arg(short, long)]
        target: Option<PathBuf>,
    },

    /// Switch a component back to the version before its latest switch
    Rollback {
        component_type: String,

        #[arg(short, long)]
        target: Option<PathBuf>,
    },

    /// Remove old deployed versions of a component
    Prune {
        component_type: String,

        /// Non-current versions to keep
        #[arg(short, long)]
        keep: usize,

        #[arg(short, long)]
        target: Option<PathBuf>,
    },
}
