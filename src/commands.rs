// src/commands.rs
//! Command handlers for the depot CLI

use anyhow::{Result, bail};
use depot::archive::{pack, verify_stored};
use depot::deploy::ComponentOutcome;
use depot::release::parse_refs;
use depot::{
    CancelToken, CliProgress, ComposeOptions, CompressionFormat, DeployOptions, Deployer,
    DepotConfig, ManifestStore, ProgressUnit, Registry, ReleaseComposer,
};
use std::path::{Path, PathBuf};
use tracing::info;

fn open_store(config: &DepotConfig) -> Result<ManifestStore> {
    Ok(ManifestStore::open(&config.workspace.root)?)
}

fn target_root(config: &DepotConfig, target: Option<PathBuf>) -> PathBuf {
    target.unwrap_or_else(|| config.deploy.target_root.clone())
}

fn open_registry(config: &DepotConfig, target: Option<PathBuf>) -> Registry {
    Registry::open(target_root(config, target)).with_links(config.deploy.links.clone())
}

#[allow(clippy::too_many_arguments)]
pub fn cmd_pack(
    config: &DepotConfig,
    component_type: &str,
    version: &str,
    source: &Path,
    force: bool,
    compression: Option<CompressionFormat>,
    level: Option<i32>,
    exclude: Vec<String>,
) -> Result<()> {
    let store = open_store(config)?;

    let mut options = config.pack.build_options();
    if let Some(format) = compression {
        options.compression = format;
        options.level = format.default_level();
    }
    if let Some(level) = level {
        options.level = level;
    }
    options.exclude.extend(exclude);

    let manifest = pack(&store, source, component_type, version, &options, force)?;

    println!(
        "Packed {} ({} files, {} bytes)",
        manifest.id(),
        manifest.files.len(),
        manifest.total_size
    );
    println!("  archive:  {}", store.archive_path(&manifest).display());
    println!("  size:     {} bytes ({})", manifest.archive_size, manifest.compression);
    println!("  checksum: {}", manifest.archive_checksum);
    Ok(())
}

pub fn cmd_verify(config: &DepotConfig, component_type: &str, version: &str) -> Result<()> {
    let store = open_store(config)?;
    let manifest = store.get_component(component_type, version)?;
    let result = verify_stored(&store, &manifest)?;

    if result.ok {
        println!("{}: OK ({} files)", manifest.id(), manifest.files.len());
        return Ok(());
    }

    for path in &result.mismatched_files {
        println!("  mismatch: {}", path);
    }
    if !result.archive_checksum_ok {
        println!("  archive checksum does not match {}", manifest.archive_checksum);
    }
    bail!(
        "{} failed verification: {}",
        manifest.id(),
        result.first_problem(&manifest).unwrap_or("unknown")
    );
}

pub fn cmd_components(config: &DepotConfig, component_type: Option<&str>) -> Result<()> {
    let store = open_store(config)?;
    let components = store.list_components(component_type)?;

    if components.is_empty() {
        println!("No components packaged.");
        return Ok(());
    }

    println!("Components ({}):", components.len());
    for manifest in &components {
        println!(
            "  {:<30} {:>5} files {:>12} bytes  {}",
            manifest.id().to_string(),
            manifest.files.len(),
            manifest.archive_size,
            manifest.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

pub fn cmd_releases(config: &DepotConfig) -> Result<()> {
    let store = open_store(config)?;
    let releases = store.list_releases()?;

    if releases.is_empty() {
        println!("No releases composed.");
        return Ok(());
    }

    for release in &releases {
        print!(
            "{}  ({})",
            release.release_version,
            release.created_at.format("%Y-%m-%d %H:%M:%S")
        );
        if let Some(description) = &release.description {
            print!(" - {}", description);
        }
        println!();
        for component in &release.components {
            println!("  {}", component.id());
        }
    }
    Ok(())
}

pub fn cmd_publish(
    config: &DepotConfig,
    release: &str,
    components: &[String],
    force: bool,
    description: Option<String>,
) -> Result<()> {
    let store = open_store(config)?;
    let transport = depot::transport::open(&config.storage, &config.retry)?;
    let refs = parse_refs(components)?;

    let progress = CliProgress::new(&format!("Publishing {}", release), 0, ProgressUnit::Items);
    let options = ComposeOptions {
        force,
        concurrency: config.deploy.concurrency,
        description,
        cancel: CancelToken::new(),
    };

    let manifest = ReleaseComposer::new(&store, transport.as_ref())
        .with_progress(&progress)
        .compose(release, &refs, &options)?;

    info!("Release {} published via {}", release, transport.name());
    println!(
        "Published release {} ({} components)",
        manifest.release_version,
        manifest.components.len()
    );
    Ok(())
}

pub fn cmd_deploy(
    config: &DepotConfig,
    release: &str,
    components: Vec<String>,
    target: Option<PathBuf>,
) -> Result<()> {
    let transport = depot::transport::open(&config.storage, &config.retry)?;
    let mirrors = config
        .deploy
        .mirrors
        .iter()
        .map(|mirror| depot::transport::open(mirror, &config.retry))
        .collect::<depot::Result<Vec<_>>>()?;
    let root = target_root(config, target);

    let progress = CliProgress::new(&format!("Deploying {}", release), 0, ProgressUnit::Items);
    let options = DeployOptions {
        components,
        concurrency: config.deploy.concurrency,
        cancel: CancelToken::new(),
    };

    let mut deployer = Deployer::new(transport.as_ref(), &root)
        .with_progress(&progress)
        .with_links(config.deploy.links.clone());
    for mirror in &mirrors {
        deployer = deployer.with_fallback(mirror.as_ref());
    }
    let report = deployer.deploy(release, &options)?;

    println!("Release {} -> {}", report.release_version, root.display());
    for component in &report.components {
        let id = format!("{}:{}", component.component_type, component.version);
        match &component.outcome {
            ComponentOutcome::Deployed { extracted: true } => println!("  {:<30} deployed", id),
            ComponentOutcome::Deployed { extracted: false } => {
                println!("  {:<30} deployed (reused existing directory)", id)
            }
            ComponentOutcome::SkippedAlreadyCurrent => println!("  {:<30} already current", id),
            ComponentOutcome::Failed {
                state,
                error,
                retryable,
            } => println!(
                "  {:<30} FAILED while {} ({}): {}",
                id,
                state,
                if *retryable { "retryable" } else { "terminal" },
                error
            ),
        }
    }

    let failed = report.failed().count();
    if failed > 0 {
        bail!("{} of {} components failed", failed, report.components.len());
    }
    Ok(())
}

pub fn cmd_versions(config: &DepotConfig, component_type: Option<&str>, target: Option<PathBuf>) -> Result<()> {
    let registry = Registry::open(target_root(config, target));
    let versions = registry.list(component_type)?;

    if versions.is_empty() {
        println!("Nothing deployed.");
        return Ok(());
    }

    for info in &versions {
        let marker = if info.is_current { "*" } else { " " };
        let deployed = info
            .deployed_at
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        let missing = if info.on_disk { "" } else { "  (removed)" };
        println!(
            "{} {:<30} {}{}",
            marker,
            format!("{}:{}", info.component_type, info.version),
            deployed,
            missing
        );
    }
    Ok(())
}

pub fn cmd_history(config: &DepotConfig, component_type: &str, target: Option<PathBuf>) -> Result<()> {
    let registry = Registry::open(target_root(config, target));
    let history = registry.history(component_type)?;

    if history.is_empty() {
        println!("No switches recorded for {}.", component_type);
        return Ok(());
    }

    for event in &history {
        print!(
            "{}  {:<8} {} -> {}",
            event.switched_at.format("%Y-%m-%d %H:%M:%S"),
            event.reason,
            event.previous_version.as_deref().unwrap_or("-"),
            event.version
        );
        if let Some(release) = &event.source_release {
            print!("  (release {})", release);
        }
        println!();
    }
    Ok(())
}

pub fn cmd_switch(config: &DepotConfig, component_type: &str, version: &str, target: Option<PathBuf>) -> Result<()> {
    let registry = open_registry(config, target);
    match registry.switch(component_type, version)? {
        Some(event) => println!(
            "Switched {} from {} to {}",
            component_type,
            event.previous_version.as_deref().unwrap_or("-"),
            event.version
        ),
        None => println!("{}:{} is already current", component_type, version),
    }
    Ok(())
}

pub fn cmd_rollback(config: &DepotConfig, component_type: &str, target: Option<PathBuf>) -> Result<()> {
    let registry = open_registry(config, target);
    match registry.rollback(component_type)? {
        Some(event) => println!(
            "Rolled back {} from {} to {}",
            component_type,
            event.previous_version.as_deref().unwrap_or("-"),
            event.version
        ),
        None => println!("{} unchanged", component_type),
    }
    Ok(())
}

pub fn cmd_prune(config: &DepotConfig, component_type: &str, keep: usize, target: Option<PathBuf>) -> Result<()> {
    let registry = Registry::open(target_root(config, target));
    let removed = registry.prune(component_type, keep)?;

    if removed.is_empty() {
        println!("Nothing to prune for {}.", component_type);
    } else {
        for version in &removed {
            println!("Removed {}:{}", component_type, version);
        }
    }
    Ok(())
}
