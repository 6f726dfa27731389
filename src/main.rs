// src/main.rs

mod cli;
mod commands;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};
use depot::DepotConfig;

fn main() -> Result<()> {
    // Initialize tracing subscriber for logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = DepotConfig::discover(cli.config.as_deref())?;

    match cli.command {
        Commands::Pack {
            component_type,
            version,
            source,
            force,
            compression,
            level,
            exclude,
        } => commands::cmd_pack(
            &config,
            &component_type,
            &version,
            &source,
            force,
            compression,
            level,
            exclude,
        ),
        Commands::Verify {
            component_type,
            version,
        } => commands::cmd_verify(&config, &component_type, &version),
        Commands::Components { component_type } => {
            commands::cmd_components(&config, component_type.as_deref())
        }
        Commands::Releases => commands::cmd_releases(&config),
        Commands::Publish {
            release,
            components,
            force,
            description,
        } => commands::cmd_publish(&config, &release, &components, force, description),
        Commands::Deploy {
            release,
            components,
            target,
        } => commands::cmd_deploy(&config, &release, components, target),
        Commands::Versions {
            component_type,
            target,
        } => commands::cmd_versions(&config, component_type.as_deref(), target),
        Commands::History {
            component_type,
            target,
        } => commands::cmd_history(&config, &component_type, target),
        Commands::Switch {
            component_type,
            version,
            target,
        } => commands::cmd_switch(&config, &component_type, &version, target),
        Commands::Rollback {
            component_type,
            target,
        } => commands::cmd_rollback(&config, &component_type, target),
        Commands::Prune {
            component_type,
            keep,
            target,
        } => commands::cmd_prune(&config, &component_type, keep, target),
    }
}
