// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate, generate

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::{Path, PathBuf};

use aegis_chat_core::domain::node_config::NodeConfigManifest;

const MINIMAL_TEMPLATE: &str = include_str!("../../templates/config-minimal.yaml");
const EXAMPLES_TEMPLATE: &str = include_str!("../../templates/config-with-examples.yaml");

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Show config file paths checked
        #[arg(long)]
        paths: bool,
    },

    /// Validate configuration file
    Validate {
        /// Path to config file (default: discover)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Generate sample configuration
    Generate {
        /// Output path (default: ./aegis-config.yaml)
        #[arg(short, long, default_value = "./aegis-config.yaml")]
        output: PathBuf,

        /// Include every section with commented defaults
        #[arg(long)]
        examples: bool,
    },
}

pub async fn handle_command(
    command: ConfigCommand,
    config_override: Option<PathBuf>,
) -> Result<()> {
    match command {
        ConfigCommand::Show { paths } => show(config_override, paths).await,
        ConfigCommand::Validate { file } => validate(file.or(config_override)).await,
        ConfigCommand::Generate { output, examples } => generate(&output, examples).await,
    }
}

async fn show(config_override: Option<PathBuf>, show_paths: bool) -> Result<()> {
    let config = NodeConfigManifest::load_or_default(config_override.clone())
        .context("Failed to load configuration")?;

    if show_paths {
        println!("{}", "Configuration discovery paths:".bold());
        if let Some(path) = &config_override {
            println!("  1. --config flag: {}", path.display());
        } else {
            println!("  1. --config flag: {}", "(not set)".dimmed());
        }
        println!(
            "  2. AEGIS_CONFIG_PATH: {}",
            std::env::var("AEGIS_CONFIG_PATH")
                .unwrap_or_else(|_| "(not set)".to_string())
                .dimmed()
        );
        println!("  3. ./aegis-config.yaml");
        println!("  4. ~/.aegis/config.yaml");
        println!("  5. /etc/aegis/config.yaml");
        println!();
    }

    let spec = &config.spec;
    println!("{}", "Current configuration:".bold());
    println!();

    println!("{}", "Node:".bold());
    println!("  Name: {}", config.metadata.name);
    println!("  ID: {}", spec.node.id);
    println!();

    println!("{}", "Inference:".bold());
    println!("  Provider: {}", spec.inference.provider);
    println!("  Endpoint: {}", spec.inference.endpoint);
    println!("  Model: {}", spec.inference.model);
    println!("  Request timeout: {:?}", spec.inference.request_timeout);
    println!();

    println!("{}", "Scheduler:".bold());
    println!("  Capacity: {}", spec.scheduler.capacity);
    println!(
        "  Queue heartbeat: {:?}",
        spec.scheduler.queue_heartbeat_interval
    );
    println!();

    println!("{}", "Streaming:".bold());
    println!("  Pulse interval: {:?}", spec.streaming.pulse_interval);
    println!("  Hard stall timeout: {:?}", spec.streaming.hard_stall_timeout);
    println!("  Partial tag flush: {:?}", spec.streaming.partial_tag_flush);
    println!();

    println!("{}", "Cognition:".bold());
    println!(
        "  Iterations: {} per plan, {} total",
        spec.cognition.max_iterations_per_plan, spec.cognition.max_total_iterations
    );
    println!("  Accept threshold: {}", spec.cognition.accept_threshold);
    println!(
        "  Timeouts: stage {:?}, loop {:?}",
        spec.cognition.stage_timeout, spec.cognition.cognitive_loop_timeout
    );
    println!();

    println!("{}", "Server:".bold());
    println!("  Listen: {}:{}", spec.server.host, spec.server.port);
    match spec.observability.metrics_port {
        Some(port) => println!("  Metrics: :{}", port),
        None => println!("  Metrics: {}", "(disabled)".dimmed()),
    }
    println!();

    Ok(())
}

async fn validate(config_path: Option<PathBuf>) -> Result<()> {
    println!("Validating configuration...");

    let config =
        NodeConfigManifest::load_or_default(config_path).context("Failed to load configuration")?;

    config
        .validate()
        .context("Configuration validation failed")?;

    println!("{}", "✓ Configuration is valid".green());

    Ok(())
}

async fn generate(output: &Path, with_examples: bool) -> Result<()> {
    write_template(output, with_examples)?;

    println!(
        "{}",
        format!("✓ Configuration generated: {}", output.display()).green()
    );

    Ok(())
}

fn write_template(output: &Path, with_examples: bool) -> Result<()> {
    let sample = if with_examples {
        EXAMPLES_TEMPLATE
    } else {
        MINIMAL_TEMPLATE
    };

    std::fs::write(output, sample)
        .with_context(|| format!("Failed to write config to {:?}", output))
}
