// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # AEGIS Chat CLI
//!
//! The `aegis-chat` binary runs the chat server and talks to it.
//!
//! ## Commands
//!
//! - `aegis-chat serve` - Run the HTTP/SSE chat server in the foreground
//! - `aegis-chat chat <message>` - Stream one reply to the terminal
//! - `aegis-chat stop <request_id>` - Stop a live request
//! - `aegis-chat config show|validate|generate` - Configuration management

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;

use aegis_chat::commands::{self, ChatArgs, ConfigCommand};
use aegis_chat::daemon;
use aegis_chat_core::domain::node_config::NodeConfigManifest;

/// AEGIS Chat - streaming assistant backend with admission control
#[derive(Parser)]
#[command(name = "aegis-chat")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file (overrides discovery)
    #[arg(
        short,
        long,
        global = true,
        env = "AEGIS_CONFIG_PATH",
        value_name = "FILE"
    )]
    config: Option<PathBuf>,

    /// HTTP API port (default: from config, else 8000)
    #[arg(long, global = true, env = "AEGIS_PORT")]
    port: Option<u16>,

    /// HTTP API host (default: from config, else 127.0.0.1)
    #[arg(long, global = true, env = "AEGIS_HOST")]
    host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "AEGIS_LOG_LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the chat server
    #[command(name = "serve")]
    Serve,

    /// Send a message and stream the reply
    #[command(name = "chat")]
    Chat(ChatArgs),

    /// Stop a live request by id
    #[command(name = "stop")]
    Stop {
        /// Request id printed by `aegis-chat chat`
        request_id: String,
    },

    /// Configuration management
    #[command(name = "config")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Serve) => {
            let config = NodeConfigManifest::load_or_default(cli.config)
                .context("Failed to load configuration")?;
            let observability = &config.spec.observability;
            let level = cli
                .log_level
                .unwrap_or_else(|| observability.log_level.clone());
            init_logging(&level, &observability.log_format)?;
            daemon::server::start_server(config, cli.host, cli.port).await
        }
        Some(Commands::Chat(args)) => {
            init_logging(cli.log_level.as_deref().unwrap_or("warn"), "compact")?;
            commands::chat::handle_command(args, &endpoint(cli.host, cli.port)).await
        }
        Some(Commands::Stop { request_id }) => {
            init_logging(cli.log_level.as_deref().unwrap_or("warn"), "compact")?;
            commands::stop::handle_command(&request_id, &endpoint(cli.host, cli.port)).await
        }
        Some(Commands::Config { command }) => {
            init_logging(cli.log_level.as_deref().unwrap_or("info"), "compact")?;
            commands::config::handle_command(command, cli.config).await
        }
        None => {
            eprintln!("{}", "No command specified. Use --help for usage.".yellow());
            std::process::exit(1);
        }
    }
}

fn endpoint(host: Option<String>, port: Option<u16>) -> String {
    daemon::base_url(
        host.as_deref().unwrap_or(daemon::DEFAULT_HOST),
        port.unwrap_or(daemon::DEFAULT_PORT),
    )
}

/// Initialize tracing subscriber for logging. `RUST_LOG` wins over `level`.
fn init_logging(level: &str, format: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr);

    if format == "json" {
        builder.json().init();
    } else {
        builder.compact().init();
    }

    Ok(())
}
