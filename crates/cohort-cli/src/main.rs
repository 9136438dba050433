//! Cohort command-line node.
//!
//! Runs one group member and drives it from stdin.
//!
//! # Quick Start
//!
//! ```bash
//! # Two-member group on one machine
//! COHORT_GROUP__MEMBERS=127.0.0.1:7400:0,127.0.0.1:7401:0 cohort run --port 7400
//! COHORT_GROUP__MEMBERS=127.0.0.1:7400:0,127.0.0.1:7401:0 cohort run --port 7401
//!
//! # Then, on either terminal
//! causal hello
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

/// Cohort - FIFO and causal multicast with group membership.
#[derive(Parser)]
#[command(name = "cohort")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version information.
    Version,

    /// Configuration commands.
    #[command(subcommand)]
    Config(ConfigCommands),

    /// Run a group member, reading commands from stdin.
    Run {
        /// Directory holding cohort.toml and cohort.local.toml.
        #[arg(short, long, default_value = ".")]
        project_dir: String,

        /// Listen port, overriding the configuration (0 picks a free port).
        #[arg(long)]
        port: Option<u16>,

        /// Incarnation number, overriding the configuration.
        #[arg(long)]
        incarnation: Option<u32>,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Show the effective configuration.
    Show {
        /// Directory holding cohort.toml and cohort.local.toml.
        #[arg(short, long, default_value = ".")]
        project_dir: String,

        /// Output format (text, toml, json).
        #[arg(short, long, default_value = "text")]
        format: String,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Version => {
            commands::version::run();
            Ok(())
        }
        Commands::Config(ConfigCommands::Show {
            project_dir,
            format,
        }) => commands::config::show(&project_dir, &format),
        Commands::Run {
            project_dir,
            port,
            incarnation,
        } => commands::run::run(&project_dir, port, incarnation),
    }
}
