//! CLI command definitions and dispatch.

mod commit;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// nydus-commit — commit a running container into an accelerated image.
#[derive(Parser)]
#[command(name = "nydus-commit", version, about)]
pub struct Cli {
    /// Set the logging level [trace, debug, info, warn, error]
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    /// Path to the YAML configuration file
    #[arg(long, global = true, env = "CONFIG")]
    pub config: Option<PathBuf>,

    /// Parent directory for per-invocation work directories
    #[arg(long, global = true, default_value = "/tmp")]
    pub workdir: PathBuf,

    /// Path to the external block-image builder
    #[arg(long, global = true, default_value = "nydus-image")]
    pub builder: PathBuf,

    /// Unix socket of the pouch engine
    #[arg(long = "pouch.addr", global = true, default_value = "/var/run/pouchd.sock")]
    pub pouch_addr: PathBuf,

    /// Unix socket of the docker engine
    #[arg(long = "docker.addr", global = true, default_value = "/var/run/docker.sock")]
    pub docker_addr: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Commit a running container into a nydus image based on a nydus image
    Commit(commit::CommitArgs),
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match &cli.command {
        Command::Commit(args) => commit::execute(&cli, args).await,
    }
}
