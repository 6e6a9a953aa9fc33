//! Command-line surface.
//!
//! Mirrors the original's `cobra` command tree (`run`, `version`) with
//! `clap`'s derive macros: one root command, one subcommand per
//! original's `internal/cmd/*` package.

use clap::{Parser, Subcommand};

pub const CRATE_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Parser)]
#[command(name = "hashring-proxy", about = "Consistent-hash-routing reverse proxy", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Load a config file and run every configured proxy.
    Run(RunArgs),

    /// Print the build version and exit.
    Version,
}

#[derive(Debug, Parser)]
pub struct RunArgs {
    /// Path to the YAML configuration file.
    #[arg(long, default_value = "config.yaml")]
    pub config: String,

    /// Minimum log level: trace, debug, info, warn, error.
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Disable tracing spans in log output (events only).
    #[arg(long, default_value_t = false)]
    pub disable_trace: bool,

    /// Address the shared `/metrics` and `/{name}/health` webserver binds to.
    #[arg(long, default_value = "0.0.0.0:9090")]
    pub status_address: String,
}
