//! Clap derive structures for the `devbridge` CLI.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;

// ── Top-Level CLI ────────────────────────────────────────────────────

/// devbridge -- bridge local devices onto an MQTT broker
#[derive(Debug, Parser)]
#[command(
    name = "devbridge",
    version,
    about = "Bridge local devices onto an MQTT broker",
    long_about = "Runs a connector instance that publishes device state, accepts\n\
        commands, and announces devices to dashboards over MQTT.",
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Configuration file (defaults to the platform config directory)
    #[arg(long, short = 'c', env = "DEVBRIDGE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Output format
    #[arg(long, short = 'o', default_value = "text", global = true)]
    pub output: OutputFormat,

    /// When to use color output
    #[arg(long, default_value = "auto", global = true)]
    pub color: ColorMode,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text (default)
    Text,
    /// Pretty-printed JSON
    Json,
    /// Compact single-line JSON
    JsonCompact,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ColorMode {
    /// Auto-detect (color if terminal is interactive)
    Auto,
    /// Always emit color codes
    Always,
    /// Never emit color codes
    Never,
}

// ── Commands ─────────────────────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Connect to the broker and run the bridge until interrupted
    Run(RunArgs),

    /// Validate the configuration and print every device's topics
    Check,

    /// Send a command to a device and print the response
    Send(SendArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Fail every Nth poll of each simulated device (0 disables)
    #[arg(long, default_value = "0", value_name = "N")]
    pub fail_every: u32,

    /// Artificial latency of simulated device operations
    #[arg(long, default_value = "0", value_name = "MS")]
    pub latency_ms: u64,
}

#[derive(Debug, Args)]
pub struct SendArgs {
    /// Target device id
    pub device: String,

    /// Values to set, as field=value (JSON literals, else strings)
    #[arg(required = true, value_name = "FIELD=VALUE")]
    pub values: Vec<String>,

    /// Instance owning the device (defaults to the configured instance)
    #[arg(long, short = 'i')]
    pub instance: Option<String>,

    /// How long to wait for the response
    #[arg(long, default_value = "5000", value_name = "MS")]
    pub timeout_ms: u64,
}

#[derive(Debug, Args)]
pub struct CompletionsArgs {
    /// Target shell
    pub shell: Shell,
}
