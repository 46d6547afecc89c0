//! Clap derive structures for the `portlet` CLI.
//!
//! Defines the command tree, global flags, and shared types.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

// ── Top-Level CLI ────────────────────────────────────────────────────

/// portlet -- connect to services forwarded through secure tunnels
#[derive(Debug, Parser)]
#[command(
    name = "portlet",
    version,
    about = "Connect to tunnelled services from the command line",
    long_about = "Tracks which forwarded services you want reachable, probes their\n\
        local tunnel endpoints, and reports every connection change.",
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
    /// Config file (default: platform config dir)
    #[arg(long, env = "PORTLET_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Output format
    #[arg(long, short = 'o', default_value = "table", global = true)]
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

// ── Output & Color Enums ─────────────────────────────────────────────

#[derive(Debug, Clone, ValueEnum)]
pub enum OutputFormat {
    /// Pretty table (default, interactive)
    Table,
    /// Pretty-printed JSON
    Json,
    /// Compact single-line JSON
    JsonCompact,
    /// YAML
    Yaml,
    /// Plain text, one value per line (scripting)
    Plain,
}

#[derive(Debug, Clone, ValueEnum)]
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
    /// List configured services and their state
    #[command(alias = "ls")]
    List(ListArgs),

    /// Show one service
    Show {
        /// Service id
        id: String,
    },

    /// Probe one service's tunnel endpoint once
    Probe(ProbeArgs),

    /// Start a session: connect services and follow changes
    Run(RunArgs),

    /// Manage the configuration file
    Config(ConfigArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

#[derive(Debug, Args)]
pub struct ListArgs {
    /// Only services in this group
    #[arg(long, short = 'g')]
    pub group: Option<String>,
}

#[derive(Debug, Args)]
pub struct ProbeArgs {
    /// Service id
    pub id: String,

    /// Probe timeout in seconds (overrides config)
    #[arg(long, short = 't')]
    pub timeout: Option<u64>,
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Connect these services on start, in addition to auto_connect ones
    #[arg(long, short = 'c', value_name = "ID")]
    pub connect: Vec<String>,

    /// Do not read intents from stdin; follow events until Ctrl-C
    #[arg(long)]
    pub no_input: bool,
}

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Print the config file location
    Path,

    /// Display the resolved configuration
    Show,

    /// Write a starter config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Debug, Args)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    pub shell: clap_complete::Shell,
}
