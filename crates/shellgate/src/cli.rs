//! Clap derive structures for the `shellgate` CLI.

use clap::{Args, Parser, Subcommand};

// ── Top-Level CLI ────────────────────────────────────────────────────

/// shellgate -- command-line client for the database shell GUI backend
#[derive(Debug, Parser)]
#[command(
    name = "shellgate",
    version,
    about = "Talk to a database shell GUI backend over its WebSocket protocol",
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
    /// Backend base URL
    #[arg(
        long,
        short = 'u',
        env = "SHELLGATE_URL",
        default_value = "http://127.0.0.1:8000",
        global = true
    )]
    pub url: String,

    /// Backend user to authenticate as
    #[arg(long, env = "SHELLGATE_USER", global = true)]
    pub user: Option<String>,

    /// Password for --user
    #[arg(long, env = "SHELLGATE_PASSWORD", global = true, hide_env = true)]
    pub password: Option<String>,

    /// Request timeout in seconds (0 disables expiry)
    #[arg(long, env = "SHELLGATE_TIMEOUT", default_value = "30", global = true)]
    pub timeout: u64,

    /// Seconds to wait for the initial connection
    #[arg(long, default_value = "15", global = true)]
    pub connect_timeout: u64,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

// ── Top-Level Command Enum ───────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Execute a backend command and print its results
    #[command(alias = "x")]
    Exec(ExecArgs),

    /// Print bus events (socket state, web session, notifications) as
    /// they arrive; stop with Ctrl-C
    Listen,

    /// Show backend session information
    Info,
}

#[derive(Debug, Args)]
pub struct ExecArgs {
    /// Dotted command name, e.g. gui.dbconnections.list_db_connections
    pub command: String,

    /// JSON object with the command arguments
    #[arg(long, short = 'a', default_value = "{}")]
    pub args: String,
}
