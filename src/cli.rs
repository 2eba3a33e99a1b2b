use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "idswap")]
#[command(about = "Keep several identities for a single-account desktop app and switch between them")]
#[command(version)]
pub struct Cli {
    /// Increase log detail (-v info, -vv debug)
    #[arg(long, short = 'v', action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Path to config.toml (defaults to the platform config directory)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// List saved snapshots
    List(ListArgs),

    /// Capture the current host state as a new snapshot
    Add(AddArgs),

    /// Stop the host, swap in a snapshot and start the host again
    Switch(SwitchArgs),

    /// Delete a snapshot
    Delete(DeleteArgs),

    /// Refresh the startup backup slot now
    Backup,

    /// Show whether the host is running and which identity is active
    Status(StatusArgs),

    /// Verify the index against payload directories
    Check(CheckArgs),
}

#[derive(Parser)]
pub struct ListArgs {
    /// Include the startup and pre-switch backup slots
    #[arg(long, default_value_t = false)]
    pub all: bool,

    /// Output as JSON
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Parser)]
pub struct AddArgs {
    /// Display name (defaults to the detected account email)
    pub label: Option<String>,
}

#[derive(Parser)]
pub struct SwitchArgs {
    /// Snapshot position in `list`, id, id prefix, or backup slot name
    pub snapshot: String,

    /// Leave the host stopped after restoring
    #[arg(long, default_value_t = false)]
    pub no_launch: bool,
}

#[derive(Parser)]
pub struct DeleteArgs {
    /// Snapshot position in `list`, id, or id prefix
    pub snapshot: String,
}

#[derive(Parser)]
pub struct StatusArgs {
    /// Output as JSON
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Parser)]
pub struct CheckArgs {
    /// Drop entries without payloads and move unindexed payloads aside
    #[arg(long, default_value_t = false)]
    pub repair: bool,
}
