//! CLI struct definitions for the groundtruth command-line interface.
//!
//! All clap-derived types live here. Dispatch lives in `lib.rs`.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(
    name = "groundtruth",
    version = env!("CARGO_PKG_VERSION"),
    about = "Progressive, confidence-gated discovery of what is actually there, with snapshots to say what changed."
)]
pub(crate) struct Cli {
    /// State directory (default: $GROUNDTRUTH_HOME, then ./.groundtruth).
    #[clap(long, global = true)]
    pub store: Option<PathBuf>,
    /// Session scope for cache entries (default: $GROUNDTRUTH_SESSION, then 'default').
    #[clap(long, global = true)]
    pub session: Option<String>,
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(clap::Args, Debug)]
pub(crate) struct FormatArg {
    /// Output format: 'json' or 'text'.
    #[clap(long, default_value = "json", value_parser = ["json", "text"])]
    pub format: String,
}

impl FormatArg {
    pub fn is_text(&self) -> bool {
        self.format == "text"
    }
}

#[derive(clap::Args, Debug)]
pub(crate) struct DiscoverCli {
    /// Target locator: fs:<path>, forge:<repo-path> or db:<url|env>. Bare paths are filesystem targets.
    #[clap(long)]
    pub target: String,
    /// Deepest level to attempt (default: deepest the probe supports).
    #[clap(long, value_parser = clap::value_parser!(u8).range(1..=9))]
    pub level: Option<u8>,
    /// Drop cached levels for this target before running.
    #[clap(long)]
    pub fresh: bool,
    /// Capture a snapshot and report changes since the previous one.
    #[clap(long)]
    pub snapshot: bool,
    #[clap(flatten)]
    pub format: FormatArg,
}

#[derive(clap::Args, Debug)]
pub(crate) struct SnapshotCli {
    #[clap(subcommand)]
    pub command: SnapshotCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum SnapshotCommand {
    /// Run discovery and persist the result as a new snapshot
    Capture {
        #[clap(long)]
        target: String,
        #[clap(long, value_parser = clap::value_parser!(u8).range(1..=9))]
        level: Option<u8>,
        #[clap(flatten)]
        format: FormatArg,
    },
    /// List stored snapshots, oldest first
    List {
        #[clap(long)]
        target: Option<String>,
        #[clap(flatten)]
        format: FormatArg,
    },
    /// Print one snapshot
    Show {
        id: String,
        #[clap(flatten)]
        format: FormatArg,
    },
    /// Compare two snapshots of the same target
    Diff {
        base: String,
        target: String,
        #[clap(flatten)]
        format: FormatArg,
    },
    /// Delete a snapshot permanently
    Prune { id: String },
    /// Print the most recent snapshot of a target
    Latest {
        #[clap(long)]
        target: String,
        #[clap(flatten)]
        format: FormatArg,
    },
}

#[derive(clap::Args, Debug)]
pub(crate) struct CacheCli {
    #[clap(subcommand)]
    pub command: CacheCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum CacheCommand {
    /// Invalidate every cached level of a target
    Clear {
        #[clap(long)]
        target: String,
    },
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Discover a target level by level
    Discover(DiscoverCli),
    /// Capture, inspect and compare snapshots
    Snapshot(SnapshotCli),
    /// Manage the level cache
    Cache(CacheCli),
    /// Show the level calibration table and each probe's levels
    Levels,
    /// Show the most recent audit events
    Events {
        #[clap(long, default_value = "20")]
        limit: usize,
    },
}
