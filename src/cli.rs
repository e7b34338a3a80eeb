use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Command-line interface for the mailbox migration engine.
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Load settings from this env file instead of the default `.env` lookup.
    #[arg(long, global = true)]
    pub env_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the migration pipeline.
    Migrate {
        /// Fetch and fingerprint messages, write evidence, but never call Gmail.
        #[arg(long)]
        dry_run: bool,

        /// Reset skipped/failed messages and folder checkpoints, then rescan.
        #[arg(long)]
        reset: bool,
    },

    /// Run the interactive Google OAuth consent flow and store the refresh token.
    SinkAuth,

    /// Re-hash every downloaded `.eml` and compare against its stored checksum.
    Verify,

    /// Write a JSON summary of the current ledger state to the reports directory.
    Report,
}
