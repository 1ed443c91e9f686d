use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Command-line options for icloud2gmail.
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Load environment from this file instead of the default `.env`.
    #[arg(long, global = true)]
    pub env_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Complete the Google OAuth consent flow and persist the token file.
    GmailAuth,
    /// Run discovery and ingestion (or stop after evidence on --dry-run).
    Migrate {
        /// Download and record evidence without calling Gmail.
        #[arg(long)]
        dry_run: bool,
        /// Return skipped/failed rows and folder checkpoints for re-attempt
        /// before discovery begins.
        #[arg(long)]
        reset: bool,
    },
    /// Recompute the SHA-256 of every stored .eml and compare to the state
    /// database.
    Verify,
    /// Write a JSON summary into the reports directory.
    Report,
}
