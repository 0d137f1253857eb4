//! Updater CLI Module
//! Command-line interface for inspecting and driving updates

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub mod formatter;

#[derive(Parser, Debug)]
#[command(name = "bundle-updater")]
#[command(version)]
#[command(about = "Select, verify and install application bundle updates", long_about = None)]
pub struct Cli {
    /// Directory holding updater.config.json (defaults to current directory)
    #[arg(short, long, global = true)]
    pub config_dir: Option<PathBuf>,

    /// Output format (json for scripting)
    #[arg(short, long, global = true, default_value = "text")]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Compare two version strings
    Compare {
        a: String,
        b: String,
    },

    /// Pick the update to install from a feed
    Select {
        #[command(flatten)]
        source: FeedSource,
    },

    /// Check an artifact's signature against the configured keys
    Verify {
        /// Artifact file
        #[arg(short, long)]
        artifact: PathBuf,

        /// Base64 signature
        #[arg(short, long)]
        signature: String,

        /// Treat the signature as ECDSA P-256 instead of Ed25519
        #[arg(long)]
        legacy: bool,
    },

    /// Apply a delta patch to a bundle
    ApplyPatch {
        /// Bundle the patch was built against
        #[arg(long)]
        base: PathBuf,

        /// Patch container
        #[arg(long)]
        patch: PathBuf,

        /// Directory that receives the patched bundle
        #[arg(long)]
        out: PathBuf,
    },

    /// Select and install the next update
    Install {
        #[command(flatten)]
        source: FeedSource,
    },

    /// Finish or undo a swap interrupted by a crash
    Recover,

    /// Never offer this version again
    Skip {
        version: String,
    },

    /// Forget the skipped version
    Unskip,
}

/// Feed and host description shared by `select` and `install`.
#[derive(clap::Args, Debug)]
pub struct FeedSource {
    /// JSON array of candidate records
    #[arg(long)]
    pub feed: PathBuf,

    /// Installed bundle
    #[arg(long)]
    pub bundle: PathBuf,

    /// JSON host state; read from the bundle and stored state when omitted
    #[arg(long)]
    pub host: Option<PathBuf>,

    /// Ignore phased rollout, as for a check the user asked for
    #[arg(long)]
    pub user_initiated: bool,
}

impl Cli {
    pub fn get_config_dir(&self) -> PathBuf {
        self.config_dir
            .clone()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
    }
}
