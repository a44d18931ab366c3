use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde::Serialize;

/// Downloads firmware images for paired hardware wallets and checks which components
/// need an update.
///
/// Flashing itself needs a device driver and is driven through the library.
#[derive(Debug, Parser, Serialize)]
#[command(author, version)]
pub struct Args {
    /// The path to the config file.
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<String>,
    /// The directory firmware images are cached in.
    #[arg(long, alias = "dir")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub downloads: Option<String>,
    /// The file candidate records are persisted in.
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub records: Option<String>,
    /// Size in bytes of the chunks a download is read in.
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<usize>,
    /// Minimum milliseconds between two download progress notifications.
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress_interval: Option<u64>,
    /// Milliseconds without any received data after which a download times out.
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stall_timeout: Option<u64>,
    /// Permits downloading firmware over plain http.
    #[arg(long)]
    // Serialization is skipped if not set because command line args always take
    // precedence over env vars and a config file. This would otherwise make it
    // impossible to set this config option outside of cli args.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub allow_http: bool,
    /// Treats every candidate as an update, even if the device already runs it.
    #[arg(long)]
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub force: bool,
    #[command(subcommand)]
    #[serde(skip)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Compares two firmware versions numerically.
    Compare { a: String, b: String },
    /// Prints the version check decision for every candidate.
    Check {
        /// JSON file describing the device.
        #[arg(long)]
        device: PathBuf,
        /// JSON file listing the firmware candidates.
        #[arg(long)]
        candidates: PathBuf,
    },
    /// Downloads and validates every candidate into the artifact store.
    Fetch {
        /// JSON file listing the firmware candidates.
        #[arg(long)]
        candidates: PathBuf,
    },
}
