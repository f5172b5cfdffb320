use std::path::PathBuf;

use clap::Parser;

/// Copy local files through the upload receiver, with bandwidth throttling
/// and progress reporting.
#[derive(Debug, Parser)]
#[command(name = "echo-ft-copy", version, about)]
pub struct Args {
    /// Files to upload.
    #[arg(required = true)]
    pub files: Vec<PathBuf>,

    /// Directory receiving the uploaded files.
    #[arg(short, long)]
    pub dest: PathBuf,

    /// Receiver config file (JSON).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Bandwidth cap in bytes per second; 0 disables throttling.
    #[arg(short, long)]
    pub bandwidth: Option<u64>,

    /// Maximum total upload size in bytes; negative for no limit.
    #[arg(long, allow_negative_numbers = true)]
    pub max_size: Option<i64>,

    /// Milliseconds between progress log lines.
    #[arg(long, default_value_t = 500)]
    pub poll_ms: u64,
}
