//! Command-line surfaces for `ferry` and `ferryd`.
//!
//! The port is taken as text here and validated by the `HandleArguments`
//! state so both binaries report bad ports the same way.

use clap::Parser;
use std::path::PathBuf;

/// Push files to a ferryd receiver
#[derive(Clone, Debug, Parser)]
#[command(version, about)]
pub struct ClientArgs {
    /// Receiver IPv4 or IPv6 address
    pub address: String,

    /// Receiver TCP port
    pub port: String,

    /// Files to send, in order; missing files are skipped
    #[arg(required = true)]
    pub files: Vec<PathBuf>,

    /// Show a progress bar per file
    #[arg(short, long)]
    pub progress: bool,

    /// Trace every state the session enters
    #[arg(short, long)]
    pub trace: bool,

    /// Write trace and event lines to this file instead of stderr
    #[arg(long = "log-file")]
    pub log_file: Option<PathBuf>,
}

/// Receive files from ferry clients into a directory
#[derive(Clone, Debug, Parser)]
#[command(version, about)]
pub struct ServerArgs {
    /// Address to listen on
    pub address: String,

    /// TCP port to listen on
    pub port: String,

    /// Directory received files are written to
    pub directory: PathBuf,

    /// Append one JSON line per received file to this journal
    #[arg(long)]
    pub journal: Option<PathBuf>,

    /// Trace every state the session enters
    #[arg(short, long)]
    pub trace: bool,

    /// Write trace and event lines to this file instead of stderr
    #[arg(long = "log-file")]
    pub log_file: Option<PathBuf>,
}
