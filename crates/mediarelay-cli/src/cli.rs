//! Command-line arguments.

use clap::Parser;
use clap::builder::BoolishValueParser;
use std::path::PathBuf;

/// mediarelay - relay a live media stream between endpoints
///
/// Endpoints are URIs: a file path or `file://con` (stdin/stdout),
/// `udp://host:port`, `rtp://host:port`, or `tcp://host:port` for the
/// reliable framed-TCP transport. An empty host listens or binds on all
/// interfaces.
#[derive(Parser, Debug, Default)]
#[command(name = "mediarelay")]
#[command(author, version, about)]
pub struct Cli {
    /// Source URI
    #[arg(value_name = "SOURCE")]
    pub source: Option<String>,

    /// Target URI
    #[arg(value_name = "TARGET")]
    pub target: Option<String>,

    /// Stop after this many seconds unless the governed connections are up
    #[arg(short = 't', long, visible_alias = "to", value_name = "SECONDS")]
    pub timeout: Option<u64>,

    /// Roles that cancel the timeout: 0 none, 1 source, 2 target, 3 both
    #[arg(
        long = "timeout-mode",
        visible_alias = "tm",
        value_name = "MODE",
        value_parser = clap::value_parser!(u8).range(0..=3)
    )]
    pub timeout_mode: Option<u8>,

    /// Maximum bytes per packet
    #[arg(short = 'c', long, value_name = "BYTES")]
    pub chunk: Option<usize>,

    /// Bandwidth report interval
    #[arg(short = 'r', long, value_name = "MS")]
    pub bwreport: Option<u64>,

    /// Pass source timestamps on to the target
    #[arg(long, visible_aliases = ["st", "sourcetime"])]
    pub srctime: bool,

    /// Maximum packets read per wake-up
    #[arg(long, value_name = "PACKETS")]
    pub buffering: Option<usize>,

    /// Stats report interval
    #[arg(short = 's', long, value_name = "MS")]
    pub stats: Option<u64>,

    /// Write stats reports to this file instead of stdout
    #[arg(long, value_name = "PATH")]
    pub statsout: Option<PathBuf>,

    /// Stats format: 2cols, csv or json
    #[arg(long, visible_alias = "pf", value_name = "FORMAT")]
    pub statspf: Option<String>,

    /// Include per-endpoint statistics in stats reports
    #[arg(short = 'f', long)]
    pub fullstats: bool,

    /// Re-create endpoints after a lost connection
    #[arg(short = 'a', long, value_name = "BOOL", value_parser = BoolishValueParser::new())]
    pub autoreconnect: Option<bool>,

    /// Delay before re-creating a reset endpoint
    #[arg(long = "reconnect-delay", value_name = "MS")]
    pub reconnect_delay: Option<u64>,

    /// Log level: trace, debug, info, warn or error
    #[arg(long, visible_alias = "ll", value_name = "LEVEL")]
    pub loglevel: Option<String>,

    /// Write logs to this file instead of stderr
    #[arg(long, value_name = "PATH")]
    pub logfile: Option<PathBuf>,

    /// Errors only, no loss reports
    #[arg(short, long)]
    pub quiet: bool,

    /// Debug logging
    #[arg(short, long)]
    pub verbose: bool,

    /// TOML file with defaults for any of these options
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,
}
