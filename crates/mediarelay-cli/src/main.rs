//! mediarelay CLI
//!
//! Relays a live media stream from a source endpoint to a target endpoint,
//! reconnecting as needed and reporting losses.

mod cli;
mod config;
mod logging;
mod signals;

use clap::Parser;
use mediarelay_core::error::{EXIT_FAILURE, EXIT_RUNTIME};
use mediarelay_core::{CancellationToken, Relay, StatsWriter};
use mediarelay_transport::{TransportConfig, UriEndpointFactory};
use std::fs::File;
use std::process::ExitCode;
use tracing::info;

use cli::Cli;
use config::{FileConfig, Settings};

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // help and version are not errors
            let code = if e.use_stderr() { EXIT_FAILURE } else { 0 };
            let _ = e.print();
            return ExitCode::from(code);
        }
    };

    match run(cli) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("ERROR: {e:#}");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

/// Returns the exit status. Errors are configuration problems (exit 1).
fn run(cli: Cli) -> anyhow::Result<u8> {
    let file = match &cli.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };
    let settings = Settings::resolve(cli, file)?;

    logging::init(&settings.log_level, settings.logfile.as_deref());

    let cancel = CancellationToken::new();
    if let Err(e) = signals::spawn_listener(cancel.clone()) {
        eprintln!("ERROR: cannot install signal handlers: {e}");
        return Ok(EXIT_RUNTIME);
    }

    let relay_config = settings.relay;
    if !relay_config.quiet {
        info!(
            "Media path: '{}' --> '{}'",
            relay_config.source, relay_config.target
        );
    }

    let stats_format = relay_config.stats_format;
    let wants_stats = relay_config.stats_report.is_some();
    let factory = UriEndpointFactory::new(TransportConfig::default());
    let mut relay = match Relay::new(relay_config, Box::new(factory), cancel) {
        Ok(relay) => relay,
        Err(e) => {
            eprintln!("ERROR: {e}");
            return Ok(e.exit_code());
        }
    };

    if wants_stats {
        if let Some(path) = &settings.statsout {
            match File::create(path) {
                Ok(file) => {
                    relay = relay.with_stats_writer(StatsWriter::new(Box::new(file), stats_format));
                }
                Err(e) => eprintln!(
                    "ERROR: can't open '{}' for writing stats ({}), falling back to stdout",
                    path.display(),
                    e
                ),
            }
        }
    } else if settings.statsout.is_some() {
        info!("--statsout has no effect without --stats");
    }

    match relay.run() {
        Ok(reason) => {
            info!("Stopped: {}", reason);
            Ok(0)
        }
        Err(e) => {
            eprintln!("ERROR: {e}");
            Ok(e.exit_code())
        }
    }
}
