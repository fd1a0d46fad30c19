//! Logging setup.

use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber.
///
/// `RUST_LOG`, when set, takes precedence over `level`. Logs go to
/// `logfile` if it can be created, otherwise to stderr.
pub fn init(level: &str, logfile: Option<&Path>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    match logfile.map(|path| (path, File::create(path))) {
        Some((_, Ok(file))) => builder.with_ansi(false).with_writer(Mutex::new(file)).init(),
        Some((path, Err(e))) => {
            eprintln!(
                "ERROR: can't open '{}' for writing ({}), logging to stderr",
                path.display(),
                e
            );
            builder.with_writer(io::stderr).init();
        }
        None => builder.with_writer(io::stderr).init(),
    }
}
