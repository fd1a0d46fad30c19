//! Configuration file and option merging.
//!
//! Every command-line option may also be given in a TOML file passed with
//! `--config`. Command-line values win over file values, which win over
//! the built-in defaults.

use crate::cli::Cli;
use anyhow::{Context, bail};
use mediarelay_core::{RelayConfig, StatsFormat, TimeoutMode};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Reconnect delay when none is configured
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 500;

/// Log level when none is configured
pub const DEFAULT_LOG_LEVEL: &str = "info";

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Contents of a `--config` file
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    /// Source URI
    pub source: Option<String>,
    /// Target URI
    pub target: Option<String>,
    /// Watchdog seconds
    pub timeout: Option<u64>,
    /// Watchdog mode 0-3
    pub timeout_mode: Option<u8>,
    /// Chunk size in bytes
    pub chunk: Option<usize>,
    /// Bandwidth report interval in ms
    pub bwreport: Option<u64>,
    /// Pass source timestamps
    pub srctime: Option<bool>,
    /// Packets per wake-up
    pub buffering: Option<usize>,
    /// Stats interval in ms
    pub stats: Option<u64>,
    /// Stats file
    pub statsout: Option<PathBuf>,
    /// Stats format
    pub statspf: Option<String>,
    /// Per-endpoint stats
    pub fullstats: Option<bool>,
    /// Auto-reconnect
    pub autoreconnect: Option<bool>,
    /// Reconnect delay in ms
    pub reconnect_delay: Option<u64>,
    /// Log level
    pub loglevel: Option<String>,
    /// Log file
    pub logfile: Option<PathBuf>,
    /// Errors only
    pub quiet: Option<bool>,
    /// Debug logging
    pub verbose: Option<bool>,
}

impl FileConfig {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("cannot read config file '{}'", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("invalid config file '{}'", path.display()))?;
        Ok(config)
    }
}

/// Everything the binary needs after merging.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Relay configuration
    pub relay: RelayConfig,
    /// Log filter directive
    pub log_level: String,
    /// Log file
    pub logfile: Option<PathBuf>,
    /// Stats file
    pub statsout: Option<PathBuf>,
}

fn millis(ms: Option<u64>) -> Option<Duration> {
    ms.filter(|&ms| ms > 0).map(Duration::from_millis)
}

impl Settings {
    /// Merge command-line options over file values over defaults.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first missing or invalid value.
    pub fn resolve(cli: Cli, file: FileConfig) -> anyhow::Result<Self> {
        let Some(source) = cli.source.or(file.source) else {
            bail!("missing source URI");
        };
        let Some(target) = cli.target.or(file.target) else {
            bail!("missing target URI");
        };
        let Some(chunk) = cli.chunk.or(file.chunk) else {
            bail!("chunk size (-c/--chunk) is required");
        };

        let mut relay = RelayConfig::new(source, target, chunk);
        if let Some(buffering) = cli.buffering.or(file.buffering) {
            relay.buffering = buffering;
        }
        relay.source_time = cli.srctime || file.srctime.unwrap_or(false);
        relay.auto_reconnect = cli.autoreconnect.or(file.autoreconnect).unwrap_or(true);
        relay.reconnect_delay = Duration::from_millis(
            cli.reconnect_delay
                .or(file.reconnect_delay)
                .unwrap_or(DEFAULT_RECONNECT_DELAY_MS),
        );
        relay.quiet = cli.quiet || file.quiet.unwrap_or(false);

        relay.timeout = cli
            .timeout
            .or(file.timeout)
            .filter(|&secs| secs > 0)
            .map(Duration::from_secs);
        relay.timeout_mode = TimeoutMode::try_from(cli.timeout_mode.or(file.timeout_mode).unwrap_or(0))?;

        relay.bandwidth_report = millis(cli.bwreport.or(file.bwreport));
        relay.stats_report = millis(cli.stats.or(file.stats));
        if let Some(format) = cli.statspf.or(file.statspf) {
            relay.stats_format = format.parse::<StatsFormat>().map_err(anyhow::Error::msg)?;
        }
        relay.full_stats = cli.fullstats || file.fullstats.unwrap_or(false);
        relay.validate()?;

        let verbose = cli.verbose || file.verbose.unwrap_or(false);
        let log_level = if relay.quiet {
            "error".to_string()
        } else if verbose {
            "debug".to_string()
        } else {
            let level = cli
                .loglevel
                .or(file.loglevel)
                .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string())
                .to_ascii_lowercase();
            if !LOG_LEVELS.contains(&level.as_str()) {
                bail!(
                    "invalid log level: {}. Must be one of: {}",
                    level,
                    LOG_LEVELS.join(", ")
                );
            }
            level
        };

        Ok(Self {
            relay,
            log_level,
            logfile: cli.logfile.or(file.logfile),
            statsout: cli.statsout.or(file.statsout),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn cli(args: &[&str]) -> Cli {
        let mut argv = vec!["mediarelay"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults() {
        let settings =
            Settings::resolve(cli(&["-c", "1316", "udp://:5000", "file://con"]), FileConfig::default())
                .unwrap();

        let relay = &settings.relay;
        assert_eq!(relay.chunk_size, 1316);
        assert_eq!(relay.buffering, 10);
        assert!(relay.auto_reconnect);
        assert_eq!(relay.reconnect_delay, Duration::from_millis(500));
        assert_eq!(relay.timeout, None);
        assert_eq!(relay.stats_format, StatsFormat::TwoColumns);
        assert_eq!(settings.log_level, "info");
    }

    #[test]
    fn test_cli_overrides_file() {
        let file: FileConfig = toml::from_str(
            r#"
            source = "udp://:5000"
            target = "out.ts"
            chunk = 188
            buffering = 4
            autoreconnect = false
            loglevel = "warn"
            statspf = "csv"
            "#,
        )
        .unwrap();

        let settings = Settings::resolve(cli(&["-c", "1316", "--buffering", "8"]), file).unwrap();
        assert_eq!(settings.relay.source, "udp://:5000");
        assert_eq!(settings.relay.chunk_size, 1316);
        assert_eq!(settings.relay.buffering, 8);
        assert!(!settings.relay.auto_reconnect);
        assert_eq!(settings.relay.stats_format, StatsFormat::Csv);
        assert_eq!(settings.log_level, "warn");
    }

    #[test]
    fn test_quiet_and_verbose_levels() {
        let settings =
            Settings::resolve(cli(&["-q", "-v", "-c", "1", "a", "b"]), FileConfig::default()).unwrap();
        assert_eq!(settings.log_level, "error");
        assert!(settings.relay.quiet);

        let settings =
            Settings::resolve(cli(&["-v", "-c", "1", "a", "b"]), FileConfig::default()).unwrap();
        assert_eq!(settings.log_level, "debug");
    }

    #[test]
    fn test_rejects_bad_values() {
        let missing_chunk = Settings::resolve(cli(&["a", "b"]), FileConfig::default());
        assert!(missing_chunk.unwrap_err().to_string().contains("chunk"));

        assert!(Settings::resolve(cli(&["-c", "1", "--buffering", "0", "a", "b"]), FileConfig::default()).is_err());
        assert!(Settings::resolve(cli(&["-c", "1", "--pf", "xml", "a", "b"]), FileConfig::default()).is_err());
        assert!(Settings::resolve(cli(&["-c", "1", "--ll", "loud", "a", "b"]), FileConfig::default()).is_err());
        assert!(Settings::resolve(cli(&["-c", "1"]), FileConfig::default()).is_err());
    }

    #[test]
    fn test_zero_intervals_disable_reports() {
        let settings = Settings::resolve(
            cli(&["-c", "1", "-t", "0", "-r", "0", "-s", "1000", "a", "b"]),
            FileConfig::default(),
        )
        .unwrap();
        assert_eq!(settings.relay.timeout, None);
        assert_eq!(settings.relay.bandwidth_report, None);
        assert_eq!(settings.relay.stats_report, Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_load_rejects_unknown_keys() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "chunk = 1316\nbogus = 1").unwrap();
        assert!(FileConfig::load(file.path()).is_err());

        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "chunk = 1316\ntimeout_mode = 2").unwrap();
        let config = FileConfig::load(file.path()).unwrap();
        assert_eq!(config.chunk, Some(1316));
        assert_eq!(config.timeout_mode, Some(2));
    }
}
