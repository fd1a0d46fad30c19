//! Relay configuration

use crate::error::{RelayError, RelayResult};
use crate::stats::StatsFormat;
use mediarelay_transport::Role;
use std::time::Duration;

/// Default number of packets read per wake-up
pub const DEFAULT_BUFFERING: usize = 10;

/// Default readiness wait
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Minimum spacing of loss reports
pub const DEFAULT_LOSS_REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// Which connections cancel the watchdog.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TimeoutMode {
    /// Overall run-time limit, never cancelled
    #[default]
    Overall,
    /// Cancelled once the source is connected
    Source,
    /// Cancelled once the target is connected
    Target,
    /// Cancelled once both are connected
    Both,
}

impl TimeoutMode {
    /// Whether `role` takes part in cancelling the watchdog.
    #[must_use]
    pub fn governs(self, role: Role) -> bool {
        matches!(
            (self, role),
            (Self::Source | Self::Both, Role::Source) | (Self::Target | Self::Both, Role::Target)
        )
    }
}

impl TryFrom<u8> for TimeoutMode {
    type Error = RelayError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Overall),
            1 => Ok(Self::Source),
            2 => Ok(Self::Target),
            3 => Ok(Self::Both),
            other => Err(RelayError::InvalidConfig(format!(
                "timeout mode must be 0-3, got {other}"
            ))),
        }
    }
}

/// Relay configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Source URI
    pub source: String,
    /// Target URI
    pub target: String,
    /// Maximum bytes per packet
    pub chunk_size: usize,
    /// Maximum packets read per wake-up
    pub buffering: usize,
    /// Forward source timestamps to the target
    pub source_time: bool,
    /// Re-create endpoints after a lost connection instead of stopping
    pub auto_reconnect: bool,
    /// Delay before re-creating an endpoint that was reset
    pub reconnect_delay: Duration,
    /// Suppress informational logs and loss reports
    pub quiet: bool,

    /// Watchdog timeout
    pub timeout: Option<Duration>,
    /// Which connections cancel the watchdog
    pub timeout_mode: TimeoutMode,
    /// Readiness wait per iteration
    pub poll_timeout: Duration,

    /// Minimum spacing of loss reports
    pub loss_report_interval: Duration,
    /// Bandwidth report interval
    pub bandwidth_report: Option<Duration>,
    /// Stats report interval
    pub stats_report: Option<Duration>,
    /// Stats report format
    pub stats_format: StatsFormat,
    /// Include per-endpoint statistics in stats reports
    pub full_stats: bool,
}

impl RelayConfig {
    /// Configuration with defaults for everything but the endpoints.
    #[must_use]
    pub fn new(source: impl Into<String>, target: impl Into<String>, chunk_size: usize) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            chunk_size,
            buffering: DEFAULT_BUFFERING,
            source_time: false,
            auto_reconnect: true,
            reconnect_delay: Duration::ZERO,
            quiet: false,
            timeout: None,
            timeout_mode: TimeoutMode::default(),
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            loss_report_interval: DEFAULT_LOSS_REPORT_INTERVAL,
            bandwidth_report: None,
            stats_report: None,
            stats_format: StatsFormat::default(),
            full_stats: false,
        }
    }

    /// Check values the loop relies on.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::InvalidConfig`] naming the first bad value.
    pub fn validate(&self) -> RelayResult<()> {
        let invalid = |msg: &str| Err(RelayError::InvalidConfig(msg.to_string()));

        if self.source.trim().is_empty() {
            return invalid("source URI is empty");
        }
        if self.target.trim().is_empty() {
            return invalid("target URI is empty");
        }
        if self.chunk_size == 0 {
            return invalid("chunk size must be greater than 0");
        }
        if self.buffering == 0 {
            return invalid("buffering must be greater than 0");
        }
        if self.timeout.is_some_and(|t| t.is_zero()) {
            return invalid("timeout must be greater than 0");
        }
        if self.bandwidth_report.is_some_and(|d| d.is_zero()) {
            return invalid("bandwidth report interval must be greater than 0");
        }
        if self.stats_report.is_some_and(|d| d.is_zero()) {
            return invalid("stats report interval must be greater than 0");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RelayConfig::new("udp://:5000", "file://con", 1316);
        assert_eq!(config.buffering, 10);
        assert!(config.auto_reconnect);
        assert!(!config.source_time);
        assert_eq!(config.poll_timeout, Duration::from_millis(100));
        assert_eq!(config.loss_report_interval, Duration::from_secs(5));
        assert_eq!(config.timeout_mode, TimeoutMode::Overall);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let mut config = RelayConfig::new("in.ts", "out.ts", 0);
        assert!(config.validate().is_err());

        config.chunk_size = 1316;
        config.buffering = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("buffering"));

        config.buffering = 1;
        config.timeout = Some(Duration::ZERO);
        assert!(config.validate().is_err());

        config.timeout = Some(Duration::from_secs(1));
        config.source = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_timeout_mode() {
        assert_eq!(TimeoutMode::try_from(0).unwrap(), TimeoutMode::Overall);
        assert_eq!(TimeoutMode::try_from(3).unwrap(), TimeoutMode::Both);
        assert!(TimeoutMode::try_from(4).is_err());

        assert!(!TimeoutMode::Overall.governs(Role::Source));
        assert!(TimeoutMode::Source.governs(Role::Source));
        assert!(!TimeoutMode::Source.governs(Role::Target));
        assert!(TimeoutMode::Both.governs(Role::Target));
    }
}
