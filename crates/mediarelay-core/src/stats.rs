//! Byte accounting and periodic reporting.
//!
//! Three reports come out of the loop:
//! - the loss line, rate limited and only when losses changed
//! - the bandwidth line, every `bwreport` interval
//! - a stats snapshot, every `stats` interval, in one of several formats

use mediarelay_transport::TransportStats;
use serde::Serialize;
use std::fmt;
use std::io::{self, Write};
use std::str::FromStr;
use std::time::{Duration, Instant};

/// Byte counters for the current source and target epochs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ByteCounters {
    /// Bytes read from the source
    pub received: u64,
    /// Bytes accepted by the target
    pub written: u64,
    /// Bytes dropped: no target, or a rejected write
    pub lost: u64,
    /// `lost` as of the last loss report
    pub last_reported_lost: u64,
}

impl ByteCounters {
    /// A new source was created.
    ///
    /// `last_reported_lost` survives, so `lost` can fall below it; the loss
    /// reporter skips the resulting zero.
    pub fn reset_source_epoch(&mut self) {
        self.received = 0;
        self.lost = 0;
    }

    /// A new target was created.
    pub fn reset_target_epoch(&mut self) {
        self.written = 0;
        self.lost = 0;
        self.last_reported_lost = 0;
    }
}

/// One loss line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LossReport {
    /// Bytes lost
    pub lost: u64,
    /// Bytes written
    pub written: u64,
    /// Bytes received
    pub received: u64,
}

impl fmt::Display for LossReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} bytes lost, {} bytes sent, {} bytes received",
            self.lost, self.written, self.received
        )
    }
}

/// Rate limiter for the loss line.
#[derive(Debug, Clone)]
pub struct LossReporter {
    interval: Duration,
    last_report: Instant,
}

impl LossReporter {
    /// The first report can come no earlier than `interval` after `now`.
    #[must_use]
    pub fn new(interval: Duration, now: Instant) -> Self {
        Self {
            interval,
            last_report: now,
        }
    }

    /// Produce a report if losses changed and the interval has passed.
    ///
    /// A loss count reset to zero by a new source epoch is not reported.
    pub fn poll(&mut self, counters: &mut ByteCounters, now: Instant) -> Option<LossReport> {
        if counters.lost == counters.last_reported_lost {
            return None;
        }
        if counters.lost == 0 {
            counters.last_reported_lost = 0;
            return None;
        }
        if now.saturating_duration_since(self.last_report) < self.interval {
            return None;
        }

        self.last_report = now;
        counters.last_reported_lost = counters.lost;
        Some(LossReport {
            lost: counters.lost,
            written: counters.written,
            received: counters.received,
        })
    }
}

/// Fires once per interval.
#[derive(Debug, Clone)]
pub struct Ticker {
    every: Duration,
    next: Instant,
}

impl Ticker {
    /// First tick one interval after `now`.
    #[must_use]
    pub fn new(every: Duration, now: Instant) -> Self {
        Self {
            every,
            next: now + every,
        }
    }

    /// True when a tick is due; schedules the next one.
    pub fn due(&mut self, now: Instant) -> bool {
        if now < self.next {
            return false;
        }
        self.next = now + self.every;
        true
    }
}

/// Receive bitrate over one report interval.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BandwidthReport {
    /// Megabits per second over the interval
    pub mbps: f64,
    /// Bytes received since the relay started
    pub total: u64,
}

impl fmt::Display for BandwidthReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Bandwidth: {:.3} Mbps, {} received",
            self.mbps,
            format_bytes(self.total)
        )
    }
}

/// Measures receive bitrate independently of epoch resets.
#[derive(Debug, Clone)]
pub struct BandwidthMeter {
    ticker: Ticker,
    window_start: Instant,
    window_bytes: u64,
    total: u64,
}

impl BandwidthMeter {
    /// Meter reporting every `every`.
    #[must_use]
    pub fn new(every: Duration, now: Instant) -> Self {
        Self {
            ticker: Ticker::new(every, now),
            window_start: now,
            window_bytes: 0,
            total: 0,
        }
    }

    /// Count received bytes.
    pub fn record(&mut self, bytes: u64) {
        self.window_bytes += bytes;
        self.total += bytes;
    }

    /// Report for the window that just ended, if one is due.
    #[allow(clippy::cast_precision_loss)]
    pub fn poll(&mut self, now: Instant) -> Option<BandwidthReport> {
        if !self.ticker.due(now) {
            return None;
        }

        let secs = now.saturating_duration_since(self.window_start).as_secs_f64();
        let mbps = if secs > 0.0 {
            (self.window_bytes * 8) as f64 / secs / 1_000_000.0
        } else {
            0.0
        };
        self.window_start = now;
        self.window_bytes = 0;
        Some(BandwidthReport {
            mbps,
            total: self.total,
        })
    }
}

/// Output format of stats reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StatsFormat {
    /// `key: value` lines
    #[default]
    TwoColumns,
    /// Header once, then one row per report
    Csv,
    /// One JSON object per line
    Json,
}

impl FromStr for StatsFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "2cols" | "default" | "vertical" => Ok(Self::TwoColumns),
            "csv" | "horizontal" => Ok(Self::Csv),
            "json" => Ok(Self::Json),
            other => Err(format!("unsupported stats format '{other}'")),
        }
    }
}

/// Per-endpoint statistics included with `--fullstats`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EndpointStats {
    /// Current source, zeroed when there is none
    pub source: TransportStats,
    /// Current target, zeroed when there is none
    pub target: TransportStats,
}

/// One stats report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Milliseconds since the relay started
    pub elapsed_ms: u64,
    /// Byte counters
    #[serde(flatten)]
    pub counters: ByteCounters,
    /// Endpoint statistics, when requested
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoints: Option<EndpointStats>,
}

impl StatsSnapshot {
    fn fields(&self) -> Vec<(String, u64)> {
        let mut fields = vec![
            ("elapsed_ms".to_string(), self.elapsed_ms),
            ("received".to_string(), self.counters.received),
            ("written".to_string(), self.counters.written),
            ("lost".to_string(), self.counters.lost),
        ];
        if let Some(endpoints) = &self.endpoints {
            for (side, stats) in [("source", &endpoints.source), ("target", &endpoints.target)] {
                fields.extend([
                    (format!("{side}.bytes_sent"), stats.bytes_sent),
                    (format!("{side}.bytes_received"), stats.bytes_received),
                    (format!("{side}.packets_sent"), stats.packets_sent),
                    (format!("{side}.packets_received"), stats.packets_received),
                    (format!("{side}.send_errors"), stats.send_errors),
                    (format!("{side}.recv_errors"), stats.recv_errors),
                ]);
            }
        }
        fields
    }
}

/// Writes stats snapshots to a stream.
pub struct StatsWriter {
    out: Box<dyn Write + Send>,
    format: StatsFormat,
    header_written: bool,
}

impl StatsWriter {
    /// Writer emitting `format` to `out`.
    #[must_use]
    pub fn new(out: Box<dyn Write + Send>, format: StatsFormat) -> Self {
        Self {
            out,
            format,
            header_written: false,
        }
    }

    /// Write one snapshot and flush.
    ///
    /// # Errors
    ///
    /// Returns the I/O error of the underlying stream.
    pub fn write(&mut self, snapshot: &StatsSnapshot) -> io::Result<()> {
        match self.format {
            StatsFormat::TwoColumns => {
                for (key, value) in snapshot.fields() {
                    writeln!(self.out, "{key:>24}: {value}")?;
                }
                writeln!(self.out)?;
            }
            StatsFormat::Csv => {
                let fields = snapshot.fields();
                if !self.header_written {
                    let header: Vec<&str> = fields.iter().map(|(k, _)| k.as_str()).collect();
                    writeln!(self.out, "{}", header.join(","))?;
                    self.header_written = true;
                }
                let row: Vec<String> = fields.iter().map(|(_, v)| v.to_string()).collect();
                writeln!(self.out, "{}", row.join(","))?;
            }
            StatsFormat::Json => {
                serde_json::to_writer(&mut self.out, snapshot).map_err(io::Error::other)?;
                writeln!(self.out)?;
            }
        }
        self.out.flush()
    }
}

/// Format bytes in human-readable form
///
/// # Example
///
/// ```
/// use mediarelay_core::stats::format_bytes;
///
/// assert_eq!(format_bytes(1024), "1.00 KB");
/// assert_eq!(format_bytes(1024 * 1024), "1.00 MB");
/// ```
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    format!("{size:.2} {}", UNITS[unit_idx])
}
