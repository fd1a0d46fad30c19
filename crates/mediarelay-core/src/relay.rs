//! The relay loop.
//!
//! One thread owns the poller, both endpoints and the look-ahead queue. Every
//! iteration:
//!
//! 1. stops on cancellation or an expired watchdog
//! 2. creates a missing source or target
//! 3. waits for readiness
//! 4. runs each ready reliable handle through its connection tracker
//! 5. drains up to `buffering` packets from the source
//! 6. forwards them to the target in order, counting failures as lost
//! 7. emits whatever reports are due

use crate::cancel::CancellationToken;
use crate::config::RelayConfig;
use crate::error::{RelayError, RelayResult};
use crate::state::{ConnectionTracker, Transition};
use crate::stats::{
    BandwidthMeter, ByteCounters, EndpointStats, LossReporter, StatsSnapshot, StatsWriter, Ticker,
};
use crate::watchdog::Watchdog;
use mediarelay_transport::{
    EndpointFactory, EndpointKind, Handle, Interest, MediaPacket, Multiplexer, Poller,
    ReadOutcome, Readiness, Role, Source, Target,
};
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::time::Instant;
use tracing::{debug, info, trace, warn};

/// Why the loop stopped without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The cancellation token was set
    Interrupted,
    /// The watchdog deadline passed
    WatchdogExpired,
    /// A connection was lost with auto-reconnect disabled
    Disconnected(Role),
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interrupted => f.write_str("interrupted"),
            Self::WatchdogExpired => f.write_str("timeout expired"),
            Self::Disconnected(role) => write!(f, "{role} disconnected"),
        }
    }
}

/// Packet counts for one iteration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Packets read from the source
    pub drained: usize,
    /// Packets accepted by the target
    pub written: usize,
    /// Packets dropped
    pub lost: usize,
}

/// Result of one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Keep going
    Continue(CycleReport),
    /// Stop cleanly
    Stop(StopReason),
}

struct StatsReport {
    ticker: Ticker,
    writer: StatsWriter,
}

/// Relay engine.
pub struct Relay<P: Poller = Multiplexer> {
    config: RelayConfig,
    factory: Box<dyn EndpointFactory>,
    poller: P,
    cancel: CancellationToken,

    source: Option<Box<dyn Source>>,
    target: Option<Box<dyn Target>>,
    source_handles: Vec<Handle>,
    target_handles: Vec<Handle>,
    source_tracker: ConnectionTracker,
    target_tracker: ConnectionTracker,
    source_retry_at: Option<Instant>,
    target_retry_at: Option<Instant>,

    watchdog: Watchdog,
    counters: ByteCounters,
    loss: LossReporter,
    bandwidth: Option<BandwidthMeter>,
    stats: Option<StatsReport>,
    started: Instant,
}

impl Relay<Multiplexer> {
    /// Relay on the OS multiplexer.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::InvalidConfig`] for a bad configuration, or
    /// [`RelayError::Wait`] if the poll instance cannot be created.
    pub fn new(
        config: RelayConfig,
        factory: Box<dyn EndpointFactory>,
        cancel: CancellationToken,
    ) -> RelayResult<Self> {
        let poller = Multiplexer::new().map_err(RelayError::Wait)?;
        Self::with_poller(config, factory, poller, cancel)
    }
}

impl<P: Poller> Relay<P> {
    /// Relay on a caller-provided poller.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::InvalidConfig`] for a bad configuration.
    pub fn with_poller(
        config: RelayConfig,
        factory: Box<dyn EndpointFactory>,
        poller: P,
        cancel: CancellationToken,
    ) -> RelayResult<Self> {
        config.validate()?;

        let now = Instant::now();
        let watchdog = Watchdog::new(config.timeout, config.timeout_mode, config.quiet, now);
        let bandwidth = config
            .bandwidth_report
            .map(|every| BandwidthMeter::new(every, now));
        let stats = config.stats_report.map(|every| StatsReport {
            ticker: Ticker::new(every, now),
            writer: StatsWriter::new(Box::new(io::stdout()), config.stats_format),
        });

        Ok(Self {
            loss: LossReporter::new(config.loss_report_interval, now),
            config,
            factory,
            poller,
            cancel,
            source: None,
            target: None,
            source_handles: Vec::new(),
            target_handles: Vec::new(),
            source_tracker: ConnectionTracker::new(Role::Source),
            target_tracker: ConnectionTracker::new(Role::Target),
            source_retry_at: None,
            target_retry_at: None,
            watchdog,
            counters: ByteCounters::default(),
            bandwidth,
            stats,
            started: now,
        })
    }

    /// Send stats reports to `writer` instead of stdout. Has no effect
    /// unless a stats interval is configured.
    #[must_use]
    pub fn with_stats_writer(mut self, writer: StatsWriter) -> Self {
        if let Some(stats) = self.stats.as_mut() {
            stats.writer = writer;
        }
        self
    }

    /// Byte counters of the current epochs
    #[must_use]
    pub fn counters(&self) -> ByteCounters {
        self.counters
    }

    /// The poller
    #[must_use]
    pub fn poller(&self) -> &P {
        &self.poller
    }

    /// Whether a source endpoint currently exists
    #[must_use]
    pub fn has_source(&self) -> bool {
        self.source.is_some()
    }

    /// Whether a target endpoint currently exists
    #[must_use]
    pub fn has_target(&self) -> bool {
        self.target.is_some()
    }

    /// Whether the watchdog deadline is pending
    #[must_use]
    pub fn watchdog_armed(&self) -> bool {
        self.watchdog.is_armed()
    }

    /// Run until a clean stop or a fatal error. Endpoints are deregistered
    /// and closed either way.
    ///
    /// # Errors
    ///
    /// Returns the fatal [`RelayError`] that ended the loop.
    pub fn run(&mut self) -> RelayResult<StopReason> {
        let result = loop {
            match self.step() {
                Ok(StepOutcome::Continue(_)) => {}
                Ok(StepOutcome::Stop(reason)) => break Ok(reason),
                Err(e) => break Err(e),
            }
        };
        self.shutdown();
        result
    }

    /// One loop iteration.
    ///
    /// # Errors
    ///
    /// Returns a fatal [`RelayError`]; the relay must not be stepped again.
    pub fn step(&mut self) -> RelayResult<StepOutcome> {
        let now = Instant::now();
        if self.cancel.is_cancelled() {
            info!("Interrupted, stopping");
            return Ok(StepOutcome::Stop(StopReason::Interrupted));
        }
        if self.watchdog.expired(now) {
            info!("TIMEOUT: expired, stopping");
            return Ok(StepOutcome::Stop(StopReason::WatchdogExpired));
        }

        self.ensure_source(now)?;
        self.ensure_target(now)?;

        let readiness = self
            .poller
            .wait(self.config.poll_timeout)
            .map_err(RelayError::Wait)?;

        for handle in readiness.reliable_handles() {
            if let Some(reason) = self.dispatch(handle)? {
                return Ok(StepOutcome::Stop(reason));
            }
        }

        let mut report = CycleReport::default();
        let queue = self.drain(&readiness, &mut report)?;
        self.forward(queue, &mut report);
        self.report(Instant::now());

        trace!(
            "cycle: {} drained, {} written, {} lost",
            report.drained, report.written, report.lost
        );
        Ok(StepOutcome::Continue(report))
    }

    fn ensure_source(&mut self, now: Instant) -> RelayResult<()> {
        if self.source.is_some() || self.source_retry_at.is_some_and(|at| now < at) {
            return Ok(());
        }
        self.source_retry_at = None;

        let uri = &self.config.source;
        let source = self
            .factory
            .create_source(uri)
            .map_err(|e| RelayError::from_create(Role::Source, uri, e))?;

        let handles = source.handles();
        for handle in &handles {
            self.poller
                .register(*handle, Interest::READ | Interest::ERROR)
                .map_err(|source| RelayError::Poll {
                    role: Role::Source,
                    source,
                })?;
        }

        let kind = source.kind();
        debug!("created {} source for '{}'", kind, uri);
        self.counters.reset_source_epoch();
        // native endpoints carry data at once but never cancel the watchdog
        if !kind.is_reliable() {
            self.source_tracker.mark_connected();
        }
        self.source = Some(source);
        self.source_handles = handles;
        Ok(())
    }

    fn ensure_target(&mut self, now: Instant) -> RelayResult<()> {
        if self.target.is_some() || self.target_retry_at.is_some_and(|at| now < at) {
            return Ok(());
        }
        self.target_retry_at = None;

        let uri = &self.config.target;
        let target = self
            .factory
            .create_target(uri)
            .map_err(|e| RelayError::from_create(Role::Target, uri, e))?;

        // Only reliable targets are watched, and only for state changes.
        let kind = target.kind();
        let handles: Vec<Handle> = if kind.is_reliable() {
            target.handles()
        } else {
            Vec::new()
        };
        for handle in &handles {
            self.poller
                .register(*handle, Interest::all())
                .map_err(|source| RelayError::Poll {
                    role: Role::Target,
                    source,
                })?;
        }

        debug!("created {} target for '{}'", kind, uri);
        self.counters.reset_target_epoch();
        // native endpoints carry data at once but never cancel the watchdog
        if !kind.is_reliable() {
            self.target_tracker.mark_connected();
        }
        self.target = Some(target);
        self.target_handles = handles;
        Ok(())
    }

    fn role_of(&self, handle: Handle) -> Option<Role> {
        if self.source_handles.contains(&handle) {
            Some(Role::Source)
        } else if self.target_handles.contains(&handle) {
            Some(Role::Target)
        } else {
            None
        }
    }

    fn kind_of(&self, role: Role) -> Option<EndpointKind> {
        match role {
            Role::Source => self.source.as_ref().map(|s| s.kind()),
            Role::Target => self.target.as_ref().map(|t| t.kind()),
        }
    }

    fn dispatch(&mut self, handle: Handle) -> RelayResult<Option<StopReason>> {
        let Some(role) = self.role_of(handle) else {
            return Ok(None);
        };
        let status = match role {
            Role::Source => self.source.as_mut().map(|s| s.status()),
            Role::Target => self.target.as_mut().map(|t| t.status()),
        };
        let Some(status) = status else {
            return Ok(None);
        };
        let kind = self.kind_of(role).unwrap_or(EndpointKind::Reliable);

        let transition = match role {
            Role::Source => self.source_tracker.observe(status),
            Role::Target => self.target_tracker.observe(status),
        };

        match transition {
            Transition::Accept => self.accept(role, kind)?,
            Transition::Lost { was_connected } => {
                if was_connected && !self.config.quiet {
                    info!("{} {} disconnected", kind, role);
                }
                if !self.config.auto_reconnect {
                    return Ok(Some(StopReason::Disconnected(role)));
                }
                self.reset_endpoint(role, Instant::now());
            }
            Transition::Connected => {
                if !self.config.quiet {
                    info!("{} {} connected", kind, role);
                }
                if role == Role::Target && kind.is_reliable() {
                    for handle in &self.target_handles {
                        self.poller
                            .update(*handle, Interest::READ | Interest::ERROR)
                            .map_err(|source| RelayError::Poll {
                                role: Role::Target,
                                source,
                            })?;
                    }
                }
                self.watchdog.on_connected(role);
            }
            Transition::Idle => {}
        }
        Ok(None)
    }

    fn accept(&mut self, role: Role, kind: EndpointKind) -> RelayResult<()> {
        // the endpoint closes its listener on accept
        let old = match role {
            Role::Source => std::mem::take(&mut self.source_handles),
            Role::Target => std::mem::take(&mut self.target_handles),
        };
        for handle in old {
            if let Err(e) = self.poller.deregister(handle) {
                debug!("deregistering listener {}: {}", handle, e);
            }
        }

        let accepted = match role {
            Role::Source => self.source.as_mut().map(|s| s.accept_new_client()),
            Role::Target => self.target.as_mut().map(|t| t.accept_new_client()),
        };
        if let Some(Err(source)) = accepted {
            return Err(RelayError::Accept { role, source });
        }

        let new = match role {
            Role::Source => self.source.as_ref().map(|s| s.handles()),
            Role::Target => self.target.as_ref().map(|t| t.handles()),
        }
        .unwrap_or_default();
        for handle in &new {
            self.poller
                .register(*handle, Interest::READ | Interest::ERROR)
                .map_err(|source| RelayError::Poll { role, source })?;
        }

        match role {
            Role::Source => {
                self.source_handles = new;
                self.source_tracker.mark_connected();
            }
            Role::Target => {
                self.target_handles = new;
                self.target_tracker.mark_connected();
            }
        }
        if !self.config.quiet {
            info!("Accepted {} {} connection", kind, role);
        }
        self.watchdog.on_connected(role);
        Ok(())
    }

    fn deregister_all(&mut self, handles: Vec<Handle>) {
        for handle in handles {
            if let Err(e) = self.poller.deregister(handle) {
                debug!("deregistering {}: {}", handle, e);
            }
        }
    }

    fn reset_endpoint(&mut self, role: Role, now: Instant) {
        let retry_at = (!self.config.reconnect_delay.is_zero())
            .then(|| now + self.config.reconnect_delay);

        match role {
            Role::Source => {
                let handles = std::mem::take(&mut self.source_handles);
                self.deregister_all(handles);
                self.source = None;
                self.source_tracker.reset();
                self.source_retry_at = retry_at;
            }
            Role::Target => {
                let handles = std::mem::take(&mut self.target_handles);
                self.deregister_all(handles);
                self.target = None;
                self.target_tracker.reset();
                self.target_retry_at = retry_at;
            }
        }
        debug!("{} reset, will be re-created", role);
        self.watchdog.on_lost(role, now);
    }

    fn drain(
        &mut self,
        readiness: &Readiness,
        report: &mut CycleReport,
    ) -> RelayResult<VecDeque<MediaPacket>> {
        let mut queue = VecDeque::with_capacity(self.config.buffering);

        let Some(source) = self.source.as_mut() else {
            return Ok(queue);
        };
        if !source.is_open() || !self.source_handles.iter().any(|h| readiness.is_readable(*h)) {
            return Ok(queue);
        }

        let mut end_of_stream = false;
        while queue.len() < self.config.buffering {
            match source.read(self.config.chunk_size).map_err(RelayError::Read)? {
                ReadOutcome::Data(packet) if packet.is_empty() => break,
                ReadOutcome::Data(packet) => {
                    let len = packet.len() as u64;
                    self.counters.received += len;
                    if let Some(meter) = self.bandwidth.as_mut() {
                        meter.record(len);
                    }
                    queue.push_back(packet);
                }
                ReadOutcome::WouldBlock => break,
                ReadOutcome::EndOfStream => {
                    end_of_stream = true;
                    break;
                }
            }
        }
        report.drained = queue.len();

        let keep_polling = if end_of_stream {
            source.is_open() || source.kind().is_reliable()
        } else {
            queue.len() == self.config.buffering
        };

        if keep_polling {
            for handle in &self.source_handles {
                self.poller.mark_pending(*handle);
            }
        } else if end_of_stream {
            debug!("{} source reached end of stream", source.kind());
            let handles = std::mem::take(&mut self.source_handles);
            self.deregister_all(handles);
        }

        Ok(queue)
    }

    fn forward(&mut self, queue: VecDeque<MediaPacket>, report: &mut CycleReport) {
        for packet in queue {
            let len = packet.len() as u64;
            let time = if self.config.source_time {
                packet.time
            } else {
                None
            };

            let delivered = match self.target.as_mut() {
                Some(target) if target.is_open() => match target.write(&packet.payload, time) {
                    Ok(()) => true,
                    Err(e) => {
                        trace!("write of {} bytes failed: {}", len, e);
                        false
                    }
                },
                _ => false,
            };

            if delivered {
                self.counters.written += len;
                report.written += 1;
            } else {
                self.counters.lost += len;
                report.lost += 1;
            }
        }
    }

    fn report(&mut self, now: Instant) {
        if !self.config.quiet {
            if let Some(loss) = self.loss.poll(&mut self.counters, now) {
                warn!("{}", loss);
            }
        }

        if let Some(bandwidth) = self.bandwidth.as_mut().and_then(|meter| meter.poll(now)) {
            info!("{}", bandwidth);
        }

        let due = self.stats.as_mut().is_some_and(|stats| stats.ticker.due(now));
        if due {
            let snapshot = self.snapshot(now);
            if let Some(stats) = self.stats.as_mut() {
                if let Err(e) = stats.writer.write(&snapshot) {
                    warn!("cannot write stats: {}", e);
                }
            }
        }
    }

    fn snapshot(&self, now: Instant) -> StatsSnapshot {
        let endpoints = self.config.full_stats.then(|| EndpointStats {
            source: self.source.as_ref().map(|s| s.stats()).unwrap_or_default(),
            target: self.target.as_ref().map(|t| t.stats()).unwrap_or_default(),
        });
        StatsSnapshot {
            elapsed_ms: u64::try_from(now.saturating_duration_since(self.started).as_millis())
                .unwrap_or(u64::MAX),
            counters: self.counters,
            endpoints,
        }
    }

    fn shutdown(&mut self) {
        let handles = std::mem::take(&mut self.source_handles);
        self.deregister_all(handles);
        let handles = std::mem::take(&mut self.target_handles);
        self.deregister_all(handles);
        self.source = None;
        self.target = None;
    }
}
