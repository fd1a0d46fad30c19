//! Scripted relay fixtures
//!
//! Endpoints here follow a script instead of touching the network:
//! - [`SourceScript`] and [`TargetScript`] describe one endpoint instance
//! - [`MockFactory`] hands out one script per creation and records activity
//!   in a shared [`Journal`]
//! - [`LevelPoller`] reports every registered handle as ready on each wait
//!
//! # Example
//!
//! ```no_run
//! use mediarelay_integration_tests::fixtures::{self, MockFactory, SourceScript, TargetScript};
//!
//! let factory = MockFactory::new()
//!     .source(SourceScript::native(3).packets(10, 1316))
//!     .target(TargetScript::native(4));
//! let journal = factory.journal();
//! let mut relay = fixtures::relay(fixtures::config(4), factory);
//! let reports = fixtures::step_n(&mut relay, 3);
//! assert_eq!(journal.lock().unwrap().written.len(), 10);
//! # let _ = reports;
//! ```

use mediarelay_core::{CancellationToken, CycleReport, Relay, RelayConfig, StepOutcome};
use mediarelay_transport::{
    ConnectionStatus, Endpoint, EndpointError, EndpointFactory, EndpointKind, EndpointResult,
    Handle, HandleKind, Interest, MediaPacket, Poller, ReadOutcome, Readiness, Source, Target,
    TransportStats,
};
use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One scripted read result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadStep {
    /// A packet with an optional source timestamp
    Data(Vec<u8>, Option<u64>),
    /// Nothing available
    WouldBlock,
    /// The stream ended
    EndOfStream,
    /// The read fails with an I/O error
    Fail,
}

/// Everything the scripted endpoints and factory did.
#[derive(Debug, Default)]
pub struct Journal {
    /// Source creations that succeeded
    pub sources_created: usize,
    /// Target creations that succeeded
    pub targets_created: usize,
    /// Source instances dropped
    pub sources_dropped: usize,
    /// Target instances dropped
    pub targets_dropped: usize,
    /// Packets accepted by any target, in order
    pub written: Vec<MediaPacket>,
    /// Writes a target refused
    pub rejected: usize,
}

/// Journal shared between a factory, its endpoints and the test
pub type SharedJournal = Arc<Mutex<Journal>>;

fn scripted_error(kind: io::ErrorKind, msg: &str) -> EndpointError {
    EndpointError::Io(io::Error::new(kind, msg.to_string()))
}

/// Script for one source instance.
#[derive(Debug, Clone)]
pub struct SourceScript {
    kind: EndpointKind,
    handle: Handle,
    accepted: Option<Handle>,
    initial: ConnectionStatus,
    statuses: VecDeque<ConnectionStatus>,
    reads: VecDeque<ReadStep>,
}

impl SourceScript {
    /// UDP-like source, connected from the start
    #[must_use]
    pub fn native(raw: RawFd) -> Self {
        Self {
            kind: EndpointKind::Udp,
            handle: Handle::native(raw),
            accepted: None,
            initial: ConnectionStatus::Connected,
            statuses: VecDeque::new(),
            reads: VecDeque::new(),
        }
    }

    /// Reliable caller, connecting until a scripted status says otherwise
    #[must_use]
    pub fn reliable(raw: RawFd) -> Self {
        Self {
            kind: EndpointKind::Reliable,
            handle: Handle::reliable(raw),
            initial: ConnectionStatus::Connecting,
            ..Self::native(raw)
        }
    }

    /// Reliable listener that swaps to `accepted` once a peer is accepted
    #[must_use]
    pub fn listening(raw: RawFd, accepted: RawFd) -> Self {
        Self {
            accepted: Some(Handle::reliable(accepted)),
            initial: ConnectionStatus::Listening,
            ..Self::reliable(raw)
        }
    }

    /// Statuses returned by successive `status` calls; the last one sticks.
    #[must_use]
    pub fn statuses(mut self, statuses: impl IntoIterator<Item = ConnectionStatus>) -> Self {
        self.statuses.extend(statuses);
        self
    }

    /// Read results in order; an exhausted script would block.
    #[must_use]
    pub fn reads(mut self, reads: impl IntoIterator<Item = ReadStep>) -> Self {
        self.reads.extend(reads);
        self
    }

    /// `count` packets of `len` bytes, packet `i` filled with byte `i`.
    #[must_use]
    pub fn packets(self, count: usize, len: usize) -> Self {
        self.reads((0..count).map(|i| ReadStep::Data(vec![i as u8; len], None)))
    }
}

/// Script for one target instance.
#[derive(Debug, Clone)]
pub struct TargetScript {
    kind: EndpointKind,
    handle: Handle,
    initial: ConnectionStatus,
    statuses: VecDeque<ConnectionStatus>,
    rejects: usize,
}

impl TargetScript {
    /// UDP-like target, connected from the start
    #[must_use]
    pub fn native(raw: RawFd) -> Self {
        Self {
            kind: EndpointKind::Udp,
            handle: Handle::native(raw),
            initial: ConnectionStatus::Connected,
            statuses: VecDeque::new(),
            rejects: 0,
        }
    }

    /// Reliable caller, connecting until a scripted status says otherwise
    #[must_use]
    pub fn reliable(raw: RawFd) -> Self {
        Self {
            kind: EndpointKind::Reliable,
            handle: Handle::reliable(raw),
            initial: ConnectionStatus::Connecting,
            ..Self::native(raw)
        }
    }

    /// Statuses returned by successive `status` calls; the last one sticks.
    #[must_use]
    pub fn statuses(mut self, statuses: impl IntoIterator<Item = ConnectionStatus>) -> Self {
        self.statuses.extend(statuses);
        self
    }

    /// Refuse the first `count` writes.
    #[must_use]
    pub fn rejects(mut self, count: usize) -> Self {
        self.rejects = count;
        self
    }
}

struct MockSource {
    script: SourceScript,
    current: ConnectionStatus,
    journal: SharedJournal,
}

impl Drop for MockSource {
    fn drop(&mut self) {
        if let Ok(mut journal) = self.journal.lock() {
            journal.sources_dropped += 1;
        }
    }
}

impl Endpoint for MockSource {
    fn kind(&self) -> EndpointKind {
        self.script.kind
    }

    fn is_open(&self) -> bool {
        self.current == ConnectionStatus::Connected
    }

    fn status(&mut self) -> ConnectionStatus {
        if let Some(next) = self.script.statuses.pop_front() {
            self.current = next;
        }
        self.current
    }

    fn handles(&self) -> Vec<Handle> {
        vec![self.script.handle]
    }

    fn is_listening(&self) -> bool {
        self.current == ConnectionStatus::Listening
    }

    fn accept_new_client(&mut self) -> EndpointResult<()> {
        let accepted = self.script.accepted.take().ok_or(EndpointError::NotListening)?;
        self.script.handle = accepted;
        self.current = ConnectionStatus::Connected;
        Ok(())
    }

    fn stats(&self) -> TransportStats {
        TransportStats::new()
    }
}

impl Source for MockSource {
    fn read(&mut self, max_chunk: usize) -> EndpointResult<ReadOutcome> {
        match self.script.reads.pop_front() {
            None | Some(ReadStep::WouldBlock) => Ok(ReadOutcome::WouldBlock),
            Some(ReadStep::Data(mut payload, time)) => {
                payload.truncate(max_chunk);
                Ok(ReadOutcome::Data(MediaPacket::new(payload, time)))
            }
            Some(ReadStep::EndOfStream) => {
                self.current = ConnectionStatus::Closed;
                Ok(ReadOutcome::EndOfStream)
            }
            Some(ReadStep::Fail) => Err(scripted_error(
                io::ErrorKind::ConnectionRefused,
                "scripted read failure",
            )),
        }
    }
}

struct MockTarget {
    script: TargetScript,
    current: ConnectionStatus,
    journal: SharedJournal,
}

impl Drop for MockTarget {
    fn drop(&mut self) {
        if let Ok(mut journal) = self.journal.lock() {
            journal.targets_dropped += 1;
        }
    }
}

impl Endpoint for MockTarget {
    fn kind(&self) -> EndpointKind {
        self.script.kind
    }

    fn is_open(&self) -> bool {
        self.current == ConnectionStatus::Connected
    }

    fn status(&mut self) -> ConnectionStatus {
        if let Some(next) = self.script.statuses.pop_front() {
            self.current = next;
        }
        self.current
    }

    fn handles(&self) -> Vec<Handle> {
        vec![self.script.handle]
    }

    fn stats(&self) -> TransportStats {
        TransportStats::new()
    }
}

impl Target for MockTarget {
    fn write(&mut self, payload: &[u8], time: Option<u64>) -> EndpointResult<()> {
        if !self.is_open() {
            return Err(EndpointError::NotConnected);
        }
        let mut journal = self
            .journal
            .lock()
            .map_err(|_| scripted_error(io::ErrorKind::Other, "journal poisoned"))?;
        if self.script.rejects > 0 {
            self.script.rejects -= 1;
            journal.rejected += 1;
            return Err(scripted_error(io::ErrorKind::WouldBlock, "scripted write refusal"));
        }
        journal.written.push(MediaPacket::new(payload.to_vec(), time));
        Ok(())
    }
}

/// Script entry for one creation: an endpoint, or the error creating it gives
type Scripted<S> = Result<S, fn() -> EndpointError>;

#[derive(Default)]
struct Scripts {
    sources: VecDeque<Scripted<SourceScript>>,
    targets: VecDeque<Scripted<TargetScript>>,
    last_source: Option<SourceScript>,
    last_target: Option<TargetScript>,
}

fn next_script<S: Clone>(queue: &mut VecDeque<Scripted<S>>, last: &mut Option<S>) -> EndpointResult<S> {
    match queue.pop_front() {
        Some(Ok(script)) => {
            *last = Some(script.clone());
            Ok(script)
        }
        Some(Err(make_error)) => Err(make_error()),
        None => last
            .clone()
            .ok_or_else(|| scripted_error(io::ErrorKind::NotFound, "no endpoint scripted")),
    }
}

/// Factory handing out scripted endpoints in order. Once a queue runs dry the
/// last successful script of that role is repeated.
#[derive(Default)]
pub struct MockFactory {
    scripts: Mutex<Scripts>,
    journal: SharedJournal,
}

impl MockFactory {
    /// Factory with nothing scripted
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a source instance
    #[must_use]
    pub fn source(self, script: SourceScript) -> Self {
        self.push(|scripts| scripts.sources.push_back(Ok(script)))
    }

    /// Queue a failing source creation
    #[must_use]
    pub fn source_error(self, make_error: fn() -> EndpointError) -> Self {
        self.push(|scripts| scripts.sources.push_back(Err(make_error)))
    }

    /// Queue a target instance
    #[must_use]
    pub fn target(self, script: TargetScript) -> Self {
        self.push(|scripts| scripts.targets.push_back(Ok(script)))
    }

    /// Queue a failing target creation
    #[must_use]
    pub fn target_error(self, make_error: fn() -> EndpointError) -> Self {
        self.push(|scripts| scripts.targets.push_back(Err(make_error)))
    }

    /// Journal shared with every endpoint this factory creates
    #[must_use]
    pub fn journal(&self) -> SharedJournal {
        Arc::clone(&self.journal)
    }

    fn push(self, add: impl FnOnce(&mut Scripts)) -> Self {
        if let Ok(mut scripts) = self.scripts.lock() {
            add(&mut scripts);
        }
        self
    }

    fn lock_scripts(&self) -> EndpointResult<std::sync::MutexGuard<'_, Scripts>> {
        self.scripts
            .lock()
            .map_err(|_| scripted_error(io::ErrorKind::Other, "scripts poisoned"))
    }
}

impl EndpointFactory for MockFactory {
    fn create_source(&self, _uri: &str) -> EndpointResult<Box<dyn Source>> {
        let script = {
            let mut scripts = self.lock_scripts()?;
            let Scripts {
                sources,
                last_source,
                ..
            } = &mut *scripts;
            next_script(sources, last_source)?
        };
        if let Ok(mut journal) = self.journal.lock() {
            journal.sources_created += 1;
        }
        Ok(Box::new(MockSource {
            current: script.initial,
            script,
            journal: self.journal(),
        }))
    }

    fn create_target(&self, _uri: &str) -> EndpointResult<Box<dyn Target>> {
        let script = {
            let mut scripts = self.lock_scripts()?;
            let Scripts {
                targets,
                last_target,
                ..
            } = &mut *scripts;
            next_script(targets, last_target)?
        };
        if let Ok(mut journal) = self.journal.lock() {
            journal.targets_created += 1;
        }
        Ok(Box::new(MockTarget {
            current: script.initial,
            script,
            journal: self.journal(),
        }))
    }
}

/// A call the relay made on the poller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollCall {
    /// `register`
    Register(Handle, Interest),
    /// `update`
    Update(Handle, Interest),
    /// `deregister`
    Deregister(Handle),
}

/// Poller that reports every registered handle as ready on every wait and
/// never blocks. Reliable handles are readable when registered for
/// [`Interest::READ`] and writable when registered for [`Interest::WRITE`].
#[derive(Debug, Default)]
pub struct LevelPoller {
    registered: BTreeMap<Handle, Interest>,
    calls: Vec<PollCall>,
    pending: Vec<Handle>,
    waits: usize,
}

impl LevelPoller {
    /// Empty poller
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every registration change, in order
    #[must_use]
    pub fn calls(&self) -> &[PollCall] {
        &self.calls
    }

    /// Interest `handle` is registered with
    #[must_use]
    pub fn interest(&self, handle: Handle) -> Option<Interest> {
        self.registered.get(&handle).copied()
    }

    /// Registered handles in order
    #[must_use]
    pub fn registered(&self) -> Vec<Handle> {
        self.registered.keys().copied().collect()
    }

    /// Handles marked pending since the last wait
    #[must_use]
    pub fn pending(&self) -> &[Handle] {
        &self.pending
    }

    /// Number of waits so far
    #[must_use]
    pub fn waits(&self) -> usize {
        self.waits
    }

    fn unknown(handle: Handle) -> io::Error {
        io::Error::new(io::ErrorKind::NotFound, format!("{handle} is not registered"))
    }
}

impl Poller for LevelPoller {
    fn register(&mut self, handle: Handle, interest: Interest) -> io::Result<()> {
        if self.registered.contains_key(&handle) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{handle} is already registered"),
            ));
        }
        self.registered.insert(handle, interest);
        self.calls.push(PollCall::Register(handle, interest));
        Ok(())
    }

    fn update(&mut self, handle: Handle, interest: Interest) -> io::Result<()> {
        let slot = self
            .registered
            .get_mut(&handle)
            .ok_or_else(|| Self::unknown(handle))?;
        *slot = interest;
        self.calls.push(PollCall::Update(handle, interest));
        Ok(())
    }

    fn deregister(&mut self, handle: Handle) -> io::Result<()> {
        self.registered
            .remove(&handle)
            .ok_or_else(|| Self::unknown(handle))?;
        self.calls.push(PollCall::Deregister(handle));
        Ok(())
    }

    fn mark_pending(&mut self, handle: Handle) {
        self.pending.push(handle);
    }

    fn wait(&mut self, _timeout: Duration) -> io::Result<Readiness> {
        self.waits += 1;
        self.pending.clear();

        let mut readiness = Readiness::default();
        for (&handle, &interest) in &self.registered {
            match handle.kind {
                HandleKind::Native => {
                    readiness.readable_native.insert(handle);
                }
                HandleKind::Reliable => {
                    if interest.contains(Interest::READ) {
                        readiness.readable_reliable.insert(handle);
                    }
                    if interest.contains(Interest::WRITE) {
                        readiness.writable_reliable.insert(handle);
                    }
                }
            }
        }
        Ok(readiness)
    }
}

/// Relay configuration for scripted endpoints with the given buffering.
#[must_use]
pub fn config(buffering: usize) -> RelayConfig {
    let mut config = RelayConfig::new("mock://source", "mock://target", 1316);
    config.buffering = buffering;
    config.poll_timeout = Duration::from_millis(1);
    config
}

/// Relay over `factory` on a [`LevelPoller`].
///
/// # Panics
///
/// Panics if `config` is rejected.
#[must_use]
pub fn relay(config: RelayConfig, factory: MockFactory) -> Relay<LevelPoller> {
    relay_with_cancel(config, factory, CancellationToken::new())
}

/// Like [`relay`], stopping when `cancel` is set.
///
/// # Panics
///
/// Panics if `config` is rejected.
#[must_use]
pub fn relay_with_cancel(
    config: RelayConfig,
    factory: MockFactory,
    cancel: CancellationToken,
) -> Relay<LevelPoller> {
    Relay::with_poller(config, Box::new(factory), LevelPoller::new(), cancel)
        .expect("relay configuration rejected")
}

/// Run `n` iterations and collect their reports.
///
/// # Panics
///
/// Panics if an iteration fails or stops the relay.
pub fn step_n(relay: &mut Relay<LevelPoller>, n: usize) -> Vec<CycleReport> {
    (0..n)
        .map(|i| match relay.step() {
            Ok(StepOutcome::Continue(report)) => report,
            Ok(StepOutcome::Stop(reason)) => panic!("iteration {i} stopped: {reason}"),
            Err(e) => panic!("iteration {i} failed: {e}"),
        })
        .collect()
}
