//! Readiness multiplexing over both handle namespaces.
//!
//! The relay waits on reliable-transport sockets and plain descriptors at
//! the same time. Each namespace keeps its own registration table; both feed
//! one `mio::Poll`, whose token carries the namespace in its low bit and the
//! raw descriptor in the remaining bits.
//!
//! `mio` reports edges while the relay wants levels: a handle the relay
//! stopped draining early is marked pending and reported again on the next
//! wait, which then does not block. Descriptors epoll refuses (regular files)
//! are treated as always readable while registered.

use crate::endpoint::{Handle, HandleKind};
use bitflags::bitflags;
use mio::unix::SourceFd;
use mio::{Events, Poll, Token};
use std::collections::{BTreeSet, HashMap};
use std::io;
use std::os::fd::RawFd;
use std::time::Duration;
use tracing::{debug, trace};

const EVENT_CAPACITY: usize = 16;

bitflags! {
    /// Events a handle is registered for.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Interest: u8 {
        /// Readable, or for a listener: a peer is waiting
        const READ = 0b001;
        /// Writable, or for a caller: the connection completed
        const WRITE = 0b010;
        /// Error conditions
        const ERROR = 0b100;
    }
}

/// Handles reported by one wait, de-duplicated per category.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Readiness {
    /// Reliable handles ready to read (or accept)
    pub readable_reliable: BTreeSet<Handle>,
    /// Reliable handles ready to write
    pub writable_reliable: BTreeSet<Handle>,
    /// Reliable handles in an error state
    pub erred_reliable: BTreeSet<Handle>,
    /// Native handles ready to read
    pub readable_native: BTreeSet<Handle>,
}

impl Readiness {
    /// True when nothing was reported
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.readable_reliable.is_empty()
            && self.writable_reliable.is_empty()
            && self.erred_reliable.is_empty()
            && self.readable_native.is_empty()
    }

    /// Every reliable handle reported in any category, each once.
    #[must_use]
    pub fn reliable_handles(&self) -> BTreeSet<Handle> {
        self.readable_reliable
            .iter()
            .chain(&self.writable_reliable)
            .chain(&self.erred_reliable)
            .copied()
            .collect()
    }

    /// Whether a read on `handle` may make progress.
    #[must_use]
    pub fn is_readable(&self, handle: Handle) -> bool {
        match handle.kind {
            HandleKind::Reliable => {
                self.readable_reliable.contains(&handle) || self.erred_reliable.contains(&handle)
            }
            HandleKind::Native => self.readable_native.contains(&handle),
        }
    }

    /// Record `handle` as readable in its namespace.
    pub fn insert_readable(&mut self, handle: Handle) {
        match handle.kind {
            HandleKind::Reliable => self.readable_reliable.insert(handle),
            HandleKind::Native => self.readable_native.insert(handle),
        };
    }
}

/// Unified wait primitive over both handle namespaces.
pub trait Poller {
    /// Start watching `handle`.
    ///
    /// # Errors
    ///
    /// Fails if the handle is already registered or the OS rejects it.
    fn register(&mut self, handle: Handle, interest: Interest) -> io::Result<()>;

    /// Change the interest of a registered handle.
    ///
    /// # Errors
    ///
    /// Fails if the handle is not registered.
    fn update(&mut self, handle: Handle, interest: Interest) -> io::Result<()>;

    /// Stop watching `handle`. Must precede closing it.
    ///
    /// # Errors
    ///
    /// Fails if the handle is not registered.
    fn deregister(&mut self, handle: Handle) -> io::Result<()>;

    /// Report `handle` as readable on the next wait regardless of events.
    fn mark_pending(&mut self, handle: Handle);

    /// Block up to `timeout` for readiness. An interrupted wait returns an
    /// empty [`Readiness`].
    ///
    /// # Errors
    ///
    /// Returns the OS error if waiting failed for another reason.
    fn wait(&mut self, timeout: Duration) -> io::Result<Readiness>;
}

fn token_for(handle: Handle) -> Token {
    let bit = match handle.kind {
        HandleKind::Reliable => 0,
        HandleKind::Native => 1,
    };
    #[allow(clippy::cast_sign_loss)]
    Token(((handle.raw as usize) << 1) | bit)
}

fn handle_for(token: Token) -> Handle {
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    let raw = (token.0 >> 1) as RawFd;
    if token.0 & 1 == 1 {
        Handle::native(raw)
    } else {
        Handle::reliable(raw)
    }
}

fn mio_interest(interest: Interest) -> mio::Interest {
    let write = interest.contains(Interest::WRITE);
    let read = interest.contains(Interest::READ) || !write;
    match (read, write) {
        (true, true) => mio::Interest::READABLE | mio::Interest::WRITABLE,
        (false, true) => mio::Interest::WRITABLE,
        _ => mio::Interest::READABLE,
    }
}

/// `mio`-backed [`Poller`].
pub struct Multiplexer {
    poll: Poll,
    events: Events,
    reliable: HashMap<RawFd, Interest>,
    native: HashMap<RawFd, Interest>,
    pending: BTreeSet<Handle>,
    unpollable: BTreeSet<Handle>,
}

impl Multiplexer {
    /// Create a multiplexer with no registrations.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS poll instance cannot be created.
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(EVENT_CAPACITY),
            reliable: HashMap::new(),
            native: HashMap::new(),
            pending: BTreeSet::new(),
            unpollable: BTreeSet::new(),
        })
    }

    fn table(&self, kind: HandleKind) -> &HashMap<RawFd, Interest> {
        match kind {
            HandleKind::Reliable => &self.reliable,
            HandleKind::Native => &self.native,
        }
    }

    fn table_mut(&mut self, kind: HandleKind) -> &mut HashMap<RawFd, Interest> {
        match kind {
            HandleKind::Reliable => &mut self.reliable,
            HandleKind::Native => &mut self.native,
        }
    }

    /// Whether `handle` is currently registered
    #[must_use]
    pub fn is_registered(&self, handle: Handle) -> bool {
        self.table(handle.kind).contains_key(&handle.raw)
    }

    /// Number of registered handles in both namespaces
    #[must_use]
    pub fn len(&self) -> usize {
        self.reliable.len() + self.native.len()
    }

    /// True when nothing is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn not_registered(handle: Handle) -> io::Error {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("{handle} is not registered"),
        )
    }
}

impl Poller for Multiplexer {
    fn register(&mut self, handle: Handle, interest: Interest) -> io::Result<()> {
        if handle.raw < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid handle {handle}"),
            ));
        }
        if self.is_registered(handle) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{handle} is already registered"),
            ));
        }

        let result = self.poll.registry().register(
            &mut SourceFd(&handle.raw),
            token_for(handle),
            mio_interest(interest),
        );
        match result {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == Some(libc::EPERM) => {
                debug!("{} cannot be polled, treating it as always ready", handle);
                self.unpollable.insert(handle);
            }
            Err(e) => return Err(e),
        }

        trace!("registered {} for {:?}", handle, interest);
        self.table_mut(handle.kind).insert(handle.raw, interest);
        Ok(())
    }

    fn update(&mut self, handle: Handle, interest: Interest) -> io::Result<()> {
        if !self.is_registered(handle) {
            return Err(Self::not_registered(handle));
        }
        if !self.unpollable.contains(&handle) {
            self.poll.registry().reregister(
                &mut SourceFd(&handle.raw),
                token_for(handle),
                mio_interest(interest),
            )?;
        }

        trace!("updated {} to {:?}", handle, interest);
        self.table_mut(handle.kind).insert(handle.raw, interest);
        Ok(())
    }

    fn deregister(&mut self, handle: Handle) -> io::Result<()> {
        if self.table_mut(handle.kind).remove(&handle.raw).is_none() {
            return Err(Self::not_registered(handle));
        }
        self.pending.remove(&handle);
        if self.unpollable.remove(&handle) {
            return Ok(());
        }

        trace!("deregistered {}", handle);
        self.poll
            .registry()
            .deregister(&mut SourceFd(&handle.raw))
    }

    fn mark_pending(&mut self, handle: Handle) {
        if self.is_registered(handle) {
            self.pending.insert(handle);
        }
    }

    fn wait(&mut self, timeout: Duration) -> io::Result<Readiness> {
        let timeout = if self.pending.is_empty() && self.unpollable.is_empty() {
            timeout
        } else {
            Duration::ZERO
        };

        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                return Ok(Readiness::default());
            }
            Err(e) => return Err(e),
        }

        let mut readiness = Readiness::default();
        for event in &self.events {
            let handle = handle_for(event.token());
            let Some(interest) = self.table(handle.kind).get(&handle.raw).copied() else {
                continue;
            };

            match handle.kind {
                HandleKind::Reliable => {
                    if event.is_error() {
                        readiness.erred_reliable.insert(handle);
                    }
                    if event.is_readable() || event.is_read_closed() {
                        readiness.readable_reliable.insert(handle);
                    }
                    if event.is_writable() && interest.contains(Interest::WRITE) {
                        readiness.writable_reliable.insert(handle);
                    }
                }
                HandleKind::Native => {
                    if event.is_readable() || event.is_read_closed() || event.is_error() {
                        readiness.readable_native.insert(handle);
                    }
                }
            }
        }

        for handle in std::mem::take(&mut self.pending) {
            readiness.insert_readable(handle);
        }
        for handle in &self.unpollable {
            readiness.insert_readable(*handle);
        }

        Ok(readiness)
    }
}
