//! Endpoint capability contract shared by every transport kind.
//!
//! A source or target is one of file, UDP, RTP or a reliable-transport socket
//! (possibly listening). The relay only talks to them through the [`Source`]
//! and [`Target`] traits defined here, so it never needs to know which kind it
//! is driving beyond the [`EndpointKind`] tag used for logging and poll
//! registration.

use serde::Serialize;
use std::fmt;
use std::io;
use std::os::fd::RawFd;
use std::sync::OnceLock;
use std::time::Instant;

/// Endpoint errors
#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    /// I/O error from the underlying socket or file
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The URI could not be parsed
    #[error("invalid URI '{uri}': {reason}")]
    InvalidUri {
        /// The offending URI
        uri: String,
        /// Why it was rejected
        reason: String,
    },

    /// No endpoint implementation exists for the URI scheme
    #[error("unsupported endpoint type: {0}")]
    UnsupportedScheme(String),

    /// `accept_new_client` called on an endpoint that is not listening
    #[error("endpoint is not listening")]
    NotListening,

    /// Data path used before the connection was established
    #[error("endpoint is not connected")]
    NotConnected,

    /// A received message does not fit in the configured chunk size
    #[error("message of {len} bytes exceeds chunk size {max}")]
    MessageTooLarge {
        /// Message length
        len: usize,
        /// Chunk size the caller asked for
        max: usize,
    },
}

impl EndpointError {
    /// Build an [`EndpointError::InvalidUri`].
    pub fn invalid_uri(uri: &str, reason: impl fmt::Display) -> Self {
        Self::InvalidUri {
            uri: uri.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Result type for endpoint operations
pub type EndpointResult<T> = Result<T, EndpointError>;

/// Which side of the relay an endpoint sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Data is read from it
    Source,
    /// Data is written to it
    Target,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Source => f.write_str("source"),
            Self::Target => f.write_str("target"),
        }
    }
}

/// Transport kind behind an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointKind {
    /// Local file, stdin or stdout
    File,
    /// Plain UDP datagrams
    Udp,
    /// UDP datagrams carrying an RTP header
    Rtp,
    /// Socket provided by a reliable-transport collaborator
    Reliable,
}

impl EndpointKind {
    /// Whether handles of this kind live in the reliable-transport namespace.
    #[must_use]
    pub fn is_reliable(self) -> bool {
        self == Self::Reliable
    }
}

impl fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File => f.write_str("FILE"),
            Self::Udp => f.write_str("UDP"),
            Self::Rtp => f.write_str("RTP"),
            Self::Reliable => f.write_str("reliable"),
        }
    }
}

/// Registration namespace of a waitable handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HandleKind {
    /// Socket owned by a reliable-transport collaborator
    Reliable,
    /// Plain OS descriptor (UDP socket, pipe, file)
    Native,
}

/// A waitable handle, tagged with its namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle {
    /// Namespace the handle is registered in
    pub kind: HandleKind,
    /// Raw descriptor
    pub raw: RawFd,
}

impl Handle {
    /// Handle in the reliable-transport namespace
    #[must_use]
    pub const fn reliable(raw: RawFd) -> Self {
        Self {
            kind: HandleKind::Reliable,
            raw,
        }
    }

    /// Handle in the native socket namespace
    #[must_use]
    pub const fn native(raw: RawFd) -> Self {
        Self {
            kind: HandleKind::Native,
            raw,
        }
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            HandleKind::Reliable => write!(f, "reliable:{}", self.raw),
            HandleKind::Native => write!(f, "native:{}", self.raw),
        }
    }
}

/// Connection status as reported by an endpoint.
///
/// Only `Listening`, `Connected` and the lost states drive the relay; every
/// other status is a no-op for the connection tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Waiting for a peer; `accept_new_client` is due
    Listening,
    /// Connection attempt in flight
    Connecting,
    /// Data path usable
    Connected,
    /// Peer vanished or the connection failed
    Broken,
    /// Closed locally
    Closed,
    /// The socket no longer exists
    Nonexistent,
}

impl ConnectionStatus {
    /// `Broken`, `Closed` or `Nonexistent`
    #[must_use]
    pub fn is_lost(self) -> bool {
        matches!(self, Self::Broken | Self::Closed | Self::Nonexistent)
    }
}

/// Monotonic microseconds since the first call in this process.
///
/// Never returns 0, which the framed transport reserves for "no timestamp".
#[must_use]
pub fn monotonic_micros() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = EPOCH.get_or_init(Instant::now);
    u64::try_from(epoch.elapsed().as_micros())
        .unwrap_or(u64::MAX)
        .max(1)
}

/// One chunk of media read from a source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaPacket {
    /// Payload bytes
    pub payload: Vec<u8>,
    /// Source timestamp in monotonic microseconds, if the source provides one
    pub time: Option<u64>,
}

impl MediaPacket {
    /// Packet with the given payload and timestamp.
    #[must_use]
    pub fn new(payload: Vec<u8>, time: Option<u64>) -> Self {
        Self { payload, time }
    }

    /// Payload length in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// True when the payload is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Outcome of a single read attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// A packet with at least one byte
    Data(MediaPacket),
    /// Nothing available right now; ends the current drain batch
    WouldBlock,
    /// Zero bytes: end of file or the peer closed the stream
    EndOfStream,
}

/// Capabilities shared by sources and targets.
pub trait Endpoint: Send {
    /// Transport kind
    fn kind(&self) -> EndpointKind;

    /// True once the endpoint has a usable data path (not merely listening).
    fn is_open(&self) -> bool;

    /// Query the current connection status.
    ///
    /// Takes `&mut self` because reliable sockets probe the peer to find out.
    fn status(&mut self) -> ConnectionStatus;

    /// Waitable handles, at most two.
    fn handles(&self) -> Vec<Handle>;

    /// Whether a peer must be accepted before the endpoint becomes usable.
    fn is_listening(&self) -> bool {
        false
    }

    /// Promote a listening endpoint to a connected data path.
    ///
    /// # Errors
    ///
    /// Returns [`EndpointError::NotListening`] for endpoints that never listen,
    /// or the transport error if accepting failed.
    fn accept_new_client(&mut self) -> EndpointResult<()> {
        Err(EndpointError::NotListening)
    }

    /// Traffic statistics since the endpoint was created.
    fn stats(&self) -> TransportStats;
}

/// Readable endpoint.
pub trait Source: Endpoint {
    /// Read at most `max_chunk` bytes as one packet.
    ///
    /// # Errors
    ///
    /// Returns an error for failures other than "no data yet", which is
    /// reported as [`ReadOutcome::WouldBlock`].
    fn read(&mut self, max_chunk: usize) -> EndpointResult<ReadOutcome>;
}

/// Writable endpoint.
pub trait Target: Endpoint {
    /// Write one packet. `time` is the source timestamp to schedule by, or
    /// `None` to let the target use its own clock.
    ///
    /// # Errors
    ///
    /// An error means this packet was not delivered; it does not necessarily
    /// mean the connection is gone.
    fn write(&mut self, payload: &[u8], time: Option<u64>) -> EndpointResult<()>;
}

/// Endpoint traffic statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransportStats {
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Total bytes received
    pub bytes_received: u64,
    /// Total packets sent
    pub packets_sent: u64,
    /// Total packets received
    pub packets_received: u64,
    /// Send errors
    pub send_errors: u64,
    /// Receive errors
    pub recv_errors: u64,
}

impl TransportStats {
    /// Create new empty statistics
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful send
    pub fn record_send(&mut self, bytes: usize) {
        self.bytes_sent += bytes as u64;
        self.packets_sent += 1;
    }

    /// Record a successful receive
    pub fn record_recv(&mut self, bytes: usize) {
        self.bytes_received += bytes as u64;
        self.packets_received += 1;
    }

    /// Record a send error
    pub fn record_send_error(&mut self) {
        self.send_errors += 1;
    }

    /// Record a receive error
    pub fn record_recv_error(&mut self) {
        self.recv_errors += 1;
    }
}
