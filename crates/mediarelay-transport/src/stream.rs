//! Message-framed TCP, the bundled reliable transport (`tcp://`).
//!
//! Each message travels as a 12-byte header followed by the payload:
//!
//! ```text
//! +----------------+--------------------------------+-------------+
//! | length (u32 BE)| timestamp in µs (u64 BE, 0=none)| payload ... |
//! +----------------+--------------------------------+-------------+
//! ```
//!
//! Sockets are non-blocking `mio` sockets. A listener accepts a single peer
//! and then closes its listening socket. Outgoing frames that the kernel does
//! not take immediately are queued in user space up to `sndbuf` bytes; beyond
//! that a send is rejected and the message counts as lost.

use crate::endpoint::{
    ConnectionStatus, EndpointError, EndpointResult, Role, TransportStats, monotonic_micros,
};
use crate::reliable::{RecvOutcome, ReliableSocket, ReliableTransport};
use crate::uri::MediaUri;
use mio::net::{TcpListener, TcpStream};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use tracing::{debug, info};

/// Frame header length
pub const FRAME_HEADER_LEN: usize = 12;

/// Largest frame accepted from a peer
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Default cap on bytes queued in user space
pub const DEFAULT_MAX_PENDING: usize = 4 * 1024 * 1024;

const READ_CHUNK: usize = 64 * 1024;

/// URI scheme served by [`StreamTransport`]
pub const STREAM_SCHEME: &str = "tcp";

fn is_connection_lost(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
    )
}

/// Framed-TCP reliable transport.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamTransport;

impl ReliableTransport for StreamTransport {
    fn scheme(&self) -> &str {
        STREAM_SCHEME
    }

    fn open(&self, uri: &MediaUri, role: Role) -> EndpointResult<Box<dyn ReliableSocket>> {
        let socket = StreamSocket::open(uri)?;
        debug!("{} {} socket for {}", role, socket.mode(), uri);
        Ok(Box::new(socket))
    }
}

/// One framed-TCP connection or single-peer listener.
pub struct StreamSocket {
    listener: Option<TcpListener>,
    stream: Option<TcpStream>,
    state: ConnectionStatus,
    rx: Vec<u8>,
    tx: Vec<u8>,
    max_pending: usize,
    stats: TransportStats,
}

impl StreamSocket {
    /// Listen on or connect to the URI's address.
    ///
    /// `mode=listener` or `mode=caller` selects the side explicitly; without
    /// it an empty or wildcard host listens and anything else connects.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown mode, a missing port, or a socket
    /// that cannot be bound or connected.
    pub fn open(uri: &MediaUri) -> EndpointResult<Self> {
        let addr = uri.socket_addr()?;
        let listen = match uri.param("mode") {
            Some("listener") | Some("server") => true,
            Some("caller") | Some("client") => false,
            Some(other) => {
                return Err(EndpointError::invalid_uri(
                    uri.as_str(),
                    format!("unknown mode '{other}'"),
                ));
            }
            None => uri.is_wildcard_host(),
        };
        let max_pending = uri
            .param_parsed::<usize>("sndbuf")?
            .unwrap_or(DEFAULT_MAX_PENDING);

        if listen {
            Self::listen(addr, max_pending)
        } else {
            Self::connect(addr, max_pending)
        }
    }

    fn listen(addr: SocketAddr, max_pending: usize) -> EndpointResult<Self> {
        let listener = TcpListener::bind(addr)?;
        info!("Listening on {}", listener.local_addr()?);
        Ok(Self::with_parts(
            Some(listener),
            None,
            ConnectionStatus::Listening,
            max_pending,
        ))
    }

    fn connect(addr: SocketAddr, max_pending: usize) -> EndpointResult<Self> {
        let stream = TcpStream::connect(addr)?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("cannot set TCP_NODELAY: {}", e);
        }
        debug!("Connecting to {}", addr);
        Ok(Self::with_parts(
            None,
            Some(stream),
            ConnectionStatus::Connecting,
            max_pending,
        ))
    }

    fn with_parts(
        listener: Option<TcpListener>,
        stream: Option<TcpStream>,
        state: ConnectionStatus,
        max_pending: usize,
    ) -> Self {
        Self {
            listener,
            stream,
            state,
            rx: Vec::new(),
            tx: Vec::new(),
            max_pending,
            stats: TransportStats::new(),
        }
    }

    fn mode(&self) -> &'static str {
        if self.listener.is_some() {
            "listener"
        } else {
            "caller"
        }
    }

    /// Local address of the listening or connected socket.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket is gone or the address is unavailable.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match (&self.listener, &self.stream) {
            (Some(listener), _) => listener.local_addr(),
            (None, Some(stream)) => stream.local_addr(),
            (None, None) => Err(io::Error::from(io::ErrorKind::NotConnected)),
        }
    }

    fn mark_broken(&mut self, why: &dyn std::fmt::Display) {
        if self.state != ConnectionStatus::Broken {
            debug!("connection broken: {}", why);
        }
        self.state = ConnectionStatus::Broken;
    }

    /// Pop one complete frame from the receive buffer.
    fn take_frame(&mut self, buf: &mut [u8]) -> EndpointResult<Option<RecvOutcome>> {
        if self.rx.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&self.rx[..4]);
        let len = u32::from_be_bytes(len_bytes) as usize;
        if len > MAX_FRAME_LEN {
            self.stats.record_recv_error();
            self.mark_broken(&"oversized frame header");
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {len} bytes exceeds {MAX_FRAME_LEN}"),
            )
            .into());
        }
        if self.rx.len() < FRAME_HEADER_LEN + len {
            return Ok(None);
        }

        let mut time_bytes = [0u8; 8];
        time_bytes.copy_from_slice(&self.rx[4..FRAME_HEADER_LEN]);
        let time = u64::from_be_bytes(time_bytes);

        if len > buf.len() {
            self.rx.drain(..FRAME_HEADER_LEN + len);
            self.stats.record_recv_error();
            return Err(EndpointError::MessageTooLarge {
                len,
                max: buf.len(),
            });
        }

        buf[..len].copy_from_slice(&self.rx[FRAME_HEADER_LEN..FRAME_HEADER_LEN + len]);
        self.rx.drain(..FRAME_HEADER_LEN + len);
        self.stats.record_recv(len);

        Ok(Some(RecvOutcome::Message {
            len,
            time: (time != 0).then_some(time),
        }))
    }

    /// Push queued bytes to the kernel until it would block.
    fn flush(&mut self) -> EndpointResult<()> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(EndpointError::NotConnected);
        };

        while !self.tx.is_empty() {
            match stream.write(&self.tx) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                Ok(n) => {
                    self.tx.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    if is_connection_lost(&e) {
                        self.mark_broken(&e);
                    }
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }
}

impl ReliableSocket for StreamSocket {
    fn raw_handle(&self) -> RawFd {
        match (&self.stream, &self.listener) {
            (Some(stream), _) => stream.as_raw_fd(),
            (None, Some(listener)) => listener.as_raw_fd(),
            (None, None) => -1,
        }
    }

    fn state(&self) -> ConnectionStatus {
        self.state
    }

    fn probe(&mut self) -> ConnectionStatus {
        let Some(stream) = self.stream.as_ref() else {
            return self.state;
        };

        match self.state {
            ConnectionStatus::Connecting => match stream.take_error() {
                Ok(Some(e)) | Err(e) => self.mark_broken(&e),
                Ok(None) => match stream.peer_addr() {
                    Ok(peer) => {
                        debug!("connected to {}", peer);
                        self.state = ConnectionStatus::Connected;
                    }
                    Err(e) if e.kind() == io::ErrorKind::NotConnected => {}
                    Err(e) => self.mark_broken(&e),
                },
            },
            ConnectionStatus::Connected => {
                let mut probe = [0u8; 1];
                match stream.peek(&mut probe) {
                    Ok(0) => self.mark_broken(&"peer closed the connection"),
                    Ok(_) => {}
                    Err(e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                        ) => {}
                    Err(e) => self.mark_broken(&e),
                }
            }
            _ => {}
        }
        self.state
    }

    fn accept(&mut self) -> EndpointResult<()> {
        let Some(listener) = self.listener.as_ref() else {
            return Err(EndpointError::NotListening);
        };

        let (stream, peer) = loop {
            match listener.accept() {
                Ok(accepted) => break accepted,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!("cannot set TCP_NODELAY: {}", e);
        }
        debug!("accepted peer {}", peer);

        self.stream = Some(stream);
        self.listener = None;
        self.state = ConnectionStatus::Connected;
        Ok(())
    }

    fn recv(&mut self, buf: &mut [u8]) -> EndpointResult<RecvOutcome> {
        loop {
            if let Some(outcome) = self.take_frame(buf)? {
                return Ok(outcome);
            }

            let Some(stream) = self.stream.as_mut() else {
                return Err(EndpointError::NotConnected);
            };
            let start = self.rx.len();
            self.rx.resize(start + READ_CHUNK, 0);
            let result = stream.read(&mut self.rx[start..]);
            self.rx.truncate(start + *result.as_ref().unwrap_or(&0));

            match result {
                Ok(0) => {
                    self.mark_broken(&"peer closed the connection");
                    return Ok(RecvOutcome::Closed);
                }
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(RecvOutcome::NoData);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if is_connection_lost(&e) => {
                    self.mark_broken(&e);
                    return Ok(RecvOutcome::Closed);
                }
                Err(e) => {
                    self.stats.record_recv_error();
                    return Err(e.into());
                }
            }
        }
    }

    fn send(&mut self, payload: &[u8], time: Option<u64>) -> EndpointResult<()> {
        if self.state != ConnectionStatus::Connected {
            return Err(EndpointError::NotConnected);
        }
        if payload.len() > MAX_FRAME_LEN {
            self.stats.record_send_error();
            return Err(EndpointError::MessageTooLarge {
                len: payload.len(),
                max: MAX_FRAME_LEN,
            });
        }

        if let Err(e) = self.flush() {
            self.stats.record_send_error();
            return Err(e);
        }

        let frame_len = FRAME_HEADER_LEN + payload.len();
        if self.tx.len() + frame_len > self.max_pending {
            self.stats.record_send_error();
            return Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                format!(
                    "send queue full ({} of {} bytes pending)",
                    self.tx.len(),
                    self.max_pending
                ),
            )
            .into());
        }

        #[allow(clippy::cast_possible_truncation)]
        let len = payload.len() as u32;
        let time = time.unwrap_or_else(monotonic_micros);
        self.tx.extend_from_slice(&len.to_be_bytes());
        self.tx.extend_from_slice(&time.to_be_bytes());
        self.tx.extend_from_slice(payload);

        match self.flush() {
            Ok(()) => {
                self.stats.record_send(payload.len());
                Ok(())
            }
            Err(e) => {
                self.stats.record_send_error();
                Err(e)
            }
        }
    }

    fn stats(&self) -> TransportStats {
        self.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn wait_for<T>(mut attempt: impl FnMut() -> Option<T>) -> T {
        for _ in 0..500 {
            if let Some(value) = attempt() {
                return value;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("condition not reached in time");
    }

    fn connected_pair() -> (StreamSocket, StreamSocket) {
        let uri = MediaUri::parse("tcp://127.0.0.1:0?mode=listener").unwrap();
        let mut listener = StreamSocket::open(&uri).unwrap();
        assert_eq!(listener.state(), ConnectionStatus::Listening);
        let port = listener.local_addr().unwrap().port();

        let uri = MediaUri::parse(&format!("tcp://127.0.0.1:{port}")).unwrap();
        let mut caller = StreamSocket::open(&uri).unwrap();

        wait_for(|| listener.accept().ok());
        wait_for(|| (caller.probe() == ConnectionStatus::Connected).then_some(()));
        assert_eq!(listener.state(), ConnectionStatus::Connected);
        (listener, caller)
    }

    fn recv_message(socket: &mut StreamSocket, buf: &mut [u8]) -> RecvOutcome {
        wait_for(|| match socket.recv(buf).unwrap() {
            RecvOutcome::NoData => None,
            other => Some(other),
        })
    }

    #[test]
    fn test_wildcard_host_listens() {
        let uri = MediaUri::parse("tcp://:0").unwrap();
        let socket = StreamSocket::open(&uri).unwrap();
        assert_eq!(socket.state(), ConnectionStatus::Listening);
        assert_eq!(socket.mode(), "listener");
        assert!(socket.raw_handle() >= 0);
    }

    #[test]
    fn test_unknown_mode_rejected() {
        let uri = MediaUri::parse("tcp://127.0.0.1:9?mode=rendezvous").unwrap();
        assert!(matches!(
            StreamSocket::open(&uri),
            Err(EndpointError::InvalidUri { .. })
        ));
    }

    #[test]
    fn test_messages_keep_boundaries_and_timestamps() {
        let (mut listener, mut caller) = connected_pair();

        caller.send(&[1u8; 1316], Some(5_000)).unwrap();
        caller.send(&[2u8; 188], None).unwrap();

        let mut buf = vec![0u8; 1316];
        assert_eq!(
            recv_message(&mut listener, &mut buf),
            RecvOutcome::Message { len: 1316, time: Some(5_000) }
        );
        assert!(buf.iter().all(|&b| b == 1));

        let RecvOutcome::Message { len, time } = recv_message(&mut listener, &mut buf) else {
            panic!("expected a message");
        };
        assert_eq!(len, 188);
        assert!(time.is_some());
        assert_eq!(listener.stats().bytes_received, 1504);
        assert_eq!(caller.stats().packets_sent, 2);
    }

    #[test]
    fn test_oversized_message_is_error() {
        let (mut listener, mut caller) = connected_pair();
        caller.send(&[0u8; 2000], None).unwrap();

        let mut buf = vec![0u8; 1316];
        let err = wait_for(|| match listener.recv(&mut buf) {
            Ok(RecvOutcome::NoData) => None,
            Ok(other) => panic!("unexpected {other:?}"),
            Err(e) => Some(e),
        });
        assert!(matches!(
            err,
            EndpointError::MessageTooLarge { len: 2000, max: 1316 }
        ));
    }

    #[test]
    fn test_peer_close_is_detected() {
        let (mut listener, caller) = connected_pair();
        drop(caller);

        let mut buf = vec![0u8; 64];
        assert_eq!(recv_message(&mut listener, &mut buf), RecvOutcome::Closed);
        assert_eq!(listener.probe(), ConnectionStatus::Broken);
        assert!(listener.send(b"late", None).is_err());
    }

    #[test]
    fn test_send_queue_cap() {
        let uri = MediaUri::parse("tcp://127.0.0.1:0?mode=listener&sndbuf=16").unwrap();
        let mut listener = StreamSocket::open(&uri).unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut caller =
            StreamSocket::open(&MediaUri::parse(&format!("tcp://127.0.0.1:{port}")).unwrap())
                .unwrap();
        wait_for(|| listener.accept().ok());
        wait_for(|| (caller.probe() == ConnectionStatus::Connected).then_some(()));

        assert!(listener.send(&[0u8; 100], None).is_err());
        assert_eq!(listener.stats().send_errors, 1);
        listener.send(&[0u8; 4], None).unwrap();
        assert!(listener.tx.is_empty());
    }

    #[test]
    fn test_send_before_connect() {
        let uri = MediaUri::parse("tcp://127.0.0.1:0?mode=listener").unwrap();
        let mut listener = StreamSocket::open(&uri).unwrap();
        assert!(matches!(
            listener.send(b"x", None),
            Err(EndpointError::NotConnected)
        ));
        assert!(matches!(
            StreamSocket::with_parts(None, None, ConnectionStatus::Closed, 0).accept(),
            Err(EndpointError::NotListening)
        ));
    }
}
