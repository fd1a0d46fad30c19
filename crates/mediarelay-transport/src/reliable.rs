//! Reliable-transport collaborator contract.
//!
//! A reliable transport (message-oriented, connection-based) plugs into the
//! relay through [`ReliableTransport`], which opens [`ReliableSocket`]s for a
//! URI. [`ReliableEndpoint`] adapts such a socket to the [`Source`] and
//! [`Target`] traits so the relay drives it like any other endpoint, with its
//! handle registered in the reliable namespace.

use crate::endpoint::{
    ConnectionStatus, Endpoint, EndpointError, EndpointKind, EndpointResult, Handle, MediaPacket,
    ReadOutcome, Role, Source, Target, TransportStats,
};
use crate::uri::MediaUri;
use std::os::fd::RawFd;

/// Result of one receive attempt on a reliable socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvOutcome {
    /// A whole message of `len` bytes was copied into the buffer
    Message {
        /// Message length
        len: usize,
        /// Sender timestamp in microseconds, if it sent one
        time: Option<u64>,
    },
    /// No complete message yet
    NoData,
    /// The peer closed the connection
    Closed,
}

/// One connection (or listener) of a reliable transport.
pub trait ReliableSocket: Send {
    /// Descriptor to wait on. Changes after a successful `accept`.
    fn raw_handle(&self) -> RawFd;

    /// Last known status, without I/O.
    fn state(&self) -> ConnectionStatus;

    /// Query the live status, updating the cached state.
    fn probe(&mut self) -> ConnectionStatus;

    /// Accept the pending peer of a listening socket.
    ///
    /// # Errors
    ///
    /// Returns [`EndpointError::NotListening`] if the socket does not listen,
    /// or the transport error if no peer could be accepted.
    fn accept(&mut self) -> EndpointResult<()>;

    /// Receive one message into `buf`.
    ///
    /// # Errors
    ///
    /// Returns an error for transport failures; "no data yet" is
    /// [`RecvOutcome::NoData`].
    fn recv(&mut self, buf: &mut [u8]) -> EndpointResult<RecvOutcome>;

    /// Send one message.
    ///
    /// # Errors
    ///
    /// Returns an error if the message was not accepted for delivery.
    fn send(&mut self, payload: &[u8], time: Option<u64>) -> EndpointResult<()>;

    /// Traffic statistics.
    fn stats(&self) -> TransportStats;
}

/// Opens reliable sockets for one URI scheme.
pub trait ReliableTransport: Send + Sync {
    /// URI scheme served, lower case
    fn scheme(&self) -> &str;

    /// Open a socket for `uri` on the given side of the relay.
    ///
    /// # Errors
    ///
    /// Returns an error if the URI is invalid for this transport or the
    /// socket cannot be created.
    fn open(&self, uri: &MediaUri, role: Role) -> EndpointResult<Box<dyn ReliableSocket>>;
}

/// Source/target adapter over a [`ReliableSocket`].
pub struct ReliableEndpoint {
    socket: Box<dyn ReliableSocket>,
    buf: Vec<u8>,
}

impl ReliableEndpoint {
    /// Wrap an opened socket.
    #[must_use]
    pub fn new(socket: Box<dyn ReliableSocket>) -> Self {
        Self {
            socket,
            buf: Vec::new(),
        }
    }
}

impl Endpoint for ReliableEndpoint {
    fn kind(&self) -> EndpointKind {
        EndpointKind::Reliable
    }

    fn is_open(&self) -> bool {
        self.socket.state() == ConnectionStatus::Connected
    }

    fn status(&mut self) -> ConnectionStatus {
        self.socket.probe()
    }

    fn handles(&self) -> Vec<Handle> {
        vec![Handle::reliable(self.socket.raw_handle())]
    }

    fn is_listening(&self) -> bool {
        self.socket.state() == ConnectionStatus::Listening
    }

    fn accept_new_client(&mut self) -> EndpointResult<()> {
        self.socket.accept()
    }

    fn stats(&self) -> TransportStats {
        self.socket.stats()
    }
}

impl Source for ReliableEndpoint {
    fn read(&mut self, max_chunk: usize) -> EndpointResult<ReadOutcome> {
        if self.buf.len() < max_chunk {
            self.buf.resize(max_chunk, 0);
        }

        match self.socket.recv(&mut self.buf[..max_chunk])? {
            RecvOutcome::Message { len, time } => Ok(ReadOutcome::Data(MediaPacket::new(
                self.buf[..len].to_vec(),
                time,
            ))),
            RecvOutcome::NoData => Ok(ReadOutcome::WouldBlock),
            RecvOutcome::Closed => Ok(ReadOutcome::EndOfStream),
        }
    }
}

impl Target for ReliableEndpoint {
    fn write(&mut self, payload: &[u8], time: Option<u64>) -> EndpointResult<()> {
        if !self.is_open() {
            return Err(EndpointError::NotConnected);
        }
        self.socket.send(payload, time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct ScriptedSocket {
        state: ConnectionStatus,
        inbox: VecDeque<RecvOutcome>,
        sent: Vec<Vec<u8>>,
    }

    impl ReliableSocket for ScriptedSocket {
        fn raw_handle(&self) -> RawFd {
            if self.state == ConnectionStatus::Listening { 10 } else { 11 }
        }
        fn state(&self) -> ConnectionStatus {
            self.state
        }
        fn probe(&mut self) -> ConnectionStatus {
            self.state
        }
        fn accept(&mut self) -> EndpointResult<()> {
            if self.state != ConnectionStatus::Listening {
                return Err(EndpointError::NotListening);
            }
            self.state = ConnectionStatus::Connected;
            Ok(())
        }
        fn recv(&mut self, buf: &mut [u8]) -> EndpointResult<RecvOutcome> {
            let outcome = self.inbox.pop_front().unwrap_or(RecvOutcome::NoData);
            if let RecvOutcome::Message { len, .. } = outcome {
                buf[..len].fill(0xAB);
            }
            Ok(outcome)
        }
        fn send(&mut self, payload: &[u8], _time: Option<u64>) -> EndpointResult<()> {
            self.sent.push(payload.to_vec());
            Ok(())
        }
        fn stats(&self) -> TransportStats {
            TransportStats::new()
        }
    }

    fn listening() -> ReliableEndpoint {
        ReliableEndpoint::new(Box::new(ScriptedSocket {
            state: ConnectionStatus::Listening,
            inbox: VecDeque::from([
                RecvOutcome::Message { len: 4, time: Some(99) },
                RecvOutcome::NoData,
                RecvOutcome::Closed,
            ]),
            sent: Vec::new(),
        }))
    }

    #[test]
    fn test_accept_switches_handle_and_opens() {
        let mut endpoint = listening();
        assert!(endpoint.is_listening());
        assert!(!endpoint.is_open());
        assert_eq!(endpoint.handles(), vec![Handle::reliable(10)]);

        endpoint.accept_new_client().unwrap();
        assert!(!endpoint.is_listening());
        assert!(endpoint.is_open());
        assert_eq!(endpoint.handles(), vec![Handle::reliable(11)]);
        assert!(matches!(
            endpoint.accept_new_client(),
            Err(EndpointError::NotListening)
        ));
    }

    #[test]
    fn test_read_maps_outcomes() {
        let mut endpoint = listening();
        endpoint.accept_new_client().unwrap();

        let ReadOutcome::Data(packet) = endpoint.read(1316).unwrap() else {
            panic!("expected data");
        };
        assert_eq!(packet.payload, vec![0xAB; 4]);
        assert_eq!(packet.time, Some(99));
        assert_eq!(endpoint.read(1316).unwrap(), ReadOutcome::WouldBlock);
        assert_eq!(endpoint.read(1316).unwrap(), ReadOutcome::EndOfStream);
    }

    #[test]
    fn test_write_requires_connection() {
        let mut endpoint = listening();
        assert!(matches!(
            endpoint.write(b"ts", None),
            Err(EndpointError::NotConnected)
        ));
        endpoint.accept_new_client().unwrap();
        endpoint.write(b"ts", None).unwrap();
    }
}
