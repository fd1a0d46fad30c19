//! UDP and RTP endpoints.
//!
//! Sockets are built with `socket2` so buffer sizes, multicast membership and
//! TTL can be set before binding, then handed over to `std::net::UdpSocket`
//! in non-blocking mode.
//!
//! URI options:
//! - `rcvbuf` / `sndbuf`: socket buffer sizes in bytes
//! - `ttl`: unicast or multicast TTL (targets)
//! - `adapter`: local IPv4 interface for multicast membership or sending
//! - `bind`: local address for a target socket
//! - `pt`: RTP payload type (RTP targets)

use crate::TransportConfig;
use crate::endpoint::{
    ConnectionStatus, Endpoint, EndpointError, EndpointKind, EndpointResult, Handle, MediaPacket,
    ReadOutcome, Source, Target, TransportStats, monotonic_micros,
};
use crate::rtp::{self, PAYLOAD_TYPE_MP2T, RTP_MAX_HEADER_LEN, RtpPacketizer};
use crate::uri::MediaUri;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::os::fd::AsRawFd;
use tracing::{debug, warn};

fn new_socket(addr: &SocketAddr) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(*addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

fn unspecified_like(addr: &SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    }
}

/// UDP (or RTP-over-UDP) source.
///
/// Binds the URI's address. A multicast host is joined on the `adapter`
/// interface and the socket binds the wildcard address on the group's port.
pub struct UdpSource {
    socket: UdpSocket,
    rtp: bool,
    recv_buf: Vec<u8>,
    stats: TransportStats,
}

impl UdpSource {
    /// Open a source from a `udp://` or `rtp://` URI.
    ///
    /// # Errors
    ///
    /// Returns an error if the URI is incomplete or the socket cannot be
    /// bound or joined to its multicast group.
    pub fn open(uri: &MediaUri, config: &TransportConfig, rtp: bool) -> EndpointResult<Self> {
        let addr = uri.socket_addr()?;
        let socket = new_socket(&addr)?;

        let rcvbuf = uri
            .param_parsed::<usize>("rcvbuf")?
            .unwrap_or(config.recv_buffer_size);
        if let Err(e) = socket.set_recv_buffer_size(rcvbuf) {
            warn!("UDP source {}: cannot set receive buffer to {}: {}", uri, rcvbuf, e);
        }

        match addr.ip() {
            IpAddr::V4(group) if group.is_multicast() => {
                let adapter = uri
                    .param_parsed::<Ipv4Addr>("adapter")?
                    .unwrap_or(Ipv4Addr::UNSPECIFIED);
                socket.set_reuse_address(true)?;
                socket.bind(&SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), addr.port()).into())?;
                socket.join_multicast_v4(&group, &adapter)?;
                debug!("UDP source joined {} on {}", group, adapter);
            }
            IpAddr::V6(group) if group.is_multicast() => {
                socket.set_reuse_address(true)?;
                socket.bind(&SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), addr.port()).into())?;
                socket.join_multicast_v6(&group, 0)?;
                debug!("UDP source joined {}", group);
            }
            _ => socket.bind(&addr.into())?,
        }

        let socket: UdpSocket = socket.into();
        debug!("UDP source bound to {}", socket.local_addr()?);

        Ok(Self {
            socket,
            rtp,
            recv_buf: Vec::new(),
            stats: TransportStats::new(),
        })
    }

    /// Local address the socket is bound to
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be determined.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

impl Endpoint for UdpSource {
    fn kind(&self) -> EndpointKind {
        if self.rtp {
            EndpointKind::Rtp
        } else {
            EndpointKind::Udp
        }
    }

    fn is_open(&self) -> bool {
        true
    }

    fn status(&mut self) -> ConnectionStatus {
        ConnectionStatus::Connected
    }

    fn handles(&self) -> Vec<Handle> {
        vec![Handle::native(self.socket.as_raw_fd())]
    }

    fn stats(&self) -> TransportStats {
        self.stats.clone()
    }
}

impl Source for UdpSource {
    fn read(&mut self, max_chunk: usize) -> EndpointResult<ReadOutcome> {
        let capacity = if self.rtp {
            max_chunk + RTP_MAX_HEADER_LEN
        } else {
            max_chunk
        };
        if self.recv_buf.len() < capacity {
            self.recv_buf.resize(capacity, 0);
        }

        loop {
            let received = match self.socket.recv(&mut self.recv_buf[..capacity]) {
                Ok(0) => return Ok(ReadOutcome::EndOfStream),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(ReadOutcome::WouldBlock);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.stats.record_recv_error();
                    return Err(e.into());
                }
            };

            let datagram = &self.recv_buf[..received];
            let payload = if self.rtp {
                match rtp::payload(datagram) {
                    Some(payload) if !payload.is_empty() => payload,
                    // keepalives and malformed headers carry no media
                    _ => {
                        self.stats.record_recv_error();
                        continue;
                    }
                }
            } else {
                datagram
            };

            self.stats.record_recv(received);
            return Ok(ReadOutcome::Data(MediaPacket::new(
                payload.to_vec(),
                Some(monotonic_micros()),
            )));
        }
    }
}

/// UDP (or RTP-over-UDP) target.
///
/// The socket is connected to the destination so ICMP errors surface as
/// failed writes rather than silently vanishing.
pub struct UdpTarget {
    socket: UdpSocket,
    packetizer: Option<RtpPacketizer>,
    stats: TransportStats,
}

impl UdpTarget {
    /// Open a target from a `udp://` or `rtp://` URI.
    ///
    /// # Errors
    ///
    /// Returns an error if the URI has no destination host or the socket
    /// cannot be configured.
    pub fn open(uri: &MediaUri, config: &TransportConfig, rtp: bool) -> EndpointResult<Self> {
        let dest = uri.socket_addr()?;
        if dest.ip().is_unspecified() {
            return Err(EndpointError::invalid_uri(
                uri.as_str(),
                "a target needs a destination host",
            ));
        }

        let socket = new_socket(&dest)?;
        let sndbuf = uri
            .param_parsed::<usize>("sndbuf")?
            .unwrap_or(config.send_buffer_size);
        if let Err(e) = socket.set_send_buffer_size(sndbuf) {
            warn!("UDP target {}: cannot set send buffer to {}: {}", uri, sndbuf, e);
        }

        let ttl = uri.param_parsed::<u32>("ttl")?;
        if let IpAddr::V4(group) = dest.ip() {
            if group.is_multicast() {
                if let Some(adapter) = uri.param_parsed::<Ipv4Addr>("adapter")? {
                    socket.set_multicast_if_v4(&adapter)?;
                }
            }
        }

        let bind = uri
            .param_parsed::<SocketAddr>("bind")?
            .unwrap_or_else(|| unspecified_like(&dest));
        socket.bind(&bind.into())?;
        socket.connect(&dest.into())?;

        let packetizer = if rtp {
            let payload_type = uri.param_parsed::<u8>("pt")?.unwrap_or(PAYLOAD_TYPE_MP2T);
            Some(RtpPacketizer::new(payload_type))
        } else {
            None
        };

        let socket: UdpSocket = socket.into();
        if let Some(ttl) = ttl {
            match dest.ip() {
                IpAddr::V4(group) if group.is_multicast() => socket.set_multicast_ttl_v4(ttl)?,
                IpAddr::V6(group) if group.is_multicast() => {
                    warn!("UDP target {}: ttl is ignored for IPv6 multicast", uri);
                }
                _ => socket.set_ttl(ttl)?,
            }
        }
        debug!("UDP target {} -> {}", socket.local_addr()?, dest);

        Ok(Self {
            socket,
            packetizer,
            stats: TransportStats::new(),
        })
    }
}

impl Endpoint for UdpTarget {
    fn kind(&self) -> EndpointKind {
        if self.packetizer.is_some() {
            EndpointKind::Rtp
        } else {
            EndpointKind::Udp
        }
    }

    fn is_open(&self) -> bool {
        true
    }

    fn status(&mut self) -> ConnectionStatus {
        ConnectionStatus::Connected
    }

    fn handles(&self) -> Vec<Handle> {
        vec![Handle::native(self.socket.as_raw_fd())]
    }

    fn stats(&self) -> TransportStats {
        self.stats.clone()
    }
}

impl Target for UdpTarget {
    fn write(&mut self, payload: &[u8], time: Option<u64>) -> EndpointResult<()> {
        let datagram = match self.packetizer.as_mut() {
            Some(packetizer) => packetizer.packetize(payload, time),
            None => payload,
        };

        match self.socket.send(datagram) {
            Ok(sent) if sent == datagram.len() => {
                self.stats.record_send(sent);
                Ok(())
            }
            Ok(sent) => {
                self.stats.record_send_error();
                Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    format!("short datagram write: {sent} of {}", datagram.len()),
                )
                .into())
            }
            Err(e) => {
                self.stats.record_send_error();
                Err(e.into())
            }
        }
    }
}
