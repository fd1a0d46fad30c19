//! # mediarelay transport
//!
//! Endpoints and readiness multiplexing for the mediarelay engine.
//!
//! This crate provides:
//! - The endpoint capability contract ([`Source`], [`Target`])
//! - File, UDP and RTP endpoints
//! - The reliable-transport collaborator contract and a framed-TCP backend
//! - URI-driven endpoint creation
//! - A readiness multiplexer over reliable and native handles

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod endpoint;
pub mod factory;
pub mod file;
pub mod poll;
pub mod reliable;
pub mod rtp;
pub mod stream;
pub mod udp;
pub mod uri;

pub use endpoint::{
    ConnectionStatus, Endpoint, EndpointError, EndpointKind, EndpointResult, Handle, HandleKind,
    MediaPacket, ReadOutcome, Role, Source, Target, TransportStats, monotonic_micros,
};
pub use factory::{EndpointFactory, UriEndpointFactory};
pub use poll::{Interest, Multiplexer, Poller, Readiness};
pub use reliable::{RecvOutcome, ReliableEndpoint, ReliableSocket, ReliableTransport};
pub use stream::StreamTransport;
pub use uri::MediaUri;

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Default UDP receive buffer size, overridable per URI with `rcvbuf`
    pub recv_buffer_size: usize,
    /// Default UDP send buffer size, overridable per URI with `sndbuf`
    pub send_buffer_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            recv_buffer_size: 2 * 1024 * 1024,
            send_buffer_size: 2 * 1024 * 1024,
        }
    }
}
