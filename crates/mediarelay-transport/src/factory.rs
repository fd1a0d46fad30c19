//! Endpoint factory: turns a URI into a source or target.
//!
//! File, UDP and RTP endpoints are built in. Reliable transports are looked
//! up by scheme among the registered [`ReliableTransport`]s; the framed-TCP
//! [`StreamTransport`] is registered by default.

use crate::TransportConfig;
use crate::endpoint::{EndpointError, EndpointKind, EndpointResult, Role, Source, Target};
use crate::file::{FileSource, FileTarget};
use crate::reliable::{ReliableEndpoint, ReliableTransport};
use crate::stream::StreamTransport;
use crate::udp::{UdpSource, UdpTarget};
use crate::uri::{FILE_SCHEME, MediaUri};
use std::sync::Arc;

/// Creates endpoints from URIs.
pub trait EndpointFactory: Send {
    /// Create a source for `uri`.
    ///
    /// # Errors
    ///
    /// [`EndpointError::UnsupportedScheme`] when no endpoint kind serves the
    /// scheme; any other error when the endpoint could not be opened.
    fn create_source(&self, uri: &str) -> EndpointResult<Box<dyn Source>>;

    /// Create a target for `uri`.
    ///
    /// # Errors
    ///
    /// Same as [`EndpointFactory::create_source`].
    fn create_target(&self, uri: &str) -> EndpointResult<Box<dyn Target>>;
}

/// Factory dispatching on the URI scheme.
#[derive(Clone)]
pub struct UriEndpointFactory {
    config: TransportConfig,
    reliable: Vec<Arc<dyn ReliableTransport>>,
}

impl UriEndpointFactory {
    /// Factory with the built-in kinds and the framed-TCP transport.
    #[must_use]
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            reliable: vec![Arc::new(StreamTransport)],
        }
    }

    /// Register another reliable transport. A later registration for the
    /// same scheme takes precedence.
    #[must_use]
    pub fn with_reliable(mut self, transport: Arc<dyn ReliableTransport>) -> Self {
        self.reliable.insert(0, transport);
        self
    }

    fn reliable_for(&self, scheme: &str) -> Option<&Arc<dyn ReliableTransport>> {
        self.reliable.iter().find(|t| t.scheme() == scheme)
    }

    /// Endpoint kind that would serve `uri`.
    ///
    /// # Errors
    ///
    /// Returns an error if the URI does not parse or its scheme is unknown.
    pub fn kind_of(&self, uri: &str) -> EndpointResult<EndpointKind> {
        let parsed = MediaUri::parse(uri)?;
        self.kind_for(&parsed)
    }

    fn kind_for(&self, uri: &MediaUri) -> EndpointResult<EndpointKind> {
        match uri.scheme() {
            FILE_SCHEME => Ok(EndpointKind::File),
            "udp" => Ok(EndpointKind::Udp),
            "rtp" => Ok(EndpointKind::Rtp),
            scheme if self.reliable_for(scheme).is_some() => Ok(EndpointKind::Reliable),
            scheme => Err(EndpointError::UnsupportedScheme(scheme.to_string())),
        }
    }

    fn open_reliable(&self, uri: &MediaUri, role: Role) -> EndpointResult<ReliableEndpoint> {
        let transport = self
            .reliable_for(uri.scheme())
            .ok_or_else(|| EndpointError::UnsupportedScheme(uri.scheme().to_string()))?;
        Ok(ReliableEndpoint::new(transport.open(uri, role)?))
    }
}

impl Default for UriEndpointFactory {
    fn default() -> Self {
        Self::new(TransportConfig::default())
    }
}

impl EndpointFactory for UriEndpointFactory {
    fn create_source(&self, uri: &str) -> EndpointResult<Box<dyn Source>> {
        let uri = MediaUri::parse(uri)?;
        Ok(match self.kind_for(&uri)? {
            EndpointKind::File => Box::new(FileSource::open(&uri)?),
            EndpointKind::Udp => Box::new(UdpSource::open(&uri, &self.config, false)?),
            EndpointKind::Rtp => Box::new(UdpSource::open(&uri, &self.config, true)?),
            EndpointKind::Reliable => Box::new(self.open_reliable(&uri, Role::Source)?),
        })
    }

    fn create_target(&self, uri: &str) -> EndpointResult<Box<dyn Target>> {
        let uri = MediaUri::parse(uri)?;
        Ok(match self.kind_for(&uri)? {
            EndpointKind::File => Box::new(FileTarget::open(&uri)?),
            EndpointKind::Udp => Box::new(UdpTarget::open(&uri, &self.config, false)?),
            EndpointKind::Rtp => Box::new(UdpTarget::open(&uri, &self.config, true)?),
            EndpointKind::Reliable => Box::new(self.open_reliable(&uri, Role::Target)?),
        })
    }
}
