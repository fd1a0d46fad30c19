//! Endpoint URI parsing.
//!
//! Network URIs (`udp://`, `rtp://`, `tcp://`, ...) go through the `url`
//! crate. Live-streaming tools conventionally write a listening or wildcard
//! endpoint with an empty host (`udp://:5000`), which WHATWG URL parsing
//! rejects, so the host is filled in before parsing and remembered as absent.
//! Anything without a scheme is a file path.

use crate::endpoint::{EndpointError, EndpointResult};
use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::str::FromStr;
use url::{Host, Url};

/// Scheme used for paths given without one.
pub const FILE_SCHEME: &str = "file";

/// Paths that mean stdin (as a source) or stdout (as a target).
const CONSOLE_PATHS: &[&str] = &["con", "-", "stdin", "stdout"];

/// Parsed endpoint URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaUri {
    original: String,
    scheme: String,
    host: Option<String>,
    port: Option<u16>,
    path: String,
    params: BTreeMap<String, String>,
}

impl MediaUri {
    /// Parse an endpoint descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`EndpointError::InvalidUri`] if the input is empty or the
    /// network part is malformed.
    pub fn parse(input: &str) -> EndpointResult<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(EndpointError::invalid_uri(input, "empty URI"));
        }

        let Some((scheme, rest)) = trimmed.split_once("://") else {
            return Ok(Self::file(trimmed, trimmed, BTreeMap::new()));
        };

        let scheme = scheme.to_ascii_lowercase();
        if scheme == FILE_SCHEME {
            let (path, query) = match rest.split_once('?') {
                Some((path, query)) => (path, Some(query)),
                None => (rest, None),
            };
            if path.is_empty() {
                return Err(EndpointError::invalid_uri(input, "missing file path"));
            }
            let params = query.map(parse_query).unwrap_or_default();
            return Ok(Self::file(trimmed, path, params));
        }

        let empty_host = rest.starts_with(':') || rest.is_empty();
        let normalized = if empty_host {
            format!("{scheme}://{}{rest}", Ipv4Addr::UNSPECIFIED)
        } else {
            format!("{scheme}://{rest}")
        };
        let url = Url::parse(&normalized).map_err(|e| EndpointError::invalid_uri(input, e))?;

        let host = if empty_host {
            None
        } else {
            match url.host() {
                Some(Host::Domain(domain)) if !domain.is_empty() => Some(domain.to_string()),
                Some(Host::Ipv4(addr)) => Some(addr.to_string()),
                Some(Host::Ipv6(addr)) => Some(addr.to_string()),
                _ => None,
            }
        };

        let params = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        Ok(Self {
            original: trimmed.to_string(),
            scheme,
            host,
            port: url.port(),
            path: url.path().to_string(),
            params,
        })
    }

    fn file(original: &str, path: &str, params: BTreeMap<String, String>) -> Self {
        Self {
            original: original.to_string(),
            scheme: FILE_SCHEME.to_string(),
            host: None,
            port: None,
            path: path.to_string(),
            params,
        }
    }

    /// The URI as given
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.original
    }

    /// Lower-case scheme; `file` for bare paths
    #[must_use]
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Host, or `None` when it was left empty
    #[must_use]
    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    /// Explicit port
    #[must_use]
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// File path (file URIs) or URL path (network URIs)
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Raw query parameter
    #[must_use]
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// Query parameter parsed as `T`.
    ///
    /// # Errors
    ///
    /// Returns [`EndpointError::InvalidUri`] if the parameter is present but
    /// does not parse.
    pub fn param_parsed<T>(&self, key: &str) -> EndpointResult<Option<T>>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        self.param(key)
            .map(|raw| {
                raw.parse::<T>().map_err(|e| {
                    EndpointError::invalid_uri(&self.original, format!("parameter '{key}': {e}"))
                })
            })
            .transpose()
    }

    /// True for `file://con`, `-` and friends
    #[must_use]
    pub fn is_console(&self) -> bool {
        self.scheme == FILE_SCHEME && CONSOLE_PATHS.contains(&self.path.as_str())
    }

    /// True when no host was given or it is a wildcard address
    #[must_use]
    pub fn is_wildcard_host(&self) -> bool {
        match self.host.as_deref() {
            None => true,
            Some(host) => host
                .parse::<IpAddr>()
                .map(|ip| ip.is_unspecified())
                .unwrap_or(false),
        }
    }

    /// Resolve host and port into a socket address.
    ///
    /// An absent host resolves to `0.0.0.0`.
    ///
    /// # Errors
    ///
    /// Returns [`EndpointError::InvalidUri`] when the port is missing, or an
    /// I/O error when name resolution fails.
    pub fn socket_addr(&self) -> EndpointResult<SocketAddr> {
        let port = self
            .port
            .ok_or_else(|| EndpointError::invalid_uri(&self.original, "missing port"))?;

        let Some(host) = self.host.as_deref() else {
            return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port));
        };

        (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| EndpointError::invalid_uri(&self.original, "host did not resolve"))
    }
}

impl fmt::Display for MediaUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.original)
    }
}

fn parse_query(query: &str) -> BTreeMap<String, String> {
    url::form_urlencoded::parse(query.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}
