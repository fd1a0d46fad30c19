//! Error types for the relay engine.

use mediarelay_transport::{EndpointError, Role};
use std::io;
use thiserror::Error;

/// Exit status for configuration and setup failures
pub const EXIT_FAILURE: u8 = 1;

/// Exit status for runtime failures
pub const EXIT_RUNTIME: u8 = 255;

/// Fatal relay errors. Everything else is recovered inside the loop.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Configuration rejected before the loop started
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// No endpoint kind serves the URI
    #[error("unsupported {role} URI '{uri}'")]
    Unsupported {
        /// Side of the relay
        role: Role,
        /// Offending URI
        uri: String,
    },

    /// A listening endpoint failed to accept its peer
    #[error("failed to accept {role} connection: {source}")]
    Accept {
        /// Side of the relay
        role: Role,
        /// Transport error
        source: EndpointError,
    },

    /// A handle could not be added to, or updated in, the multiplexer
    #[error("failed to add {role} to poll: {source}")]
    Poll {
        /// Side of the relay
        role: Role,
        /// OS error
        source: io::Error,
    },

    /// Endpoint creation failed for a reason other than its scheme
    #[error("failed to create {role}: {source}")]
    Create {
        /// Side of the relay
        role: Role,
        /// Transport error
        source: EndpointError,
    },

    /// Reading from the source failed
    #[error("read error: {0}")]
    Read(#[source] EndpointError),

    /// Waiting for readiness failed
    #[error("wait failed: {0}")]
    Wait(#[source] io::Error),
}

impl RelayError {
    /// Process exit status for this error.
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::InvalidConfig(_)
            | Self::Unsupported { .. }
            | Self::Accept { .. }
            | Self::Poll { .. } => EXIT_FAILURE,
            Self::Create { .. } | Self::Read(_) | Self::Wait(_) => EXIT_RUNTIME,
        }
    }

    /// Classify an endpoint creation failure.
    #[must_use]
    pub fn from_create(role: Role, uri: &str, source: EndpointError) -> Self {
        match source {
            EndpointError::UnsupportedScheme(_) => Self::Unsupported {
                role,
                uri: uri.to_string(),
            },
            EndpointError::InvalidUri { .. } => Self::InvalidConfig(source.to_string()),
            source => Self::Create { role, source },
        }
    }
}

/// Result type for relay operations
pub type RelayResult<T> = Result<T, RelayError>;
