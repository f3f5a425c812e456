//! Client-facing error taxonomy.

use crate::base::lifecycle::ClientState;
use crate::base::neterror::{BoxError, NetError, NetFailure};
use thiserror::Error;

/// Errors surfaced by [`CouchClient`](crate::client::CouchClient).
///
/// HTTP error statuses are not errors: a 409 comes back as a
/// [`Response`](crate::http::Response) with status 409.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Malformed or unreadable TLS material, or contradictory settings.
    /// Fatal at construction.
    #[error("configuration error: {message}")]
    Configuration {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// The call did not produce an HTTP response.
    #[error("{method} {path} on {endpoint} failed: {failure}")]
    Transport {
        method: String,
        path: String,
        endpoint: String,
        #[source]
        failure: NetFailure,
    },

    /// A call was issued while the client was not ready.
    #[error("client is {state}; requests need a ready client")]
    InvalidState { state: ClientState },

    /// The connection self-test run at construction failed.
    #[error("cannot connect to CouchDB at {endpoint}: {reason}")]
    Startup {
        endpoint: String,
        reason: String,
        #[source]
        source: Option<Box<ClientError>>,
    },
}

impl ClientError {
    pub fn configuration(message: impl Into<String>) -> Self {
        ClientError::Configuration { message: message.into(), source: None }
    }

    pub fn configuration_with(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        ClientError::Configuration { message: message.into(), source: Some(source.into()) }
    }

    /// The network error kind, for transport failures.
    pub fn net_error(&self) -> Option<NetError> {
        match self {
            ClientError::Transport { failure, .. } => Some(failure.kind()),
            ClientError::Startup { source: Some(inner), .. } => inner.net_error(),
            _ => None,
        }
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, ClientError::Configuration { .. })
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, ClientError::Transport { .. })
    }

    pub fn is_invalid_state(&self) -> bool {
        matches!(self, ClientError::InvalidState { .. })
    }
}
