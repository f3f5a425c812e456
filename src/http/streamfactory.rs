//! Transport construction and HTTP/1.1 streams.
//!
//! [`TransportBuilder::build`] runs once per client. It validates TLS
//! material, creates the connection pool and installs the credentials
//! provider. The resulting [`Transport`] holds the two handles the dispatcher
//! routes between.

use crate::base::error::ClientError;
use crate::base::neterror::{NetError, NetFailure};
use crate::config::{Credentials, Endpoint, TlsSettings, TransportConfig};
use crate::http::requestbody::BodyWrapper;
use crate::socket::authcache::{AuthScope, CredentialsProvider};
use crate::socket::connectjob::ConnectJob;
use crate::socket::pool::{Checkout, ClientSocketPool, GroupId, PoolSlot, Poolable};
use crate::socket::tls::TlsConnector;
use http::{Request, Response};
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use std::sync::Arc;

/// Wraps an HTTP/1.1 connection.
/// Equivalent to net::HttpStream.
pub struct HttpStream {
    sender: http1::SendRequest<BodyWrapper>,
    reused: bool,
}

impl HttpStream {
    /// True if the stream came from the idle pool rather than a fresh connect.
    pub fn is_reused(&self) -> bool {
        self.reused
    }

    pub async fn send_request(
        &mut self,
        req: Request<BodyWrapper>,
    ) -> Result<Response<Incoming>, NetFailure> {
        self.sender.ready().await.map_err(NetFailure::from_hyper)?;
        self.sender.send_request(req).await.map_err(NetFailure::from_hyper)
    }

    fn mark_reused(mut self) -> Self {
        self.reused = true;
        self
    }
}

impl Poolable for HttpStream {
    fn is_open(&self) -> bool {
        !self.sender.is_closed()
    }
}

impl std::fmt::Debug for HttpStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpStream").field("reused", &self.reused).finish()
    }
}

/// Hands out HTTP streams to one endpoint, pooled under the configured limits.
#[derive(Debug)]
pub struct HttpStreamFactory {
    endpoint: Endpoint,
    group: GroupId,
    config: TransportConfig,
    pool: ClientSocketPool<HttpStream>,
    tls: Option<TlsConnector>,
    credentials: Option<CredentialsProvider>,
}

impl HttpStreamFactory {
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn pool(&self) -> &ClientSocketPool<HttpStream> {
        &self.pool
    }

    /// Fallback credentials for 401 challenges.
    pub fn credentials(&self) -> Option<&CredentialsProvider> {
        self.credentials.as_ref()
    }

    /// A reused idle stream, or a new connection once pool capacity allows.
    pub async fn request_stream(&self) -> Result<(HttpStream, PoolSlot<HttpStream>), NetFailure> {
        let slot = match self.pool.checkout(&self.group).await? {
            Checkout::Reused(stream, slot) => return Ok((stream.mark_reused(), slot)),
            Checkout::Connect(slot) => slot,
        };

        // 1. Socket (TCP + TLS under the connect timeout)
        let socket = ConnectJob::new(&self.endpoint, self.tls.as_ref(), self.config.connect_timeout)
            .connect()
            .await?;
        let peer = socket.peer_addr().ok();

        // 2. Handshake (HTTP/1.1 only)
        let (sender, conn) = http1::handshake(TokioIo::new(socket))
            .await
            .map_err(|e| NetFailure::new(NetError::ConnectionFailed, e))?;

        // 3. Spawn the connection driver
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::debug!(error = %e, "connection closed with error");
            }
        });

        tracing::debug!(endpoint = %self.endpoint, ?peer, "opened connection");
        Ok((HttpStream { sender, reused: false }, slot))
    }

    /// Close idle connections, stop the cleanup task and fail pool waiters.
    pub fn shutdown(&self) {
        self.pool.shutdown();
    }
}

/// The two transport handles a client routes between.
///
/// `primary` serves the cached route and `backend` the direct one. They share
/// one pool configuration, so both currently point at the same factory.
#[derive(Debug, Clone)]
pub struct Transport {
    primary: Arc<HttpStreamFactory>,
    backend: Arc<HttpStreamFactory>,
}

impl Transport {
    pub fn primary(&self) -> &Arc<HttpStreamFactory> {
        &self.primary
    }

    pub fn backend(&self) -> &Arc<HttpStreamFactory> {
        &self.backend
    }

    pub fn shutdown(&self) {
        self.primary.shutdown();
        if !Arc::ptr_eq(&self.primary, &self.backend) {
            self.backend.shutdown();
        }
    }
}

/// Builds a [`Transport`] from an endpoint, transport settings and credentials.
pub struct TransportBuilder;

impl TransportBuilder {
    /// Build the transport. Runs no network I/O; bad settings or TLS material
    /// fail here with [`ClientError::Configuration`].
    pub fn build(
        endpoint: Endpoint,
        config: &TransportConfig,
        credentials: Option<Credentials>,
    ) -> Result<Transport, ClientError> {
        if config.max_connections == 0 {
            return Err(ClientError::configuration("max_connections must be at least 1"));
        }
        if config.connect_timeout.is_zero() || config.socket_timeout.is_zero() {
            return Err(ClientError::configuration("timeouts must be positive"));
        }

        let tls = if endpoint.is_tls() {
            let defaults = TlsSettings::default();
            Some(TlsConnector::new(config.tls.as_ref().unwrap_or(&defaults))?)
        } else {
            if config.tls.is_some() {
                tracing::warn!(endpoint = %endpoint, "TLS settings ignored for plain http endpoint");
            }
            None
        };

        let credentials =
            credentials.map(|c| CredentialsProvider::new(AuthScope::from(&endpoint), c));

        let pool = ClientSocketPool::new(config.max_connections);
        if config.cleanup_idle_connections {
            pool.start_cleanup_task();
        }

        tracing::debug!(
            endpoint = %endpoint,
            max_connections = config.max_connections,
            tls = tls.is_some(),
            credentials = credentials.is_some(),
            "built transport"
        );

        let factory = Arc::new(HttpStreamFactory {
            group: GroupId::from(&endpoint),
            endpoint,
            config: config.clone(),
            pool,
            tls,
            credentials,
        });
        Ok(Transport { primary: Arc::clone(&factory), backend: factory })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreLocation;

    #[test]
    fn test_handles_share_one_factory() {
        let transport = TransportBuilder::build(
            Endpoint::http("localhost", 5984),
            &TransportConfig { cleanup_idle_connections: false, ..Default::default() },
            Some(Credentials::new("admin", "secret")),
        )
        .unwrap();
        assert!(Arc::ptr_eq(transport.primary(), transport.backend()));
        let provider = transport.primary().credentials().unwrap();
        assert_eq!(provider.scope(), &AuthScope::new("localhost", 5984));
    }

    #[test]
    fn test_missing_trust_store_fails_before_io() {
        let config = TransportConfig {
            cleanup_idle_connections: false,
            tls: Some(TlsSettings {
                trust_store: Some(StoreLocation::new("/nonexistent/trust.pem", "")),
                ..Default::default()
            }),
            ..Default::default()
        };
        let err = TransportBuilder::build(Endpoint::https("db.example", 6984), &config, None)
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_zero_pool_rejected() {
        let config = TransportConfig { max_connections: 0, ..Default::default() };
        let err = TransportBuilder::build(Endpoint::http("localhost", 5984), &config, None)
            .unwrap_err();
        assert!(err.is_configuration());
    }
}
