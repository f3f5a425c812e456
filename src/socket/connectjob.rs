use crate::base::context::IoResultExt;
use crate::base::neterror::{NetError, NetFailure};
use crate::config::Endpoint;
use crate::socket::client::SocketType;
use crate::socket::tls::TlsConnector;
use std::time::Duration;
use tokio::net::TcpStream;

/// Manages the connection process: DNS -> TCP -> SSL.
/// Roughly equivalent to net::ConnectJob.
pub struct ConnectJob<'a> {
    endpoint: &'a Endpoint,
    tls: Option<&'a TlsConnector>,
    timeout: Duration,
}

impl<'a> ConnectJob<'a> {
    pub fn new(endpoint: &'a Endpoint, tls: Option<&'a TlsConnector>, timeout: Duration) -> Self {
        Self { endpoint, tls, timeout }
    }

    /// Connect within the connect timeout, which covers resolution, TCP
    /// connect and the TLS handshake.
    pub async fn connect(&self) -> Result<SocketType, NetFailure> {
        match tokio::time::timeout(self.timeout, self.connect_inner()).await {
            Ok(result) => result,
            Err(elapsed) => Err(NetFailure::new(NetError::ConnectionTimedOut, elapsed)),
        }
    }

    async fn connect_inner(&self) -> Result<SocketType, NetFailure> {
        let host = self.endpoint.host();

        // 1. DNS Resolution
        let addrs: Vec<_> = tokio::net::lookup_host(self.endpoint.authority())
            .await
            .net_context(NetError::NameNotResolved)?
            .collect();
        if addrs.is_empty() {
            return Err(NetError::NameNotResolved.into());
        }

        // 2. TCP Connect, first address that answers wins
        let mut last_error = None;
        let mut stream = None;
        for addr in addrs {
            match TcpStream::connect(addr).await.connection_context() {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(e) => {
                    tracing::debug!(%addr, error = %e, "connect attempt failed");
                    last_error = Some(e);
                }
            }
        }
        let stream = match (stream, last_error) {
            (Some(s), _) => s,
            (None, Some(e)) => return Err(e),
            (None, None) => return Err(NetError::ConnectionFailed.into()),
        };
        let _ = stream.set_nodelay(true);

        // 3. SSL Handshake (if https)
        match (self.endpoint.is_tls(), self.tls) {
            (true, Some(tls)) => Ok(SocketType::Ssl(tls.connect(host, stream).await?)),
            (true, None) => Err(NetFailure::new(
                NetError::SslProtocolError,
                format!("{} needs TLS but no TLS context was built", self.endpoint),
            )),
            (false, _) => Ok(SocketType::Tcp(stream)),
        }
    }
}
