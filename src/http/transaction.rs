use crate::base::neterror::{NetError, NetFailure};
use crate::http::request::Request;
use crate::http::response::Response;
use crate::http::responsebody::{ResponseBody, StreamLease};
use crate::http::streamfactory::HttpStreamFactory;
use http::HeaderValue;

/// One request/response exchange on a pooled stream.
///
/// The wait for response headers is bounded by the socket timeout. A request
/// sent on a reused connection that the server had already closed is replayed
/// once per stale connection on a fresh one, provided its body can be resent.
pub struct HttpNetworkTransaction<'a> {
    factory: &'a HttpStreamFactory,
    attempts: usize,
}

impl<'a> HttpNetworkTransaction<'a> {
    pub fn new(factory: &'a HttpStreamFactory) -> Self {
        Self { factory, attempts: 0 }
    }

    /// Number of times the request went on the wire.
    pub fn attempts(&self) -> usize {
        self.attempts
    }

    /// Run the exchange up to response headers. The body is left on the
    /// connection for the caller to read.
    pub async fn start(
        &mut self,
        request: Request,
        authorization: Option<HeaderValue>,
    ) -> Result<Response, NetFailure> {
        let endpoint = self.factory.endpoint();
        let config = self.factory.config();
        let request_line = request.request_line(endpoint);
        let mut request = request;

        loop {
            let (mut stream, slot) = self.factory.request_stream().await?;
            let reused = stream.is_reused();
            let replay = if reused { request.try_clone() } else { None };

            self.attempts += 1;
            let http_request =
                request.into_http(endpoint, config.use_expect_continue, authorization.clone())?;

            let sent = tokio::time::timeout(config.socket_timeout, stream.send_request(http_request))
                .await
                .unwrap_or_else(|elapsed| Err(NetFailure::new(NetError::TimedOut, elapsed)));

            let response = match sent {
                Ok(response) => response,
                Err(e) if reused && e.kind().is_stale_connection() => match replay {
                    Some(again) => {
                        tracing::debug!(
                            request = %request_line,
                            error = %e,
                            "reused connection was stale, retrying on a new one"
                        );
                        slot.discard();
                        request = again;
                        continue;
                    }
                    None => return Err(e),
                },
                Err(e) => return Err(e),
            };

            let (parts, incoming) = response.into_parts();
            let body =
                ResponseBody::streaming(incoming, StreamLease::new(stream, slot), config.socket_timeout);
            return Ok(Response::from_parts(parts, body, request_line));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Endpoint, TransportConfig};
    use crate::http::streamfactory::TransportBuilder;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Answers one request per connection, then hangs up on the next one.
    async fn one_reply_per_connection() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    let _ = socket.read(&mut buf).await;
                    let _ = socket.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK").await;
                    let _ = socket.read(&mut buf).await;
                });
            }
        });
        port
    }

    #[tokio::test]
    async fn test_stale_reuse_counts_second_attempt() {
        let port = one_reply_per_connection().await;
        let transport = TransportBuilder::build(
            Endpoint::http("127.0.0.1", port),
            &TransportConfig { cleanup_idle_connections: false, ..Default::default() },
            None,
        )
        .unwrap();
        let factory = transport.primary();

        let mut first = HttpNetworkTransaction::new(factory);
        let response = first.start(Request::get("/mydb"), None).await.unwrap();
        response.bytes().await.unwrap();
        assert_eq!(first.attempts(), 1);
        assert_eq!(factory.pool().idle_count(), 1);

        let mut second = HttpNetworkTransaction::new(factory);
        let response = second.start(Request::get("/mydb"), None).await.unwrap();
        assert_eq!(response.text().await.unwrap(), "OK");
        assert_eq!(second.attempts(), 2);
    }
}
