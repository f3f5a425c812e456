//! Response body streaming.
//! Mirrors Chromium's HttpStream::ReadResponseBody.
//!
//! The body owns the lease on its connection. Reading it to the end checks
//! the connection back into the pool; dropping it early closes the connection.

use crate::base::neterror::{NetError, NetFailure};
use crate::http::streamfactory::HttpStream;
use crate::socket::pool::PoolSlot;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, StreamExt};
use http_body::Body as _;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use std::time::Duration;

/// Holds a pooled stream while its response body is being read.
#[derive(Debug)]
pub struct StreamLease {
    stream: HttpStream,
    slot: PoolSlot<HttpStream>,
}

impl StreamLease {
    pub fn new(stream: HttpStream, slot: PoolSlot<HttpStream>) -> Self {
        Self { stream, slot }
    }

    /// The exchange completed; the connection may serve another request.
    pub fn release(self) {
        self.slot.checkin(self.stream);
    }
}

enum Source {
    Network { incoming: Incoming, lease: Option<StreamLease>, read_timeout: Duration },
    Buffered(Option<Bytes>),
    Done,
}

/// Response body, read lazily.
pub struct ResponseBody {
    source: Source,
}

impl std::fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &self.source {
            Source::Network { .. } => "network",
            Source::Buffered(_) => "buffered",
            Source::Done => "done",
        };
        f.debug_struct("ResponseBody").field("source", &state).finish()
    }
}

impl ResponseBody {
    /// Body streamed from the connection; each chunk must arrive within
    /// `read_timeout`.
    pub fn streaming(incoming: Incoming, lease: StreamLease, read_timeout: Duration) -> Self {
        if incoming.is_end_stream() {
            lease.release();
            return Self { source: Source::Done };
        }
        Self { source: Source::Network { incoming, lease: Some(lease), read_timeout } }
    }

    /// Body already in memory, e.g. served from the response cache.
    pub fn from_bytes(bytes: Bytes) -> Self {
        Self { source: Source::Buffered(Some(bytes)) }
    }

    pub fn empty() -> Self {
        Self { source: Source::Done }
    }

    /// True once the whole body has been read.
    pub fn is_end(&self) -> bool {
        match &self.source {
            Source::Done => true,
            Source::Buffered(data) => data.as_ref().map_or(true, Bytes::is_empty),
            Source::Network { .. } => false,
        }
    }

    /// Next chunk of the body, `None` at the end.
    pub async fn chunk(&mut self) -> Result<Option<Bytes>, NetFailure> {
        loop {
            let (incoming, read_timeout) = match &mut self.source {
                Source::Done => return Ok(None),
                Source::Buffered(data) => {
                    let next = data.take().filter(|b| !b.is_empty());
                    self.source = Source::Done;
                    return Ok(next);
                }
                Source::Network { incoming, read_timeout, .. } => (incoming, *read_timeout),
            };

            let frame = match tokio::time::timeout(read_timeout, incoming.frame()).await {
                Ok(Some(Ok(frame))) => frame,
                Ok(None) => {
                    self.finish();
                    return Ok(None);
                }
                Ok(Some(Err(e))) => {
                    self.source = Source::Done;
                    return Err(NetFailure::new(NetError::HttpBodyError, e));
                }
                Err(elapsed) => {
                    self.source = Source::Done;
                    return Err(NetFailure::new(NetError::TimedOut, elapsed));
                }
            };

            // Trailers carry no payload.
            if let Ok(data) = frame.into_data() {
                if !data.is_empty() {
                    return Ok(Some(data));
                }
            }
        }
    }

    fn finish(&mut self) {
        if let Source::Network { lease, .. } = &mut self.source {
            if let Some(lease) = lease.take() {
                lease.release();
            }
        }
        self.source = Source::Done;
    }

    /// Read entire body as bytes.
    pub async fn bytes(mut self) -> Result<Bytes, NetFailure> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.chunk().await? {
            if buf.is_empty() && self.is_end() {
                return Ok(chunk);
            }
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }

    /// Read body as UTF-8 string.
    pub async fn text(self) -> Result<String, NetFailure> {
        let bytes = self.bytes().await?;
        String::from_utf8(bytes.to_vec()).map_err(|e| NetFailure::new(NetError::InvalidUtf8, e))
    }

    /// Read body as JSON, deserializing to type T.
    #[cfg(feature = "json")]
    pub async fn json<T: serde::de::DeserializeOwned>(self) -> Result<T, NetFailure> {
        let bytes = self.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| NetFailure::new(NetError::JsonParseError, e))
    }

    /// The body as a stream of chunks. Ends after the first error.
    pub fn into_stream(self) -> BoxStream<'static, Result<Bytes, NetFailure>> {
        stream::unfold(self, |mut body| async move {
            match body.chunk().await {
                Ok(Some(chunk)) => Some((Ok(chunk), body)),
                Ok(None) => None,
                Err(e) => Some((Err(e), body)),
            }
        })
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    #[tokio::test]
    async fn test_buffered_body() {
        let body = ResponseBody::from_bytes(Bytes::from_static(b"{\"ok\":true}"));
        assert!(!body.is_end());
        let value: serde_json::Value = body.json().await.unwrap();
        assert_eq!(value["ok"], true);
    }

    #[tokio::test]
    async fn test_buffered_stream_yields_once() {
        let chunks: Vec<Bytes> =
            ResponseBody::from_bytes(Bytes::from_static(b"abc")).into_stream().try_collect().await.unwrap();
        assert_eq!(chunks, vec![Bytes::from_static(b"abc")]);
    }

    #[tokio::test]
    async fn test_empty_body() {
        let mut body = ResponseBody::empty();
        assert!(body.is_end());
        assert_eq!(body.chunk().await.unwrap(), None);
        assert_eq!(ResponseBody::empty().text().await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_invalid_utf8() {
        let err = ResponseBody::from_bytes(Bytes::from_static(&[0xff, 0xfe])).text().await.unwrap_err();
        assert_eq!(err.kind(), NetError::InvalidUtf8);
    }

    #[tokio::test]
    async fn test_invalid_json() {
        let err = ResponseBody::from_bytes(Bytes::from_static(b"not json"))
            .json::<serde_json::Value>()
            .await
            .unwrap_err();
        assert_eq!(err.kind(), NetError::JsonParseError);
    }
}
