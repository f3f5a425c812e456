//! Request body for PUT/POST operations.
//!
//! The body kind is fixed when the request is built, so nothing downstream
//! branches on concrete payload types: [`RequestBody::content_length`] decides
//! between `Content-Length` and chunked framing, and [`BodyWrapper`] feeds
//! any variant to hyper.

use bytes::Bytes;
use http_body::{Body, Frame, SizeHint};
use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};

pub const JSON_UTF8: &str = "application/json; charset=utf-8";
const STREAM_CHUNK_SIZE: usize = 16 * 1024;

/// Source of a streamed body.
pub type BodyReader = Box<dyn AsyncRead + Send + Unpin>;

/// Request body for HTTP methods that send data.
#[derive(Default)]
pub enum RequestBody {
    /// No body (GET, HEAD, DELETE, COPY, bodiless PUT).
    #[default]
    Empty,
    /// UTF-8 JSON text.
    Text(String),
    /// In-memory entity with its own content type.
    Bytes { data: Bytes, content_type: String },
    /// Streamed entity. Unknown length means chunked transfer.
    Stream { reader: BodyReader, content_type: String, length: Option<u64> },
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestBody::Empty => f.write_str("Empty"),
            RequestBody::Text(text) => f.debug_tuple("Text").field(&text.len()).finish(),
            RequestBody::Bytes { data, content_type } => f
                .debug_struct("Bytes")
                .field("len", &data.len())
                .field("content_type", content_type)
                .finish(),
            RequestBody::Stream { content_type, length, .. } => f
                .debug_struct("Stream")
                .field("content_type", content_type)
                .field("length", length)
                .finish_non_exhaustive(),
        }
    }
}

impl From<String> for RequestBody {
    fn from(s: String) -> Self {
        RequestBody::Text(s)
    }
}

impl From<&str> for RequestBody {
    fn from(s: &str) -> Self {
        RequestBody::Text(s.to_owned())
    }
}

impl RequestBody {
    pub fn text(text: impl Into<String>) -> Self {
        RequestBody::Text(text.into())
    }

    pub fn bytes(data: impl Into<Bytes>, content_type: impl Into<String>) -> Self {
        RequestBody::Bytes { data: data.into(), content_type: content_type.into() }
    }

    pub fn stream<R>(reader: R, content_type: impl Into<String>, length: Option<u64>) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        RequestBody::Stream { reader: Box::new(reader), content_type: content_type.into(), length }
    }

    /// True when the body is known to carry no bytes.
    pub fn is_empty(&self) -> bool {
        self.content_length() == Some(0)
    }

    pub fn content_type(&self) -> Option<&str> {
        match self {
            RequestBody::Empty => None,
            RequestBody::Text(_) => Some(JSON_UTF8),
            RequestBody::Bytes { content_type, .. } | RequestBody::Stream { content_type, .. } => {
                Some(content_type)
            }
        }
    }

    /// Exact length when known up front. `None` selects chunked transfer.
    pub fn content_length(&self) -> Option<u64> {
        match self {
            RequestBody::Empty => Some(0),
            RequestBody::Text(text) => Some(text.len() as u64),
            RequestBody::Bytes { data, .. } => Some(data.len() as u64),
            RequestBody::Stream { length, .. } => *length,
        }
    }

    /// In-memory bodies can be sent again, streams cannot.
    pub fn is_replayable(&self) -> bool {
        !matches!(self, RequestBody::Stream { .. })
    }

    /// A copy for resending, if the body is replayable.
    pub fn try_clone(&self) -> Option<RequestBody> {
        match self {
            RequestBody::Empty => Some(RequestBody::Empty),
            RequestBody::Text(text) => Some(RequestBody::Text(text.clone())),
            RequestBody::Bytes { data, content_type } => Some(RequestBody::Bytes {
                data: data.clone(),
                content_type: content_type.clone(),
            }),
            RequestBody::Stream { .. } => None,
        }
    }

    pub fn into_body(self) -> BodyWrapper {
        let kind = match self {
            RequestBody::Empty => Kind::Empty,
            RequestBody::Text(text) => Kind::Full(Some(Bytes::from(text))),
            RequestBody::Bytes { data, .. } => Kind::Full(Some(data)),
            RequestBody::Stream { reader, length, .. } => Kind::Stream {
                reader,
                buf: vec![0; STREAM_CHUNK_SIZE],
                declared: length,
                sent: 0,
                done: false,
            },
        };
        BodyWrapper { kind }
    }
}

enum Kind {
    Empty,
    Full(Option<Bytes>),
    Stream { reader: BodyReader, buf: Vec<u8>, declared: Option<u64>, sent: u64, done: bool },
}

/// [`http_body::Body`] over a [`RequestBody`].
///
/// A stream that ends before its declared length, or runs past it, fails the
/// upload instead of sending a truncated or oversized entity.
pub struct BodyWrapper {
    kind: Kind,
}

impl BodyWrapper {
    pub fn empty() -> Self {
        Self { kind: Kind::Empty }
    }
}

impl Body for BodyWrapper {
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match &mut self.get_mut().kind {
            Kind::Empty => Poll::Ready(None),
            Kind::Full(data) => {
                Poll::Ready(data.take().filter(|b| !b.is_empty()).map(|b| Ok(Frame::data(b))))
            }
            Kind::Stream { done: true, .. } => Poll::Ready(None),
            Kind::Stream { reader, buf, declared, sent, done } => {
                let mut read_buf = ReadBuf::new(buf);
                match Pin::new(reader).poll_read(cx, &mut read_buf) {
                    Poll::Pending => Poll::Pending,
                    Poll::Ready(Err(e)) => {
                        *done = true;
                        Poll::Ready(Some(Err(e)))
                    }
                    Poll::Ready(Ok(())) => {
                        let filled = read_buf.filled();
                        if filled.is_empty() {
                            *done = true;
                            return match declared {
                                Some(expected) if *sent < *expected => {
                                    Poll::Ready(Some(Err(io::Error::new(
                                        io::ErrorKind::UnexpectedEof,
                                        format!("body ended after {sent} of {expected} bytes"),
                                    ))))
                                }
                                _ => Poll::Ready(None),
                            };
                        }
                        *sent += filled.len() as u64;
                        if let Some(expected) = declared {
                            if *sent > *expected {
                                *done = true;
                                return Poll::Ready(Some(Err(io::Error::new(
                                    io::ErrorKind::InvalidData,
                                    format!("body longer than declared {expected} bytes"),
                                ))));
                            }
                        }
                        Poll::Ready(Some(Ok(Frame::data(Bytes::copy_from_slice(filled)))))
                    }
                }
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        match &self.kind {
            Kind::Empty => true,
            Kind::Full(data) => data.as_ref().map_or(true, Bytes::is_empty),
            Kind::Stream { done, declared, .. } => *done || *declared == Some(0),
        }
    }

    fn size_hint(&self) -> SizeHint {
        match &self.kind {
            Kind::Empty => SizeHint::with_exact(0),
            Kind::Full(data) => SizeHint::with_exact(data.as_ref().map_or(0, |b| b.len() as u64)),
            Kind::Stream { declared: Some(n), sent, .. } => {
                SizeHint::with_exact(n.saturating_sub(*sent))
            }
            Kind::Stream { .. } => SizeHint::default(),
        }
    }
}
