//! HTTP Response with body access.

use crate::base::neterror::NetFailure;
use crate::http::request::RequestLine;
use crate::http::responsebody::ResponseBody;
use bytes::Bytes;
use futures::stream::BoxStream;
use http::header::{AsHeaderName, CONTENT_LENGTH, CONTENT_TYPE, ETAG};
use http::{HeaderMap, StatusCode};
use hyper::ext::ReasonPhrase;
use std::fmt;

/// A database response: status line, headers, lazily read body and the
/// request it answers.
///
/// Any status is a valid response. A 409 is returned to the caller like a
/// 200; only failures to get a response at all are errors.
pub struct Response {
    status: StatusCode,
    reason: String,
    headers: HeaderMap,
    etag: Option<String>,
    request: RequestLine,
    body: Option<ResponseBody>,
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("request", &self.request)
            .field("etag", &self.etag)
            .finish_non_exhaustive()
    }
}

impl Response {
    /// Adapt a hyper response head. The reason phrase comes from the wire
    /// when the server sent one.
    pub fn from_parts(
        parts: http::response::Parts,
        body: ResponseBody,
        request: RequestLine,
    ) -> Self {
        let reason = parts
            .extensions
            .get::<ReasonPhrase>()
            .and_then(|r| std::str::from_utf8(r.as_bytes()).ok())
            .map(str::to_string);
        Self::new(parts.status, reason, parts.headers, body, request)
    }

    pub fn new(
        status: StatusCode,
        reason: Option<String>,
        headers: HeaderMap,
        body: ResponseBody,
        request: RequestLine,
    ) -> Self {
        let reason = reason
            .or_else(|| status.canonical_reason().map(str::to_string))
            .unwrap_or_default();
        let etag = parse_etag(&headers);
        Self { status, reason, headers, etag, request, body: Some(body) }
    }

    /// Get the status code.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn status_code(&self) -> u16 {
        self.status.as_u16()
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Get a reference to the headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn header(&self, name: impl AsHeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Revision validator without quotes or weak prefix. `None` when the
    /// server sent no ETag.
    pub fn etag(&self) -> Option<&str> {
        self.etag.as_deref()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header(CONTENT_TYPE)
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header(CONTENT_LENGTH).and_then(|v| v.trim().parse().ok())
    }

    /// The request this response answers.
    pub fn request(&self) -> &RequestLine {
        &self.request
    }

    /// `"PUT /db/doc1 failed: 409 Conflict"`, for callers turning a status
    /// into their own error.
    pub fn failure_message(&self) -> String {
        format!("{} failed: {} {}", self.request, self.status.as_u16(), self.reason)
    }

    /// Take the response body for consumption.
    /// Can only be called once - subsequent calls return None.
    pub fn take_body(&mut self) -> Option<ResponseBody> {
        self.body.take()
    }

    /// Next body chunk, `None` at the end.
    pub async fn chunk(&mut self) -> Result<Option<Bytes>, NetFailure> {
        match self.body.as_mut() {
            Some(body) => body.chunk().await,
            None => Ok(None),
        }
    }

    /// Consume body as bytes.
    pub async fn bytes(mut self) -> Result<Bytes, NetFailure> {
        self.body.take().unwrap_or_else(ResponseBody::empty).bytes().await
    }

    /// Consume body as text.
    pub async fn text(mut self) -> Result<String, NetFailure> {
        self.body.take().unwrap_or_else(ResponseBody::empty).text().await
    }

    /// Consume body as JSON.
    #[cfg(feature = "json")]
    pub async fn json<T: serde::de::DeserializeOwned>(mut self) -> Result<T, NetFailure> {
        self.body.take().unwrap_or_else(ResponseBody::empty).json().await
    }

    pub fn into_stream(mut self) -> BoxStream<'static, Result<Bytes, NetFailure>> {
        self.body.take().unwrap_or_else(ResponseBody::empty).into_stream()
    }

    /// Status line and headers with a replacement body.
    pub(crate) fn with_body(mut self, body: ResponseBody) -> Self {
        self.body = Some(body);
        self
    }
}

fn parse_etag(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(ETAG)?.to_str().ok()?.trim();
    let raw = raw.strip_prefix("W/").unwrap_or(raw);
    let raw = raw.strip_prefix('"').and_then(|r| r.strip_suffix('"')).unwrap_or(raw);
    Some(raw.to_string())
}
