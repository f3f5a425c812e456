//! Request construction.
//!
//! A [`Request`] is built fresh for every call from a verb, a path and an
//! optional body, then turned into an `http::Request` right before it goes on
//! the wire.

use crate::base::neterror::{NetError, NetFailure};
use crate::config::Endpoint;
use crate::http::requestbody::{BodyWrapper, RequestBody};
use http::header::{
    HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE,
    EXPECT, HOST,
};
use http::Method;
use std::fmt;
use std::time::Duration;

pub const DESTINATION: HeaderName = HeaderName::from_static("destination");

/// HTTP verbs used against the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Get,
    Head,
    Put,
    Post,
    Delete,
    /// Non-standard `COPY`, target named by the `Destination` header.
    Copy,
}

impl Verb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Get => "GET",
            Verb::Head => "HEAD",
            Verb::Put => "PUT",
            Verb::Post => "POST",
            Verb::Delete => "DELETE",
            Verb::Copy => "COPY",
        }
    }

    pub fn method(&self) -> Result<Method, NetFailure> {
        Ok(match self {
            Verb::Get => Method::GET,
            Verb::Head => Method::HEAD,
            Verb::Put => Method::PUT,
            Verb::Post => Method::POST,
            Verb::Delete => Method::DELETE,
            Verb::Copy => Method::from_bytes(b"COPY")
                .map_err(|e| NetFailure::new(NetError::MethodNotSupported, e))?,
        })
    }

    /// PUT and POST carry an entity; the others never do.
    pub fn has_body(&self) -> bool {
        matches!(self, Verb::Put | Verb::Post)
    }

    /// Verbs that change server state.
    pub fn is_unsafe(&self) -> bool {
        matches!(self, Verb::Put | Verb::Post | Verb::Delete | Verb::Copy)
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Method, path and endpoint of the request a response answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub verb: Verb,
    pub path: String,
    pub endpoint: Endpoint,
}

impl fmt::Display for RequestLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.verb, self.path)
    }
}

/// A request to the database, built per call and never reused.
#[derive(Debug)]
pub struct Request {
    verb: Verb,
    path: String,
    headers: HeaderMap,
    body: RequestBody,
    timeout: Option<Duration>,
}

impl Request {
    fn new(verb: Verb, path: impl Into<String>, body: RequestBody) -> Self {
        let body = if verb.has_body() { body } else { RequestBody::Empty };
        Self { verb, path: path.into(), headers: HeaderMap::new(), body, timeout: None }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Verb::Get, path, RequestBody::Empty)
    }

    pub fn head(path: impl Into<String>) -> Self {
        Self::new(Verb::Head, path, RequestBody::Empty)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Verb::Delete, path, RequestBody::Empty)
    }

    pub fn put(path: impl Into<String>, body: impl Into<RequestBody>) -> Self {
        Self::new(Verb::Put, path, body.into())
    }

    pub fn post(path: impl Into<String>, body: impl Into<RequestBody>) -> Self {
        Self::new(Verb::Post, path, body.into())
    }

    /// `COPY source` with `Destination: destination`.
    pub fn copy(source: impl Into<String>, destination: &str) -> Result<Self, NetFailure> {
        let destination = HeaderValue::from_str(destination)
            .map_err(|e| NetFailure::new(NetError::InvalidRequestHeader, e))?;
        let mut request = Self::new(Verb::Copy, source, RequestBody::Empty);
        request.headers.insert(DESTINATION.clone(), destination);
        Ok(request)
    }

    /// Merge caller headers. A caller header replaces every default of the
    /// same name.
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        merge_headers(&mut self.headers, headers);
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Deadline for the exchange up to response headers.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn verb(&self) -> Verb {
        self.verb
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &RequestBody {
        &self.body
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// True when the caller set headers beyond those the verb implies.
    pub fn has_caller_headers(&self) -> bool {
        self.headers.keys().any(|name| *name != DESTINATION)
    }

    pub fn request_line(&self, endpoint: &Endpoint) -> RequestLine {
        RequestLine { verb: self.verb, path: self.path.clone(), endpoint: endpoint.clone() }
    }

    /// A copy for resending, unless the body is a stream.
    pub fn try_clone(&self) -> Option<Request> {
        Some(Request {
            verb: self.verb,
            path: self.path.clone(),
            headers: self.headers.clone(),
            body: self.body.try_clone()?,
            timeout: self.timeout,
        })
    }

    /// Origin-form request target.
    fn target(&self) -> String {
        if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        }
    }

    /// Build the wire request: defaults first, then entity headers, then
    /// credentials, then the caller's headers on top.
    pub fn into_http(
        self,
        endpoint: &Endpoint,
        use_expect_continue: bool,
        authorization: Option<HeaderValue>,
    ) -> Result<http::Request<BodyWrapper>, NetFailure> {
        let invalid_header = |e: http::header::InvalidHeaderValue| {
            NetFailure::new(NetError::InvalidRequestHeader, e)
        };

        let mut builder = http::Request::builder().method(self.verb.method()?).uri(self.target());
        let headers = builder
            .headers_mut()
            .ok_or_else(|| NetFailure::from(NetError::InvalidUrl))?;

        let host = HeaderValue::from_str(&endpoint.authority()).map_err(invalid_header)?;
        headers.insert(HOST, host);
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        if self.verb.has_body() {
            if let Some(content_type) = self.body.content_type() {
                let content_type = HeaderValue::from_str(content_type).map_err(invalid_header)?;
                headers.insert(CONTENT_TYPE, content_type);
            }
            if let Some(length) = self.body.content_length() {
                headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
            }
            if use_expect_continue && !self.body.is_empty() {
                headers.insert(EXPECT, HeaderValue::from_static("100-continue"));
            }
        }

        if let Some(value) = authorization {
            headers.insert(AUTHORIZATION, value);
        }

        merge_headers(headers, self.headers);

        builder
            .body(self.body.into_body())
            .map_err(|e| NetFailure::new(NetError::InvalidUrl, e))
    }
}

/// Copy `source` into `target`; each name in `source` replaces all values
/// `target` had for it.
fn merge_headers(target: &mut HeaderMap, source: HeaderMap) {
    for name in source.keys() {
        target.remove(name);
    }
    for (name, value) in &source {
        target.append(name.clone(), value.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> Endpoint {
        Endpoint::http("db.example", 5984)
    }

    #[test]
    fn test_bodiless_verbs_drop_body() {
        for request in [
            Request::get("/db/doc"),
            Request::head("/db/doc"),
            Request::delete("/db/doc"),
            Request::copy("/db/doc", "/db/doc2").unwrap(),
        ] {
            assert!(request.body().is_empty(), "{} has a body", request.verb());
            let http = request.into_http(&endpoint(), true, None).unwrap();
            assert!(http.headers().get(CONTENT_LENGTH).is_none());
            assert!(http.headers().get(EXPECT).is_none());
        }
    }

    #[test]
    fn test_text_put_headers() {
        let http = Request::put("/db/doc1", "{\"a\":1}").into_http(&endpoint(), true, None).unwrap();
        assert_eq!(http.method(), Method::PUT);
        assert_eq!(http.uri(), "/db/doc1");
        assert_eq!(http.headers()[CONTENT_TYPE], "application/json; charset=utf-8");
        assert_eq!(http.headers()[CONTENT_LENGTH], "7");
        assert_eq!(http.headers()[EXPECT], "100-continue");
        assert_eq!(http.headers()[HOST], "db.example:5984");
        assert_eq!(http.headers()[ACCEPT], "application/json");
    }

    #[test]
    fn test_empty_put_has_zero_length_and_no_expect() {
        let http = Request::put("/db", RequestBody::Empty).into_http(&endpoint(), true, None).unwrap();
        assert_eq!(http.headers()[CONTENT_LENGTH], "0");
        assert!(http.headers().get(EXPECT).is_none());
        assert!(http.headers().get(CONTENT_TYPE).is_none());
    }

    #[test]
    fn test_stream_without_length_has_no_content_length() {
        let body = RequestBody::stream(&b"data"[..], "application/octet-stream", None);
        let http = Request::put("/db/doc/att", body).into_http(&endpoint(), false, None).unwrap();
        assert!(http.headers().get(CONTENT_LENGTH).is_none());
        assert!(http.headers().get(EXPECT).is_none());
        assert_eq!(http.headers()[CONTENT_TYPE], "application/octet-stream");
    }

    #[test]
    fn test_copy_destination() {
        let request = Request::copy("/db/a", "/db/b").unwrap();
        assert!(!request.has_caller_headers());
        let http = request.into_http(&endpoint(), true, None).unwrap();
        assert_eq!(http.method().as_str(), "COPY");
        assert_eq!(http.headers()[&DESTINATION], "/db/b");
    }

    #[test]
    fn test_caller_headers_override_defaults() {
        let mut extra = HeaderMap::new();
        extra.insert(ACCEPT, HeaderValue::from_static("text/plain"));
        extra.insert("x-couch-full-commit", HeaderValue::from_static("false"));
        let request = Request::get("/db/doc").with_headers(extra);
        assert!(request.has_caller_headers());

        let http = request
            .into_http(&endpoint(), true, Some(HeaderValue::from_static("Basic abc")))
            .unwrap();
        assert_eq!(http.headers().get_all(ACCEPT).iter().count(), 1);
        assert_eq!(http.headers()[ACCEPT], "text/plain");
        assert_eq!(http.headers()["x-couch-full-commit"], "false");
        assert_eq!(http.headers()[AUTHORIZATION], "Basic abc");
    }

    #[test]
    fn test_relative_path_gets_leading_slash() {
        let http = Request::get("db/_all_docs?limit=1").into_http(&endpoint(), true, None).unwrap();
        assert_eq!(http.uri(), "/db/_all_docs?limit=1");
    }

    #[test]
    fn test_request_line_display() {
        let line = Request::put("/db/doc1", "{}").request_line(&endpoint());
        assert_eq!(line.to_string(), "PUT /db/doc1");
    }

    #[test]
    fn test_try_clone_refuses_streams() {
        assert!(Request::post("/db", "{}").try_clone().is_some());
        let stream = RequestBody::stream(&b"x"[..], "x/y", Some(1));
        assert!(Request::put("/db/d/a", stream).try_clone().is_none());
    }
}
