//! HTTP authentication for the database endpoint.
//!
//! A [`CredentialsProvider`] holds the one credentials set of a client, scoped
//! to the endpoint's host and port. An [`AuthCache`] records which scheme to
//! use preemptively for a scope. The cached route builds a fresh cache per
//! call, seeded with the Basic marker, so the first request already carries
//! `Authorization` and no auth state is shared between calls.
//!
//! Based on Chromium's HttpAuthCache.

use crate::config::{Credentials, Endpoint};
use base64::{engine::general_purpose, Engine as _};
use http::header::{HeaderValue, WWW_AUTHENTICATE};
use http::HeaderMap;
use std::collections::HashMap;
use zeroize::Zeroizing;

/// Authentication scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScheme {
    /// Basic authentication (base64 encoded)
    Basic,
}

impl AuthScheme {
    /// Scheme named by the first challenge of a `WWW-Authenticate` header set.
    pub fn from_challenge(headers: &HeaderMap) -> Option<Self> {
        headers.get_all(WWW_AUTHENTICATE).iter().find_map(|value| {
            let value = value.to_str().ok()?.trim_start();
            let name = value.split_whitespace().next()?;
            name.eq_ignore_ascii_case("basic").then_some(AuthScheme::Basic)
        })
    }
}

/// Host and port a credentials set applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AuthScope {
    host: String,
    port: u16,
}

impl AuthScope {
    pub fn new(host: &str, port: u16) -> Self {
        Self { host: host.to_ascii_lowercase(), port }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl From<&Endpoint> for AuthScope {
    fn from(endpoint: &Endpoint) -> Self {
        Self::new(endpoint.host(), endpoint.port())
    }
}

/// Credentials installed once at transport construction.
#[derive(Debug, Clone)]
pub struct CredentialsProvider {
    scope: AuthScope,
    credentials: Credentials,
}

impl CredentialsProvider {
    pub fn new(scope: AuthScope, credentials: Credentials) -> Self {
        Self { scope, credentials }
    }

    pub fn scope(&self) -> &AuthScope {
        &self.scope
    }

    /// Credentials for `scope`, if it is the scope this provider was built for.
    pub fn credentials_for(&self, scope: &AuthScope) -> Option<&Credentials> {
        (self.scope == *scope).then_some(&self.credentials)
    }

    /// `Authorization` value for `scheme` at `scope`.
    pub fn authorization(&self, scope: &AuthScope, scheme: AuthScheme) -> Option<HeaderValue> {
        let credentials = self.credentials_for(scope)?;
        match scheme {
            AuthScheme::Basic => basic_authorization(credentials),
        }
    }
}

/// `Basic base64(user:password)`, marked sensitive so it is never logged by http.
pub fn basic_authorization(credentials: &Credentials) -> Option<HeaderValue> {
    let header = Zeroizing::new(format!("Basic {}", basic_token(credentials).as_str()));
    let mut value = HeaderValue::from_str(&header).ok()?;
    value.set_sensitive(true);
    Some(value)
}

/// base64 of `user:password`, wiped on drop along with the raw pair.
fn basic_token(credentials: &Credentials) -> Zeroizing<String> {
    let raw = Zeroizing::new(format!("{}:{}", credentials.username(), credentials.password()));
    Zeroizing::new(general_purpose::STANDARD.encode(raw.as_bytes()))
}

/// Per-call record of the scheme to send preemptively for a scope.
#[derive(Debug, Default)]
pub struct AuthCache {
    entries: HashMap<AuthScope, AuthScheme>,
}

impl AuthCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// A cache holding the Basic marker for `scope`.
    pub fn preemptive_basic(scope: AuthScope) -> Self {
        let mut cache = Self::new();
        cache.put(scope, AuthScheme::Basic);
        cache
    }

    pub fn put(&mut self, scope: AuthScope, scheme: AuthScheme) {
        self.entries.insert(scope, scheme);
    }

    pub fn get(&self, scope: &AuthScope) -> Option<AuthScheme> {
        self.entries.get(scope).copied()
    }

    /// Preemptive `Authorization` value for `scope`, resolved through `provider`.
    pub fn authorization(
        &self,
        scope: &AuthScope,
        provider: &CredentialsProvider,
    ) -> Option<HeaderValue> {
        let scheme = self.get(scope)?;
        provider.authorization(scope, scheme)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
