//! Client configuration.
//!
//! [`ClientConfig`] is the inbound contract: every field has the documented
//! default and the struct can be deserialized with serde by whatever layer
//! loads settings. [`ClientConfig::resolve`] validates it and produces the
//! immutable pieces the transport is built from.

use crate::base::error::ClientError;
use boring::ssl::SslVersion;
use boring::x509::X509Ref;
use percent_encoding::percent_decode_str;
use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use url::Url;
use zeroize::Zeroize;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 5984;
pub const DEFAULT_MAX_CONNECTIONS: usize = 20;
pub const DEFAULT_CONNECTION_TIMEOUT_MS: u64 = 1000;
pub const DEFAULT_SOCKET_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_MAX_CACHE_ENTRIES: usize = 1000;
pub const DEFAULT_MAX_OBJECT_SIZE_BYTES: usize = 8192;

/// URL scheme of the database endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// Network identity of the database server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    scheme: Scheme,
    host: String,
    port: u16,
}

impl Endpoint {
    pub fn new(scheme: Scheme, host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .map(str::to_string)
            .unwrap_or(host);
        Self { scheme, host, port }
    }

    pub fn http(host: impl Into<String>, port: u16) -> Self {
        Self::new(Scheme::Http, host, port)
    }

    pub fn https(host: impl Into<String>, port: u16) -> Self {
        Self::new(Scheme::Https, host, port)
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_tls(&self) -> bool {
        self.scheme == Scheme::Https
    }

    /// `host:port`, with IPv6 literals bracketed.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme.as_str(), self.authority())
    }
}

/// A password or store passphrase. Wiped from memory on drop and never
/// printed by `Debug`.
#[derive(Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Drop for Secret {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Username/password pair for Basic authentication against one endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    username: String,
    password: Secret,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<Secret>) -> Self {
        Self { username: username.into(), password: password.into() }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        self.password.expose()
    }
}

/// TLS protocol versions that may be pinned for negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum TlsVersion {
    #[serde(rename = "TLSv1")]
    Tls1_0,
    #[serde(rename = "TLSv1.1")]
    Tls1_1,
    #[default]
    #[serde(rename = "TLSv1.2")]
    Tls1_2,
    #[serde(rename = "TLSv1.3")]
    Tls1_3,
}

impl TlsVersion {
    pub fn to_ssl_version(self) -> SslVersion {
        match self {
            TlsVersion::Tls1_0 => SslVersion::TLS1,
            TlsVersion::Tls1_1 => SslVersion::TLS1_1,
            TlsVersion::Tls1_2 => SslVersion::TLS1_2,
            TlsVersion::Tls1_3 => SslVersion::TLS1_3,
        }
    }
}

/// Location of a certificate store on disk.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StoreLocation {
    pub path: PathBuf,
    #[serde(default)]
    pub password: Secret,
}

impl StoreLocation {
    pub fn new(path: impl Into<PathBuf>, password: impl Into<Secret>) -> Self {
        Self { path: path.into(), password: password.into() }
    }
}

type HostnamePredicate = dyn Fn(&str, &X509Ref) -> bool + Send + Sync;

/// Hostname verification policy applied after the TLS handshake.
#[derive(Clone, Default)]
pub enum HostnameVerification {
    /// The certificate must match the endpoint host.
    #[default]
    Strict,
    /// Any hostname is accepted. Opt-in only.
    AllowAll,
    /// Caller supplied predicate over the hostname and the peer certificate.
    Custom(Arc<HostnamePredicate>),
}

impl HostnameVerification {
    pub fn custom<F>(predicate: F) -> Self
    where
        F: Fn(&str, &X509Ref) -> bool + Send + Sync + 'static,
    {
        HostnameVerification::Custom(Arc::new(predicate))
    }
}

impl fmt::Debug for HostnameVerification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostnameVerification::Strict => f.write_str("Strict"),
            HostnameVerification::AllowAll => f.write_str("AllowAll"),
            HostnameVerification::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Resolved TLS settings for an https endpoint.
#[derive(Debug, Clone, Default)]
pub struct TlsSettings {
    pub protocol: TlsVersion,
    pub trust_store: Option<StoreLocation>,
    pub key_store: Option<StoreLocation>,
    /// Accept server chains made of a single self-signed certificate.
    pub trust_self_signed: bool,
    pub hostname_verification: HostnameVerification,
}

/// Immutable transport settings, consumed once by the transport builder.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub max_connections: usize,
    pub connect_timeout: Duration,
    pub socket_timeout: Duration,
    pub use_expect_continue: bool,
    pub cleanup_idle_connections: bool,
    pub tls: Option<TlsSettings>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            connect_timeout: Duration::from_millis(DEFAULT_CONNECTION_TIMEOUT_MS),
            socket_timeout: Duration::from_millis(DEFAULT_SOCKET_TIMEOUT_MS),
            use_expect_continue: true,
            cleanup_idle_connections: true,
            tls: None,
        }
    }
}

/// Limits of the in-memory response cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSettings {
    pub max_entries: usize,
    pub max_object_size: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_CACHE_ENTRIES,
            max_object_size: DEFAULT_MAX_OBJECT_SIZE_BYTES,
        }
    }
}

/// Inbound configuration contract.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// `http[s]://[user:pass@]host[:port]`; overrides host, port, scheme and
    /// credentials when set.
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub max_connections: usize,
    /// Milliseconds.
    pub connection_timeout: u64,
    /// Milliseconds.
    pub socket_timeout: u64,
    pub cleanup_idle_connections: bool,
    pub enable_ssl: bool,
    pub relaxed_ssl_settings: bool,
    pub trust_self_signed: bool,
    pub trust_store: Option<StoreLocation>,
    pub key_store: Option<StoreLocation>,
    pub tls_protocol: TlsVersion,
    pub username: Option<String>,
    pub password: Option<Secret>,
    pub caching: bool,
    pub max_cache_entries: usize,
    pub max_object_size_bytes: usize,
    pub use_expect_continue: bool,
    pub test_connection_at_startup: bool,
    /// Read by view-refresh collaborators; the client itself does not use it.
    pub auto_update_view_on_change: bool,
    #[serde(skip)]
    pub hostname_verification: Option<HostnameVerification>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT_MS,
            socket_timeout: DEFAULT_SOCKET_TIMEOUT_MS,
            cleanup_idle_connections: true,
            enable_ssl: false,
            relaxed_ssl_settings: false,
            trust_self_signed: false,
            trust_store: None,
            key_store: None,
            tls_protocol: TlsVersion::default(),
            username: None,
            password: None,
            caching: true,
            max_cache_entries: DEFAULT_MAX_CACHE_ENTRIES,
            max_object_size_bytes: DEFAULT_MAX_OBJECT_SIZE_BYTES,
            use_expect_continue: true,
            test_connection_at_startup: false,
            auto_update_view_on_change: false,
            hostname_verification: None,
        }
    }
}

/// Output of [`ClientConfig::resolve`].
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub endpoint: Endpoint,
    pub transport: TransportConfig,
    pub credentials: Option<Credentials>,
    pub cache: Option<CacheSettings>,
}

impl ClientConfig {
    /// Validate the settings and derive endpoint, transport, credentials and
    /// cache limits.
    pub fn resolve(&self) -> Result<ResolvedConfig, ClientError> {
        let (endpoint, url_credentials) = self.resolve_endpoint()?;

        if self.max_connections == 0 {
            return Err(ClientError::configuration("max_connections must be at least 1"));
        }
        if self.connection_timeout == 0 || self.socket_timeout == 0 {
            return Err(ClientError::configuration(
                "connection_timeout and socket_timeout must be positive",
            ));
        }

        let credentials = match (&self.username, &self.password) {
            (Some(user), password) => Some(Credentials::new(
                user.clone(),
                password.clone().unwrap_or_default(),
            )),
            (None, Some(_)) => {
                return Err(ClientError::configuration("password given without username"));
            }
            (None, None) => url_credentials,
        };

        let tls = if endpoint.is_tls() {
            Some(self.tls_settings())
        } else {
            if self.trust_store.is_some() || self.key_store.is_some() {
                return Err(ClientError::configuration(format!(
                    "trust/key store configured but {endpoint} does not use TLS"
                )));
            }
            if self.relaxed_ssl_settings {
                tracing::warn!(endpoint = %endpoint, "relaxed_ssl_settings ignored without TLS");
            }
            None
        };

        let transport = TransportConfig {
            max_connections: self.max_connections,
            connect_timeout: Duration::from_millis(self.connection_timeout),
            socket_timeout: Duration::from_millis(self.socket_timeout),
            use_expect_continue: self.use_expect_continue,
            cleanup_idle_connections: self.cleanup_idle_connections,
            tls,
        };

        let cache = (self.caching && self.max_cache_entries > 0).then(|| CacheSettings {
            max_entries: self.max_cache_entries,
            max_object_size: self.max_object_size_bytes,
        });

        Ok(ResolvedConfig { endpoint, transport, credentials, cache })
    }

    fn resolve_endpoint(&self) -> Result<(Endpoint, Option<Credentials>), ClientError> {
        let Some(raw) = self.url.as_deref().filter(|u| !u.trim().is_empty()) else {
            let scheme = if self.enable_ssl { Scheme::Https } else { Scheme::Http };
            if self.host.trim().is_empty() {
                return Err(ClientError::configuration("host must not be empty"));
            }
            return Ok((Endpoint::new(scheme, self.host.trim(), self.port), None));
        };

        let url = Url::parse(raw.trim())
            .map_err(|e| ClientError::configuration_with(format!("invalid url {raw:?}"), e))?;
        let scheme = match url.scheme() {
            "http" if self.enable_ssl => Scheme::Https,
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            other => {
                return Err(ClientError::configuration(format!(
                    "unsupported url scheme {other:?}, expected http or https"
                )));
            }
        };
        let host = url
            .host_str()
            .ok_or_else(|| ClientError::configuration(format!("url {raw:?} has no host")))?;
        let port = url.port_or_known_default().unwrap_or(DEFAULT_PORT);

        let credentials = if url.username().is_empty() {
            None
        } else {
            let decode = |s: &str| percent_decode_str(s).decode_utf8_lossy().into_owned();
            Some(Credentials::new(
                decode(url.username()),
                decode(url.password().unwrap_or_default()),
            ))
        };

        Ok((Endpoint::new(scheme, host, port), credentials))
    }

    fn tls_settings(&self) -> TlsSettings {
        let hostname_verification = match &self.hostname_verification {
            Some(policy) => policy.clone(),
            None if self.relaxed_ssl_settings => HostnameVerification::AllowAll,
            None => HostnameVerification::Strict,
        };
        TlsSettings {
            protocol: self.tls_protocol,
            trust_store: self.trust_store.clone(),
            key_store: self.key_store.clone(),
            trust_self_signed: self.trust_self_signed || self.relaxed_ssl_settings,
            hostname_verification,
        }
    }

    /// Dump the effective settings at debug level. The password is never logged.
    pub fn log_settings(&self) {
        tracing::debug!(host = %self.host, port = self.port, url = ?self.url, "endpoint settings");
        tracing::debug!(
            max_connections = self.max_connections,
            connection_timeout = self.connection_timeout,
            socket_timeout = self.socket_timeout,
            cleanup_idle_connections = self.cleanup_idle_connections,
            use_expect_continue = self.use_expect_continue,
            "transport settings"
        );
        tracing::debug!(
            enable_ssl = self.enable_ssl,
            relaxed_ssl_settings = self.relaxed_ssl_settings,
            tls_protocol = ?self.tls_protocol,
            trust_store = ?self.trust_store.as_ref().map(|s| &s.path),
            key_store = ?self.key_store.as_ref().map(|s| &s.path),
            "tls settings"
        );
        tracing::debug!(
            caching = self.caching,
            max_cache_entries = self.max_cache_entries,
            max_object_size_bytes = self.max_object_size_bytes,
            test_connection_at_startup = self.test_connection_at_startup,
            auto_update_view_on_change = self.auto_update_view_on_change,
            username = ?self.username,
            "client settings"
        );
    }
}
