use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum NetError {
    // Generic
    #[error("Operation timed out")]
    TimedOut,

    // Connection Errors
    #[error("Connection closed (TCP FIN)")]
    ConnectionClosed,
    #[error("Connection reset (TCP RST)")]
    ConnectionReset,
    #[error("Connection refused")]
    ConnectionRefused,
    #[error("Connection aborted")]
    ConnectionAborted,
    #[error("Connection failed")]
    ConnectionFailed,
    #[error("Name not resolved")]
    NameNotResolved,
    #[error("SSL protocol error")]
    SslProtocolError,
    #[error("Connection timed out")]
    ConnectionTimedOut,
    #[error("SSL version or cipher mismatch")]
    SslVersionOrCipherMismatch,
    #[error("Bad SSL client auth cert")]
    BadSslClientAuthCert,

    // Certificate Errors
    #[error("Certificate common name invalid")]
    CertCommonNameInvalid,
    #[error("Certificate authority invalid")]
    CertAuthorityInvalid,

    // HTTP Errors
    #[error("Invalid URL")]
    InvalidUrl,
    #[error("Method not supported")]
    MethodNotSupported,
    #[error("Empty response")]
    EmptyResponse,
    #[error("Invalid HTTP response")]
    InvalidHttpResponse,
    #[error("Request body could not be sent")]
    UploadFailed,
    #[error("Invalid request header")]
    InvalidRequestHeader,
    #[error("Response body error")]
    HttpBodyError,
    #[error("Response body is not valid UTF-8")]
    InvalidUtf8,
    #[error("Response body is not valid JSON")]
    JsonParseError,
}

impl NetError {
    pub fn as_i32(&self) -> i32 {
        match self {
            NetError::TimedOut => -7,

            NetError::ConnectionClosed => -100,
            NetError::ConnectionReset => -101,
            NetError::ConnectionRefused => -102,
            NetError::ConnectionAborted => -103,
            NetError::ConnectionFailed => -104,
            NetError::NameNotResolved => -105,
            NetError::SslProtocolError => -107,
            NetError::SslVersionOrCipherMismatch => -113,
            NetError::BadSslClientAuthCert => -117,
            NetError::ConnectionTimedOut => -118,

            NetError::CertCommonNameInvalid => -200,
            NetError::CertAuthorityInvalid => -202,

            NetError::InvalidUrl => -300,
            NetError::MethodNotSupported => -322,
            NetError::EmptyResponse => -324,
            NetError::InvalidHttpResponse => -370,
            // Codes below -900 have no Chromium counterpart.
            NetError::UploadFailed => -905,
            NetError::InvalidRequestHeader => -906,
            NetError::HttpBodyError => -907,
            NetError::InvalidUtf8 => -908,
            NetError::JsonParseError => -909,
        }
    }

    /// Errors that indicate a pooled connection went stale before use.
    /// Requests failing this way on a reused connection may be replayed once.
    pub fn is_stale_connection(&self) -> bool {
        matches!(
            self,
            NetError::ConnectionClosed
                | NetError::ConnectionReset
                | NetError::ConnectionAborted
                | NetError::EmptyResponse
        )
    }
}

/// A network error kind together with the failure that caused it.
///
/// The kind is what callers match on; the source keeps the underlying I/O,
/// TLS or protocol error for diagnostics.
#[derive(Debug, Error)]
#[error("{kind}")]
pub struct NetFailure {
    kind: NetError,
    #[source]
    source: Option<BoxError>,
}

impl NetFailure {
    pub fn new(kind: NetError, source: impl Into<BoxError>) -> Self {
        Self { kind, source: Some(source.into()) }
    }

    pub fn kind(&self) -> NetError {
        self.kind
    }

    /// Classify a hyper client error.
    pub fn from_hyper(err: hyper::Error) -> Self {
        let kind = if err.is_timeout() {
            NetError::TimedOut
        } else if err.is_incomplete_message() {
            NetError::EmptyResponse
        } else if err.is_canceled() || err.is_closed() {
            NetError::ConnectionClosed
        } else if err.is_body_write_aborted() || err.is_user() {
            NetError::UploadFailed
        } else if err.is_parse() || err.is_parse_status() {
            NetError::InvalidHttpResponse
        } else {
            NetError::ConnectionReset
        };
        Self::new(kind, err)
    }
}

impl From<NetError> for NetFailure {
    fn from(kind: NetError) -> Self {
        Self { kind, source: None }
    }
}
