//! Ergonomic error context helpers.
//!
//! Provides extension traits for attaching a `NetError` kind to `Result`
//! types while keeping the original error as the source.

use crate::base::neterror::{NetError, NetFailure};
use std::io;

/// Extension trait for adding context to IO Results.
pub trait IoResultExt<T> {
    /// Classify a connect failure by its `io::ErrorKind`.
    ///
    /// # Example
    /// ```ignore
    /// use couchnet::base::context::IoResultExt;
    ///
    /// let stream = TcpStream::connect(addr).await.connection_context()?;
    /// // Error kind: NetError::ConnectionRefused, source: the io::Error
    /// ```
    fn connection_context(self) -> Result<T, NetFailure>;

    /// Attach a fixed kind to any IO error.
    fn net_context(self, kind: NetError) -> Result<T, NetFailure>;
}

impl<T> IoResultExt<T> for Result<T, io::Error> {
    fn connection_context(self) -> Result<T, NetFailure> {
        self.map_err(|e| {
            let kind = match e.kind() {
                io::ErrorKind::ConnectionRefused => NetError::ConnectionRefused,
                io::ErrorKind::ConnectionReset => NetError::ConnectionReset,
                io::ErrorKind::ConnectionAborted => NetError::ConnectionAborted,
                io::ErrorKind::TimedOut => NetError::ConnectionTimedOut,
                _ => NetError::ConnectionFailed,
            };
            NetFailure::new(kind, e)
        })
    }

    fn net_context(self, kind: NetError) -> Result<T, NetFailure> {
        self.map_err(|e| NetFailure::new(kind, e))
    }
}
