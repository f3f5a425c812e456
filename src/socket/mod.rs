//! Socket and connection management.
//!
//! Provides connection pooling and socket handling mirroring Chromium's `net/socket/`:
//! - [`pool`]: Connection pooling (`max_connections` per endpoint and total)
//! - [`connectjob`]: DNS → TCP → TLS connection flow under the connect timeout
//! - [`tls`]: TLS configuration with BoringSSL
//! - [`authcache`]: Basic credentials and the per-call preemptive auth cache

pub mod authcache;
pub mod client;
pub mod connectjob;
pub mod pool;
pub mod tls;
