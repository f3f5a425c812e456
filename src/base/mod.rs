//! Base types and error handling.
//!
//! - [`NetError`](neterror::NetError): network error codes in the style of
//!   Chromium's `net_error_list.h`
//! - [`ClientError`](error::ClientError): the taxonomy callers see
//! - [`ClientState`](lifecycle::ClientState): the client lifecycle

pub mod context;
pub mod error;
pub mod lifecycle;
pub mod neterror;
