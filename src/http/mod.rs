//! HTTP layer: requests, responses, transactions and dispatch.
//!
//! - [`request`] / [`requestbody`]: verbs, request construction and bodies
//! - [`streamfactory`]: transport construction and pooled HTTP/1.1 streams
//! - [`transaction`]: one exchange on a stream
//! - [`response`] / [`responsebody`]: status, headers, ETag and a lazy body
//! - [`httpcache`]: response cache for the cached route
//! - [`dispatcher`]: route selection and error wrapping

pub mod dispatcher;
pub mod httpcache;
pub mod request;
pub mod requestbody;
pub mod response;
pub mod responsebody;
pub mod streamfactory;
pub mod transaction;

// Re-exports for convenience
pub use dispatcher::{Dispatcher, Route};
pub use request::{Request, RequestLine, Verb};
pub use requestbody::RequestBody;
pub use response::Response;
pub use responsebody::ResponseBody;
pub use streamfactory::{Transport, TransportBuilder};
