//! HTTP surface: request context, admission middleware and the server.

pub mod admission;
pub mod context;
mod response;
mod server;

pub use admission::{admission, derive_key, AdmissionState, Principal};
pub use context::{request_context, RequestId};
pub use response::{ErrorDetail, ErrorEnvelope};
pub use server::HttpServer;
