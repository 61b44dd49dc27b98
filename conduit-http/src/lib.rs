//! Conduit HTTP
//!
//! HTTP/1.x built on `conduit-core`'s stream contract:
//! - Shared types: methods, status codes, MIME types, header map, query (`common`)
//! - RFC 1123 `Date` header formatting (`date`)
//! - Server-side request/response state machine (`server`)
//! - Client-side request/response state machine (`client`)
//! - Prefix-routed server dispatcher (`dispatch`)

pub mod client;
pub mod common;
pub mod date;
pub mod dispatch;
pub mod server;

/// A small prelude to make downstream crates ergonomic.
pub mod prelude {
    pub use crate::client::{HttpClientRequest, HttpClientResponse};
    pub use crate::common::{forwarded_for, ContentType, Cookies, HeaderMap, Method, Query, Status, Version};
    pub use crate::dispatch::{Dispatcher, ErrorHandler, Handler, Tracing};
    pub use crate::server::{HttpServerRequest, LoadOutcome};
}
