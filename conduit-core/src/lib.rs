//! Conduit Core
//!
//! Runtime-agnostic building blocks shared by every Conduit crate:
//! - Readiness-based reactor and async I/O handle (`reactor`, `io_handle`)
//! - The stream contract all adapters and transports implement (`stream`)
//! - Runtime context: executor, sockets, pipes, stdio, signals (`context`)
//! - Peer name parsing/resolution (`peername`)
//! - Stream adapters: length-limited, chunked transfer-coding (`limited`, `chunked`)
//! - Delimiter/exact-length read helpers built on streaming KMP (`reader`, `kmp`)
//! - Multi-producer writer with a single in-flight write invariant (`writer`)
//! - TLS record-layer adapter (`tls`)
//! - Error types (`error`)

pub mod chunked;
pub mod context;
pub mod error;
pub mod io_handle;
pub mod kmp;
pub mod limited;
pub mod peername;
pub mod reactor;
pub mod reader;
pub mod socket_stream;
pub mod stream;
pub mod timeout;
pub mod tls;
pub mod writer;

// `test_support/memstream.rs` is `include!`-ed directly into each test
// module that needs it rather than declared as a module here.

/// A small prelude to make downstream crates ergonomic.
pub mod prelude {
    pub use crate::chunked::{ChunkedStream, ExtensionPolicy};
    pub use crate::context::{Listener, Runtime};
    pub use crate::error::{ConduitError, Result};
    pub use crate::limited::{LimitedStream, ShortWriteEofPolicy};
    pub use crate::peername::{GroupId, PeerName};
    pub use crate::reader::{read_exact, read_until, ReadExactOutcome, ReadUntilOutcome};
    pub use crate::socket_stream::SocketStream;
    pub use crate::stream::{NullStream, SharedStream, Stream};
    pub use crate::timeout::Timeouts;
    pub use crate::tls::TlsStream;
    pub use crate::writer::MultiWriter;
}
