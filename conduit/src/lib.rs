//! # Conduit
//!
//! An asynchronous network I/O runtime and composable stream toolkit.
//!
//! ## Architecture
//!
//! Conduit is structured as a small kernel with optional protocol layers:
//!
//! - **`conduit-core`**: readiness-based reactor, async I/O handle, the
//!   `Stream` contract, and framing adapters (chunked, length-limited, TLS)
//! - **Protocol crates**: message-oriented framing and request state
//!   machines built on `Stream`
//! - **`conduit`**: public API surface (this crate)
//!
//! ## Toolkits (opt-in via features)
//!
//! Each protocol toolkit is gated behind a feature flag to avoid pulling
//! in code a given binary doesn't use:
//!
//! - **`ws`** — WebSocket (RFC 6455) framing and message streams, plus a
//!   compact length-prefixed message protocol
//! - **`http`** — HTTP/1.x client and server request state machines and a
//!   prefix-routed server dispatcher
//!
//! ```toml
//! [dependencies]
//! conduit = { version = "0.1", features = ["http"] }
//! ```
//!
//! ## Quick Start
//!
//! ### Echo server over TCP
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! use conduit::{PeerName, Runtime, Stream};
//!
//! let rt = Runtime::new(Some(1))?;
//! let peers = PeerName::lookup("127.0.0.1:7000", None)?;
//! let listener = rt.listen(&peers)?.pop().expect("one listener per peer");
//! loop {
//!     let (stream, _peer) = listener.accept().await?;
//!     rt.spawn(async move {
//!         loop {
//!             let chunk = stream.read().await?;
//!             if chunk.is_empty() {
//!                 break;
//!             }
//!             if !stream.write(&chunk).await? {
//!                 break;
//!             }
//!         }
//!         Ok::<_, std::io::Error>(())
//!     })
//!     .detach();
//! }
//! # }
//! ```
//!
//! ## Performance
//!
//! - **Zero-copy reads**: `bytes::Bytes` for refcounted buffers shared
//!   across adapters
//! - **Readiness-based reactor**: native Linux `epoll` (via `mio`), one
//!   dedicated reactor worker feeding a multi-threaded task executor
//! - **No per-future heap churn on the hot path**: adapters embed their
//!   wrapped stream by exclusive ownership rather than boxing per call
//!
//! ## Safety
//!
//! - `unsafe` code is isolated to the handful of `conduit-core` modules
//!   that must touch raw file descriptors (socket setup, fd teardown);
//!   each such module documents why at its top and is the only place in
//!   the workspace that opts back into `unsafe_code`.
//! - Everything above `conduit-core`'s raw-fd boundary is safe Rust.

#![warn(missing_docs)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub use bytes::Bytes;
pub use conduit_core::context::{Listener, Runtime};
pub use conduit_core::error::{ConduitError, Result};
pub use conduit_core::peername::{GroupId, PeerName};
pub use conduit_core::stream::{NullStream, SharedStream, Stream};

#[cfg(feature = "ws")]
pub use conduit_ws as ws;

#[cfg(feature = "http")]
pub use conduit_http as http;

/// Development helper for wiring up `tracing` in demos and tests.
pub mod dev_tracing;
