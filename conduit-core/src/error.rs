//! Conduit error types.
//!
//! Recoverable conditions (timeout, peer-closed) are not represented here —
//! they are surfaced as empty reads / `false` writes per the stream contract
//! in [`crate::stream`]. This type covers what's left: things that are
//! genuinely exceptional.

use std::io;
use thiserror::Error;

/// Main error type for Conduit operations.
#[derive(Error, Debug)]
pub enum ConduitError {
    /// Underlying OS call failed (`socket`, `bind`, `listen`, `recv`, `send`,
    /// `epoll_wait`, resolver, ...).
    #[error("system error: {0}")]
    System(#[from] io::Error),

    /// No address in a connect-list produced a live socket.
    #[error("connect failed: no reachable address among {attempted}")]
    ConnectFailed {
        /// Number of addresses attempted.
        attempted: usize,
        /// The last error observed, if any address was reachable at all.
        #[source]
        last: Option<io::Error>,
    },

    /// HTTP/chunked/WebSocket/length-prefix framing was malformed.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A future's producer was dropped before resolving it (e.g. reactor
    /// stopped while a wait was outstanding).
    #[error("broken promise: producer dropped before resolving the future")]
    BrokenPromise,

    /// A peer name literal failed to parse.
    #[error("invalid peer name: {0}")]
    InvalidPeerName(String),
}

/// Result type alias for Conduit operations.
pub type Result<T> = std::result::Result<T, ConduitError>;

impl ConduitError {
    /// Build a [`ConduitError::Protocol`] from a displayable message.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Build a [`ConduitError::InvalidPeerName`] from a displayable message.
    pub fn invalid_peer_name(msg: impl Into<String>) -> Self {
        Self::InvalidPeerName(msg.into())
    }

    /// Build a [`ConduitError::ConnectFailed`] for a single failed attempt.
    pub fn connect_failed(last: io::Error) -> Self {
        Self::ConnectFailed { attempted: 1, last: Some(last) }
    }

    /// True if retrying the same operation later could plausibly succeed.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::System(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}
