//! Conduit WS
//!
//! Message-oriented framing built on `conduit-core`'s stream contract:
//! - WebSocket frame codec, RFC 6455 (`codec`)
//! - WebSocket message stream: fragmentation, ping/pong, close (`stream`)
//! - A compact length-prefixed message protocol (`lenframe`)

pub mod codec;
pub mod lenframe;
pub mod stream;

/// A small prelude to make downstream crates ergonomic.
pub mod prelude {
    pub use crate::codec::{encode_frame, read_frame, Frame, FrameReadOutcome, Opcode};
    pub use crate::lenframe::{encode_message, LenFrameEvent, LenFrameStream, MessageType};
    pub use crate::stream::{close_code, MessageKind, WebSocketStream, WsEvent};
}
