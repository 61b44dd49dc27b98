//! Message-oriented stream layered over the byte-stream contract:
//! ping/pong housekeeping, close handshake, and (optionally) fragment
//! merging, sitting on top of the frame codec and the multi-producer
//! writer.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use conduit_core::prelude::SharedStream;
use conduit_core::writer::MultiWriter;
use parking_lot::Mutex;

use crate::codec::{encode_frame, read_frame, FrameReadOutcome, Opcode};

/// Which logical message type a payload belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Binary,
}

/// What [`WebSocketStream::read`] hands back.
#[derive(Debug)]
pub enum WsEvent {
    /// A complete message, or one fragment of one if fragmentation is
    /// preserved (`fin == false` means more fragments of this message
    /// follow).
    Message { kind: MessageKind, fin: bool, payload: Bytes },
    /// The peer closed, or the connection went abnormal (read timed out
    /// twice in a row after a keepalive Ping, or the underlying stream
    /// hit EOF outright).
    Close { code: Option<u16>, reason: Bytes },
}

/// Standard RFC 6455 close codes this stream may synthesize itself.
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const ABNORMAL: u16 = 1006;
}

struct FragmentState {
    kind: Option<MessageKind>,
    buf: BytesMut,
}

/// Message-oriented WebSocket stream over an inner byte stream.
pub struct WebSocketStream {
    inner: SharedStream,
    writer: MultiWriter,
    is_client: bool,
    need_fragmented: bool,
    max_message_size: usize,
    timeouts_seen: AtomicU8,
    closed: AtomicBool,
    merge_state: Mutex<FragmentState>,
    /// Tracks the logical type of an in-flight multi-fragment *write*, so
    /// later fragments can be sent as `Continuation` frames.
    write_opcode: Mutex<Option<Opcode>>,
}

impl WebSocketStream {
    /// `is_client` selects masking direction (clients mask their frames,
    /// servers never do). `need_fragmented`, if `true`, surfaces each
    /// frame of a multi-fragment message individually rather than
    /// merging them into one payload.
    #[must_use]
    pub fn new(
        inner: SharedStream,
        executor: Arc<async_executor::Executor<'static>>,
        is_client: bool,
        need_fragmented: bool,
        max_message_size: usize,
    ) -> Self {
        let writer = MultiWriter::new(Arc::clone(&inner), executor);
        Self {
            inner,
            writer,
            is_client,
            need_fragmented,
            max_message_size,
            timeouts_seen: AtomicU8::new(0),
            closed: AtomicBool::new(false),
            merge_state: Mutex::new(FragmentState { kind: None, buf: BytesMut::new() }),
            write_opcode: Mutex::new(None),
        }
    }

    /// Read the next event. Ping/Pong are handled transparently and
    /// never surfaced; a received Close is answered in kind before being
    /// returned to the caller.
    pub async fn read(&self) -> io::Result<WsEvent> {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Ok(WsEvent::Close { code: Some(close_code::NORMAL), reason: Bytes::new() });
            }
            match read_frame(&self.inner, self.max_message_size).await? {
                FrameReadOutcome::Frame(frame) => {
                    self.timeouts_seen.store(0, Ordering::Release);
                    match frame.opcode {
                        Opcode::Ping => {
                            let _ = self.send_control(Opcode::Pong, &frame.payload).await;
                        }
                        Opcode::Pong => {}
                        Opcode::Close => {
                            let (code, reason) = parse_close_payload(&frame.payload);
                            self.closed.store(true, Ordering::Release);
                            let _ = self.send_control(Opcode::Close, &close_payload(close_code::NORMAL)).await;
                            self.writer.close();
                            return Ok(WsEvent::Close { code, reason });
                        }
                        Opcode::Text | Opcode::Binary | Opcode::Continuation => {
                            if let Some(event) = self.accumulate(frame.opcode, frame.fin, frame.payload)? {
                                return Ok(event);
                            }
                        }
                    }
                }
                FrameReadOutcome::Oversized => {
                    return Err(io::Error::new(io::ErrorKind::InvalidData, "websocket message exceeds the configured maximum size"));
                }
                FrameReadOutcome::Eof => {
                    self.closed.store(true, Ordering::Release);
                    return Ok(WsEvent::Close { code: Some(close_code::ABNORMAL), reason: Bytes::new() });
                }
                FrameReadOutcome::Timeout => {
                    let seen = self.timeouts_seen.fetch_add(1, Ordering::AcqRel);
                    if seen == 0 {
                        let _ = self.send_control(Opcode::Ping, b"").await;
                    } else {
                        self.closed.store(true, Ordering::Release);
                        return Ok(WsEvent::Close { code: Some(close_code::ABNORMAL), reason: Bytes::new() });
                    }
                }
            }
        }
    }

    fn accumulate(&self, opcode: Opcode, fin: bool, payload: Bytes) -> io::Result<Option<WsEvent>> {
        if self.need_fragmented {
            let mut st = self.merge_state.lock();
            let kind = match opcode {
                Opcode::Text => MessageKind::Text,
                Opcode::Binary => MessageKind::Binary,
                Opcode::Continuation => st
                    .kind
                    .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "continuation with no preceding fragment"))?,
                _ => unreachable!("control opcodes handled by caller"),
            };
            st.kind = if fin { None } else { Some(kind) };
            return Ok(Some(WsEvent::Message { kind, fin, payload }));
        }

        let mut st = self.merge_state.lock();
        match opcode {
            Opcode::Text | Opcode::Binary => {
                if st.kind.is_some() {
                    return Err(io::Error::new(io::ErrorKind::InvalidData, "new message started before prior one finished"));
                }
                let kind = if opcode == Opcode::Text { MessageKind::Text } else { MessageKind::Binary };
                if fin {
                    return Ok(Some(WsEvent::Message { kind, fin: true, payload }));
                }
                st.kind = Some(kind);
                st.buf = BytesMut::from(&payload[..]);
                Ok(None)
            }
            Opcode::Continuation => {
                let kind = st
                    .kind
                    .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "continuation with no preceding fragment"))?;
                st.buf.extend_from_slice(&payload);
                if fin {
                    st.kind = None;
                    let merged = std::mem::take(&mut st.buf).freeze();
                    return Ok(Some(WsEvent::Message { kind, fin: true, payload: merged }));
                }
                Ok(None)
            }
            _ => unreachable!("control opcodes handled by caller"),
        }
    }

    async fn send_control(&self, opcode: Opcode, payload: &[u8]) -> io::Result<bool> {
        let frame = encode_frame(true, opcode, payload, self.is_client);
        self.writer.write(&frame)
    }

    /// Send a single-fragment (`fin == true`) message.
    pub async fn send_message(&self, kind: MessageKind, payload: &[u8]) -> io::Result<bool> {
        self.send_fragment(kind, payload, true).await
    }

    /// Send one fragment. The first fragment of a multi-fragment message
    /// establishes the logical type; later fragments pass the same
    /// `kind` and it is mapped to a `Continuation` opcode automatically.
    pub async fn send_fragment(&self, kind: MessageKind, payload: &[u8], fin: bool) -> io::Result<bool> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(false);
        }
        let mut wo = self.write_opcode.lock();
        let opcode = match *wo {
            Some(_) => Opcode::Continuation,
            None => match kind {
                MessageKind::Text => Opcode::Text,
                MessageKind::Binary => Opcode::Binary,
            },
        };
        *wo = if fin { None } else { Some(opcode) };
        drop(wo);

        let frame = encode_frame(fin, opcode, payload, self.is_client);
        self.writer.write(&frame)
    }

    /// Send a Close frame and transition to closing; further `send_*`
    /// calls return `false`.
    pub async fn close(&self, code: u16, reason: &[u8]) -> io::Result<bool> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(false);
        }
        let mut payload = close_payload(code);
        payload.extend_from_slice(reason);
        let ok = self.send_control(Opcode::Close, &payload).await?;
        self.writer.write_eof();
        Ok(ok)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

fn close_payload(code: u16) -> Vec<u8> {
    code.to_be_bytes().to_vec()
}

fn parse_close_payload(payload: &Bytes) -> (Option<u16>, Bytes) {
    if payload.len() < 2 {
        return (None, Bytes::new());
    }
    let code = u16::from_be_bytes([payload[0], payload[1]]);
    (Some(code), payload.slice(2..))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Opcode;
    use conduit_core::stream::Stream as _;
    use std::sync::Arc;

    mod mem {
        include!("test_support/memstream.rs");
    }
    use mem::MemStream;

    fn exec() -> Arc<async_executor::Executor<'static>> {
        Arc::new(async_executor::Executor::new())
    }

    /// Drive a detached background task (e.g. the multi-producer writer's
    /// drain loop, spawned on auto-reply) to completion, the same way
    /// `writer.rs`'s own `run_until_idle` drains its executor.
    fn drain(executor: &async_executor::Executor<'static>) {
        while executor.try_tick() {}
    }

    #[test]
    fn merges_fragments_into_one_message() {
        let frame1 = encode_frame(false, Opcode::Text, b"Hello ", false);
        let frame2 = encode_frame(true, Opcode::Continuation, b"world", false);
        let inner: SharedStream = Arc::new(MemStream::with_input([frame1.to_vec(), frame2.to_vec()].concat()));
        let ws = WebSocketStream::new(inner, exec(), false, false, 1 << 20);
        let event = futures::executor::block_on(ws.read()).unwrap();
        match event {
            WsEvent::Message { kind, fin, payload } => {
                assert_eq!(kind, MessageKind::Text);
                assert!(fin);
                assert_eq!(&payload[..], b"Hello world");
            }
            other => panic!("expected merged message, got {other:?}"),
        }
    }

    #[test]
    fn auto_responds_to_ping_then_yields_message() {
        let ping = encode_frame(true, Opcode::Ping, b"hi", false);
        let text = encode_frame(true, Opcode::Text, b"after ping", false);
        let inner = Arc::new(MemStream::with_input([ping.to_vec(), text.to_vec()].concat()));
        let shared: SharedStream = inner.clone();
        let executor = exec();
        let ws = WebSocketStream::new(shared, Arc::clone(&executor), false, false, 1 << 20);
        let event = futures::executor::block_on(ws.read()).unwrap();
        match event {
            WsEvent::Message { payload, .. } => assert_eq!(&payload[..], b"after ping"),
            other => panic!("expected message, got {other:?}"),
        }
        drain(&executor);
        let written = inner.written();
        assert_eq!(written[0] & 0x0F, Opcode::Pong.to_u8());
    }

    #[test]
    fn close_handshake_replies_and_surfaces_event() {
        let close = encode_frame(true, Opcode::Close, &1000u16.to_be_bytes(), false);
        let inner = Arc::new(MemStream::with_input(close.to_vec()));
        let shared: SharedStream = inner.clone();
        let executor = exec();
        let ws = WebSocketStream::new(shared, Arc::clone(&executor), false, false, 1 << 20);
        let event = futures::executor::block_on(ws.read()).unwrap();
        match event {
            WsEvent::Close { code, .. } => assert_eq!(code, Some(1000)),
            other => panic!("expected close, got {other:?}"),
        }
        drain(&executor);
        let written = inner.written();
        assert_eq!(written[0] & 0x0F, Opcode::Close.to_u8());
    }
}
