//! Length-prefix message stream: a compact alternative to WebSocket
//! framing for process-internal or trusted-peer links.
//!
//! Wire format, one message:
//!
//! ```text
//! byte 0: TTLLLLLL_b   bits[7:6] = type, bits[5:3] = reserved(0), bits[2:0] = len_bytes - 1
//! bytes 1..1+len_bytes: big-endian length (at most len_bytes wide)
//! bytes ...:            payload
//! ```

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use conduit_core::prelude::SharedStream;
use conduit_core::reader::{read_exact, ReadExactOutcome};
use conduit_core::writer::MultiWriter;

/// Message type codes: `00=Ping, 01=Pong, 10=Text, 11=Binary`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageType {
    Ping,
    Pong,
    Text,
    Binary,
}

impl MessageType {
    fn from_bits(bits: u8) -> Self {
        match bits {
            0b00 => Self::Ping,
            0b01 => Self::Pong,
            0b10 => Self::Text,
            _ => Self::Binary,
        }
    }

    fn to_bits(self) -> u8 {
        match self {
            Self::Ping => 0b00,
            Self::Pong => 0b01,
            Self::Text => 0b10,
            Self::Binary => 0b11,
        }
    }
}

/// What [`LenFrameStream::read`] hands back.
#[derive(Debug)]
pub enum LenFrameEvent {
    Message { kind: MessageType, payload: Bytes },
    Close,
}

fn len_bytes_for(len: usize) -> u8 {
    let mut n = 1u32;
    while (len as u64) >= (1u64 << (8 * n)) && n < 8 {
        n += 1;
    }
    n as u8
}

/// Encode one message frame.
#[must_use]
pub fn encode_message(kind: MessageType, payload: &[u8]) -> BytesMut {
    let len_bytes = len_bytes_for(payload.len());
    let mut out = BytesMut::with_capacity(1 + len_bytes as usize + payload.len());
    out.extend_from_slice(&[(kind.to_bits() << 6) | (len_bytes - 1)]);
    let len_be = (payload.len() as u64).to_be_bytes();
    out.extend_from_slice(&len_be[8 - len_bytes as usize..]);
    out.extend_from_slice(payload);
    out
}

/// Message-oriented stream implementing the length-prefix protocol over
/// an inner byte stream.
pub struct LenFrameStream {
    inner: SharedStream,
    writer: MultiWriter,
    timeouts_seen: AtomicU8,
    closed: AtomicBool,
}

impl LenFrameStream {
    #[must_use]
    pub fn new(inner: SharedStream, executor: Arc<async_executor::Executor<'static>>) -> Self {
        let writer = MultiWriter::new(Arc::clone(&inner), executor);
        Self { inner, writer, timeouts_seen: AtomicU8::new(0), closed: AtomicBool::new(false) }
    }

    /// Read the next message. A Ping is answered with a Pong and not
    /// surfaced; on two consecutive read timeouts a Ping is sent once,
    /// then the connection is declared closed.
    pub async fn read(&self) -> io::Result<LenFrameEvent> {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Ok(LenFrameEvent::Close);
            }
            let header = match read_exact(&self.inner, 1).await? {
                ReadExactOutcome::Full(b) => b,
                ReadExactOutcome::Eof(_) => {
                    self.closed.store(true, Ordering::Release);
                    return Ok(LenFrameEvent::Close);
                }
                ReadExactOutcome::Timeout(_) => {
                    let seen = self.timeouts_seen.fetch_add(1, Ordering::AcqRel);
                    if seen == 0 {
                        let _ = self.send(MessageType::Ping, b"").await;
                        continue;
                    }
                    self.closed.store(true, Ordering::Release);
                    return Ok(LenFrameEvent::Close);
                }
            };
            self.timeouts_seen.store(0, Ordering::Release);

            let byte0 = header[0];
            let kind = MessageType::from_bits((byte0 >> 6) & 0b11);
            let len_bytes = ((byte0 & 0b111) + 1) as usize;

            let len_raw = match read_exact(&self.inner, len_bytes).await? {
                ReadExactOutcome::Full(b) => b,
                ReadExactOutcome::Eof(_) => {
                    self.closed.store(true, Ordering::Release);
                    return Ok(LenFrameEvent::Close);
                }
                ReadExactOutcome::Timeout(_) => {
                    self.closed.store(true, Ordering::Release);
                    return Ok(LenFrameEvent::Close);
                }
            };
            let mut len_buf = [0u8; 8];
            len_buf[8 - len_bytes..].copy_from_slice(&len_raw);
            let len = u64::from_be_bytes(len_buf) as usize;

            let payload = if len == 0 {
                Bytes::new()
            } else {
                match read_exact(&self.inner, len).await? {
                    ReadExactOutcome::Full(b) => b,
                    ReadExactOutcome::Eof(_) => {
                        self.closed.store(true, Ordering::Release);
                        return Ok(LenFrameEvent::Close);
                    }
                    ReadExactOutcome::Timeout(_) => {
                        self.closed.store(true, Ordering::Release);
                        return Ok(LenFrameEvent::Close);
                    }
                }
            };

            match kind {
                MessageType::Ping => {
                    let _ = self.send(MessageType::Pong, &payload).await;
                }
                MessageType::Pong => {}
                MessageType::Text | MessageType::Binary => return Ok(LenFrameEvent::Message { kind, payload }),
            }
        }
    }

    /// Send one message.
    pub async fn send(&self, kind: MessageType, payload: &[u8]) -> io::Result<bool> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(false);
        }
        let frame = encode_message(kind, payload);
        self.writer.write(&frame)
    }

    /// Close the writer; no further `send` succeeds.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.writer.close();
        self.writer.write_eof();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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
    fn len_bytes_for_selects_minimal_width() {
        assert_eq!(len_bytes_for(0), 1);
        assert_eq!(len_bytes_for(255), 1);
        assert_eq!(len_bytes_for(256), 2);
        assert_eq!(len_bytes_for(u32::MAX as usize), 4);
    }

    #[test]
    fn encodes_and_decodes_text_message() {
        let encoded = encode_message(MessageType::Text, b"hello");
        assert_eq!(encoded[0] >> 6, 0b10);
        assert_eq!(encoded[0] & 0b111, 0); // 1 length byte
        let inner: SharedStream = Arc::new(MemStream::with_input(encoded.to_vec()));
        let stream = LenFrameStream::new(inner, exec());
        let event = futures::executor::block_on(stream.read()).unwrap();
        match event {
            LenFrameEvent::Message { kind, payload } => {
                assert_eq!(kind, MessageType::Text);
                assert_eq!(&payload[..], b"hello");
            }
            LenFrameEvent::Close => panic!("expected a message"),
        }
    }

    #[test]
    fn ping_is_answered_with_pong_and_not_surfaced() {
        let ping = encode_message(MessageType::Ping, b"");
        let text = encode_message(MessageType::Text, b"after ping");
        let inner = Arc::new(MemStream::with_input([ping.to_vec(), text.to_vec()].concat()));
        let shared: SharedStream = inner.clone();
        let executor = exec();
        let stream = LenFrameStream::new(shared, Arc::clone(&executor));
        let event = futures::executor::block_on(stream.read()).unwrap();
        match event {
            LenFrameEvent::Message { payload, .. } => assert_eq!(&payload[..], b"after ping"),
            LenFrameEvent::Close => panic!("expected a message"),
        }
        drain(&executor);
        let written = inner.written();
        assert_eq!(written[0] >> 6, MessageType::Pong.to_bits());
    }
}
