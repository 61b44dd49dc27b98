//! WebSocket frame codec (RFC 6455): parser and builder over the raw
//! frame header/payload wire format. Masking, fragmentation and the
//! short/16-/64-bit length encodings live here; message-level semantics
//! (ping/pong auto-reply, close handshake) are [`crate::stream`]'s job.

use std::io;

use bytes::{Bytes, BytesMut};
use conduit_core::prelude::SharedStream;
use conduit_core::reader::{read_exact, ReadExactOutcome};

/// One of the six opcodes RFC 6455 defines; `%x3-7` and `%xB-F` are
/// reserved and never constructed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    #[must_use]
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0x0 => Some(Self::Continuation),
            0x1 => Some(Self::Text),
            0x2 => Some(Self::Binary),
            0x8 => Some(Self::Close),
            0x9 => Some(Self::Ping),
            0xA => Some(Self::Pong),
            _ => None,
        }
    }

    #[must_use]
    pub fn to_u8(self) -> u8 {
        match self {
            Self::Continuation => 0x0,
            Self::Text => 0x1,
            Self::Binary => 0x2,
            Self::Close => 0x8,
            Self::Ping => 0x9,
            Self::Pong => 0xA,
        }
    }

    #[must_use]
    pub fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }
}

/// A fully-decoded frame: header fields plus unmasked payload.
#[derive(Debug)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    pub payload: Bytes,
}

/// Outcome of reading one frame off a stream.
pub enum FrameReadOutcome {
    Frame(Frame),
    /// Payload length exceeded the configured maximum message size. The
    /// frame (header and payload) was still fully consumed so the stream
    /// stays correctly framed for whatever comes next.
    Oversized,
    Eof,
    Timeout,
}

/// Read one frame header + payload off `stream`, unmasking if the
/// header's mask bit is set. `max_message_size` bounds a single frame's
/// payload (RFC 6455 does not fragment control frames, so this also
/// bounds control-frame payloads, which are further capped at 125 bytes
/// by the short-length encoding).
pub async fn read_frame(stream: &SharedStream, max_message_size: usize) -> io::Result<FrameReadOutcome> {
    let header = match read_exact(stream, 2).await? {
        ReadExactOutcome::Full(b) => b,
        ReadExactOutcome::Eof(_) => return Ok(FrameReadOutcome::Eof),
        ReadExactOutcome::Timeout(_) => return Ok(FrameReadOutcome::Timeout),
    };
    let byte0 = header[0];
    let byte1 = header[1];
    let fin = byte0 & 0x80 != 0;
    let opcode = Opcode::from_u8(byte0 & 0x0F)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "unknown websocket opcode"))?;
    let masked = byte1 & 0x80 != 0;
    let len7 = byte1 & 0x7F;

    let payload_len: u64 = match len7 {
        126 => {
            let ext = match read_exact(stream, 2).await? {
                ReadExactOutcome::Full(b) => b,
                ReadExactOutcome::Eof(_) => return Ok(FrameReadOutcome::Eof),
                ReadExactOutcome::Timeout(_) => return Ok(FrameReadOutcome::Timeout),
            };
            u64::from(u16::from_be_bytes([ext[0], ext[1]]))
        }
        127 => {
            let ext = match read_exact(stream, 8).await? {
                ReadExactOutcome::Full(b) => b,
                ReadExactOutcome::Eof(_) => return Ok(FrameReadOutcome::Eof),
                ReadExactOutcome::Timeout(_) => return Ok(FrameReadOutcome::Timeout),
            };
            u64::from_be_bytes(ext[..8].try_into().unwrap())
        }
        n => u64::from(n),
    };

    let mask = if masked {
        match read_exact(stream, 4).await? {
            ReadExactOutcome::Full(b) => Some([b[0], b[1], b[2], b[3]]),
            ReadExactOutcome::Eof(_) => return Ok(FrameReadOutcome::Eof),
            ReadExactOutcome::Timeout(_) => return Ok(FrameReadOutcome::Timeout),
        }
    } else {
        None
    };

    let oversized = payload_len as usize > max_message_size;
    let mut payload = if payload_len == 0 {
        Bytes::new()
    } else {
        match read_exact(stream, payload_len as usize).await? {
            ReadExactOutcome::Full(b) => b,
            ReadExactOutcome::Eof(_) => return Ok(FrameReadOutcome::Eof),
            ReadExactOutcome::Timeout(_) => return Ok(FrameReadOutcome::Timeout),
        }
    };

    if let Some(mask) = mask {
        let mut unmasked = BytesMut::from(&payload[..]);
        for (i, b) in unmasked.iter_mut().enumerate() {
            *b ^= mask[i & 3];
        }
        payload = unmasked.freeze();
    }

    if oversized {
        return Ok(FrameReadOutcome::Oversized);
    }
    Ok(FrameReadOutcome::Frame(Frame { fin, opcode, payload }))
}

/// Encode one frame. `client_mask`, if `true`, generates a fresh random
/// mask (clients must mask; servers must not, per RFC 6455 §5.1).
#[must_use]
pub fn encode_frame(fin: bool, opcode: Opcode, payload: &[u8], client_mask: bool) -> BytesMut {
    let mut out = BytesMut::with_capacity(payload.len() + 14);
    out.extend_from_slice(&[(u8::from(fin) << 7) | opcode.to_u8()]);

    let mask_bit = if client_mask { 0x80 } else { 0x00 };
    if payload.len() < 126 {
        out.extend_from_slice(&[mask_bit | payload.len() as u8]);
    } else if payload.len() <= 0xFFFF {
        out.extend_from_slice(&[mask_bit | 126]);
        out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    } else {
        out.extend_from_slice(&[mask_bit | 127]);
        out.extend_from_slice(&(payload.len() as u64).to_be_bytes());
    }

    if client_mask {
        let mask: [u8; 4] = rand::random();
        out.extend_from_slice(&mask);
        let start = out.len();
        out.extend_from_slice(payload);
        for (i, b) in out[start..].iter_mut().enumerate() {
            *b ^= mask[i & 3];
        }
    } else {
        out.extend_from_slice(payload);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    mod mem {
        include!("test_support/memstream.rs");
    }
    use mem::MemStream;

    #[test]
    fn short_length_round_trips_unmasked() {
        let encoded = encode_frame(true, Opcode::Text, b"hello", false);
        let inner: SharedStream = Arc::new(MemStream::with_input(encoded.to_vec()));
        let frame = match futures::executor::block_on(read_frame(&inner, 1 << 20)).unwrap() {
            FrameReadOutcome::Frame(f) => f,
            _ => panic!("expected a frame"),
        };
        assert!(frame.fin);
        assert_eq!(frame.opcode, Opcode::Text);
        assert_eq!(&frame.payload[..], b"hello");
    }

    #[test]
    fn masked_round_trips() {
        let encoded = encode_frame(true, Opcode::Binary, b"masked payload", true);
        // client->server framing always sets the mask bit; verify it did.
        assert_eq!(encoded[1] & 0x80, 0x80);
        let inner: SharedStream = Arc::new(MemStream::with_input(encoded.to_vec()));
        let frame = match futures::executor::block_on(read_frame(&inner, 1 << 20)).unwrap() {
            FrameReadOutcome::Frame(f) => f,
            _ => panic!("expected a frame"),
        };
        assert_eq!(&frame.payload[..], b"masked payload");
    }

    #[test]
    fn length_encoding_selects_16_bit_for_126() {
        let payload = vec![b'x'; 126];
        let encoded = encode_frame(true, Opcode::Binary, &payload, false);
        assert_eq!(encoded[1] & 0x7F, 126);
        assert_eq!(&encoded[2..4], &126u16.to_be_bytes());
    }

    #[test]
    fn length_encoding_selects_64_bit_for_65536() {
        let payload = vec![b'x'; 65536];
        let encoded = encode_frame(true, Opcode::Binary, &payload, false);
        assert_eq!(encoded[1] & 0x7F, 127);
        assert_eq!(&encoded[2..10], &65536u64.to_be_bytes());
    }

    #[test]
    fn oversized_payload_is_flagged_after_being_drained() {
        let payload = vec![b'x'; 1000];
        let encoded = encode_frame(true, Opcode::Binary, &payload, false);
        let inner: SharedStream = Arc::new(MemStream::with_input(encoded.to_vec()));
        match futures::executor::block_on(read_frame(&inner, 10)).unwrap() {
            FrameReadOutcome::Oversized => {}
            _ => panic!("expected Oversized"),
        }
        // Stream is fully drained; nothing left to misinterpret as a header.
        let leftover = futures::executor::block_on(inner.read_nb());
        assert!(leftover.is_empty());
    }
}
