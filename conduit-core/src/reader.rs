//! Buffered read helpers built on top of [`Stream`]: read up to (and
//! including) a delimiter, or read exactly N bytes.

use std::io;

use bytes::{Bytes, BytesMut};

use crate::kmp::{Pattern, Search};
use crate::stream::SharedStream;

/// Accumulates `Stream::read()` output until `pattern` is found (the
/// returned bytes include the match), the caller-supplied cap is hit, or
/// EOF/timeout occurs first.
///
/// On cap overflow, the unconsumed tail (including anything read past
/// the cap) is pushed back onto `stream` via `put_back` so a subsequent
/// read sees it again — the caller decides whether that means "give up"
/// or "retry with a larger cap".
pub async fn read_until(stream: &SharedStream, pattern: &[u8], max_len: usize) -> io::Result<ReadUntilOutcome> {
    let compiled = Pattern::new(pattern);
    let mut search = Search::new(&compiled);
    let mut buf = BytesMut::new();

    loop {
        let chunk = stream.read().await?;
        if chunk.is_empty() {
            if stream.is_read_timeout() {
                return Ok(ReadUntilOutcome::Timeout(buf.freeze()));
            }
            return Ok(ReadUntilOutcome::Eof(buf.freeze()));
        }

        let start = buf.len();
        buf.extend_from_slice(&chunk);
        if let Some(rel_end) = search.feed_slice(&chunk) {
            let end = start + rel_end;
            let tail = buf.split_off(end);
            if !tail.is_empty() {
                stream.put_back(tail.freeze());
            }
            return Ok(ReadUntilOutcome::Found(buf.freeze()));
        }

        if buf.len() > max_len {
            stream.put_back(Bytes::copy_from_slice(&buf));
            return Ok(ReadUntilOutcome::TooLong);
        }
    }
}

/// Outcome of [`read_until`].
#[derive(Debug)]
pub enum ReadUntilOutcome {
    /// Found the pattern; bytes include the match itself.
    Found(Bytes),
    /// Hit the length cap before finding the pattern. The bytes already
    /// consumed were pushed back onto the stream.
    TooLong,
    /// Stream hit EOF before the pattern was found; whatever was
    /// accumulated so far is returned for the caller to inspect.
    Eof(Bytes),
    /// Stream timed out before the pattern was found; same as `Eof` but
    /// recoverable (caller may retry).
    Timeout(Bytes),
}

/// Accumulates exactly `len` bytes, or returns early on EOF/timeout.
pub async fn read_exact(stream: &SharedStream, len: usize) -> io::Result<ReadExactOutcome> {
    let mut buf = BytesMut::with_capacity(len);
    while buf.len() < len {
        let chunk = stream.read().await?;
        if chunk.is_empty() {
            return Ok(if stream.is_read_timeout() {
                ReadExactOutcome::Timeout(buf.freeze())
            } else {
                ReadExactOutcome::Eof(buf.freeze())
            });
        }
        let need = len - buf.len();
        if chunk.len() > need {
            buf.extend_from_slice(&chunk[..need]);
            stream.put_back(chunk.slice(need..));
        } else {
            buf.extend_from_slice(&chunk);
        }
    }
    Ok(ReadExactOutcome::Full(buf.freeze()))
}

/// Outcome of [`read_exact`].
#[derive(Debug)]
pub enum ReadExactOutcome {
    Full(Bytes),
    Eof(Bytes),
    Timeout(Bytes),
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
    fn finds_delimiter_split_across_fragments() {
        // The terminating blank-line CRLF is split right down the middle:
        // the first fragment ends on a lone trailing \r, the second opens
        // with \n\r\n before the unconsumed tail.
        let inner = Arc::new(MemStream::new());
        inner.push_front_input(b"\n\r\nTail");
        inner.push_front_input(b"HTTP/1.0 200 OK\r\nContent-Type: text/plain\r");
        let stream: SharedStream = inner;

        let outcome = futures::executor::block_on(read_until(&stream, b"\r\n\r\n", 4096)).unwrap();
        match outcome {
            ReadUntilOutcome::Found(bytes) => {
                assert_eq!(&bytes[..], b"HTTP/1.0 200 OK\r\nContent-Type: text/plain\r\n\r\n");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        let tail = futures::executor::block_on(stream.read()).unwrap();
        assert_eq!(&tail[..], b"Tail");
    }

    #[test]
    fn too_long_pushes_back_accumulated_bytes() {
        let inner = Arc::new(MemStream::with_input(b"abcdefghij".to_vec()));
        let stream: SharedStream = inner.clone();
        let outcome = futures::executor::block_on(read_until(&stream, b"\n", 4)).unwrap();
        assert!(matches!(outcome, ReadUntilOutcome::TooLong));
        // Everything read so far should have been pushed back.
        let replay = futures::executor::block_on(stream.read()).unwrap();
        assert_eq!(&replay[..], b"abcdefghij");
    }

    #[test]
    fn read_exact_splits_overshoot_fragment() {
        let inner = Arc::new(MemStream::with_input(b"abcdefgh".to_vec()));
        let stream: SharedStream = inner;
        let outcome = futures::executor::block_on(read_exact(&stream, 3)).unwrap();
        match outcome {
            ReadExactOutcome::Full(bytes) => assert_eq!(&bytes[..], b"abc"),
            other => panic!("unexpected outcome: {other:?}"),
        }
        let rest = futures::executor::block_on(stream.read()).unwrap();
        assert_eq!(&rest[..], b"defgh");
    }
}
