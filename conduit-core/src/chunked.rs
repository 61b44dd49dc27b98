//! HTTP/1.1 chunked transfer-coding adapter (RFC 7230 §4.1).
//!
//! Reading de-chunks incrementally, tolerating the chunk header and CRLF
//! delimiters arriving split across arbitrarily many fragments. Writing
//! wraps each `write()` call in its own chunk, which is simple and
//! correct but not optimal for many small writes — callers that care
//! should buffer upstream of this adapter.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;

use crate::stream::{SharedStream, Stream};
use crate::timeout::Timeouts;

/// Chunk-extension handling on read. The spec leaves the correct
/// behavior here as an open question; we resolve it conservatively.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExtensionPolicy {
    /// Ignore any `;ext=value` text after the chunk size (most servers'
    /// behavior, and what this adapter uses by default).
    Ignore,
    /// Reject the stream as malformed if an extension is present.
    Reject,
}

impl Default for ExtensionPolicy {
    fn default() -> Self {
        ExtensionPolicy::Ignore
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ReadState {
    ChunkHeader,
    ChunkData(usize),
    ChunkTrailingCrlf,
    TrailerLines,
    Done,
}

struct ReadSide {
    state: ReadState,
    header_buf: Vec<u8>,
    putback: Bytes,
    was_timeout: bool,
}

/// Wraps an inner [`Stream`] to decode/encode chunked transfer-coding.
pub struct ChunkedStream {
    inner: SharedStream,
    read: Mutex<ReadSide>,
    extension_policy: ExtensionPolicy,
    eof_sent: AtomicBool,
}

impl ChunkedStream {
    #[must_use]
    pub fn new(inner: SharedStream, extension_policy: ExtensionPolicy) -> Self {
        Self {
            inner,
            read: Mutex::new(ReadSide {
                state: ReadState::ChunkHeader,
                header_buf: Vec::new(),
                putback: Bytes::new(),
                was_timeout: false,
            }),
            extension_policy,
            eof_sent: AtomicBool::new(false),
        }
    }

    /// Encode `data` as a single chunk: size line in hex, CRLF, data, CRLF.
    /// Writing zero bytes produces no chunk (a zero-length chunk would be
    /// read back as the terminator).
    fn encode_chunk(data: &[u8]) -> BytesMut {
        let mut buf = BytesMut::with_capacity(data.len() + 16);
        buf.put(format!("{:x}\r\n", data.len()).as_bytes());
        buf.put(data);
        buf.put(&b"\r\n"[..]);
        buf
    }

    /// Parse one chunk-size header line (without the trailing CRLF already
    /// stripped), applying the extension policy.
    fn parse_chunk_size(&self, line: &[u8]) -> io::Result<usize> {
        let line = std::str::from_utf8(line).map_err(|_| invalid_data("non-UTF8 chunk header"))?;
        let size_part = match line.split_once(';') {
            Some((size, _ext)) => {
                if self.extension_policy == ExtensionPolicy::Reject {
                    return Err(invalid_data(&format!("chunk extension rejected: {line}")));
                }
                size
            }
            None => line,
        };
        usize::from_str_radix(size_part.trim(), 16).map_err(|_| invalid_data(&format!("bad chunk size: {line}")))
    }
}

fn invalid_data(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

#[async_trait]
impl Stream for ChunkedStream {
    async fn read(&self) -> io::Result<Bytes> {
        loop {
            let pending_putback = {
                let mut rs = self.read.lock();
                if !rs.putback.is_empty() {
                    return Ok(std::mem::take(&mut rs.putback));
                }
                rs.state == ReadState::Done
            };
            if pending_putback {
                return Ok(Bytes::new());
            }

            let chunk = self.inner.read().await?;
            if chunk.is_empty() {
                let mut rs = self.read.lock();
                rs.was_timeout = self.inner.is_read_timeout();
                return Ok(Bytes::new());
            }

            let mut out = BytesMut::new();
            let mut cursor = 0usize;
            let done;
            {
                let mut rs = self.read.lock();
                rs.was_timeout = false;
                loop {
                    if cursor >= chunk.len() {
                        done = false;
                        break;
                    }
                    match rs.state {
                        ReadState::ChunkHeader => {
                            let Some(nl) = find_byte(&chunk[cursor..], b'\n') else {
                                rs.header_buf.extend_from_slice(&chunk[cursor..]);
                                cursor = chunk.len();
                                done = false;
                                break;
                            };
                            rs.header_buf.extend_from_slice(&chunk[cursor..cursor + nl]);
                            cursor += nl + 1;
                            let mut line = std::mem::take(&mut rs.header_buf);
                            if line.last() == Some(&b'\r') {
                                line.pop();
                            }
                            let size = self.parse_chunk_size(&line)?;
                            rs.state = if size == 0 { ReadState::TrailerLines } else { ReadState::ChunkData(size) };
                        }
                        ReadState::ChunkData(remaining) => {
                            let take = remaining.min(chunk.len() - cursor);
                            out.extend_from_slice(&chunk[cursor..cursor + take]);
                            cursor += take;
                            let left = remaining - take;
                            rs.state = if left == 0 { ReadState::ChunkTrailingCrlf } else { ReadState::ChunkData(left) };
                        }
                        ReadState::ChunkTrailingCrlf => {
                            let Some(nl) = find_byte(&chunk[cursor..], b'\n') else {
                                done = false;
                                break;
                            };
                            cursor += nl + 1;
                            rs.state = ReadState::ChunkHeader;
                        }
                        ReadState::TrailerLines => {
                            let Some(nl) = find_byte(&chunk[cursor..], b'\n') else {
                                rs.header_buf.extend_from_slice(&chunk[cursor..]);
                                cursor = chunk.len();
                                done = false;
                                break;
                            };
                            let line_len = nl;
                            let blank = line_len == 0 || (line_len == 1 && chunk[cursor] == b'\r');
                            cursor += nl + 1;
                            if blank && rs.header_buf.is_empty() {
                                rs.state = ReadState::Done;
                                done = true;
                                break;
                            }
                            rs.header_buf.clear();
                        }
                        ReadState::Done => {
                            done = true;
                            break;
                        }
                    }
                }
            }
            if !out.is_empty() {
                if cursor < chunk.len() {
                    self.inner.put_back(chunk.slice(cursor..));
                }
                return Ok(out.freeze());
            }
            if done {
                if cursor < chunk.len() {
                    self.inner.put_back(chunk.slice(cursor..));
                }
                return Ok(Bytes::new());
            }
            // Consumed the whole fragment with no output yet (mid-header or
            // mid-trailer); go around for the next one.
        }
    }

    async fn read_nb(&self) -> Bytes {
        // Chunk boundaries can't be resolved without suspending for more
        // input, so the non-blocking variant never attempts to de-chunk
        // partial data; it degrades to "nothing available right now".
        Bytes::new()
    }

    fn put_back(&self, bytes: Bytes) {
        self.read.lock().putback = bytes;
    }

    async fn write(&self, buf: &[u8]) -> io::Result<bool> {
        if buf.is_empty() {
            return Ok(true);
        }
        let framed = Self::encode_chunk(buf);
        self.inner.write(&framed).await
    }

    async fn write_eof(&self) -> bool {
        if self.eof_sent.swap(true, Ordering::AcqRel) {
            return false;
        }
        let _ = self.inner.write(b"0\r\n\r\n").await;
        self.inner.write_eof().await
    }

    fn shutdown(&self) {
        self.inner.shutdown();
    }

    fn is_read_timeout(&self) -> bool {
        self.read.lock().was_timeout
    }

    fn get_timeouts(&self) -> Timeouts {
        self.inner.get_timeouts()
    }

    fn set_timeouts(&self, timeouts: Timeouts) {
        self.inner.set_timeouts(timeouts);
    }
}

fn find_byte(haystack: &[u8], needle: u8) -> Option<usize> {
    haystack.iter().position(|&b| b == needle)
}

impl Drop for ChunkedStream {
    fn drop(&mut self) {
        if !self.eof_sent.load(Ordering::Acquire) {
            self.inner.shutdown();
        }
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

    #[test]
    fn encodes_multiple_writes_as_separate_chunks_then_terminator() {
        let inner = Arc::new(MemStream::new());
        let shared: SharedStream = inner.clone();
        let chunked = ChunkedStream::new(shared, ExtensionPolicy::Ignore);
        futures::executor::block_on(async {
            chunked.write(b"abc123").await.unwrap();
            chunked.write(b"x").await.unwrap();
            chunked.write(b"abcdefghijklmnopqrstuvwxyz").await.unwrap();
            chunked.write_eof().await;
        });
        let written = inner.written();
        assert_eq!(&written[..], &b"6\r\nabc123\r\n1\r\nx\r\n1a\r\nabcdefghijklmnopqrstuvwxyz\r\n0\r\n\r\n"[..]);
    }

    #[test]
    fn decodes_chunk_split_across_arbitrary_fragments() {
        // Mirrors the fragmented "6\r\nHello \r\n" / "6\r" / "\nworld" / ...
        // sequence used as the reader's worked example: two six-byte
        // chunks ("Hello " and "world!") whose headers and trailing CRLFs
        // land on arbitrary fragment boundaries, then the terminator.
        let fragments: Vec<&[u8]> =
            vec![b"6\r\nHello \r\n", b"6\r", b"\nworld", b"!\r\n0", b"\r\n\r\n"];
        let inner = Arc::new(MemStream::new());
        for f in fragments.into_iter().rev() {
            inner.push_front_input(f);
        }
        let shared: SharedStream = inner.clone();
        let chunked = ChunkedStream::new(shared, ExtensionPolicy::Ignore);

        let mut collected = Vec::new();
        futures::executor::block_on(async {
            loop {
                let b = chunked.read().await.unwrap();
                if b.is_empty() {
                    break;
                }
                collected.extend_from_slice(&b);
            }
        });
        assert_eq!(collected, b"Hello world!");
    }

    #[test]
    fn zero_size_chunk_terminates_read() {
        let inner = Arc::new(MemStream::with_input(b"0\r\n\r\n".to_vec()));
        let shared: SharedStream = inner;
        let chunked = ChunkedStream::new(shared, ExtensionPolicy::Ignore);
        let out = futures::executor::block_on(chunked.read()).unwrap();
        assert!(out.is_empty());
        assert!(!chunked.is_read_timeout());
    }

    #[test]
    fn drop_without_eof_shuts_down_inner() {
        let inner = Arc::new(MemStream::new());
        let shared: SharedStream = inner.clone();
        let chunked = ChunkedStream::new(shared, ExtensionPolicy::Ignore);
        futures::executor::block_on(chunked.write(b"abc")).unwrap();
        drop(chunked);
        assert!(inner.was_shutdown());
    }

    #[test]
    fn drop_after_eof_does_not_shut_down_inner() {
        let inner = Arc::new(MemStream::new());
        let shared: SharedStream = inner.clone();
        let chunked = ChunkedStream::new(shared, ExtensionPolicy::Ignore);
        futures::executor::block_on(chunked.write_eof());
        drop(chunked);
        assert!(!inner.was_shutdown());
    }
}
