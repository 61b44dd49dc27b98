//! HTTP/1 client request/response state machine — the symmetric
//! counterpart to [`crate::server::HttpServerRequest`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use conduit_core::chunked::{ChunkedStream, ExtensionPolicy};
use conduit_core::limited::{LimitedStream, ShortWriteEofPolicy};
use conduit_core::reader::{read_until, ReadUntilOutcome};
use conduit_core::stream::{NullStream, SharedStream, Stream};
use parking_lot::Mutex;

use crate::common::{HeaderMap, Method, Status, Version};

const MAX_HEADER_BYTES: usize = 64 * 1024;
const USER_AGENT: &str = "Conduit/0.1";

struct ResponseHead {
    version: Version,
    status: Status,
    headers: HeaderMap,
}

/// A parsed response: status, headers, keep-alive disposition, and the
/// body stream framed per the response headers.
pub struct HttpClientResponse {
    pub version: Version,
    pub status: Status,
    pub headers: HeaderMap,
    pub keep_alive: bool,
    pub body: SharedStream,
}

/// One outgoing HTTP/1 request against a connection stream. Headers are
/// mutable until `begin_body`/`send` commits them to the wire.
pub struct HttpClientRequest {
    conn: SharedStream,
    method: Method,
    target: String,
    version: Version,
    headers: Mutex<HeaderMap>,
    declared_length: Mutex<Option<u64>>,
    chunked: AtomicBool,
    custom_te: Mutex<Option<String>>,
    expects_continue: AtomicBool,
    headers_sent: AtomicBool,
    preset_response: Mutex<Option<ResponseHead>>,
}

impl HttpClientRequest {
    #[must_use]
    pub fn new(conn: SharedStream, method: Method, host: &str, target: &str, version: Version) -> Self {
        let mut headers = HeaderMap::new();
        headers.set(&b"Host"[..], Bytes::from(host.as_bytes().to_vec()));
        headers.set(&b"User-Agent"[..], Bytes::from_static(USER_AGENT.as_bytes()));
        Self {
            conn,
            method,
            target: target.to_string(),
            version,
            headers: Mutex::new(headers),
            declared_length: Mutex::new(None),
            chunked: AtomicBool::new(false),
            custom_te: Mutex::new(None),
            expects_continue: AtomicBool::new(false),
            headers_sent: AtomicBool::new(false),
            preset_response: Mutex::new(None),
        }
    }

    /// Set a request header. `Content-Length`, `Transfer-Encoding`, and
    /// `Expect` are additionally parsed to drive body-framing decisions
    /// in `begin_body`.
    pub fn set_header(&self, name: &str, value: impl Into<Bytes>) {
        let value = value.into();
        match name.to_ascii_lowercase().as_str() {
            "content-length" => {
                if let Ok(n) = std::str::from_utf8(&value).unwrap_or("").parse::<u64>() {
                    *self.declared_length.lock() = Some(n);
                }
            }
            "transfer-encoding" => {
                let is_chunked = value.eq_ignore_ascii_case(b"chunked");
                self.chunked.store(is_chunked, Ordering::Release);
                if !is_chunked {
                    *self.custom_te.lock() = Some(String::from_utf8_lossy(&value).into_owned());
                }
            }
            "expect" => {
                self.expects_continue.store(value.eq_ignore_ascii_case(b"100-continue"), Ordering::Release);
            }
            _ => {}
        }
        self.headers.lock().set(Bytes::from(name.as_bytes().to_vec()), value);
    }

    async fn write_request_head(&self) -> std::io::Result<()> {
        let mut out = Vec::new();
        out.extend_from_slice(self.method.as_str().as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.target.as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.version.as_str().as_bytes());
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.headers.lock().to_wire());
        out.extend_from_slice(b"\r\n");
        self.conn.write(&out).await?;
        Ok(())
    }

    async fn read_response_head(&self) -> std::io::Result<ResponseHead> {
        let head = match read_until(&self.conn, b"\r\n\r\n", MAX_HEADER_BYTES).await? {
            ReadUntilOutcome::Found(bytes) => bytes,
            _ => return Err(protocol_error("truncated or oversized response headers")),
        };
        let text = std::str::from_utf8(&head).map_err(|_| protocol_error("non-UTF8 response headers"))?;
        let mut lines = text.split("\r\n");
        let status_line = lines.next().ok_or_else(|| protocol_error("missing status line"))?;
        let mut parts = status_line.splitn(3, ' ');
        let (Some(version_str), Some(code_str), message) = (parts.next(), parts.next(), parts.next()) else {
            return Err(protocol_error("malformed status line"));
        };
        let version = Version::parse(version_str).ok_or_else(|| protocol_error("unsupported HTTP version"))?;
        let code: u16 = code_str.parse().map_err(|_| protocol_error("malformed status code"))?;
        let _ = message; // any server-supplied reason phrase is accepted and discarded
        let mut headers = HeaderMap::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            let (name, value) = line.split_once(':').ok_or_else(|| protocol_error("malformed header line"))?;
            headers.append(Bytes::from(name.trim().as_bytes().to_vec()), Bytes::from(value.trim().as_bytes().to_vec()));
        }
        Ok(ResponseHead { version, status: Status(code), headers })
    }

    fn make_write_body_stream(&self) -> SharedStream {
        if let Some(len) = *self.declared_length.lock() {
            Arc::new(LimitedStream::write_only(self.conn.clone(), len, ShortWriteEofPolicy::Error))
        } else if self.custom_te.lock().is_some() {
            self.conn.clone()
        } else {
            Arc::new(ChunkedStream::new(self.conn.clone(), ExtensionPolicy::Ignore))
        }
    }

    /// Send headers and return a writable body stream. With `Expect:
    /// 100-continue` set, headers are sent and the status line is read
    /// first; a non-100 reply yields a null stream and presets the
    /// response for `send()` to surface without writing a body.
    pub async fn begin_body(&self) -> std::io::Result<SharedStream> {
        self.headers_sent.store(true, Ordering::Release);
        self.write_request_head().await?;
        if self.expects_continue.load(Ordering::Acquire) {
            let head = self.read_response_head().await?;
            if head.status.0 == 100 {
                Ok(self.make_write_body_stream())
            } else {
                *self.preset_response.lock() = Some(head);
                Ok(Arc::new(NullStream))
            }
        } else {
            Ok(self.make_write_body_stream())
        }
    }

    /// Send the request (if not already sent via `begin_body`) and read
    /// the response. If `begin_body` already observed a non-100 status
    /// under `Expect: 100-continue`, that preset status is returned
    /// without re-reading the wire.
    pub async fn send(&self) -> std::io::Result<HttpClientResponse> {
        let head = if let Some(head) = self.preset_response.lock().take() {
            head
        } else {
            if !self.headers_sent.swap(true, Ordering::AcqRel) {
                self.write_request_head().await?;
            }
            self.read_response_head().await?
        };
        self.build_response(head)
    }

    fn build_response(&self, head: ResponseHead) -> std::io::Result<HttpClientResponse> {
        let has_content_length = head.headers.contains(b"Content-Length");
        let is_chunked = head.headers.get_str("Transfer-Encoding").map(|v| v.eq_ignore_ascii_case("chunked")).unwrap_or(false);
        let body: SharedStream = if is_chunked {
            Arc::new(ChunkedStream::new(self.conn.clone(), ExtensionPolicy::Ignore))
        } else if has_content_length {
            let len = head
                .headers
                .get_str("Content-Length")
                .and_then(|v| v.parse::<u64>().ok())
                .ok_or_else(|| protocol_error("malformed Content-Length"))?;
            Arc::new(LimitedStream::read_only(self.conn.clone(), len))
        } else {
            Arc::new(NullStream)
        };
        let keep_alive = match head.headers.get_str("Connection").map(str::to_ascii_lowercase) {
            Some(ref v) if v == "close" => false,
            Some(ref v) if v == "keep-alive" => true,
            _ => head.version.default_keep_alive(),
        };
        Ok(HttpClientResponse { version: head.version, status: head.status, headers: head.headers, keep_alive, body })
    }
}

fn protocol_error(msg: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, msg.to_string())
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
    fn sends_request_line_and_reads_response() {
        let inner = Arc::new(MemStream::with_input(
            b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello".to_vec(),
        ));
        let shared: SharedStream = inner.clone();
        let req = HttpClientRequest::new(shared, Method::Get, "example.com", "/", Version::Http11);
        let resp = futures::executor::block_on(req.send()).unwrap();
        assert_eq!(resp.status.0, 200);
        assert!(resp.keep_alive);
        let body = futures::executor::block_on(resp.body.read()).unwrap();
        assert_eq!(&body[..], b"hello");
        let sent = String::from_utf8(inner.written()).unwrap();
        assert!(sent.starts_with("GET / HTTP/1.1\r\n"));
        assert!(sent.contains("Host: example.com\r\n"));
    }

    #[test]
    fn expect_continue_with_non_100_skips_body_write() {
        let inner = Arc::new(MemStream::with_input(b"HTTP/1.1 417 Expectation Failed\r\n\r\n".to_vec()));
        let shared: SharedStream = inner;
        let req = HttpClientRequest::new(shared, Method::Post, "example.com", "/upload", Version::Http11);
        req.set_header("Content-Length", Bytes::from_static(b"4"));
        req.set_header("Expect", Bytes::from_static(b"100-continue"));
        let body = futures::executor::block_on(req.begin_body()).unwrap();
        let wrote = futures::executor::block_on(body.write(b"Done")).unwrap();
        assert!(!wrote); // NullStream reports the write as not progressing
        let resp = futures::executor::block_on(req.send()).unwrap();
        assert_eq!(resp.status.0, 417);
    }
}
