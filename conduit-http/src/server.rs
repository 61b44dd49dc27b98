//! HTTP/1 server request/response state machine: parses one request off
//! a connection stream, then lets the caller build and send a response.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use conduit_core::chunked::{ChunkedStream, ExtensionPolicy};
use conduit_core::limited::{LimitedStream, ShortWriteEofPolicy};
use conduit_core::reader::{read_until, ReadUntilOutcome};
use conduit_core::stream::{NullStream, SharedStream, Stream};
use parking_lot::Mutex;

use crate::common::{split_path_query, ContentType, HeaderMap, Method, Query, Status, Version};
use crate::date::http_date_now;

const MAX_HEADER_BYTES: usize = 64 * 1024;
const SERVER_BANNER: &str = "Conduit/0.1";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BodyFraming {
    None,
    Length(u64),
    Chunked,
}

/// What [`HttpServerRequest::load`] produced.
pub enum LoadOutcome {
    Request(HttpServerRequest),
    /// The peer closed the connection before sending a request.
    Eof,
    /// The request could not be parsed; the caller should send this
    /// status (with a generic body) and close the connection.
    ParseError(Status),
}

struct ResponseState {
    status: Status,
    headers: HeaderMap,
}

/// One HTTP/1 request read off a connection, with a response being
/// built against the same connection.
pub struct HttpServerRequest {
    conn: SharedStream,
    pub method: Method,
    pub path: String,
    pub query: Query,
    pub version: Version,
    pub headers: HeaderMap,
    keep_alive: bool,
    expects_continue: bool,
    body_framing: BodyFraming,
    continue_sent: AtomicBool,
    body_taken: AtomicBool,
    committed: AtomicBool,
    response: Mutex<ResponseState>,
}

impl HttpServerRequest {
    /// A request-less placeholder good only for sending an error
    /// response and closing, used when `load` itself failed to parse a
    /// request line (so no real method/path/version exist yet).
    #[must_use]
    pub fn synthetic(conn: SharedStream) -> Self {
        HttpServerRequest {
            conn,
            method: Method::Get,
            path: String::new(),
            query: Query::parse(""),
            version: Version::Http11,
            headers: HeaderMap::new(),
            keep_alive: false,
            expects_continue: false,
            body_framing: BodyFraming::None,
            continue_sent: AtomicBool::new(true),
            body_taken: AtomicBool::new(true),
            committed: AtomicBool::new(false),
            response: Mutex::new(ResponseState { status: Status::OK, headers: HeaderMap::new() }),
        }
    }

    /// Read and parse one request off `conn`. Does not handle
    /// keep-alive looping; the caller re-invokes `load` on the same
    /// connection stream after a response completes.
    pub async fn load(conn: SharedStream) -> std::io::Result<LoadOutcome> {
        let head = match read_until(&conn, b"\r\n\r\n", MAX_HEADER_BYTES).await? {
            ReadUntilOutcome::Found(bytes) => bytes,
            ReadUntilOutcome::Eof(bytes) if bytes.is_empty() => return Ok(LoadOutcome::Eof),
            ReadUntilOutcome::Eof(_) | ReadUntilOutcome::Timeout(_) => {
                return Ok(LoadOutcome::ParseError(Status::BAD_REQUEST));
            }
            ReadUntilOutcome::TooLong => return Ok(LoadOutcome::ParseError(Status(431))),
        };

        let text = match std::str::from_utf8(&head) {
            Ok(t) => t,
            Err(_) => return Ok(LoadOutcome::ParseError(Status::BAD_REQUEST)),
        };
        let mut lines = text.split("\r\n");
        let Some(request_line) = lines.next() else {
            return Ok(LoadOutcome::ParseError(Status::BAD_REQUEST));
        };
        let mut parts = request_line.split(' ');
        let (Some(method_str), Some(target), Some(version_str)) = (parts.next(), parts.next(), parts.next()) else {
            return Ok(LoadOutcome::ParseError(Status::BAD_REQUEST));
        };
        let Some(method) = Method::parse(method_str) else {
            return Ok(LoadOutcome::ParseError(Status::BAD_REQUEST));
        };
        let Some(version) = Version::parse(version_str) else {
            return Ok(LoadOutcome::ParseError(Status::BAD_REQUEST));
        };

        let mut headers = HeaderMap::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            let Some((name, value)) = line.split_once(':') else {
                return Ok(LoadOutcome::ParseError(Status::BAD_REQUEST));
            };
            headers.append(Bytes::from(name.trim().as_bytes().to_vec()), Bytes::from(value.trim().as_bytes().to_vec()));
        }

        let has_content_length = headers.contains(b"Content-Length");
        let transfer_encoding = headers.get_str("Transfer-Encoding").map(str::to_ascii_lowercase);
        let is_chunked = transfer_encoding.as_deref() == Some("chunked");
        if let Some(te) = &transfer_encoding {
            if te != "chunked" {
                return Ok(LoadOutcome::ParseError(Status::NOT_IMPLEMENTED));
            }
        }
        if has_content_length && is_chunked {
            return Ok(LoadOutcome::ParseError(Status::BAD_REQUEST));
        }
        if !method.allows_body() && (has_content_length || is_chunked) {
            return Ok(LoadOutcome::ParseError(Status::BAD_REQUEST));
        }

        let body_framing = if is_chunked {
            BodyFraming::Chunked
        } else if has_content_length {
            match headers.get_str("Content-Length").and_then(|v| v.parse::<u64>().ok()) {
                Some(len) => BodyFraming::Length(len),
                None => return Ok(LoadOutcome::ParseError(Status::BAD_REQUEST)),
            }
        } else {
            BodyFraming::None
        };

        let expects_continue = method.allows_body()
            && headers.get_str("Expect").map(|v| v.eq_ignore_ascii_case("100-continue")).unwrap_or(false);

        let keep_alive = match headers.get_str("Connection").map(str::to_ascii_lowercase) {
            Some(ref v) if v == "close" => false,
            Some(ref v) if v == "keep-alive" => true,
            _ => version.default_keep_alive(),
        };

        let (path, query_str) = split_path_query(target);
        let path = path.to_string();
        let query = Query::parse(query_str.unwrap_or(""));

        Ok(LoadOutcome::Request(HttpServerRequest {
            conn,
            method,
            path,
            query,
            version,
            headers,
            keep_alive,
            expects_continue,
            body_framing,
            continue_sent: AtomicBool::new(false),
            body_taken: AtomicBool::new(false),
            committed: AtomicBool::new(false),
            response: Mutex::new(ResponseState { status: Status::OK, headers: HeaderMap::new() }),
        }))
    }

    #[must_use]
    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Set the response status code; the canonical reason message is
    /// filled in when the status line is written.
    pub fn set_status(&self, code: u16) {
        self.response.lock().status = Status(code);
    }

    pub fn set_header(&self, name: impl Into<Bytes>, value: impl Into<Bytes>) {
        self.response.lock().headers.set(name, value);
    }

    /// The status code currently set on the (possibly not-yet-sent)
    /// response, for callers that need to inspect what a dispatcher
    /// decided (e.g. tracing hooks, tests).
    #[must_use]
    pub fn response_status(&self) -> u16 {
        self.response.lock().status.0
    }

    /// A response header value currently set, if any.
    #[must_use]
    pub fn response_header(&self, name: &str) -> Option<String> {
        self.response.lock().headers.get_str(name).map(str::to_string)
    }

    /// Obtain the request body stream. If `Expect: 100-continue` was
    /// requested, sends the interim `100 Continue` response first.
    pub async fn get_body(&self) -> std::io::Result<SharedStream> {
        if self.body_taken.swap(true, Ordering::AcqRel) {
            return Ok(Arc::new(NullStream));
        }
        if self.expects_continue && !self.continue_sent.swap(true, Ordering::AcqRel) {
            let line = format!("{} 100 Continue\r\n\r\n", self.version.as_str());
            self.conn.write(line.as_bytes()).await?;
        }
        Ok(self.make_body_stream())
    }

    fn make_body_stream(&self) -> SharedStream {
        match self.body_framing {
            BodyFraming::None => Arc::new(NullStream),
            BodyFraming::Length(n) => Arc::new(LimitedStream::read_only(self.conn.clone(), n)),
            BodyFraming::Chunked => Arc::new(ChunkedStream::new(self.conn.clone(), ExtensionPolicy::Ignore)),
        }
    }

    /// If a request body was advertised and never read, and no
    /// `100-continue` is still pending, drain and discard it so the next
    /// request on a kept-alive connection starts at the right offset.
    async fn discard_unread_body(&self) -> std::io::Result<()> {
        if self.body_framing == BodyFraming::None {
            return Ok(());
        }
        if self.expects_continue && !self.continue_sent.load(Ordering::Acquire) {
            return Ok(());
        }
        if self.body_taken.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let body = self.make_body_stream();
        loop {
            let chunk = body.read().await?;
            if chunk.is_empty() {
                break;
            }
        }
        Ok(())
    }

    fn effective_keep_alive(&self, headers: &HeaderMap) -> bool {
        match headers.get_str("Connection").map(str::to_ascii_lowercase) {
            Some(ref v) if v == "close" => false,
            Some(ref v) if v == "keep-alive" => true,
            _ => self.keep_alive,
        }
    }

    /// Write the status line and headers, filling in defaults, and
    /// return whether the connection stays alive afterwards.
    async fn write_preamble(&self, content_length: Option<u64>, chunked: bool) -> std::io::Result<bool> {
        let mut resp = self.response.lock();
        if !resp.headers.contains(b"Date") {
            resp.headers.set(&b"Date"[..], Bytes::from(http_date_now()));
        }
        if !resp.headers.contains(b"Server") {
            resp.headers.set(&b"Server"[..], Bytes::from_static(SERVER_BANNER.as_bytes()));
        }
        if !resp.headers.contains(b"Content-Type") {
            resp.headers.set(&b"Content-Type"[..], Bytes::from_static(ContentType::OctetStream.as_str().as_bytes()));
        }
        let keep_alive = self.effective_keep_alive(&resp.headers);
        if !resp.headers.contains(b"Content-Length") && !resp.headers.contains(b"Transfer-Encoding") {
            if let Some(len) = content_length {
                resp.headers.set(&b"Content-Length"[..], Bytes::from(len.to_string()));
            } else if chunked {
                resp.headers.set(&b"Transfer-Encoding"[..], Bytes::from_static(b"chunked"));
            }
        }
        if !resp.headers.contains(b"Connection") {
            resp.headers.set(&b"Connection"[..], Bytes::from_static(if keep_alive { b"keep-alive" } else { b"close" }));
        }

        let mut out = Vec::new();
        out.extend_from_slice(self.version.as_str().as_bytes());
        out.push(b' ');
        out.extend_from_slice(resp.status.0.to_string().as_bytes());
        out.push(b' ');
        out.extend_from_slice(resp.status.canonical_message().as_bytes());
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&resp.headers.to_wire());
        out.extend_from_slice(b"\r\n");
        drop(resp);

        self.conn.write(&out).await?;
        Ok(keep_alive)
    }

    /// Send a complete response with a known body. Returns whether the
    /// connection may be reused for another request.
    pub async fn send(&self, body: &[u8]) -> std::io::Result<bool> {
        self.discard_unread_body().await?;
        self.committed.store(true, Ordering::Release);
        let keep_alive = self.write_preamble(Some(body.len() as u64), false).await?;
        if !body.is_empty() {
            self.conn.write(body).await?;
        }
        if !keep_alive {
            self.conn.write_eof().await;
        }
        Ok(keep_alive)
    }

    /// Begin a streamed response body: chunked if the caller set
    /// `Transfer-Encoding: chunked` or left framing unset, length-limited
    /// if the caller set `Content-Length`. Returns the writable body
    /// stream and whether the connection stays alive once it closes.
    pub async fn send_stream(&self) -> std::io::Result<(SharedStream, bool)> {
        self.discard_unread_body().await?;
        self.committed.store(true, Ordering::Release);
        let declared_len = {
            let resp = self.response.lock();
            resp.headers.get_str("Content-Length").and_then(|v| v.parse::<u64>().ok())
        };
        let chunked = declared_len.is_none();
        let keep_alive = self.write_preamble(declared_len, chunked).await?;
        let body: SharedStream = match declared_len {
            Some(len) => Arc::new(LimitedStream::write_only(self.conn.clone(), len, ShortWriteEofPolicy::Error)),
            None => Arc::new(ChunkedStream::new(self.conn.clone(), ExtensionPolicy::Ignore)),
        };
        Ok((body, keep_alive))
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
    fn parses_get_request_line_and_headers() {
        let inner = Arc::new(MemStream::with_input(b"GET /path?x=1 HTTP/1.1\r\nHost: example.com\r\n\r\n".to_vec()));
        let conn: SharedStream = inner;
        let outcome = futures::executor::block_on(HttpServerRequest::load(conn)).unwrap();
        let req = match outcome {
            LoadOutcome::Request(r) => r,
            _ => panic!("expected a request"),
        };
        assert_eq!(req.method, Method::Get);
        assert_eq!(req.path, "/path");
        assert_eq!(req.query.get("x"), Some("1"));
        assert_eq!(req.version, Version::Http11);
        assert!(req.keep_alive());
    }

    #[test]
    fn http_10_response_closes_by_default() {
        let inner = Arc::new(MemStream::with_input(b"GET /path HTTP/1.0\r\nHost: example.com\r\n\r\n".to_vec()));
        let shared: SharedStream = inner.clone();
        let outcome = futures::executor::block_on(HttpServerRequest::load(shared)).unwrap();
        let req = match outcome {
            LoadOutcome::Request(r) => r,
            _ => panic!("expected a request"),
        };
        req.set_header(&b"Date"[..], &b"Fri, 29 Apr 2022 12:49:47 GMT"[..]);
        req.set_header(&b"Content-Type"[..], &b"text/html;charset=utf-8"[..]);
        let body = b"<html><body>It's works</body></html>";
        let keep_alive = futures::executor::block_on(req.send(body)).unwrap();
        assert!(!keep_alive);
        let written = String::from_utf8(inner.written()).unwrap();
        assert!(written.starts_with("HTTP/1.0 200 OK\r\n"));
        assert!(written.contains("Content-Length: 36\r\n"));
        assert!(written.contains("Connection: close\r\n"));
        assert!(written.ends_with("<html><body>It's works</body></html>"));
    }

    #[test]
    fn get_with_content_length_is_bad_request() {
        let inner = Arc::new(MemStream::with_input(b"GET / HTTP/1.1\r\nContent-Length: 4\r\n\r\n".to_vec()));
        let conn: SharedStream = inner;
        let outcome = futures::executor::block_on(HttpServerRequest::load(conn)).unwrap();
        assert!(matches!(outcome, LoadOutcome::ParseError(Status(400))));
    }

    #[test]
    fn unknown_transfer_encoding_is_not_implemented() {
        let inner = Arc::new(MemStream::with_input(b"POST / HTTP/1.1\r\nTransfer-Encoding: gzip\r\n\r\n".to_vec()));
        let conn: SharedStream = inner;
        let outcome = futures::executor::block_on(HttpServerRequest::load(conn)).unwrap();
        assert!(matches!(outcome, LoadOutcome::ParseError(Status(501))));
    }

    #[test]
    fn expect_continue_sends_interim_response_before_body() {
        let inner = Arc::new(MemStream::with_input(
            b"POST /upload HTTP/1.1\r\nContent-Length: 4\r\nExpect: 100-continue\r\n\r\nDone".to_vec(),
        ));
        let shared: SharedStream = inner.clone();
        let outcome = futures::executor::block_on(HttpServerRequest::load(shared)).unwrap();
        let req = match outcome {
            LoadOutcome::Request(r) => r,
            _ => panic!("expected a request"),
        };
        let body = futures::executor::block_on(req.get_body()).unwrap();
        let read = futures::executor::block_on(body.read()).unwrap();
        assert_eq!(&read[..], b"Done");
        assert_eq!(inner.written(), b"HTTP/1.1 100 Continue\r\n\r\n");
    }
}
