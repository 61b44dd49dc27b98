//! HTTP server dispatcher: a longest-prefix route table plus the
//! per-connection request/response loop.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use conduit_core::context::Listener;

use crate::common::{Method, Status};
use crate::server::{HttpServerRequest, LoadOutcome};

/// One routed handler. Implementations write a response via the
/// `HttpServerRequest` they're handed (`send`/`send_stream`); the
/// dispatcher only decides which handler runs and closes the
/// connection if it returns an error.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, req: &HttpServerRequest) -> std::io::Result<()>;
}

/// Lifecycle hooks a caller can register to observe dispatcher activity
/// (logging, metrics, etc.) without changing request handling.
pub trait Tracing: Send + Sync {
    fn on_open(&self, _peer: &str) {}
    fn on_load(&self, _peer: &str, _method: &str, _path: &str) {}
    fn on_finish(&self, _peer: &str, _status: u16) {}
    fn on_close(&self, _peer: &str) {}
    fn on_exception(&self, _peer: &str, _error: &std::io::Error) {}
}

struct NoopTracing;
impl Tracing for NoopTracing {}

/// An error-page handler registered under the synthetic path
/// `error_<code>`, invoked instead of the built-in minimal page.
#[async_trait]
pub trait ErrorHandler: Send + Sync {
    // (supertrait kept explicit: instances are stored behind `Arc` and
    // invoked from spawned per-connection tasks)
    async fn handle(&self, req: &HttpServerRequest, status: Status) -> std::io::Result<()>;
}

struct PrefixEntry {
    prefix: String,
    methods: HashMap<Method, Arc<dyn Handler>>,
}

/// Owns the routing table and drives the accept loop.
pub struct Dispatcher {
    routes: Vec<PrefixEntry>,
    error_handlers: HashMap<u16, Arc<dyn ErrorHandler>>,
    tracing: Arc<dyn Tracing>,
}

impl Dispatcher {
    #[must_use]
    pub fn new() -> Self {
        Self { routes: Vec::new(), error_handlers: HashMap::new(), tracing: Arc::new(NoopTracing) }
    }

    pub fn set_tracing(&mut self, tracing: Arc<dyn Tracing>) {
        self.tracing = tracing;
    }

    /// Register `handler` for `method` under `prefix`. Multiple methods
    /// may share a prefix; the longest matching prefix wins at dispatch
    /// time regardless of registration order.
    pub fn route(&mut self, prefix: impl Into<String>, method: Method, handler: Arc<dyn Handler>) {
        let prefix = prefix.into();
        if let Some(entry) = self.routes.iter_mut().find(|e| e.prefix == prefix) {
            entry.methods.insert(method, handler);
            return;
        }
        let mut methods = HashMap::new();
        methods.insert(method, handler);
        self.routes.push(PrefixEntry { prefix, methods });
    }

    /// Register a custom error page for `status` (synthetic path
    /// `error_<code>` in spec terms).
    pub fn route_error(&mut self, status: u16, handler: Arc<dyn ErrorHandler>) {
        self.error_handlers.insert(status, handler);
    }

    fn longest_match(&self, path: &str) -> Option<&PrefixEntry> {
        self.routes.iter().filter(|e| path.starts_with(e.prefix.as_str())).max_by_key(|e| e.prefix.len())
    }

    /// Accept connections from `listener` forever, spawning one
    /// coroutine per connection on `executor`.
    pub async fn serve(self: Arc<Self>, listener: Listener, executor: Arc<async_executor::Executor<'static>>) {
        loop {
            let (conn, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => continue,
            };
            let dispatcher = Arc::clone(&self);
            let exec = Arc::clone(&executor);
            exec.spawn(async move {
                let peer = peer.to_string();
                dispatcher.tracing.on_open(&peer);
                dispatcher.serve_connection(conn, &peer).await;
                dispatcher.tracing.on_close(&peer);
            })
            .detach();
        }
    }

    async fn serve_connection(&self, conn: conduit_core::stream::SharedStream, peer: &str) {
        loop {
            let outcome = match HttpServerRequest::load(conn.clone()).await {
                Ok(outcome) => outcome,
                Err(_) => return,
            };
            let req = match outcome {
                LoadOutcome::Request(req) => req,
                LoadOutcome::Eof => return,
                LoadOutcome::ParseError(status) => {
                    let placeholder = HttpServerRequest::synthetic(conn.clone());
                    placeholder.set_status(status.0);
                    let _ = self.send_error_page(&placeholder, status).await;
                    return;
                }
            };

            self.tracing.on_load(peer, req.method.as_str(), &req.path);

            let dispatch_result = self.dispatch_one(&req).await;
            match dispatch_result {
                Ok(()) => self.tracing.on_finish(peer, req.response_status()),
                Err(err) => {
                    self.tracing.on_exception(peer, &err);
                    return;
                }
            }

            if !req.keep_alive() {
                return;
            }
        }
    }

    async fn dispatch_one(&self, req: &HttpServerRequest) -> std::io::Result<()> {
        match self.longest_match(&req.path) {
            Some(entry) => match entry.methods.get(&req.method) {
                Some(handler) => handler.handle(req).await,
                None => {
                    let allow: Vec<&str> = entry.methods.keys().map(|m| m.as_str()).collect();
                    req.set_header(&b"Allow"[..], allow.join(", ").into_bytes());
                    self.send_error_page(req, Status::METHOD_NOT_ALLOWED).await
                }
            },
            None => self.send_error_page(req, Status::NOT_FOUND).await,
        }
    }

    async fn send_error_page(&self, req: &HttpServerRequest, status: Status) -> std::io::Result<()> {
        if let Some(handler) = self.error_handlers.get(&status.0) {
            return handler.handle(req, status).await;
        }
        req.set_status(status.0);
        let body = format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<html xmlns=\"http://www.w3.org/1999/xhtml\">\n<head><title>{code} {msg}</title></head>\n<body><h1>{code} {msg}</h1></body>\n</html>",
            code = status.0,
            msg = status.canonical_message(),
        );
        req.send(body.as_bytes()).await.map(|_| ())
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    mod mem {
        include!("test_support/memstream.rs");
    }
    use conduit_core::stream::SharedStream;
    use mem::MemStream;

    struct Ok200;
    #[async_trait]
    impl Handler for Ok200 {
        async fn handle(&self, req: &HttpServerRequest) -> std::io::Result<()> {
            req.send(b"hi").await.map(|_| ())
        }
    }

    async fn load(input: &[u8]) -> HttpServerRequest {
        let conn: SharedStream = Arc::new(MemStream::with_input(input.to_vec()));
        match HttpServerRequest::load(conn).await.unwrap() {
            LoadOutcome::Request(r) => r,
            _ => panic!("expected a parsed request"),
        }
    }

    #[test]
    fn dispatches_to_longest_matching_prefix() {
        futures::executor::block_on(async {
            let mut d = Dispatcher::new();
            d.route("/", Method::Get, Arc::new(Ok200));
            d.route("/api", Method::Get, Arc::new(Ok200));
            let req = load(b"GET /api/widgets HTTP/1.1\r\nHost: h\r\n\r\n").await;
            assert!(d.dispatch_one(&req).await.is_ok());
        });
    }

    #[test]
    fn missing_method_yields_405_with_allow_header() {
        futures::executor::block_on(async {
            let mut d = Dispatcher::new();
            d.route("/widgets", Method::Get, Arc::new(Ok200));
            let req = load(b"POST /widgets HTTP/1.1\r\nHost: h\r\n\r\n").await;
            d.dispatch_one(&req).await.unwrap();
            assert_eq!(req.response_status(), 405);
            assert_eq!(req.response_header("Allow").as_deref(), Some("GET"));
        });
    }

    #[test]
    fn unmatched_prefix_yields_404() {
        futures::executor::block_on(async {
            let d = Dispatcher::new();
            let req = load(b"GET /missing HTTP/1.1\r\nHost: h\r\n\r\n").await;
            d.dispatch_one(&req).await.unwrap();
            assert_eq!(req.response_status(), 404);
        });
    }
}
