//! TLS record-layer adapter: wraps a [`Stream`] to decrypt/encrypt via
//! `rustls`. Cipher suites and certificate validation are entirely
//! delegated to `rustls`; this module only bridges its synchronous,
//! buffer-based API onto the asynchronous stream contract — reading
//! whatever ciphertext is available from the inner stream, feeding it
//! to the connection state machine, and reading plaintext back out.

use std::io::{self, Read, Write};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::stream::{SharedStream, Stream};
use crate::timeout::Timeouts;

enum Role {
    Client(rustls::ClientConnection),
    Server(rustls::ServerConnection),
}

macro_rules! forward {
    ($self:expr, $method:ident($($arg:expr),*)) => {
        match $self {
            Role::Client(c) => c.$method($($arg),*),
            Role::Server(c) => c.$method($($arg),*),
        }
    };
}

impl Role {
    fn is_handshaking(&self) -> bool {
        forward!(self, is_handshaking())
    }

    fn wants_write(&self) -> bool {
        forward!(self, wants_write())
    }

    fn read_tls(&mut self, r: &mut dyn Read) -> io::Result<usize> {
        forward!(self, read_tls(r))
    }

    fn write_tls(&mut self, w: &mut dyn Write) -> io::Result<usize> {
        forward!(self, write_tls(w))
    }

    fn process_new_packets(&mut self) -> Result<rustls::IoState, rustls::Error> {
        forward!(self, process_new_packets())
    }

    fn reader(&mut self) -> rustls::Reader<'_> {
        match self {
            Role::Client(c) => c.reader(),
            Role::Server(c) => c.reader(),
        }
    }

    fn writer(&mut self) -> rustls::Writer<'_> {
        match self {
            Role::Client(c) => c.writer(),
            Role::Server(c) => c.writer(),
        }
    }

    fn send_close_notify(&mut self) {
        forward!(self, send_close_notify())
    }
}

/// TLS-wrapped stream: application data in, ciphertext out (and back).
pub struct TlsStream {
    inner: SharedStream,
    conn: Mutex<Role>,
    eof: Mutex<bool>,
    /// Single-slot putback for decrypted plaintext. Kept separate from
    /// the inner stream's putback slot, which only ever holds ciphertext.
    pending_putback: Mutex<Bytes>,
}

fn to_io_error(e: rustls::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e.to_string())
}

impl TlsStream {
    #[must_use]
    pub fn client(inner: SharedStream, config: Arc<rustls::ClientConfig>, server_name: rustls::pki_types::ServerName<'static>) -> io::Result<Self> {
        let conn = rustls::ClientConnection::new(config, server_name).map_err(to_io_error)?;
        Ok(Self { inner, conn: Mutex::new(Role::Client(conn)), eof: Mutex::new(false), pending_putback: Mutex::new(Bytes::new()) })
    }

    #[must_use]
    pub fn server(inner: SharedStream, config: Arc<rustls::ServerConfig>) -> io::Result<Self> {
        let conn = rustls::ServerConnection::new(config).map_err(to_io_error)?;
        Ok(Self { inner, conn: Mutex::new(Role::Server(conn)), eof: Mutex::new(false), pending_putback: Mutex::new(Bytes::new()) })
    }

    /// Drive handshake records back and forth until complete, or the
    /// inner stream hits EOF first.
    pub async fn handshake(&self) -> io::Result<()> {
        loop {
            if !self.conn.lock().is_handshaking() {
                return Ok(());
            }
            self.flush_outgoing().await?;
            if !self.conn.lock().is_handshaking() {
                return Ok(());
            }
            if !self.pull_incoming().await? {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed during TLS handshake"));
            }
        }
    }

    /// Push any ciphertext rustls has queued for us out to the inner
    /// stream.
    async fn flush_outgoing(&self) -> io::Result<()> {
        loop {
            let mut out = Vec::new();
            let wrote = {
                let mut conn = self.conn.lock();
                if !conn.wants_write() {
                    break;
                }
                conn.write_tls(&mut out)?
            };
            if wrote == 0 {
                break;
            }
            if !self.inner.write(&out).await? {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer closed while writing TLS record"));
            }
        }
        Ok(())
    }

    /// Read one chunk of ciphertext from the inner stream and feed it
    /// in. Returns `false` on inner EOF.
    async fn pull_incoming(&self) -> io::Result<bool> {
        let chunk = self.inner.read().await?;
        if chunk.is_empty() {
            return Ok(false);
        }
        let mut cursor = &chunk[..];
        let mut conn = self.conn.lock();
        conn.read_tls(&mut cursor)?;
        conn.process_new_packets().map_err(to_io_error)?;
        Ok(true)
    }
}

#[async_trait]
impl Stream for TlsStream {
    async fn read(&self) -> io::Result<Bytes> {
        {
            let mut pb = self.pending_putback.lock();
            if !pb.is_empty() {
                return Ok(std::mem::take(&mut pb));
            }
        }
        loop {
            self.flush_outgoing().await?;

            let mut plain = vec![0u8; 16 * 1024];
            let attempt = self.conn.lock().reader().read(&mut plain);
            match attempt {
                Ok(0) => {
                    if *self.eof.lock() {
                        return Ok(Bytes::new());
                    }
                }
                Ok(n) => return Ok(Bytes::copy_from_slice(&plain[..n])),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }

            if !self.pull_incoming().await? {
                *self.eof.lock() = true;
                return Ok(Bytes::new());
            }
        }
    }

    async fn read_nb(&self) -> Bytes {
        let mut plain = vec![0u8; 16 * 1024];
        match self.conn.lock().reader().read(&mut plain) {
            Ok(n) if n > 0 => Bytes::copy_from_slice(&plain[..n]),
            _ => Bytes::new(),
        }
    }

    fn put_back(&self, bytes: Bytes) {
        *self.pending_putback.lock() = bytes;
    }

    async fn write(&self, buf: &[u8]) -> io::Result<bool> {
        {
            let mut conn = self.conn.lock();
            conn.writer().write_all(buf)?;
        }
        self.flush_outgoing().await?;
        Ok(true)
    }

    async fn write_eof(&self) -> bool {
        {
            let mut conn = self.conn.lock();
            conn.send_close_notify();
        }
        let _ = self.flush_outgoing().await;
        self.inner.write_eof().await
    }

    fn shutdown(&self) {
        self.inner.shutdown();
    }

    fn is_read_timeout(&self) -> bool {
        self.inner.is_read_timeout()
    }

    fn get_timeouts(&self) -> Timeouts {
        self.inner.get_timeouts()
    }

    fn set_timeouts(&self, timeouts: Timeouts) {
        self.inner.set_timeouts(timeouts);
    }
}
