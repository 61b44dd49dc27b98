//! HTTP/1 common types: method/version/status/MIME enums, the
//! case-insensitive header map, and the query-string parser. Shared by
//! both the server and client state machines.

use bytes::Bytes;

/// HTTP request method.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Options,
    Patch,
    Trace,
    Connect,
}

impl Method {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Options => "OPTIONS",
            Self::Patch => "PATCH",
            Self::Trace => "TRACE",
            Self::Connect => "CONNECT",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "GET" => Self::Get,
            "HEAD" => Self::Head,
            "POST" => Self::Post,
            "PUT" => Self::Put,
            "DELETE" => Self::Delete,
            "OPTIONS" => Self::Options,
            "PATCH" => Self::Patch,
            "TRACE" => Self::Trace,
            "CONNECT" => Self::Connect,
            _ => return None,
        })
    }

    /// `true` for methods RFC 7230 defines a request body for in
    /// practice (excludes `GET`/`HEAD`, where a body is a client error).
    #[must_use]
    pub fn allows_body(self) -> bool {
        !matches!(self, Self::Get | Self::Head)
    }
}

/// HTTP version, restricted to the two 1.x minor versions this system
/// speaks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

impl Version {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http10 => "HTTP/1.0",
            Self::Http11 => "HTTP/1.1",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "HTTP/1.0" => Some(Self::Http10),
            "HTTP/1.1" => Some(Self::Http11),
            _ => None,
        }
    }

    /// Default keep-alive disposition absent a `Connection` header:
    /// 1.1 defaults to keep-alive, 1.0 defaults to close.
    #[must_use]
    pub fn default_keep_alive(self) -> bool {
        matches!(self, Self::Http11)
    }
}

/// Status code plus its canonical reason phrase.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Status(pub u16);

impl Status {
    pub const CONTINUE: Status = Status(100);
    pub const OK: Status = Status(200);
    pub const NO_CONTENT: Status = Status(204);
    pub const MOVED_PERMANENTLY: Status = Status(301);
    pub const FOUND: Status = Status(302);
    pub const NOT_MODIFIED: Status = Status(304);
    pub const BAD_REQUEST: Status = Status(400);
    pub const UNAUTHORIZED: Status = Status(401);
    pub const FORBIDDEN: Status = Status(403);
    pub const NOT_FOUND: Status = Status(404);
    pub const METHOD_NOT_ALLOWED: Status = Status(405);
    pub const EXPECTATION_FAILED: Status = Status(417);
    pub const INTERNAL_SERVER_ERROR: Status = Status(500);
    pub const NOT_IMPLEMENTED: Status = Status(501);

    /// Canonical reason phrase for well-known codes; `"Unknown"` for
    /// anything else (parsing always accepts a server-supplied message
    /// instead, per spec).
    #[must_use]
    pub fn canonical_message(self) -> &'static str {
        match self.0 {
            100 => "Continue",
            200 => "OK",
            201 => "Created",
            204 => "No Content",
            301 => "Moved Permanently",
            302 => "Found",
            304 => "Not Modified",
            400 => "Bad Request",
            401 => "Unauthorized",
            403 => "Forbidden",
            404 => "Not Found",
            405 => "Method Not Allowed",
            417 => "Expectation Failed",
            500 => "Internal Server Error",
            501 => "Not Implemented",
            _ => "Unknown",
        }
    }
}

/// MIME content type, mappable to/from a file extension for static-file
/// serving.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContentType {
    Html,
    PlainText,
    Css,
    Javascript,
    Json,
    Png,
    Jpeg,
    Gif,
    Svg,
    OctetStream,
}

impl ContentType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Html => "text/html;charset=utf-8",
            Self::PlainText => "text/plain;charset=utf-8",
            Self::Css => "text/css",
            Self::Javascript => "application/javascript",
            Self::Json => "application/json",
            Self::Png => "image/png",
            Self::Jpeg => "image/jpeg",
            Self::Gif => "image/gif",
            Self::Svg => "image/svg+xml",
            Self::OctetStream => "application/octet-stream",
        }
    }

    #[must_use]
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_ascii_lowercase().as_str() {
            "html" | "htm" => Self::Html,
            "txt" => Self::PlainText,
            "css" => Self::Css,
            "js" => Self::Javascript,
            "json" => Self::Json,
            "png" => Self::Png,
            "jpg" | "jpeg" => Self::Jpeg,
            "gif" => Self::Gif,
            "svg" => Self::Svg,
            _ => Self::OctetStream,
        }
    }
}

/// A case-insensitive, order-preserving, duplicate-tolerant header map.
///
/// `entries` keeps insertion order for serialization; `index` is a
/// lowercase-name-sorted parallel table (same idiom as a sorted
/// prefix-search index elsewhere in this codebase) giving `O(log n)`
/// first-match lookup without disturbing insertion order.
#[derive(Clone, Debug, Default)]
pub struct HeaderMap {
    entries: Vec<(Bytes, Bytes)>,
    index: Vec<(Bytes, usize)>,
}

fn lower(name: &[u8]) -> Bytes {
    Bytes::from(name.to_ascii_lowercase())
}

impl HeaderMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a header, preserving any existing header of the same name
    /// (duplicate keys are legal, e.g. multiple `Set-Cookie`). Among
    /// headers sharing a name, the earliest-appended stays first in the
    /// index (inserted after, not before, same-name entries already
    /// present), so `get` consistently returns the first value.
    pub fn append(&mut self, name: impl Into<Bytes>, value: impl Into<Bytes>) {
        let name = name.into();
        let idx = self.entries.len();
        let key = lower(&name);
        self.entries.push((name, value.into()));
        let pos = self.index.partition_point(|(k, _)| k.as_ref() <= key.as_ref());
        self.index.insert(pos, (key, idx));
    }

    /// Replace every existing header of this name with a single new
    /// value.
    pub fn set(&mut self, name: impl Into<Bytes>, value: impl Into<Bytes>) {
        let name = name.into();
        self.remove(&name);
        self.append(name, value);
    }

    /// Remove every header matching `name` (case-insensitive).
    pub fn remove(&mut self, name: &[u8]) {
        let key = lower(name);
        let to_remove: Vec<usize> = self
            .index
            .iter()
            .filter(|(k, _)| k == &key)
            .map(|(_, i)| *i)
            .collect();
        if to_remove.is_empty() {
            return;
        }
        self.entries = self
            .entries
            .iter()
            .enumerate()
            .filter(|(i, _)| !to_remove.contains(i))
            .map(|(_, e)| e.clone())
            .collect();
        self.index.clear();
        for (name, value) in std::mem::take(&mut self.entries) {
            self.append(name, value);
        }
    }

    /// First value for `name` (case-insensitive), if present.
    #[must_use]
    pub fn get(&self, name: &[u8]) -> Option<&Bytes> {
        let key = lower(name);
        let pos = self.index.partition_point(|(k, _)| k.as_ref() < key.as_ref());
        self.index.get(pos).filter(|(k, _)| k == &key).map(|(_, i)| &self.entries[*i].1)
    }

    #[must_use]
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name.as_bytes()).and_then(|v| std::str::from_utf8(v).ok())
    }

    #[must_use]
    pub fn contains(&self, name: &[u8]) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Bytes, Bytes)> {
        self.entries.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialize as `Name: value\r\n` lines, in insertion order.
    #[must_use]
    pub fn to_wire(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (name, value) in &self.entries {
            out.extend_from_slice(name);
            out.extend_from_slice(b": ");
            out.extend_from_slice(value);
            out.extend_from_slice(b"\r\n");
        }
        out
    }
}

/// A flat, key-sorted query-string key/value list.
#[derive(Clone, Debug, Default)]
pub struct Query {
    pairs: Vec<(String, String)>,
}

impl Query {
    /// Parse a `key=value&key2=value2` string (the part after `?`),
    /// URL-decoding both keys and values, and sort by key for
    /// deterministic, binary-searchable lookup.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let mut pairs: Vec<(String, String)> = raw
            .split('&')
            .filter(|s| !s.is_empty())
            .map(|pair| match pair.split_once('=') {
                Some((k, v)) => (url_decode(k), url_decode(v)),
                None => (url_decode(pair), String::new()),
            })
            .collect();
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        Self { pairs }
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        let pos = self.pairs.partition_point(|(k, _)| k.as_str() < key);
        self.pairs.get(pos).filter(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Percent-decode `+` as space and `%XX` escapes; invalid escapes pass
/// through verbatim rather than failing the whole parse.
fn url_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                match u8::from_str_radix(std::str::from_utf8(&bytes[i + 1..i + 3]).unwrap_or(""), 16) {
                    Ok(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    Err(_) => {
                        out.push(bytes[i]);
                        i += 1;
                    }
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Split `path?query` into its two parts.
#[must_use]
pub fn split_path_query(target: &str) -> (&str, Option<&str>) {
    match target.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (target, None),
    }
}

/// A flat, key-sorted `Cookie` header value, same borrowing/lookup
/// discipline as [`Query`].
#[derive(Clone, Debug, Default)]
pub struct Cookies {
    pairs: Vec<(String, String)>,
}

impl Cookies {
    /// Parse a `Cookie:` header value (`name=value; name2=value2`).
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let mut pairs: Vec<(String, String)> = raw
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .filter_map(|pair| pair.split_once('=').map(|(k, v)| (k.trim().to_string(), v.trim().to_string())))
            .collect();
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        Self { pairs }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        let pos = self.pairs.partition_point(|(k, _)| k.as_str() < name);
        self.pairs.get(pos).filter(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// The first hop recorded in a `Forwarded` or (fallback) `X-Forwarded-For`
/// request header, if either is present. `Forwarded` is preferred per
/// RFC 7239 since it is the standardized successor.
#[must_use]
pub fn forwarded_for(headers: &HeaderMap) -> Option<String> {
    if let Some(v) = headers.get_str("Forwarded") {
        for part in v.split(';') {
            let part = part.trim();
            if let Some(rest) = part.strip_prefix("for=").or_else(|| part.strip_prefix("For=")) {
                return Some(rest.trim_matches('"').to_string());
            }
        }
    }
    headers.get_str("X-Forwarded-For").and_then(|v| v.split(',').next()).map(|s| s.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_lookup_is_case_insensitive() {
        let mut h = HeaderMap::new();
        h.append(&b"Content-Type"[..], &b"text/html"[..]);
        assert_eq!(h.get(b"content-type").unwrap().as_ref(), b"text/html");
    }

    #[test]
    fn get_returns_first_value_among_duplicates() {
        let mut h = HeaderMap::new();
        h.append(&b"Set-Cookie"[..], &b"a=1"[..]);
        h.append(&b"Set-Cookie"[..], &b"b=2"[..]);
        assert_eq!(h.get(b"set-cookie").unwrap().as_ref(), b"a=1");
    }

    #[test]
    fn duplicate_headers_preserve_order() {
        let mut h = HeaderMap::new();
        h.append(&b"Set-Cookie"[..], &b"a=1"[..]);
        h.append(&b"Set-Cookie"[..], &b"b=2"[..]);
        let values: Vec<_> = h.iter().map(|(_, v)| v.clone()).collect();
        assert_eq!(values, vec![Bytes::from_static(b"a=1"), Bytes::from_static(b"b=2")]);
    }

    #[test]
    fn set_replaces_all_prior_values() {
        let mut h = HeaderMap::new();
        h.append(&b"X-A"[..], &b"1"[..]);
        h.append(&b"X-A"[..], &b"2"[..]);
        h.set(&b"X-A"[..], &b"3"[..]);
        assert_eq!(h.len(), 1);
        assert_eq!(h.get(b"x-a").unwrap().as_ref(), b"3");
    }

    #[test]
    fn query_parses_and_sorts_by_key() {
        let q = Query::parse("b=2&a=hello%20world");
        assert_eq!(q.get("a"), Some("hello world"));
        assert_eq!(q.get("b"), Some("2"));
        assert_eq!(q.get("missing"), None);
    }

    #[test]
    fn content_type_round_trips_common_extensions() {
        assert_eq!(ContentType::from_extension("HTML"), ContentType::Html);
        assert_eq!(ContentType::Json.as_str(), "application/json");
    }

    #[test]
    fn cookies_parse_and_sort_by_name() {
        let c = Cookies::parse("session=abc123; theme=dark");
        assert_eq!(c.get("session"), Some("abc123"));
        assert_eq!(c.get("theme"), Some("dark"));
        assert_eq!(c.get("missing"), None);
    }

    #[test]
    fn forwarded_for_prefers_standard_header() {
        let mut h = HeaderMap::new();
        h.append(&b"Forwarded"[..], &b"for=192.0.2.1;proto=https"[..]);
        h.append(&b"X-Forwarded-For"[..], &b"198.51.100.1"[..]);
        assert_eq!(forwarded_for(&h).as_deref(), Some("192.0.2.1"));
    }

    #[test]
    fn forwarded_for_falls_back_to_x_forwarded_for() {
        let mut h = HeaderMap::new();
        h.append(&b"X-Forwarded-For"[..], &b"198.51.100.1, 70.41.3.18"[..]);
        assert_eq!(forwarded_for(&h).as_deref(), Some("198.51.100.1"));
    }
}
