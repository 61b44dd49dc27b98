//! Peer name: parse, render and resolve endpoint literals.
//!
//! Grammar (space-separated list of peers, see module docs in the crate
//! root): `ipv4:port`, `[ipv6]:port`, `host:port` (resolved), `unix:/path[:perms]`,
//! or a bare host using a caller-supplied default port. `*`/`0`/empty host
//! means "bind any"; port `*` means "ephemeral".

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{ConduitError, Result};

/// An opaque tag correlating an accepted connection with the listener it
/// came from.
pub type GroupId = u64;

/// A parsed, resolved network endpoint.
///
/// Immutable after construction. `Error` carries a peer that failed to
/// resolve so that a batch [`PeerName::lookup`] can report partial failure
/// without losing the other, valid, results.
#[derive(Clone)]
pub enum PeerName {
    /// IPv4 address in host byte order, plus port in host byte order.
    V4 {
        /// Address, host byte order.
        addr: u32,
        /// Port, host byte order.
        port: u16,
        /// Listener this peer was accepted from, if any.
        group: Option<GroupId>,
    },
    /// IPv6 address as eight 16-bit groups in host byte order.
    V6 {
        /// Address groups, host byte order.
        addr: [u16; 8],
        /// Flow label.
        flow: u32,
        /// Scope id.
        scope: u32,
        /// Port, host byte order.
        port: u16,
        /// Listener this peer was accepted from, if any.
        group: Option<GroupId>,
    },
    /// A filesystem (`AF_UNIX`) socket path with an optional mode.
    Unix {
        /// Socket path.
        path: PathBuf,
        /// Octal permission bits to apply after bind, if requested.
        perms: Option<u32>,
        /// Listener this peer was accepted from, if any.
        group: Option<GroupId>,
    },
    /// A peer literal that failed to parse or resolve.
    Error(Arc<ConduitError>),
    /// The default, unaddressed peer.
    None,
}

impl Default for PeerName {
    fn default() -> Self {
        PeerName::None
    }
}

impl PartialEq for PeerName {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (PeerName::V4 { addr: a, port: p, .. }, PeerName::V4 { addr: b, port: q, .. }) => {
                a == b && p == q
            }
            (
                PeerName::V6 { addr: a, port: p, flow: fa, scope: sa, .. },
                PeerName::V6 { addr: b, port: q, flow: fb, scope: sb, .. },
            ) => a == b && p == q && fa == fb && sa == sb,
            (PeerName::Unix { path: a, .. }, PeerName::Unix { path: b, .. }) => a == b,
            (PeerName::None, PeerName::None) => true,
            // Errors never compare equal, even to themselves: their cause
            // is not meaningfully comparable.
            _ => false,
        }
    }
}

impl std::hash::Hash for PeerName {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        core::mem::discriminant(self).hash(state);
        match self {
            PeerName::V4 { addr, port, .. } => {
                addr.hash(state);
                port.hash(state);
            }
            PeerName::V6 { addr, port, flow, scope, .. } => {
                addr.hash(state);
                port.hash(state);
                flow.hash(state);
                scope.hash(state);
            }
            PeerName::Unix { path, .. } => path.hash(state),
            PeerName::Error(_) | PeerName::None => {}
        }
    }
}

impl fmt::Debug for PeerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerName({self})")
    }
}

impl fmt::Display for PeerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerName::V4 { addr, port, .. } => {
                let [a, b, c, d] = addr.to_be_bytes();
                write!(f, "{a}.{b}.{c}.{d}:{port}")
            }
            PeerName::V6 { addr, port, .. } => {
                write!(
                    f,
                    "[{:x}:{:x}:{:x}:{:x}:{:x}:{:x}:{:x}:{:x}]:{port}",
                    addr[0], addr[1], addr[2], addr[3], addr[4], addr[5], addr[6], addr[7]
                )
            }
            PeerName::Unix { path, .. } => write!(f, "unix:{}", path.display()),
            PeerName::Error(e) => write!(f, "error: {e}"),
            PeerName::None => write!(f, "<n/a>"),
        }
    }
}

const UNIX_PREFIX: &str = "unix:";

impl PeerName {
    /// Group id this peer was accepted from, if it came from a listener.
    #[must_use]
    pub fn group(&self) -> Option<GroupId> {
        match self {
            PeerName::V4 { group, .. } | PeerName::V6 { group, .. } | PeerName::Unix { group, .. } => *group,
            _ => None,
        }
    }

    /// Attach a group id, e.g. after `accept()`.
    #[must_use]
    pub fn with_group(mut self, group: GroupId) -> Self {
        match &mut self {
            PeerName::V4 { group: g, .. } | PeerName::V6 { group: g, .. } | PeerName::Unix { group: g, .. } => {
                *g = Some(group);
            }
            _ => {}
        }
        self
    }

    /// True if this peer can be used to bind or connect.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !matches!(self, PeerName::Error(_) | PeerName::None)
    }

    /// Parse and resolve a space-separated list of peer literals.
    ///
    /// `def_port` supplies the port for literals that omit one (a bare
    /// host or `*`); pass `None` to require every literal to carry its own
    /// port. Resolution failures for individual literals become
    /// `PeerName::Error` entries rather than aborting the whole list,
    /// unless *every* literal fails, in which case the first error is
    /// returned.
    pub fn lookup(names: &str, def_port: Option<u16>) -> Result<Vec<PeerName>> {
        let mut out = Vec::new();
        for item in names.split(' ').filter(|s| !s.is_empty()) {
            match Self::lookup_one(item, def_port) {
                Ok(mut resolved) => out.append(&mut resolved),
                Err(e) => out.push(PeerName::Error(Arc::new(e))),
            }
        }
        if out.is_empty() {
            return Err(ConduitError::invalid_peer_name("empty peer list"));
        }
        if out.iter().any(PeerName::is_valid) {
            return Ok(out);
        }
        match out.into_iter().next() {
            Some(PeerName::Error(e)) => Err(Arc::try_unwrap(e).unwrap_or_else(|e| ConduitError::protocol(e.to_string()))),
            _ => Err(ConduitError::invalid_peer_name("no valid address returned")),
        }
    }

    fn lookup_one(item: &str, def_port: Option<u16>) -> Result<Vec<PeerName>> {
        if let Some(rest) = item.strip_prefix(UNIX_PREFIX) {
            return Ok(vec![Self::parse_unix(rest)?]);
        }

        let (host, port_str) = split_host_port(item);
        let port = match port_str {
            Some("*") => 0,
            Some(p) => p
                .parse::<u16>()
                .map_err(|_| ConduitError::invalid_peer_name(format!("bad port in `{item}`")))?,
            None => match def_port {
                Some(p) => p,
                None => return Err(ConduitError::invalid_peer_name(format!("`{item}` has no port"))),
            },
        };

        let wildcard = host.is_empty() || host == "*" || host == "0";
        if wildcard {
            return Ok(vec![
                PeerName::V4 { addr: u32::from(Ipv4Addr::UNSPECIFIED), port, group: None },
                PeerName::V6 { addr: [0; 8], flow: 0, scope: 0, port, group: None },
            ]);
        }

        resolve_host(host, port)
    }

    fn parse_unix(rest: &str) -> Result<PeerName> {
        // `/path` or `/path:perms`; perms may be octal (`0644`) or
        // symbolic `u+rwx,g+r,o+r`-style triads collapsed to `rwx`.
        let (path, perms) = match rest.rsplit_once(':') {
            Some((p, perm_str)) if looks_like_perms(perm_str) => (p, Some(parse_perms(perm_str)?)),
            _ => (rest, None),
        };
        if path.is_empty() {
            return Err(ConduitError::invalid_peer_name("empty unix socket path"));
        }
        Ok(PeerName::Unix { path: PathBuf::from(path), perms, group: None })
    }

    /// Convert to [`std::net::SocketAddr`], when this peer names an IP
    /// endpoint.
    #[must_use]
    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        match self {
            PeerName::V4 { addr, port, .. } => Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(*addr)), *port)),
            PeerName::V6 { addr, port, flow: _, scope: _, .. } => {
                let [a, b, c, d, e, f, g, h] = *addr;
                // `scope_id` for link-local addresses needs a `SockAddrV6`
                // (socket2), which carries it; plain `SocketAddr` has no room.
                Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::new(a, b, c, d, e, f, g, h)), *port))
            }
            _ => None,
        }
    }

    fn from_socket_addr(addr: SocketAddr) -> PeerName {
        match addr {
            SocketAddr::V4(a) => PeerName::V4 { addr: u32::from(*a.ip()), port: a.port(), group: None },
            SocketAddr::V6(a) => PeerName::V6 {
                addr: a.ip().segments(),
                flow: a.flowinfo(),
                scope: a.scope_id(),
                port: a.port(),
                group: None,
            },
        }
    }
}

fn looks_like_perms(s: &str) -> bool {
    !s.is_empty() && (s.chars().all(|c| c.is_ascii_digit()) || s.chars().all(|c| matches!(c, 'u' | 'g' | 'o' | '+' | '-' | 'r' | 'w' | 'x' | ',')))
}

fn parse_perms(s: &str) -> Result<u32> {
    if s.chars().all(|c| c.is_ascii_digit()) {
        return u32::from_str_radix(s, 8).map_err(|_| ConduitError::invalid_peer_name(format!("bad octal mode `{s}`")));
    }
    let mut mode = 0o600;
    for clause in s.split(',') {
        let mut chars = clause.chars();
        let who = chars.next().ok_or_else(|| ConduitError::invalid_peer_name("empty mode clause"))?;
        let sign = chars.next().ok_or_else(|| ConduitError::invalid_peer_name("missing +/- in mode"))?;
        let bits: u32 = chars.clone().map(|c| match c {
            'r' => 0o4,
            'w' => 0o2,
            'x' => 0o1,
            _ => 0,
        }).sum();
        let shift = match who {
            'u' => 6,
            'g' => 3,
            'o' => 0,
            _ => return Err(ConduitError::invalid_peer_name(format!("unknown mode class `{who}`"))),
        };
        let mask = bits << shift;
        match sign {
            '+' => mode |= mask,
            '-' => mode &= !mask,
            _ => return Err(ConduitError::invalid_peer_name("mode clause must use + or -")),
        }
    }
    Ok(mode)
}

/// Split `host:port`, handling `[ipv6]:port` and bare `host` (no colon).
fn split_host_port(item: &str) -> (&str, Option<&str>) {
    if let Some(rest) = item.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            let host = &rest[..end];
            let after = &rest[end + 1..];
            let port = after.strip_prefix(':');
            return (host, port);
        }
    }
    match item.rfind(':') {
        Some(pos) if item[..pos].find(':').is_none() => (&item[..pos], Some(&item[pos + 1..])),
        _ => (item, None),
    }
}

fn resolve_host(host: &str, port: u16) -> Result<Vec<PeerName>> {
    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(ConduitError::System)?;
    let out: Vec<PeerName> = addrs.map(PeerName::from_socket_addr).collect();
    if out.is_empty() {
        return Err(ConduitError::invalid_peer_name(format!("`{host}` resolved to no addresses")));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_ipv4() {
        let p = PeerName::V4 { addr: u32::from(Ipv4Addr::new(127, 0, 0, 1)), port: 8080, group: None };
        assert_eq!(p.to_string(), "127.0.0.1:8080");
    }

    #[test]
    fn parse_ipv4_literal() {
        let list = PeerName::lookup("127.0.0.1:9000", None).unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].to_string(), "127.0.0.1:9000");
    }

    #[test]
    fn parse_ipv6_literal() {
        let list = PeerName::lookup("[::1]:9000", None).unwrap();
        assert_eq!(list.len(), 1);
        assert!(list[0].to_socket_addr().unwrap().is_ipv6());
    }

    #[test]
    fn wildcard_binds_any() {
        let list = PeerName::lookup("*:0", None).unwrap();
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn bare_host_uses_default_port() {
        let list = PeerName::lookup("127.0.0.1", Some(1234)).unwrap();
        assert_eq!(list[0].to_string(), "127.0.0.1:1234");
    }

    #[test]
    fn unix_with_octal_perms() {
        let list = PeerName::lookup("unix:/tmp/x.sock:0644", None).unwrap();
        match &list[0] {
            PeerName::Unix { path, perms, .. } => {
                assert_eq!(path.to_str().unwrap(), "/tmp/x.sock");
                assert_eq!(*perms, Some(0o644));
            }
            other => panic!("expected unix peer, got {other:?}"),
        }
    }

    #[test]
    fn missing_port_without_default_is_error() {
        assert!(PeerName::lookup("127.0.0.1", None).is_err());
    }

    #[test]
    fn group_id_attaches() {
        let p = PeerName::V4 { addr: 0, port: 0, group: None }.with_group(7);
        assert_eq!(p.group(), Some(7));
    }
}
