//! Connection Information

use std::fmt;
use std::net::SocketAddr;

/// Canonicalize a socket address, converting IPv4 addresses which are
/// mapped into IPv6 addresses into standard IPv4 addresses.
pub(crate) fn make_canonical(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        std::net::IpAddr::V4(_) => addr,
        std::net::IpAddr::V6(ip) => {
            if let Some(ip) = ip.to_ipv4_mapped() {
                SocketAddr::new(std::net::IpAddr::V4(ip), addr.port())
            } else {
                addr
            }
        }
    }
}

/// Local and remote addresses of a connection.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionInfo<Addr> {
    /// The local address of the connection.
    pub local_addr: Addr,

    /// The remote address of the connection.
    pub remote_addr: Addr,
}

impl<Addr> ConnectionInfo<Addr> {
    /// Local address of the connection.
    pub fn local_addr(&self) -> &Addr {
        &self.local_addr
    }

    /// Remote address of the connection.
    pub fn remote_addr(&self) -> &Addr {
        &self.remote_addr
    }

    /// Map both addresses to another type.
    pub fn map<T, F>(self, f: F) -> ConnectionInfo<T>
    where
        F: Fn(Addr) -> T,
    {
        ConnectionInfo {
            local_addr: f(self.local_addr),
            remote_addr: f(self.remote_addr),
        }
    }
}

impl<Addr: fmt::Display> fmt::Display for ConnectionInfo<Addr> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.local_addr, self.remote_addr)
    }
}

/// An address which is only known once a transport exists.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MaybeAddr<A> {
    /// No transport yet.
    Unknown,

    /// The address reported by the transport.
    Known(A),
}

impl<A> Default for MaybeAddr<A> {
    fn default() -> Self {
        MaybeAddr::Unknown
    }
}

impl<A> MaybeAddr<A> {
    /// The address, if known.
    pub fn known(&self) -> Option<&A> {
        match self {
            MaybeAddr::Known(addr) => Some(addr),
            MaybeAddr::Unknown => None,
        }
    }
}

impl<A: fmt::Display> fmt::Display for MaybeAddr<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MaybeAddr::Known(addr) => addr.fmt(f),
            MaybeAddr::Unknown => f.write_str("unknown"),
        }
    }
}

/// Types which can report the addresses of the connection they carry.
pub trait HasConnectionInfo {
    /// The address type of the connection.
    type Addr: fmt::Display + fmt::Debug + Send + Sync;

    /// Get the connection information.
    fn info(&self) -> ConnectionInfo<Self::Addr>;
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, Ipv6Addr};

    use super::*;

    #[test]
    fn connection_info_map() {
        let info = ConnectionInfo {
            local_addr: "local",
            remote_addr: "remote",
        };

        let mapped = info.map(|addr| addr.to_string());

        assert_eq!(mapped.local_addr, "local".to_string());
        assert_eq!(mapped.to_string(), "local -> remote");
    }

    #[test]
    fn maybe_addr_display() {
        let info: ConnectionInfo<MaybeAddr<&str>> = ConnectionInfo::default();
        assert_eq!(info.to_string(), "unknown -> unknown");

        let known = MaybeAddr::Known("127.0.0.1:80");
        assert_eq!(known.known(), Some(&"127.0.0.1:80"));
        assert_eq!(known.to_string(), "127.0.0.1:80");
    }

    #[test]
    fn canonical_ipv4_mapped() {
        let mapped = SocketAddr::new(Ipv4Addr::LOCALHOST.to_ipv6_mapped().into(), 8080);
        assert_eq!(
            make_canonical(mapped),
            SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 8080)
        );

        let v6 = SocketAddr::new(Ipv6Addr::LOCALHOST.into(), 8080);
        assert_eq!(make_canonical(v6), v6);
    }
}
