//! Peer address value type shared by the framing engine and the operator bridge.

use std::fmt;
use std::net::SocketAddr;

/// A connected peer's address, formatted the way operators expect to see it
/// in logs: bracketed for IPv6, bare `host:port` for IPv4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerAddress(SocketAddr);

impl PeerAddress {
    pub fn new(addr: SocketAddr) -> Self {
        Self(addr)
    }

    pub fn is_ipv6(&self) -> bool {
        self.0.is_ipv6()
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.0
    }
}

impl From<SocketAddr> for PeerAddress {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr)
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ipv6() {
            write!(f, "[{}]:{}", self.0.ip(), self.0.port())
        } else {
            write!(f, "{}:{}", self.0.ip(), self.0.port())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_ipv4_without_brackets() {
        let addr: SocketAddr = "10.0.0.5:4444".parse().unwrap();
        assert_eq!(PeerAddress::new(addr).to_string(), "10.0.0.5:4444");
    }

    #[test]
    fn formats_ipv6_with_brackets() {
        let addr: SocketAddr = "[::1]:4444".parse().unwrap();
        assert_eq!(PeerAddress::new(addr).to_string(), "[::1]:4444");
    }
}
