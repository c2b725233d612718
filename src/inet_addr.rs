//! A thin, `Copy` newtype over [`std::net::SocketAddr`], used wherever the
//! distilled spec names "InetAddress" — as a log field and as the
//! consistent-hash key for connection-to-worker assignment.

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InetAddr(SocketAddr);

impl InetAddr {
    pub fn new(addr: SocketAddr) -> InetAddr {
        InetAddr(addr)
    }

    pub fn resolve(addr: impl ToSocketAddrs) -> std::io::Result<InetAddr> {
        addr.to_socket_addrs()?
            .next()
            .map(InetAddr)
            .ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "no address resolved")
            })
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.0
    }

    pub fn ip(&self) -> std::net::IpAddr {
        self.0.ip()
    }

    pub fn port(&self) -> u16 {
        self.0.port()
    }

    /// The stable textual form used as the consistent-hash key and in log
    /// lines: `<ip>:<port>`.
    pub fn to_ip_port_string(&self) -> String {
        self.0.to_string()
    }
}

impl fmt::Display for InetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_ip_port_string())
    }
}

impl From<SocketAddr> for InetAddr {
    fn from(addr: SocketAddr) -> InetAddr {
        InetAddr(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_ip_port_string_matches_display() {
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let inet = InetAddr::new(addr);
        assert_eq!(inet.to_ip_port_string(), "127.0.0.1:9000");
        assert_eq!(inet.to_string(), "127.0.0.1:9000");
    }

    #[test]
    fn ipv6_round_trips() {
        let addr: SocketAddr = "[::1]:8080".parse().unwrap();
        let inet = InetAddr::new(addr);
        assert_eq!(inet.port(), 8080);
    }
}
