//! Tagged network address (section 3, Data model) used throughout the
//! reactor instead of passing around `std::net::SocketAddr` bare, so the
//! acceptor/connector can ask for a raw `sockaddr` view sized for the
//! actual family when calling into `libc`.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

/// Address family of an [`Address`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

/// An IPv4 or IPv6 endpoint plus its family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Address {
    inner: SocketAddr,
}

impl Address {
    /// Binds to `0.0.0.0:port` (or `[::]:port` for IPv6), unless
    /// `loopback` is set, in which case it binds to the loopback address
    /// instead.
    pub fn new(port: u16, loopback: bool, ipv6: bool) -> Self {
        let ip = match (loopback, ipv6) {
            (true, false) => IpAddr::V4(Ipv4Addr::LOCALHOST),
            (false, false) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            (true, true) => IpAddr::V6(Ipv6Addr::LOCALHOST),
            (false, true) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        Address {
            inner: SocketAddr::new(ip, port),
        }
    }

    /// Parses `ip_str` (dotted-quad or hex IPv6) with the given `port`.
    pub fn new_with_ip(ip_str: &str, port: u16, ipv6: bool) -> std::io::Result<Self> {
        let ip: IpAddr = ip_str
            .parse()
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "bad IP address"))?;
        match (&ip, ipv6) {
            (IpAddr::V4(_), true) | (IpAddr::V6(_), false) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "IP family does not match requested family",
                ))
            }
            _ => {}
        }
        Ok(Address {
            inner: SocketAddr::new(ip, port),
        })
    }

    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        Address { inner: addr }
    }

    pub fn family(&self) -> Family {
        match self.inner {
            SocketAddr::V4(_) => Family::V4,
            SocketAddr::V6(_) => Family::V6,
        }
    }

    pub fn ip(&self) -> String {
        self.inner.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.inner.port()
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.inner
    }

    /// Same endpoint, ignoring port — used by the connector's self-connect
    /// check (same family + addr + port, compared as a whole by `PartialEq`
    /// on `Address` already; this helper documents intent at call sites).
    pub fn same_endpoint(&self, other: &Address) -> bool {
        self == other
    }

    pub fn v4(addr: SocketAddrV4) -> Self {
        Address {
            inner: SocketAddr::V4(addr),
        }
    }

    pub fn v6(addr: SocketAddrV6) -> Self {
        Address {
            inner: SocketAddr::V6(addr),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address::from_socket_addr(addr)
    }
}
