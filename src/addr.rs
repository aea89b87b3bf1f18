//! Socket address projection.
//!
//! Peer and local names are reported as a flat record of family, textual
//! address, and port, which is what the dynamic host consumes.

use std::fmt;
use std::net::SocketAddr as NetAddr;

/// Canonical address family names.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Family {
    Inet,
    Inet6,
    Unix,
    Unspec,
}

impl Family {
    pub fn as_str(self) -> &'static str {
        match self {
            Family::Inet => "inet",
            Family::Inet6 => "inet6",
            Family::Unix => "unix",
            Family::Unspec => "unspec",
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.write_str(self.as_str())
    }
}

/// A reported socket name: `{family, ip, port}`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SockName {
    pub family: Family,
    pub ip: String,
    pub port: u16,
}

impl From<NetAddr> for SockName {
    fn from(addr: NetAddr) -> SockName {
        SockName {
            family: match addr {
                NetAddr::V4(_) => Family::Inet,
                NetAddr::V6(_) => Family::Inet6,
            },
            ip: addr.ip().to_string(),
            port: addr.port(),
        }
    }
}

impl SockName {
    /// Name of a path-bound (unix) endpoint.
    pub(crate) fn unix(path: String) -> SockName {
        SockName {
            family: Family::Unix,
            ip: path,
            port: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn families() {
        let v4: SockName = "127.0.0.1:8080".parse::<NetAddr>().unwrap().into();
        assert_eq!(v4.family, Family::Inet);
        assert_eq!(v4.ip, "127.0.0.1");
        assert_eq!(v4.port, 8080);

        let v6: SockName = "[::1]:53".parse::<NetAddr>().unwrap().into();
        assert_eq!(v6.family.as_str(), "inet6");
    }
}
