//! Socket address value type

use core::fmt;
use core::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::OnceLock;

use crate::error::{MuxError, MuxResult};

/// Address family tag
///
/// Always explicit; never inferred from the byte content at comparison
/// time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AddressFamily {
    Unspecified = 0,
    Ipv4 = 1,
    Ipv6 = 2,
}

/// Immutable endpoint value: family, raw address bytes, port
///
/// The textual form is rendered lazily and cached; equality and hashing
/// look only at family + raw bytes + port, so two addresses for the same
/// endpoint compare equal regardless of whether either has been
/// formatted.
///
/// IPv4 addresses occupy the first 4 raw bytes; the remainder is zero.
#[derive(Clone)]
pub struct SocketAddress {
    family: AddressFamily,
    addr: [u8; 16],
    port: u16,
    text: OnceLock<String>,
}

impl SocketAddress {
    /// The all-zero, family-less address. Process-wide constant; use it
    /// wherever a defined placeholder value is needed.
    pub const UNSPECIFIED: SocketAddress = SocketAddress {
        family: AddressFamily::Unspecified,
        addr: [0; 16],
        port: 0,
        text: OnceLock::new(),
    };

    /// Parse a textual `"host:port"` endpoint
    ///
    /// Accepts dotted IPv4 (`"127.0.0.1:80"`) and bracketed IPv6
    /// (`"[::1]:80"`). No name resolution. Malformed input yields
    /// `MuxError::AddressParse` and no address value.
    pub fn parse(s: &str) -> MuxResult<SocketAddress> {
        let sa: SocketAddr = s.parse().map_err(|_| MuxError::AddressParse)?;
        Ok(SocketAddress::from_socket_addr(&sa))
    }

    /// Build from an already-typed std address
    pub fn from_socket_addr(sa: &SocketAddr) -> SocketAddress {
        let mut addr = [0u8; 16];
        let family = match sa.ip() {
            IpAddr::V4(ip) => {
                addr[..4].copy_from_slice(&ip.octets());
                AddressFamily::Ipv4
            }
            IpAddr::V6(ip) => {
                addr.copy_from_slice(&ip.octets());
                AddressFamily::Ipv6
            }
        };
        SocketAddress {
            family,
            addr,
            port: sa.port(),
            text: OnceLock::new(),
        }
    }

    /// Build from raw parts (family, address bytes, port)
    pub const fn from_parts(family: AddressFamily, addr: [u8; 16], port: u16) -> SocketAddress {
        SocketAddress {
            family,
            addr,
            port,
            text: OnceLock::new(),
        }
    }

    /// Address family
    #[inline]
    pub const fn family(&self) -> AddressFamily {
        self.family
    }

    /// Port in host byte order
    #[inline]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Raw address bytes (IPv4 in the first 4)
    #[inline]
    pub const fn raw_bytes(&self) -> &[u8; 16] {
        &self.addr
    }

    /// Check for the unspecified placeholder
    #[inline]
    pub const fn is_unspecified(&self) -> bool {
        matches!(self.family, AddressFamily::Unspecified)
    }

    /// Typed std form, if the family carries one
    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        match self.family {
            AddressFamily::Unspecified => None,
            AddressFamily::Ipv4 => {
                let ip = Ipv4Addr::new(self.addr[0], self.addr[1], self.addr[2], self.addr[3]);
                Some(SocketAddr::new(IpAddr::V4(ip), self.port))
            }
            AddressFamily::Ipv6 => {
                let ip = Ipv6Addr::from(self.addr);
                Some(SocketAddr::new(IpAddr::V6(ip), self.port))
            }
        }
    }

    /// Textual form, rendered on first use and cached
    pub fn text(&self) -> &str {
        self.text.get_or_init(|| match self.to_socket_addr() {
            Some(sa) => sa.to_string(),
            None => String::from("unspecified"),
        })
    }
}

impl PartialEq for SocketAddress {
    fn eq(&self, other: &Self) -> bool {
        // The text cache is deliberately excluded
        self.family == other.family && self.addr == other.addr && self.port == other.port
    }
}

impl Eq for SocketAddress {}

impl Hash for SocketAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.family.hash(state);
        self.addr.hash(state);
        self.port.hash(state);
    }
}

impl fmt::Debug for SocketAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SocketAddress({})", self.text())
    }
}

impl fmt::Display for SocketAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.text())
    }
}

impl std::str::FromStr for SocketAddress {
    type Err = MuxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SocketAddress::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ipv4() {
        let addr = SocketAddress::parse("127.0.0.1:8080").unwrap();
        assert_eq!(addr.family(), AddressFamily::Ipv4);
        assert_eq!(addr.port(), 8080);
        assert_eq!(&addr.raw_bytes()[..4], &[127, 0, 0, 1]);
        assert_eq!(&addr.raw_bytes()[4..], &[0u8; 12]);
    }

    #[test]
    fn test_parse_ipv6() {
        let addr = SocketAddress::parse("[::1]:443").unwrap();
        assert_eq!(addr.family(), AddressFamily::Ipv6);
        assert_eq!(addr.port(), 443);
        assert_eq!(addr.raw_bytes()[15], 1);
    }

    #[test]
    fn test_parse_malformed() {
        for bad in ["", "localhost", "1.2.3.4", "1.2.3.4:notaport", "::1:80", "999.0.0.1:80"] {
            assert_eq!(SocketAddress::parse(bad), Err(MuxError::AddressParse), "{}", bad);
        }
    }

    #[test]
    fn test_text_roundtrip() {
        for s in ["10.1.2.3:65535", "0.0.0.0:0", "[::1]:9", "[2001:db8::5]:80"] {
            let first = SocketAddress::parse(s).unwrap();
            let again = SocketAddress::parse(first.text()).unwrap();
            assert_eq!(first.family(), again.family());
            assert_eq!(first.raw_bytes(), again.raw_bytes());
            assert_eq!(first.port(), again.port());
        }
    }

    #[test]
    fn test_equality_ignores_text_cache() {
        let a = SocketAddress::parse("192.168.0.1:22").unwrap();
        let b = SocketAddress::parse("192.168.0.1:22").unwrap();
        let _ = a.text(); // populate one cache only
        assert_eq!(a, b);

        let c = SocketAddress::parse("192.168.0.1:23").unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_family_never_inferred() {
        // Same raw bytes, different family: not equal
        let v4 = SocketAddress::from_parts(AddressFamily::Ipv4, [0; 16], 80);
        let v6 = SocketAddress::from_parts(AddressFamily::Ipv6, [0; 16], 80);
        assert_ne!(v4, v6);
    }

    #[test]
    fn test_unspecified() {
        let u = SocketAddress::UNSPECIFIED;
        assert!(u.is_unspecified());
        assert_eq!(u.to_socket_addr(), None);
        assert_eq!(u.text(), "unspecified");
        assert_eq!(u, SocketAddress::UNSPECIFIED);
    }
}
