//! The relay request header: address-type tagged union and wire codec.
//!
//! ```text
//! +------+----------+----------+-----------------+
//! | ATYP | DST.ADDR | DST.PORT | [HMAC-SHA1/10]  |
//! +------+----------+----------+-----------------+
//! |  1   | variable |    2     |  0 or 10 bytes  |
//! ```
//!
//! The low nibble of `ATYP` selects the address family; bit `0x10` marks
//! the optional one-time-auth tag, surfaced here as the separate
//! [`RelayHeader::auth`] flag.

use core::fmt::{self, Display, Formatter};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::error::{Error, PeerMisbehaved};

pub(crate) const ADDRTYPE_MASK: u8 = 0x0F;
pub(crate) const ONETIMEAUTH_FLAG: u8 = 0x10;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Destination of a relayed connection.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum Address {
    /// A literal IPv4 address.
    V4(Ipv4Addr),
    /// A literal IPv6 address.
    V6(Ipv6Addr),
    /// A host name of at most 255 bytes, resolved by the server.
    Domain(String),
}

impl Address {
    /// The IP address, if this destination does not need resolving.
    ///
    /// A domain that happens to spell an IP literal is returned as that
    /// address, so it is dialed directly instead of hitting the resolver.
    pub fn literal_ip(&self) -> Option<IpAddr> {
        match self {
            Address::V4(ip) => Some(IpAddr::V4(*ip)),
            Address::V6(ip) => Some(IpAddr::V6(*ip)),
            Address::Domain(name) => name.parse().ok(),
        }
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Address::V4(ip) => Display::fmt(ip, f),
            Address::V6(ip) => Display::fmt(ip, f),
            Address::Domain(name) => f.write_str(name),
        }
    }
}

impl From<IpAddr> for Address {
    fn from(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(ip) => Address::V4(ip),
            IpAddr::V6(ip) => Address::V6(ip),
        }
    }
}

/// The parsed request header: destination plus the one-time-auth flag.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RelayHeader {
    /// Where the server should dial.
    pub addr: Address,
    /// Destination port.
    pub port: u16,
    /// Whether the `0x10` bit was set, i.e. a 10-byte auth tag follows the
    /// header and the request payload is chunk-authenticated.
    pub auth: bool,
}

impl RelayHeader {
    /// Tries to parse a header from the decrypted front of `buf`.
    ///
    /// Returns `Ok(None)` while the header is still incomplete (the caller
    /// keeps reading; a short header is never an error by itself) and
    /// `Ok(Some((header, consumed)))` once the address and port are
    /// available. `consumed` does not include the auth tag.
    pub fn parse(buf: &[u8]) -> Result<Option<(RelayHeader, usize)>, Error> {
        let Some(&atyp) = buf.first() else {
            return Ok(None);
        };
        let auth = atyp & ONETIMEAUTH_FLAG != 0;

        let (addr, addr_end) = match atyp & ADDRTYPE_MASK {
            ATYP_IPV4 => {
                if buf.len() < 1 + 4 + 2 {
                    return Ok(None);
                }
                let octets: [u8; 4] = buf[1..5].try_into().expect("length checked");
                (Address::V4(Ipv4Addr::from(octets)), 5)
            }
            ATYP_IPV6 => {
                if buf.len() < 1 + 16 + 2 {
                    return Ok(None);
                }
                let octets: [u8; 16] = buf[1..17].try_into().expect("length checked");
                (Address::V6(Ipv6Addr::from(octets)), 17)
            }
            ATYP_DOMAIN => {
                let Some(&name_len) = buf.get(1) else {
                    return Ok(None);
                };
                let name_len = usize::from(name_len);
                if buf.len() < 2 + name_len + 2 {
                    return Ok(None);
                }
                let name = core::str::from_utf8(&buf[2..2 + name_len])
                    .map_err(|_| PeerMisbehaved::InvalidDomainEncoding)?;
                (Address::Domain(name.to_owned()), 2 + name_len)
            }
            received => {
                return Err(PeerMisbehaved::InvalidAddressType { received }.into());
            }
        };

        let port = u16::from_be_bytes(buf[addr_end..addr_end + 2].try_into().expect("length checked"));
        Ok(Some((RelayHeader { addr, port, auth }, addr_end + 2)))
    }

    /// Appends the wire encoding of this header to `buf`.
    ///
    /// The auth tag itself is not written here; the caller computes it over
    /// exactly the bytes this produces.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        let flag = if self.auth { ONETIMEAUTH_FLAG } else { 0 };
        match &self.addr {
            Address::V4(ip) => {
                buf.push(ATYP_IPV4 | flag);
                buf.extend_from_slice(&ip.octets());
            }
            Address::V6(ip) => {
                buf.push(ATYP_IPV6 | flag);
                buf.extend_from_slice(&ip.octets());
            }
            Address::Domain(name) => {
                debug_assert!(name.len() <= 255);
                buf.push(ATYP_DOMAIN | flag);
                buf.push(name.len() as u8);
                buf.extend_from_slice(name.as_bytes());
            }
        }
        buf.extend_from_slice(&self.port.to_be_bytes());
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_ipv4() {
        let buf = [0x01, 127, 0, 0, 1, 0x00, 0x50];
        let (header, consumed) = RelayHeader::parse(&buf).unwrap().unwrap();
        assert_eq!(header.addr, Address::V4(Ipv4Addr::new(127, 0, 0, 1)));
        assert_eq!(header.port, 80);
        assert!(!header.auth);
        assert_eq!(consumed, 7);
    }

    #[test]
    fn test_parse_ipv6() {
        let mut buf = vec![0x04];
        buf.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
        buf.extend_from_slice(&443u16.to_be_bytes());
        let (header, consumed) = RelayHeader::parse(&buf).unwrap().unwrap();
        assert_eq!(header.addr, Address::V6(Ipv6Addr::LOCALHOST));
        assert_eq!(header.port, 443);
        assert_eq!(consumed, 19);
    }

    #[test]
    fn test_parse_domain_with_auth_flag_and_residual() {
        let mut buf = vec![0x03 | ONETIMEAUTH_FLAG, 11];
        buf.extend_from_slice(b"example.com");
        buf.extend_from_slice(&8080u16.to_be_bytes());
        buf.extend_from_slice(b"residual payload");
        let (header, consumed) = RelayHeader::parse(&buf).unwrap().unwrap();
        assert_eq!(header.addr, Address::Domain("example.com".into()));
        assert_eq!(header.port, 8080);
        assert!(header.auth);
        assert_eq!(&buf[consumed..], b"residual payload");
    }

    #[test]
    fn test_short_header_wants_more() {
        // Every strict prefix of a complete header parses to None.
        let mut full = vec![0x03, 11];
        full.extend_from_slice(b"example.com");
        full.extend_from_slice(&8080u16.to_be_bytes());
        for n in 0..full.len() {
            assert!(RelayHeader::parse(&full[..n]).unwrap().is_none(), "prefix {}", n);
        }
        assert!(RelayHeader::parse(&full).unwrap().is_some());
    }

    #[test]
    fn test_invalid_atyp_rejected() {
        let err = RelayHeader::parse(&[0x07, 0, 0]).unwrap_err();
        assert_eq!(
            err,
            Error::PeerMisbehaved(PeerMisbehaved::InvalidAddressType { received: 0x07 })
        );
        // The auth bit is masked off before the family check.
        assert!(RelayHeader::parse(&[0x11, 127, 0, 0, 1, 0, 80]).unwrap().is_some());
    }

    #[test]
    fn test_encode_parse_roundtrip() {
        for header in [
            RelayHeader { addr: Address::V4(Ipv4Addr::new(10, 0, 0, 7)), port: 1, auth: false },
            RelayHeader { addr: Address::V6(Ipv6Addr::LOCALHOST), port: 65535, auth: true },
            RelayHeader { addr: Address::Domain("xn--caf-dma.example".into()), port: 80, auth: true },
        ] {
            let mut buf = Vec::new();
            header.encode(&mut buf);
            let (parsed, consumed) = RelayHeader::parse(&buf).unwrap().unwrap();
            assert_eq!(parsed, header);
            assert_eq!(consumed, buf.len());
        }
    }

    #[test]
    fn test_domain_ip_literal_detected() {
        assert_eq!(
            Address::Domain("192.168.1.1".into()).literal_ip(),
            Some(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1)))
        );
        assert_eq!(Address::Domain("example.com".into()).literal_ip(), None);
    }
}
