use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use std::io::Cursor;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{ProtocolError, Result};

/// On-wire address type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AddressType {
    IPv4 = 0x01,
    Domain = 0x03,
    IPv6 = 0x04,
}

impl TryFrom<u8> for AddressType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::IPv4),
            0x03 => Ok(Self::Domain),
            0x04 => Ok(Self::IPv6),
            _ => Err(ProtocolError::InvalidAddressType(value)),
        }
    }
}

/// A destination (or source) endpoint as carried on the wire: a tagged
/// address plus a big-endian port. Domain names are forwarded verbatim,
/// without canonicalisation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    Ipv4(Ipv4Addr, u16),
    Ipv6(Ipv6Addr, u16),
    Domain(String, u16),
}

impl Address {
    #[inline]
    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => Self::Ipv4(*v4.ip(), v4.port()),
            SocketAddr::V6(v6) => Self::Ipv6(*v6.ip(), v6.port()),
        }
    }

    #[inline]
    pub fn port(&self) -> u16 {
        match self {
            Self::Ipv4(_, port) | Self::Ipv6(_, port) => *port,
            Self::Domain(_, port) => *port,
        }
    }

    #[inline]
    pub fn host(&self) -> String {
        match self {
            Self::Ipv4(ip, _) => ip.to_string(),
            Self::Ipv6(ip, _) => ip.to_string(),
            Self::Domain(domain, _) => domain.clone(),
        }
    }

    #[inline]
    pub fn address_type(&self) -> AddressType {
        match self {
            Self::Ipv4(..) => AddressType::IPv4,
            Self::Ipv6(..) => AddressType::IPv6,
            Self::Domain(..) => AddressType::Domain,
        }
    }

    /// Serialized size: tag + body + port.
    #[inline]
    pub fn serialized_len(&self) -> usize {
        match self {
            Self::Ipv4(..) => 1 + 4 + 2,
            Self::Ipv6(..) => 1 + 16 + 2,
            Self::Domain(domain, _) => 1 + 1 + domain.len() + 2,
        }
    }

    /// Appends the encoded address to `buf`. Fails only for a domain name
    /// that cannot be length-prefixed with one byte.
    pub fn write_to(&self, buf: &mut impl BufMut) -> Result<()> {
        match self {
            Self::Ipv4(ip, port) => {
                buf.put_u8(AddressType::IPv4 as u8);
                buf.put_slice(&ip.octets());
                buf.put_u16(*port);
            }
            Self::Ipv6(ip, port) => {
                buf.put_u8(AddressType::IPv6 as u8);
                buf.put_slice(&ip.octets());
                buf.put_u16(*port);
            }
            Self::Domain(domain, port) => {
                let bytes = domain.as_bytes();
                if bytes.is_empty() {
                    return Err(ProtocolError::EmptyDomain);
                }
                if bytes.len() > 255 {
                    return Err(ProtocolError::DomainTooLong(bytes.len()));
                }
                buf.put_u8(AddressType::Domain as u8);
                buf.put_u8(bytes.len() as u8);
                buf.put_slice(bytes);
                buf.put_u16(*port);
            }
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.serialized_len());
        self.write_to(&mut buf)?;
        Ok(buf.freeze())
    }

    pub fn read_from(buf: &[u8]) -> Result<(Self, usize)> {
        let mut cursor = Cursor::new(buf);
        let addr = Self::read_from_cursor(&mut cursor)?;
        Ok((addr, cursor.position() as usize))
    }

    pub fn read_from_cursor(buf: &mut Cursor<&[u8]>) -> Result<Self> {
        if !buf.has_remaining() {
            return Err(ProtocolError::TruncatedAddress);
        }
        let addr_type = AddressType::try_from(buf.get_u8())?;
        match addr_type {
            AddressType::IPv4 => {
                if buf.remaining() < 6 {
                    return Err(ProtocolError::TruncatedAddress);
                }
                let mut ip = [0u8; 4];
                buf.copy_to_slice(&mut ip);
                Ok(Self::Ipv4(Ipv4Addr::from(ip), buf.get_u16()))
            }
            AddressType::IPv6 => {
                if buf.remaining() < 18 {
                    return Err(ProtocolError::TruncatedAddress);
                }
                let mut ip = [0u8; 16];
                buf.copy_to_slice(&mut ip);
                Ok(Self::Ipv6(Ipv6Addr::from(ip), buf.get_u16()))
            }
            AddressType::Domain => {
                if !buf.has_remaining() {
                    return Err(ProtocolError::TruncatedAddress);
                }
                let len = buf.get_u8() as usize;
                if len == 0 {
                    return Err(ProtocolError::EmptyDomain);
                }
                if buf.remaining() < len + 2 {
                    return Err(ProtocolError::TruncatedAddress);
                }
                let mut domain = vec![0u8; len];
                buf.copy_to_slice(&mut domain);
                let domain = String::from_utf8(domain)
                    .map_err(|_| ProtocolError::InvalidDomainEncoding)?;
                Ok(Self::Domain(domain, buf.get_u16()))
            }
        }
    }

    /// Reads one address off an async stream. EOF anywhere inside the field
    /// is reported as `TruncatedAddress`.
    pub async fn read_from_async<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let truncated = |e| ProtocolError::eof_as(e, ProtocolError::TruncatedAddress);
        let addr_type = AddressType::try_from(reader.read_u8().await.map_err(truncated)?)?;
        match addr_type {
            AddressType::IPv4 => {
                let mut ip = [0u8; 4];
                reader.read_exact(&mut ip).await.map_err(truncated)?;
                let port = reader.read_u16().await.map_err(truncated)?;
                Ok(Self::Ipv4(Ipv4Addr::from(ip), port))
            }
            AddressType::IPv6 => {
                let mut ip = [0u8; 16];
                reader.read_exact(&mut ip).await.map_err(truncated)?;
                let port = reader.read_u16().await.map_err(truncated)?;
                Ok(Self::Ipv6(Ipv6Addr::from(ip), port))
            }
            AddressType::Domain => {
                let len = reader.read_u8().await.map_err(truncated)? as usize;
                if len == 0 {
                    return Err(ProtocolError::EmptyDomain);
                }
                let mut domain = vec![0u8; len];
                reader.read_exact(&mut domain).await.map_err(truncated)?;
                let domain = String::from_utf8(domain)
                    .map_err(|_| ProtocolError::InvalidDomainEncoding)?;
                let port = reader.read_u16().await.map_err(truncated)?;
                Ok(Self::Domain(domain, port))
            }
        }
    }

    /// Returns a socket address when no name resolution is needed.
    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Ipv4(ip, port) => Some(SocketAddr::V4(SocketAddrV4::new(*ip, *port))),
            Self::Ipv6(ip, port) => Some(SocketAddr::V6(SocketAddrV6::new(*ip, *port, 0, 0))),
            Self::Domain(..) => None,
        }
    }

    /// IPv4-mapped IPv6 addresses collapse to their IPv4 form so that one
    /// peer never shows up under two keys.
    pub fn canonical(self) -> Self {
        match self {
            Self::Ipv6(ip, port) => match ip.to_ipv4_mapped() {
                Some(v4) => Self::Ipv4(v4, port),
                None => Self::Ipv6(ip, port),
            },
            other => other,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ipv4(ip, port) => write!(f, "{}:{}", ip, port),
            Self::Ipv6(ip, port) => write!(f, "[{}]:{}", ip, port),
            Self::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

impl From<SocketAddr> for Address {
    #[inline]
    fn from(addr: SocketAddr) -> Self {
        Self::from_socket_addr(addr)
    }
}

impl From<(IpAddr, u16)> for Address {
    #[inline]
    fn from((ip, port): (IpAddr, u16)) -> Self {
        match ip {
            IpAddr::V4(v4) => Self::Ipv4(v4, port),
            IpAddr::V6(v6) => Self::Ipv6(v6, port),
        }
    }
}

impl From<(String, u16)> for Address {
    #[inline]
    fn from((domain, port): (String, u16)) -> Self {
        Self::Domain(domain, port)
    }
}

impl From<(&str, u16)> for Address {
    #[inline]
    fn from((domain, port): (&str, u16)) -> Self {
        Self::Domain(domain.to_string(), port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_roundtrip() {
        let addr = Address::Ipv4(Ipv4Addr::new(93, 184, 216, 34), 80);
        let bytes = addr.to_bytes().unwrap();
        assert_eq!(bytes[0], 0x01);
        let (parsed, len) = Address::read_from(&bytes).unwrap();
        assert_eq!(addr, parsed);
        assert_eq!(len, 7);
    }

    #[test]
    fn ipv6_roundtrip() {
        let addr = Address::Ipv6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1), 443);
        let bytes = addr.to_bytes().unwrap();
        assert_eq!(bytes[0], 0x04);
        let (parsed, len) = Address::read_from(&bytes).unwrap();
        assert_eq!(addr, parsed);
        assert_eq!(len, 19);
    }

    #[test]
    fn domain_roundtrip() {
        let addr = Address::Domain("example.com".to_string(), 443);
        let bytes = addr.to_bytes().unwrap();
        assert_eq!(bytes[0], 0x03);
        assert_eq!(bytes[1] as usize, "example.com".len());
        let (parsed, len) = Address::read_from(&bytes).unwrap();
        assert_eq!(addr, parsed);
        assert_eq!(len, addr.serialized_len());
    }

    #[test]
    fn rejects_unknown_tag() {
        let err = Address::read_from(&[0x02, 0, 0, 0, 0, 0, 0]).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidAddressType(0x02)));
    }

    #[test]
    fn rejects_empty_domain() {
        let err = Address::read_from(&[0x03, 0x00, 0x01, 0xbb]).unwrap_err();
        assert!(matches!(err, ProtocolError::EmptyDomain));

        let empty = Address::Domain(String::new(), 80);
        assert!(matches!(
            empty.to_bytes().unwrap_err(),
            ProtocolError::EmptyDomain
        ));
    }

    #[test]
    fn rejects_overlong_domain_on_encode() {
        let addr = Address::Domain("x".repeat(256), 80);
        assert!(matches!(
            addr.to_bytes().unwrap_err(),
            ProtocolError::DomainTooLong(256)
        ));
    }

    #[test]
    fn truncated_body_is_reported() {
        // tag says IPv4 but only two body bytes follow
        let err = Address::read_from(&[0x01, 1, 2]).unwrap_err();
        assert!(matches!(err, ProtocolError::TruncatedAddress));
    }

    #[tokio::test]
    async fn async_read_matches_sync() {
        let addr = Address::Domain("async.test".to_string(), 12345);
        let bytes = addr.to_bytes().unwrap();
        let mut cursor = std::io::Cursor::new(bytes.to_vec());
        let parsed = Address::read_from_async(&mut cursor).await.unwrap();
        assert_eq!(addr, parsed);
    }

    #[tokio::test]
    async fn async_eof_mid_domain_is_truncated() {
        // domain of claimed length 7 cut short after 3 bytes ("exa")
        let bytes = [0x03, 0x07, b'e', b'x', b'a'];
        let mut cursor = std::io::Cursor::new(bytes.to_vec());
        let err = Address::read_from_async(&mut cursor).await.unwrap_err();
        assert!(matches!(err, ProtocolError::TruncatedAddress));
    }

    #[test]
    fn mapped_ipv6_canonicalises_to_ipv4() {
        let mapped = Address::Ipv6(Ipv4Addr::new(10, 0, 0, 1).to_ipv6_mapped(), 53);
        assert_eq!(
            mapped.canonical(),
            Address::Ipv4(Ipv4Addr::new(10, 0, 0, 1), 53)
        );
        let plain = Address::Ipv6(Ipv6Addr::LOCALHOST, 53);
        assert_eq!(plain.clone().canonical(), plain);
    }
}
