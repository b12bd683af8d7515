use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::address::Address;
use crate::error::{ProtocolError, Result};
use crate::request::CRLF;

/// Largest UDP payload carried in one frame.
pub const MAX_PACKET_SIZE: usize = 8 * 1024;

/// One UDP datagram embedded in a byte stream:
///
/// ```text
/// addr  length(u16, BE)  CRLF  payload
/// ```
///
/// `addr` is the destination on the client-to-server path and the source on
/// the way back. Each frame carries exactly one datagram; the writer never
/// batches across frame boundaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpPacket {
    pub address: Address,
    pub payload: Bytes,
}

impl UdpPacket {
    pub fn new(address: Address, payload: impl Into<Bytes>) -> Self {
        Self {
            address,
            payload: payload.into(),
        }
    }

    /// Reads one frame. A short read inside the frame is `TruncatedPacket`;
    /// a declared length above [`MAX_PACKET_SIZE`] is `OversizePacket`.
    /// Either error terminates the session. A clean EOF at the frame
    /// boundary returns `Ok(None)`.
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Self>> {
        let first = match reader.read_u8().await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(ProtocolError::Io(e)),
        };
        let truncated = |e| ProtocolError::eof_as(e, ProtocolError::TruncatedPacket);

        // The address tag was already consumed probing for EOF; rebuild the
        // field from the tag plus the remaining bytes.
        let address = read_address_after_tag(reader, first).await?;

        let len = reader.read_u16().await.map_err(truncated)? as usize;
        if len > MAX_PACKET_SIZE {
            return Err(ProtocolError::OversizePacket(len));
        }
        let mut crlf = [0u8; 2];
        reader.read_exact(&mut crlf).await.map_err(truncated)?;
        if crlf != CRLF {
            return Err(ProtocolError::MissingCrlf);
        }
        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).await.map_err(truncated)?;
        Ok(Some(Self {
            address,
            payload: payload.into(),
        }))
    }

    pub fn encode(&self) -> Result<BytesMut> {
        if self.payload.len() > MAX_PACKET_SIZE {
            return Err(ProtocolError::OversizePacket(self.payload.len()));
        }
        let mut buf =
            BytesMut::with_capacity(self.address.serialized_len() + 4 + self.payload.len());
        self.address.write_to(&mut buf)?;
        buf.put_u16(self.payload.len() as u16);
        buf.put_slice(&CRLF);
        buf.put_slice(&self.payload);
        Ok(buf)
    }

    /// Writes exactly one frame.
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        let buf = self.encode()?;
        writer.write_all(&buf).await?;
        writer.flush().await?;
        Ok(())
    }
}

async fn read_address_after_tag<R: AsyncRead + Unpin>(
    reader: &mut R,
    tag: u8,
) -> Result<Address> {
    use crate::address::AddressType;
    let truncated = |e| ProtocolError::eof_as(e, ProtocolError::TruncatedPacket);
    match AddressType::try_from(tag)? {
        AddressType::IPv4 => {
            let mut ip = [0u8; 4];
            reader.read_exact(&mut ip).await.map_err(truncated)?;
            let port = reader.read_u16().await.map_err(truncated)?;
            Ok(Address::Ipv4(ip.into(), port))
        }
        AddressType::IPv6 => {
            let mut ip = [0u8; 16];
            reader.read_exact(&mut ip).await.map_err(truncated)?;
            let port = reader.read_u16().await.map_err(truncated)?;
            Ok(Address::Ipv6(ip.into(), port))
        }
        AddressType::Domain => {
            let len = reader.read_u8().await.map_err(truncated)? as usize;
            if len == 0 {
                return Err(ProtocolError::EmptyDomain);
            }
            let mut domain = vec![0u8; len];
            reader.read_exact(&mut domain).await.map_err(truncated)?;
            let domain =
                String::from_utf8(domain).map_err(|_| ProtocolError::InvalidDomainEncoding)?;
            let port = reader.read_u16().await.map_err(truncated)?;
            Ok(Address::Domain(domain, port))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn frame_roundtrip() {
        let packet = UdpPacket::new(
            Address::Ipv4(Ipv4Addr::LOCALHOST, 9999),
            &b"hello"[..],
        );
        let frame = packet.encode().unwrap();
        // addr(7) + len(2) + CRLF(2) + payload(5)
        assert_eq!(frame.len(), 16);
        assert_eq!(&frame[7..9], &[0x00, 0x05]);
        assert_eq!(&frame[9..11], &CRLF);
        assert_eq!(&frame[11..], b"hello");

        let mut cursor = std::io::Cursor::new(frame.to_vec());
        let parsed = UdpPacket::read_from(&mut cursor).await.unwrap().unwrap();
        assert_eq!(parsed, packet);
    }

    #[tokio::test]
    async fn clean_eof_yields_none() {
        let mut cursor = std::io::Cursor::new(Vec::new());
        assert!(UdpPacket::read_from(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn short_read_inside_frame_is_truncated() {
        let packet = UdpPacket::new(Address::Ipv4(Ipv4Addr::LOCALHOST, 53), &b"abcdef"[..]);
        let frame = packet.encode().unwrap();
        let mut cursor = std::io::Cursor::new(frame[..frame.len() - 3].to_vec());
        let err = UdpPacket::read_from(&mut cursor).await.unwrap_err();
        assert!(matches!(err, ProtocolError::TruncatedPacket));
    }

    #[tokio::test]
    async fn oversize_length_is_rejected() {
        let mut frame = Vec::new();
        Address::Ipv4(Ipv4Addr::LOCALHOST, 53)
            .write_to(&mut frame)
            .unwrap();
        frame.extend_from_slice(&(MAX_PACKET_SIZE as u16 + 1).to_be_bytes());
        frame.extend_from_slice(&CRLF);
        let mut cursor = std::io::Cursor::new(frame);
        let err = UdpPacket::read_from(&mut cursor).await.unwrap_err();
        assert!(matches!(err, ProtocolError::OversizePacket(_)));
    }

    #[test]
    fn oversize_payload_is_not_encoded() {
        let packet = UdpPacket::new(
            Address::Ipv4(Ipv4Addr::LOCALHOST, 53),
            vec![0u8; MAX_PACKET_SIZE + 1],
        );
        assert!(matches!(
            packet.encode().unwrap_err(),
            ProtocolError::OversizePacket(_)
        ));
    }

    #[tokio::test]
    async fn frames_do_not_bleed_into_each_other() {
        let a = UdpPacket::new(Address::Domain("dns.example".into(), 53), &b"one"[..]);
        let b = UdpPacket::new(Address::Ipv4(Ipv4Addr::new(8, 8, 8, 8), 53), &b"two"[..]);
        let mut stream = Vec::new();
        stream.extend_from_slice(&a.encode().unwrap());
        stream.extend_from_slice(&b.encode().unwrap());
        let mut cursor = std::io::Cursor::new(stream);
        assert_eq!(UdpPacket::read_from(&mut cursor).await.unwrap().unwrap(), a);
        assert_eq!(UdpPacket::read_from(&mut cursor).await.unwrap().unwrap(), b);
        assert!(UdpPacket::read_from(&mut cursor).await.unwrap().is_none());
    }
}

#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;
    use std::net::Ipv4Addr;

    proptest! {
        #[test]
        fn roundtrip(ip in any::<[u8; 4]>(), port in any::<u16>(),
                     payload in proptest::collection::vec(any::<u8>(), 0..2048)) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let packet = UdpPacket::new(Address::Ipv4(Ipv4Addr::from(ip), port), payload);
                let frame = packet.encode().unwrap();
                let mut cursor = std::io::Cursor::new(frame.to_vec());
                let parsed = UdpPacket::read_from(&mut cursor).await.unwrap().unwrap();
                assert_eq!(parsed, packet);
            });
        }
    }
}
