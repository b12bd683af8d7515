use bytes::{BufMut, BytesMut};
use sha2::{Digest, Sha224};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::address::Address;
use crate::error::{ProtocolError, Result};

/// Length of the hex-encoded SHA-224 password hash.
pub const HASH_LEN: usize = 56;

pub const CRLF: [u8; 2] = [0x0D, 0x0A];

/// Returns the lowercase hex SHA-224 of the password bytes, the only form
/// ever transmitted on the wire.
pub fn hash_password(password: &str) -> String {
    hex::encode(Sha224::digest(password.as_bytes()))
}

/// Request command byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Connect = 0x01,
    Associate = 0x03,
    Mux = 0x7F,
}

impl TryFrom<u8> for Command {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::Connect),
            0x03 => Ok(Self::Associate),
            0x7F => Ok(Self::Mux),
            _ => Err(ProtocolError::UnknownCommand(value)),
        }
    }
}

/// The request header sent once per session, immediately after the TLS
/// handshake:
///
/// ```text
/// hash(56 hex) CRLF cmd addr CRLF payload...
/// ```
///
/// The hash line is consumed by the server's dispatcher before the header is
/// parsed, so `read_from` starts at the command byte. The compact form
/// (`read_compact`/`write_compact`) is the per-substream header carried
/// inside a multiplexed session: `cmd addr`, no hash, no trailing CRLF.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHeader {
    pub command: Command,
    pub address: Address,
}

impl RequestHeader {
    pub fn new(command: Command, address: Address) -> Self {
        Self { command, address }
    }

    /// Parses `cmd + addr + CRLF` from the stream.
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let cmd = reader
            .read_u8()
            .await
            .map_err(|e| ProtocolError::eof_as(e, ProtocolError::TruncatedAddress))?;
        let command = Command::try_from(cmd)?;
        let address = Address::read_from_async(reader).await?;
        let mut crlf = [0u8; 2];
        reader
            .read_exact(&mut crlf)
            .await
            .map_err(|e| ProtocolError::eof_as(e, ProtocolError::MissingCrlf))?;
        if crlf != CRLF {
            return Err(ProtocolError::MissingCrlf);
        }
        Ok(Self { command, address })
    }

    /// Encodes the full client-side frame, hash line included, as one
    /// buffer so it reaches the wire in a single write.
    pub fn encode(&self, hash: &str) -> Result<BytesMut> {
        debug_assert_eq!(hash.len(), HASH_LEN);
        let mut buf = BytesMut::with_capacity(HASH_LEN + 4 + self.address.serialized_len() + 2);
        buf.put_slice(hash.as_bytes());
        buf.put_slice(&CRLF);
        buf.put_u8(self.command as u8);
        self.address.write_to(&mut buf)?;
        buf.put_slice(&CRLF);
        Ok(buf)
    }

    /// Writes the full client-side frame to the stream.
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W, hash: &str) -> Result<()> {
        let buf = self.encode(hash)?;
        writer.write_all(&buf).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Parses the compact in-mux header: `cmd + addr`.
    pub async fn read_compact<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let cmd = reader
            .read_u8()
            .await
            .map_err(|e| ProtocolError::eof_as(e, ProtocolError::TruncatedAddress))?;
        let command = Command::try_from(cmd)?;
        let address = Address::read_from_async(reader).await?;
        Ok(Self { command, address })
    }

    /// Writes the compact in-mux header.
    pub async fn write_compact<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        let mut buf = BytesMut::with_capacity(1 + self.address.serialized_len());
        buf.put_u8(self.command as u8);
        self.address.write_to(&mut buf)?;
        writer.write_all(&buf).await?;
        writer.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    // SHA-224 test vectors from FIPS 180-4.
    #[test]
    fn hash_is_56_lowercase_hex() {
        assert_eq!(
            hash_password(""),
            "d14a028c2a3a2bc9476102bb288234c415a2b01f828ea62ac5b3e42f"
        );
        assert_eq!(
            hash_password("abc"),
            "23097d223405d8228642a477bda255b32aadbce4bda0b3f7e36c9da7"
        );
        let h = hash_password("swordfish");
        assert_eq!(h.len(), HASH_LEN);
        assert!(h.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()));
    }

    #[test]
    fn command_bytes() {
        assert_eq!(Command::try_from(0x01).unwrap(), Command::Connect);
        assert_eq!(Command::try_from(0x03).unwrap(), Command::Associate);
        assert_eq!(Command::try_from(0x7F).unwrap(), Command::Mux);
        assert!(matches!(
            Command::try_from(0x02),
            Err(ProtocolError::UnknownCommand(0x02))
        ));
    }

    #[tokio::test]
    async fn frame_roundtrip() {
        let header = RequestHeader::new(
            Command::Connect,
            Address::Ipv4(Ipv4Addr::new(93, 184, 216, 34), 80),
        );
        let hash = hash_password("swordfish");
        let frame = header.encode(&hash).unwrap();

        // layout: 56 hex + CRLF + cmd + tag + 4 + port + CRLF
        assert_eq!(&frame[..HASH_LEN], hash.as_bytes());
        assert_eq!(&frame[HASH_LEN..HASH_LEN + 2], &CRLF);
        assert_eq!(frame[HASH_LEN + 2], 0x01);
        assert_eq!(frame[HASH_LEN + 3], 0x01);
        assert_eq!(&frame[HASH_LEN + 4..HASH_LEN + 8], &[93, 184, 216, 34]);
        assert_eq!(&frame[HASH_LEN + 8..HASH_LEN + 10], &[0x00, 0x50]);
        assert_eq!(&frame[HASH_LEN + 10..], &CRLF);

        let mut cursor = std::io::Cursor::new(frame[HASH_LEN + 2..].to_vec());
        let parsed = RequestHeader::read_from(&mut cursor).await.unwrap();
        assert_eq!(parsed, header);
    }

    #[tokio::test]
    async fn compact_roundtrip() {
        let header = RequestHeader::new(Command::Connect, Address::Domain("a.example".into(), 80));
        let mut buf = Vec::new();
        header.write_compact(&mut buf).await.unwrap();
        assert_eq!(buf[0], 0x01);
        let mut cursor = std::io::Cursor::new(buf);
        let parsed = RequestHeader::read_compact(&mut cursor).await.unwrap();
        assert_eq!(parsed, header);
    }

    #[tokio::test]
    async fn truncated_domain_address_is_protocol_error() {
        // cmd + domain tag + len 7 + "exa", then EOF
        let bytes = vec![0x01, 0x03, 0x07, b'e', b'x', b'a'];
        let mut cursor = std::io::Cursor::new(bytes);
        let err = RequestHeader::read_from(&mut cursor).await.unwrap_err();
        assert!(matches!(err, ProtocolError::TruncatedAddress));
    }

    #[tokio::test]
    async fn missing_crlf_is_rejected() {
        let header = RequestHeader::new(
            Command::Connect,
            Address::Ipv4(Ipv4Addr::LOCALHOST, 80),
        );
        let hash = hash_password("k");
        let mut frame = header.encode(&hash).unwrap().to_vec();
        let n = frame.len();
        frame[n - 2] = b'x';
        let mut cursor = std::io::Cursor::new(frame[HASH_LEN + 2..].to_vec());
        let err = RequestHeader::read_from(&mut cursor).await.unwrap_err();
        assert!(matches!(err, ProtocolError::MissingCrlf));
    }
}

#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn arb_address() -> impl Strategy<Value = Address> {
        prop_oneof![
            (any::<[u8; 4]>(), any::<u16>())
                .prop_map(|(ip, p)| Address::Ipv4(Ipv4Addr::from(ip), p)),
            (any::<[u8; 16]>(), any::<u16>())
                .prop_map(|(ip, p)| Address::Ipv6(Ipv6Addr::from(ip), p)),
            ("[a-z]{1,40}", any::<u16>()).prop_map(|(d, p)| Address::Domain(d, p)),
        ]
    }

    fn arb_command() -> impl Strategy<Value = Command> {
        prop_oneof![
            Just(Command::Connect),
            Just(Command::Associate),
            Just(Command::Mux)
        ]
    }

    proptest! {
        #[test]
        fn header_roundtrip(cmd in arb_command(), addr in arb_address(), pw in ".{0,24}") {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let header = RequestHeader::new(cmd, addr);
                let hash = hash_password(&pw);
                let frame = header.encode(&hash).unwrap();
                let mut cursor = std::io::Cursor::new(frame[HASH_LEN + 2..].to_vec());
                let parsed = RequestHeader::read_from(&mut cursor).await.unwrap();
                assert_eq!(parsed, header);
            });
        }
    }
}
