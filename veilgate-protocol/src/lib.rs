//! Wire-level codecs for the veilgate tunnel protocol.
//!
//! Everything in this crate is a pure encoder/decoder: the address field
//! shared by every frame, the request header sent after the TLS handshake,
//! the compact per-substream header used inside multiplexed sessions, and
//! the framing that carries UDP datagrams over a byte stream. Policy (who
//! may authenticate, where bytes go) lives in `veilgate-core`.

pub mod address;
pub mod error;
pub mod packet;
pub mod request;

pub use address::{Address, AddressType};
pub use error::{ProtocolError, Result};
pub use packet::{UdpPacket, MAX_PACKET_SIZE};
pub use request::{hash_password, Command, RequestHeader, CRLF, HASH_LEN};
