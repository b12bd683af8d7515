use thiserror::Error;

/// Errors produced while encoding or decoding protocol frames.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("truncated address")]
    TruncatedAddress,

    #[error("invalid address type: {0:#04x}")]
    InvalidAddressType(u8),

    #[error("empty domain name")]
    EmptyDomain,

    #[error("domain name too long: {0} bytes")]
    DomainTooLong(usize),

    #[error("domain name is not valid UTF-8")]
    InvalidDomainEncoding,

    #[error("unknown command: {0:#04x}")]
    UnknownCommand(u8),

    #[error("missing CRLF delimiter")]
    MissingCrlf,

    #[error("truncated packet")]
    TruncatedPacket,

    #[error("oversize packet: {0} bytes")]
    OversizePacket(usize),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

impl ProtocolError {
    /// Maps an unexpected EOF onto the given protocol error, leaving every
    /// other I/O error as-is.
    pub(crate) fn eof_as(err: std::io::Error, truncated: ProtocolError) -> ProtocolError {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            truncated
        } else {
            ProtocolError::Io(err)
        }
    }
}
