use thiserror::Error;

/// Failures raised while decoding or building wire packets
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("packet truncated: expected at least {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("unexpected packet header 0x{0:02x}")]
    BadHeader(u8),
    #[error("declared length {declared} does not match buffer size {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("unexpected packet id 0x{0:02x}")]
    UnexpectedId(u8),
    #[error("invalid player name")]
    InvalidName,
    #[error("message too long ({0} bytes)")]
    MessageTooLong(usize),
    #[error("no recipients given")]
    EmptyRecipients,
    #[error("packet too large ({0} bytes)")]
    Oversized(usize),
    #[error("action batch checksum mismatch")]
    ChecksumMismatch,
}
