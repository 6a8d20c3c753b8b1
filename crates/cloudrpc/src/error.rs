//! # Error Definitions
//!
//! Failures of the wire layer itself. Failures of the remote side travel as
//! [`crate::Fault`] instead.

/// Operational failures while framing or unframing messages.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// A value could not be turned into bytes.
    #[error("encode failed: {0}")]
    Encode(String),
    /// A byte string did not decode into the expected shape.
    #[error("decode failed: {0}")]
    Decode(String),
    /// The message decoded but violated the request/response protocol.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
}

pub type Result<T> = std::result::Result<T, Error>;
