use std::fmt;

/// Errors surfaced by the RPC core.
///
/// The strum serialization gives every kind a stable `rpc_` prefixed name,
/// suitable for wire-level or log-level matching.
#[derive(
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
    PartialEq,
    Eq,
    Clone,
    Copy,
    thiserror::Error,
)]
pub enum RpcError {
    /// Message too large for the caller's buffers, or malformed input
    #[strum(serialize = "rpc_invalid_arg")]
    InvalidArgument,
    /// The receive side advertised more than one variable-length buffer
    #[strum(serialize = "rpc_nobufs")]
    NoBufferSpace,
    /// Deadline reached before the response header arrived
    #[strum(serialize = "rpc_timeout")]
    Timeout,
    /// Stream ended or was closed while a call was pending
    #[strum(serialize = "rpc_closed")]
    ConnectionClosed,
    /// Magic or version mismatch, fatal for the stream
    #[strum(serialize = "rpc_protocol")]
    Protocol,
    /// A full-size response failed its checksum validation
    #[strum(serialize = "rpc_checksum")]
    ChecksumMismatch,
    /// Server is shutting down, or the pool could not connect
    #[strum(serialize = "rpc_unavailable")]
    Unavailable,
}

// Debug goes through Display so logs carry the strum name
impl fmt::Debug for RpcError {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl From<std::io::Error> for RpcError {
    #[inline(always)]
    fn from(_e: std::io::Error) -> Self {
        Self::ConnectionClosed
    }
}
