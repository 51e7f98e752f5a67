//! Error taxonomy shared by the client and the ingest server.
//!
//! Every failure that crosses a component boundary is a [`PipelineError`], and
//! its [`ErrorKind`] decides the recovery policy: retry with backoff, terminate
//! the connection, or drop data.

use std::fmt;

/// Malformed or truncated wire input.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("input truncated: needed {needed} more byte(s), {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("bad magic bytes")]
    BadMagic,

    #[error("unsupported wire version {0}")]
    UnsupportedVersion(u8),

    #[error("unexpected message tag 0x{found:02x} (expected 0x{expected:02x})")]
    UnexpectedTag { expected: u8, found: u8 },

    #[error("unknown metric code {0}")]
    UnknownMetric(u8),

    #[error("invalid UTF-8 in {field}")]
    InvalidUtf8 { field: &'static str },

    #[error("non-finite sample value")]
    NonFiniteValue,

    #[error("invalid timestamp ({secs}s, {nanos}ns)")]
    InvalidTimestamp { secs: i64, nanos: u32 },

    #[error("{0} trailing byte(s) after message")]
    TrailingBytes(usize),
}

/// Reasons a peer broke the protocol. The connection is always terminated.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolViolation {
    #[error("sequence {received} is not greater than last acknowledged {last}")]
    SequenceRegression { last: u64, received: u64 },

    #[error("message exceeds maximum size of {max} bytes")]
    Oversized { max: usize },

    #[error("malformed message: {0}")]
    Malformed(#[from] CodecError),

    #[error("batch claims client '{claimed}' but channel is authenticated as '{authenticated}'")]
    IdentityMismatch {
        authenticated: String,
        claimed: String,
    },

    #[error("ack for sequence {received} while waiting for {expected}")]
    UnexpectedAck { expected: u64, received: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    TransientIo,
    AuthenticationFailure,
    ProtocolViolation,
    SinkUnavailable,
    ResourceExhaustion,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::TransientIo => "transient_io",
            ErrorKind::AuthenticationFailure => "authentication_failure",
            ErrorKind::ProtocolViolation => "protocol_violation",
            ErrorKind::SinkUnavailable => "sink_unavailable",
            ErrorKind::ResourceExhaustion => "resource_exhaustion",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("transient I/O failure: {0}")]
    TransientIo(#[from] std::io::Error),

    #[error("authentication failed: {0}")]
    AuthenticationFailure(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(#[from] ProtocolViolation),

    #[error("sink unavailable after {attempts} attempt(s): {reason}")]
    SinkUnavailable { attempts: u32, reason: String },

    #[error("pending queue full, dropped {dropped} batch(es)")]
    ResourceExhaustion { dropped: usize },
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::TransientIo(_) => ErrorKind::TransientIo,
            PipelineError::AuthenticationFailure(_) => ErrorKind::AuthenticationFailure,
            PipelineError::ProtocolViolation(_) => ErrorKind::ProtocolViolation,
            PipelineError::SinkUnavailable { .. } => ErrorKind::SinkUnavailable,
            PipelineError::ResourceExhaustion { .. } => ErrorKind::ResourceExhaustion,
        }
    }

    pub fn timed_out(what: &str) -> Self {
        PipelineError::TransientIo(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("{what} timed out"),
        ))
    }

    /// Classify an I/O error coming out of a TLS stream. Errors raised by
    /// rustls itself (bad certificate, unknown CA, missing client cert, fatal
    /// alert from the peer) are authentication failures; everything else is
    /// transport-level.
    pub fn from_tls_io(err: std::io::Error) -> Self {
        let is_tls = err
            .get_ref()
            .is_some_and(|inner| inner.downcast_ref::<rustls::Error>().is_some());
        if is_tls {
            PipelineError::AuthenticationFailure(err.to_string())
        } else {
            PipelineError::TransientIo(err)
        }
    }
}

impl From<CodecError> for PipelineError {
    fn from(err: CodecError) -> Self {
        PipelineError::ProtocolViolation(ProtocolViolation::Malformed(err))
    }
}
