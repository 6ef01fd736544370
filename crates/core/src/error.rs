//! Error types for the streaming core.

use std::fmt;

use crate::amf0::Amf0Error;

/// Errors that can occur anywhere in the streaming core.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Framing**: [`ShortBuffer`](Self::ShortBuffer) - a decoder needed more
///   bytes than were available.
/// - **Protocol**: [`Invalid`](Self::Invalid), [`Amf0`](Self::Amf0) - the peer
///   sent something malformed or out of sequence.
/// - **Transport**: [`Io`](Self::Io), [`TransportClosed`](Self::TransportClosed),
///   [`Timeout`](Self::Timeout).
/// - **Negotiation**: [`AuthRequired`](Self::AuthRequired),
///   [`AuthFailed`](Self::AuthFailed), [`Status`](Self::Status).
/// - **Local**: [`ResourceExhausted`](Self::ResourceExhausted),
///   [`NotYetSupported`](Self::NotYetSupported).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A decoder ran out of input.
    #[error("short buffer: need {need} bytes, have {have}")]
    ShortBuffer { need: usize, have: usize },

    /// The peer sent malformed or unexpected protocol data.
    #[error("protocol error: {kind}")]
    Invalid { kind: ProtocolErrorKind },

    /// AMF0 value could not be encoded or decoded.
    #[error("AMF0 error: {0}")]
    Amf0(#[from] Amf0Error),

    /// The connection was closed, locally or by the peer.
    #[error("transport closed")]
    TransportClosed,

    /// The server answered 401 without a usable challenge.
    #[error("authentication required")]
    AuthRequired,

    /// The server answered 401 again after credentials were sent.
    #[error("authentication failed")]
    AuthFailed,

    /// A handshake, command or read deadline expired.
    #[error("timed out during {0}")]
    Timeout(&'static str),

    /// Local resource such as a UDP port pair could not be obtained.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Valid input that this implementation does not handle.
    #[error("not yet supported: {0}")]
    NotYetSupported(&'static str),

    /// The RTSP peer answered with a non-200 status.
    #[error("unexpected RTSP status {code} {reason}")]
    Status { code: u16, reason: String },
}

/// Specific kind of protocol failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolErrorKind {
    /// Input was empty (no start line).
    EmptyMessage,
    /// Request line did not have the expected `Method URI Version` format.
    InvalidRequestLine,
    /// Status line did not have the expected `Version Code Reason` format.
    InvalidStatusLine,
    /// A header line did not contain a colon separator.
    InvalidHeader,
    /// A header the exchange depends on was absent.
    MissingHeader(&'static str),
    /// `Transport` header could not be understood.
    InvalidTransport,
    /// URL did not parse or used an unexpected scheme.
    InvalidUrl(String),
    /// SDP was malformed or described no usable media.
    InvalidSdp(&'static str),
    /// RTP packet with a version other than 2.
    RtpVersion(u8),
    /// RTCP packet that could not be decoded.
    InvalidRtcp,
    /// RTMP handshake mismatch.
    Handshake(&'static str),
    /// RTMP chunk header that cannot be honoured.
    InvalidChunk(&'static str),
    /// RTMP command arrived in the wrong stage.
    UnexpectedCommand(String),
    /// Codec payload that does not match its declared layout.
    InvalidCodecData(&'static str),
}

impl fmt::Display for ProtocolErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyMessage => write!(f, "empty message"),
            Self::InvalidRequestLine => write!(f, "invalid request line"),
            Self::InvalidStatusLine => write!(f, "invalid status line"),
            Self::InvalidHeader => write!(f, "invalid header"),
            Self::MissingHeader(name) => write!(f, "missing header {name}"),
            Self::InvalidTransport => write!(f, "invalid transport header"),
            Self::InvalidUrl(url) => write!(f, "invalid url {url}"),
            Self::InvalidSdp(why) => write!(f, "invalid sdp: {why}"),
            Self::RtpVersion(v) => write!(f, "unsupported rtp version {v}"),
            Self::InvalidRtcp => write!(f, "invalid rtcp packet"),
            Self::Handshake(why) => write!(f, "handshake failed: {why}"),
            Self::InvalidChunk(why) => write!(f, "invalid chunk: {why}"),
            Self::UnexpectedCommand(name) => write!(f, "unexpected command {name}"),
            Self::InvalidCodecData(why) => write!(f, "invalid codec data: {why}"),
        }
    }
}

/// Coarse classification of an [`Error`], for callers that branch on the
/// failure class instead of the exact variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ShortBuffer,
    Invalid,
    TransportClosed,
    AuthRequired,
    AuthFailed,
    Timeout,
    ResourceExhausted,
    NotYetSupported,
}

impl Error {
    /// Shorthand for [`Error::Invalid`].
    pub fn invalid(kind: ProtocolErrorKind) -> Self {
        Error::Invalid { kind }
    }

    /// Shorthand for [`Error::ShortBuffer`].
    pub fn short(need: usize, have: usize) -> Self {
        Error::ShortBuffer { need, have }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ShortBuffer { .. } => ErrorKind::ShortBuffer,
            Error::Invalid { .. } | Error::Amf0(_) | Error::Status { .. } => ErrorKind::Invalid,
            Error::Io(e) if e.kind() == std::io::ErrorKind::TimedOut => ErrorKind::Timeout,
            Error::Io(_) | Error::TransportClosed => ErrorKind::TransportClosed,
            Error::AuthRequired => ErrorKind::AuthRequired,
            Error::AuthFailed => ErrorKind::AuthFailed,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            Error::NotYetSupported(_) => ErrorKind::NotYetSupported,
        }
    }
}

/// Convenience alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_classify_as_transport_closed() {
        let err: Error = std::io::Error::from(std::io::ErrorKind::ConnectionReset).into();
        assert_eq!(err.kind(), ErrorKind::TransportClosed);
    }

    #[test]
    fn io_timeouts_classify_as_timeout() {
        let err: Error = std::io::Error::from(std::io::ErrorKind::TimedOut).into();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[test]
    fn status_is_an_invalid_exchange() {
        let err = Error::Status {
            code: 404,
            reason: "Not Found".into(),
        };
        assert_eq!(err.kind(), ErrorKind::Invalid);
        assert_eq!(err.to_string(), "unexpected RTSP status 404 Not Found");
    }

    #[test]
    fn protocol_kind_display() {
        let err = Error::invalid(ProtocolErrorKind::MissingHeader("CSeq"));
        assert_eq!(err.to_string(), "protocol error: missing header CSeq");
    }
}
