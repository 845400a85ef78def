//! Client error taxonomy.
//!
//! Everything the host can observe funnels into [`DcpError`]. Raw I/O
//! and frame-level errors never cross the listener boundary directly;
//! they are wrapped here and, where a vbucket is affected, translated
//! into stream-end notifications by the channel.

use thiserror::Error;

use dcp_proto::frame::FrameError;
use dcp_proto::messages::MessageError;
use dcp_proto::Status;

/// Handshake phases, used for error reporting and phase gating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakePhase {
    Connecting,
    Auth,
    Hello,
    SelectBucket,
    DcpOpen,
    DcpControl,
    Ready,
    Closing,
}

impl std::fmt::Display for HandshakePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Auth => "auth",
            Self::Hello => "hello",
            Self::SelectBucket => "select-bucket",
            Self::DcpOpen => "dcp-open",
            Self::DcpControl => "dcp-control",
            Self::Ready => "ready",
            Self::Closing => "closing",
        };
        write!(f, "{}", name)
    }
}

/// Unified client error.
#[derive(Debug, Error)]
pub enum DcpError {
    /// The server violated the protocol (malformed frame, mutation
    /// outside its snapshot window, unexpected opcode). Fatal for the
    /// channel that observed it.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A handshake phase failed. `permanent` failures (bad credentials,
    /// missing bucket, required feature refused) stop reconnection.
    #[error("handshake failed in {phase} phase: {detail}")]
    Handshake {
        phase: HandshakePhase,
        detail: String,
        permanent: bool,
    },

    /// Server returned an unexpected status for a client request.
    #[error("request failed: {0}")]
    Request(Status),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out: {0}")]
    Timeout(String),

    /// Flow-control stall: the server-bounded buffer stayed full past
    /// the keepalive interval without the application returning credit.
    #[error("flow control stalled: {unacked} bytes unacked of {buffer}")]
    FlowControlStall { unacked: u64, buffer: u64 },

    /// The application vetoed a rollback; the affected stream stops.
    #[error("rollback to {seqno} vetoed for vbucket {vbucket}")]
    RollbackVetoed { vbucket: u16, seqno: u64 },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("client is not connected")]
    NotConnected,

    #[error("client is shutting down")]
    Shutdown,
}

impl DcpError {
    /// Whether reconnection can possibly help.
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::Handshake { permanent, .. } => *permanent,
            Self::RollbackVetoed { .. } | Self::Config(_) | Self::Shutdown => true,
            _ => false,
        }
    }

    pub(crate) fn protocol(detail: impl Into<String>) -> Self {
        Self::Protocol(detail.into())
    }
}

impl From<FrameError> for DcpError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Io(e) => Self::Io(e),
            other => Self::Protocol(other.to_string()),
        }
    }
}

impl From<MessageError> for DcpError {
    fn from(err: MessageError) -> Self {
        Self::Protocol(err.to_string())
    }
}

/// Result alias used throughout the client.
pub type DcpResult<T> = Result<T, DcpError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permanence() {
        let auth = DcpError::Handshake {
            phase: HandshakePhase::Auth,
            detail: "authentication error".into(),
            permanent: true,
        };
        assert!(auth.is_permanent());

        let timeout = DcpError::Timeout("handshake".into());
        assert!(!timeout.is_permanent());

        let veto = DcpError::RollbackVetoed { vbucket: 3, seqno: 0 };
        assert!(veto.is_permanent());
    }

    #[test]
    fn test_frame_error_wraps_to_protocol() {
        let err: DcpError = FrameError::BadMagic(0x42).into();
        assert!(matches!(err, DcpError::Protocol(_)));

        let io: DcpError =
            FrameError::Io(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "x")).into();
        assert!(matches!(io, DcpError::Io(_)));
    }
}
