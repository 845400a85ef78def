/// Opcode table for the memcached binary protocol subset that DCP uses.
///
/// Only the opcodes the client sends or expects to receive are given
/// names; everything else round-trips through `Other`.

/// A protocol opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Hello,
    SaslListMechs,
    SaslAuth,
    SaslStep,
    SelectBucket,
    GetAllVbSeqnos,
    ObserveSeqno,
    GetClusterConfig,

    DcpOpenConnection,
    DcpAddStream,
    DcpCloseStream,
    DcpStreamRequest,
    DcpGetFailoverLog,
    DcpStreamEnd,
    DcpSnapshotMarker,
    DcpMutation,
    DcpDeletion,
    DcpExpiration,
    DcpFlush,
    DcpSetVbucketState,
    DcpNoop,
    DcpBufferAck,
    DcpControl,
    DcpSystemEvent,
    DcpSeqnoAdvanced,
    DcpOsoSnapshot,

    /// An opcode this client does not interpret.
    Other(u8),
}

impl Opcode {
    pub fn from_u8(code: u8) -> Self {
        match code {
            0x1f => Self::Hello,
            0x20 => Self::SaslListMechs,
            0x21 => Self::SaslAuth,
            0x22 => Self::SaslStep,
            0x89 => Self::SelectBucket,
            0x48 => Self::GetAllVbSeqnos,
            0x91 => Self::ObserveSeqno,
            0xb5 => Self::GetClusterConfig,
            0x50 => Self::DcpOpenConnection,
            0x51 => Self::DcpAddStream,
            0x52 => Self::DcpCloseStream,
            0x53 => Self::DcpStreamRequest,
            0x54 => Self::DcpGetFailoverLog,
            0x55 => Self::DcpStreamEnd,
            0x56 => Self::DcpSnapshotMarker,
            0x57 => Self::DcpMutation,
            0x58 => Self::DcpDeletion,
            0x59 => Self::DcpExpiration,
            0x5a => Self::DcpFlush,
            0x5b => Self::DcpSetVbucketState,
            0x5c => Self::DcpNoop,
            0x5d => Self::DcpBufferAck,
            0x5e => Self::DcpControl,
            0x5f => Self::DcpSystemEvent,
            0x64 => Self::DcpSeqnoAdvanced,
            0x65 => Self::DcpOsoSnapshot,
            other => Self::Other(other),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            Self::Hello => 0x1f,
            Self::SaslListMechs => 0x20,
            Self::SaslAuth => 0x21,
            Self::SaslStep => 0x22,
            Self::SelectBucket => 0x89,
            Self::GetAllVbSeqnos => 0x48,
            Self::ObserveSeqno => 0x91,
            Self::GetClusterConfig => 0xb5,
            Self::DcpOpenConnection => 0x50,
            Self::DcpAddStream => 0x51,
            Self::DcpCloseStream => 0x52,
            Self::DcpStreamRequest => 0x53,
            Self::DcpGetFailoverLog => 0x54,
            Self::DcpStreamEnd => 0x55,
            Self::DcpSnapshotMarker => 0x56,
            Self::DcpMutation => 0x57,
            Self::DcpDeletion => 0x58,
            Self::DcpExpiration => 0x59,
            Self::DcpFlush => 0x5a,
            Self::DcpSetVbucketState => 0x5b,
            Self::DcpNoop => 0x5c,
            Self::DcpBufferAck => 0x5d,
            Self::DcpControl => 0x5e,
            Self::DcpSystemEvent => 0x5f,
            Self::DcpSeqnoAdvanced => 0x64,
            Self::DcpOsoSnapshot => 0x65,
            Self::Other(code) => code,
        }
    }

    /// Whether a server-initiated frame with this opcode counts against
    /// the flow-control buffer. Per protocol, every data-bearing DCP
    /// frame is charged at its full framed size.
    pub fn is_flow_controlled(self) -> bool {
        matches!(
            self,
            Self::DcpMutation
                | Self::DcpDeletion
                | Self::DcpExpiration
                | Self::DcpSnapshotMarker
                | Self::DcpSystemEvent
                | Self::DcpOsoSnapshot
                | Self::DcpSeqnoAdvanced
                | Self::DcpStreamEnd
        )
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_roundtrip() {
        for code in 0u8..=0xff {
            assert_eq!(Opcode::from_u8(code).to_u8(), code);
        }
    }

    #[test]
    fn test_data_opcodes_are_flow_controlled() {
        assert!(Opcode::DcpMutation.is_flow_controlled());
        assert!(Opcode::DcpStreamEnd.is_flow_controlled());
        assert!(!Opcode::DcpNoop.is_flow_controlled());
        assert!(!Opcode::DcpControl.is_flow_controlled());
    }
}
