//! Wire protocol layer for the Couchbase Database Change Protocol.
//!
//! This crate knows how to frame, build, and parse DCP messages and
//! nothing else: no sockets, no session state, no policy. The client
//! core (`dcp-client`) layers connection and stream management on top.

pub mod constants;
pub mod features;
pub mod frame;
pub mod messages;
pub mod opcode;
pub mod status;

pub use constants::{
    DEFAULT_NUM_VBUCKETS, FAILOVER_LOG_MAX_ENTRIES, HEADER_SIZE, KV_LISTEN_PORT,
    MAX_FRAME_BYTES, SEQNO_INFINITY,
};
pub use features::{Feature, FeatureSet};
pub use frame::{read_frame, Frame, FrameError};
pub use messages::{
    DeletionBody, FailoverEntry, FailoverLog, MessageError, MutationBody, ObserveSeqnoBody,
    OsoBoundary, SnapshotMarker, StreamEndReason, StreamRequest, SystemEventBody,
    SystemEventKind,
};
pub use opcode::Opcode;
pub use status::Status;
