//! Per-vbucket stream state machine.
//!
//! Interprets the DCP frames for one open stream, validates protocol
//! invariants, and decides what (if anything) surfaces to the listener.
//! The machine is pure: it never touches sockets or the session store.
//! The channel feeds it parsed bodies and applies the produced offsets
//! either immediately or, under rollback mitigation, at release time.

use dcp_proto::messages::{
    DeletionBody, MutationBody, OsoBoundary, SnapshotMarker, StreamEndReason, SystemEventBody,
    SystemEventKind,
};

use crate::config::CollectionsFilter;
use crate::error::{DcpError, DcpResult};
use crate::session::StreamOffset;

/// Lifecycle of one vbucket stream on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    /// DCP_STREAM_REQUEST sent, response outstanding.
    Opening,
    Open,
    Ended,
}

/// What a processed frame produced.
#[derive(Debug)]
pub enum StreamOutput {
    Snapshot(SnapshotMarker),
    Mutation {
        body: MutationBody,
        offset: StreamOffset,
    },
    Deletion {
        body: DeletionBody,
        due_to_expiration: bool,
        offset: StreamOffset,
    },
    SeqnoAdvanced {
        offset: StreamOffset,
    },
    SystemEvent {
        body: SystemEventBody,
        offset: StreamOffset,
        /// False when the event only advances the offset (filtered out,
        /// or the client is not collections-aware).
        deliver: bool,
    },
    OsoBoundary(OsoBoundary),
    Ended(StreamEndReason),
}

impl StreamOutput {
    /// The checkpoint offset this output carries, for the variants that
    /// move the cursor (and are therefore subject to rollback
    /// mitigation buffering).
    pub fn offset(&self) -> Option<&StreamOffset> {
        match self {
            Self::Mutation { offset, .. }
            | Self::Deletion { offset, .. }
            | Self::SeqnoAdvanced { offset }
            | Self::SystemEvent { offset, .. } => Some(offset),
            Self::Snapshot(_) | Self::OsoBoundary(_) | Self::Ended(_) => None,
        }
    }
}

/// State machine for one open (or opening) vbucket stream.
#[derive(Debug)]
pub struct ActiveStream {
    pub vbucket: u16,
    /// Correlation id; the server echoes it on every stream frame.
    pub opaque: u32,
    pub phase: StreamPhase,
    /// Requested end bound; SEQNO_INFINITY for endless streams.
    pub end_seqno: u64,
    /// Set when the host asked to close and the close is in flight.
    pub closing: bool,

    vbuuid: u64,
    manifest_uid: u64,
    snapshot_start: u64,
    snapshot_end: u64,
    last_seqno: u64,
    oso_active: bool,
}

impl ActiveStream {
    pub fn new(vbucket: u16, opaque: u32, end_seqno: u64, offset: StreamOffset) -> Self {
        Self {
            vbucket,
            opaque,
            phase: StreamPhase::Opening,
            end_seqno,
            closing: false,
            vbuuid: offset.vbuuid,
            manifest_uid: offset.collections_manifest_uid,
            snapshot_start: offset.snapshot_start,
            snapshot_end: offset.snapshot_end,
            last_seqno: offset.seqno,
            oso_active: false,
        }
    }

    /// Stream-open response accepted; adopt the server's generation.
    pub fn mark_open(&mut self, vbuuid: u64) {
        self.phase = StreamPhase::Open;
        self.vbuuid = vbuuid;
    }

    fn offset_at(&self, seqno: u64) -> StreamOffset {
        StreamOffset {
            vbuuid: self.vbuuid,
            seqno,
            snapshot_start: self.snapshot_start,
            snapshot_end: self.snapshot_end,
            collections_manifest_uid: self.manifest_uid,
        }
    }

    /// Advance the cursor, widening the window bookkeeping for OSO
    /// regions where arrival order is not seqno order.
    fn advance(&mut self, by_seqno: u64) -> u64 {
        self.last_seqno = self.last_seqno.max(by_seqno);
        if self.snapshot_end < self.last_seqno {
            self.snapshot_end = self.last_seqno;
        }
        self.last_seqno
    }

    /// Validate a data seqno against the current snapshot window.
    ///
    /// A mutation outside the announced window, or one that moves
    /// backwards, is a server protocol violation and fatal for the
    /// channel. OSO regions are exempt: the server has declared the
    /// order arbitrary until the closing boundary.
    fn check_window(&self, by_seqno: u64) -> DcpResult<()> {
        if self.oso_active {
            return Ok(());
        }
        if by_seqno < self.last_seqno {
            return Err(DcpError::protocol(format!(
                "vbucket {}: seqno {} before cursor {}",
                self.vbucket, by_seqno, self.last_seqno
            )));
        }
        if by_seqno < self.snapshot_start || by_seqno > self.snapshot_end {
            return Err(DcpError::protocol(format!(
                "vbucket {}: seqno {} outside snapshot [{}, {}]",
                self.vbucket, by_seqno, self.snapshot_start, self.snapshot_end
            )));
        }
        Ok(())
    }

    pub fn on_snapshot_marker(&mut self, marker: SnapshotMarker) -> DcpResult<StreamOutput> {
        if marker.end_seqno < marker.start_seqno {
            return Err(DcpError::protocol(format!(
                "vbucket {}: inverted snapshot [{}, {}]",
                self.vbucket, marker.start_seqno, marker.end_seqno
            )));
        }
        self.snapshot_start = marker.start_seqno;
        self.snapshot_end = marker.end_seqno;
        Ok(StreamOutput::Snapshot(marker))
    }

    pub fn on_mutation(&mut self, body: MutationBody) -> DcpResult<StreamOutput> {
        self.check_window(body.by_seqno)?;
        let seqno = self.advance(body.by_seqno);
        let offset = self.offset_at(seqno);
        Ok(StreamOutput::Mutation { body, offset })
    }

    pub fn on_deletion(
        &mut self,
        body: DeletionBody,
        due_to_expiration: bool,
    ) -> DcpResult<StreamOutput> {
        self.check_window(body.by_seqno)?;
        let seqno = self.advance(body.by_seqno);
        let offset = self.offset_at(seqno);
        Ok(StreamOutput::Deletion {
            body,
            due_to_expiration,
            offset,
        })
    }

    /// Seqno advance: offset moves exactly as for a mutation, but
    /// nothing is delivered as a change.
    pub fn on_seqno_advanced(&mut self, seqno: u64) -> DcpResult<StreamOutput> {
        let seqno = self.advance(seqno);
        // The window may not cover an advance past its end.
        if self.snapshot_start > seqno {
            self.snapshot_start = seqno;
        }
        Ok(StreamOutput::SeqnoAdvanced {
            offset: self.offset_at(seqno),
        })
    }

    /// Scope/collection lifecycle event. Always advances the offset;
    /// delivered only when the client is collections-aware and the
    /// filter admits it.
    pub fn on_system_event(
        &mut self,
        body: SystemEventBody,
        collections_aware: bool,
        filter: &CollectionsFilter,
    ) -> DcpResult<StreamOutput> {
        let seqno = self.advance(body.seqno);
        self.manifest_uid = self.manifest_uid.max(body.manifest_uid);

        let deliver = collections_aware
            && match body.kind {
                SystemEventKind::ScopeCreated | SystemEventKind::ScopeDropped => {
                    filter.allows_scope(body.scope_id)
                }
                SystemEventKind::CollectionCreated
                | SystemEventKind::CollectionDropped
                | SystemEventKind::CollectionFlushed => filter
                    .allows_collection(body.scope_id, body.collection_id.unwrap_or(0)),
                SystemEventKind::Other(_) => false,
            };

        let offset = self.offset_at(seqno);
        Ok(StreamOutput::SystemEvent {
            body,
            offset,
            deliver,
        })
    }

    pub fn on_oso_snapshot(&mut self, boundary: OsoBoundary) -> DcpResult<StreamOutput> {
        match boundary {
            OsoBoundary::Start => {
                if self.oso_active {
                    return Err(DcpError::protocol(format!(
                        "vbucket {}: nested OSO snapshot",
                        self.vbucket
                    )));
                }
                self.oso_active = true;
            }
            OsoBoundary::End => {
                if !self.oso_active {
                    return Err(DcpError::protocol(format!(
                        "vbucket {}: OSO end without start",
                        self.vbucket
                    )));
                }
                self.oso_active = false;
                // Ordering resumes; the window now covers what we saw.
                self.snapshot_start = self.snapshot_start.min(self.last_seqno);
            }
        }
        Ok(StreamOutput::OsoBoundary(boundary))
    }

    pub fn on_stream_end(&mut self, reason: StreamEndReason) -> StreamOutput {
        self.phase = StreamPhase::Ended;
        StreamOutput::Ended(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dcp_proto::SEQNO_INFINITY;

    fn mutation(by_seqno: u64) -> MutationBody {
        MutationBody {
            by_seqno,
            rev_seqno: 1,
            flags: 0,
            expiry: 0,
            lock_time: 0,
            collection_id: 0,
            key: b"k".to_vec(),
            content: b"v".to_vec(),
            cas: 0,
            datatype: 0,
        }
    }

    fn deletion(by_seqno: u64) -> DeletionBody {
        DeletionBody {
            by_seqno,
            rev_seqno: 1,
            collection_id: 0,
            key: b"k".to_vec(),
            cas: 0,
        }
    }

    fn marker(start: u64, end: u64) -> SnapshotMarker {
        SnapshotMarker {
            start_seqno: start,
            end_seqno: end,
            flags: 0,
        }
    }

    fn open_stream() -> ActiveStream {
        let mut stream = ActiveStream::new(7, 1, SEQNO_INFINITY, StreamOffset::default());
        stream.mark_open(0xabc);
        stream
    }

    #[test]
    fn test_snapshot_then_mutations_in_order() {
        let mut stream = open_stream();
        stream.on_snapshot_marker(marker(1, 3)).unwrap();

        let mut seqnos = Vec::new();
        for s in [1, 2, 3] {
            match stream.on_mutation(mutation(s)).unwrap() {
                StreamOutput::Mutation { offset, .. } => {
                    assert_eq!(offset.vbuuid, 0xabc);
                    assert_eq!(offset.snapshot_start, 1);
                    assert_eq!(offset.snapshot_end, 3);
                    seqnos.push(offset.seqno);
                }
                other => panic!("unexpected output {:?}", other),
            }
        }
        assert_eq!(seqnos, vec![1, 2, 3]);
    }

    #[test]
    fn test_mutation_outside_window_is_fatal() {
        let mut stream = open_stream();
        stream.on_snapshot_marker(marker(1, 5)).unwrap();
        let err = stream.on_mutation(mutation(9)).unwrap_err();
        assert!(matches!(err, DcpError::Protocol(_)));
    }

    #[test]
    fn test_backwards_seqno_is_fatal() {
        let mut stream = open_stream();
        stream.on_snapshot_marker(marker(1, 10)).unwrap();
        stream.on_mutation(mutation(5)).unwrap();
        let err = stream.on_mutation(mutation(4)).unwrap_err();
        assert!(matches!(err, DcpError::Protocol(_)));
    }

    #[test]
    fn test_inverted_snapshot_is_fatal() {
        let mut stream = open_stream();
        assert!(stream.on_snapshot_marker(marker(10, 5)).is_err());
    }

    #[test]
    fn test_seqno_advance_moves_offset_without_delivery() {
        let mut stream = open_stream();
        stream.on_snapshot_marker(marker(1, 4)).unwrap();
        stream.on_mutation(mutation(2)).unwrap();

        match stream.on_seqno_advanced(40).unwrap() {
            StreamOutput::SeqnoAdvanced { offset } => {
                assert_eq!(offset.seqno, 40);
                assert!(offset.snapshot_start <= 40 && 40 <= offset.snapshot_end);
            }
            other => panic!("unexpected output {:?}", other),
        }

        // Subsequent snapshot continues normally.
        stream.on_snapshot_marker(marker(41, 50)).unwrap();
        stream.on_mutation(mutation(45)).unwrap();
    }

    #[test]
    fn test_system_event_filtering() {
        let mut stream = open_stream();
        stream.on_snapshot_marker(marker(1, 10)).unwrap();

        let body = SystemEventBody {
            seqno: 4,
            kind: SystemEventKind::CollectionCreated,
            version: 0,
            manifest_uid: 9,
            scope_id: 0,
            collection_id: Some(12),
            name: "widgets".into(),
        };

        let filter = CollectionsFilter {
            scope_id: None,
            collection_ids: vec![12],
        };
        match stream
            .on_system_event(body.clone(), true, &filter)
            .unwrap()
        {
            StreamOutput::SystemEvent { deliver, offset, .. } => {
                assert!(deliver);
                assert_eq!(offset.seqno, 4);
                assert_eq!(offset.collections_manifest_uid, 9);
            }
            other => panic!("unexpected output {:?}", other),
        }

        // Filtered out: offset still advances, nothing delivered.
        let excluded = CollectionsFilter {
            scope_id: None,
            collection_ids: vec![99],
        };
        let body2 = SystemEventBody {
            seqno: 5,
            ..body.clone()
        };
        match stream.on_system_event(body2, true, &excluded).unwrap() {
            StreamOutput::SystemEvent { deliver, offset, .. } => {
                assert!(!deliver);
                assert_eq!(offset.seqno, 5);
            }
            other => panic!("unexpected output {:?}", other),
        }

        // Not collections-aware: never delivered.
        let body3 = SystemEventBody {
            seqno: 6,
            ..body
        };
        match stream
            .on_system_event(body3, false, &CollectionsFilter::default())
            .unwrap()
        {
            StreamOutput::SystemEvent { deliver, .. } => assert!(!deliver),
            other => panic!("unexpected output {:?}", other),
        }
    }

    #[test]
    fn test_oso_region_suspends_ordering() {
        let mut stream = open_stream();
        stream.on_snapshot_marker(marker(1, 100)).unwrap();
        stream.on_oso_snapshot(OsoBoundary::Start).unwrap();

        // Key order, not seqno order.
        for s in [50u64, 3, 78, 12] {
            assert!(stream.on_mutation(mutation(s)).is_ok());
        }

        stream.on_oso_snapshot(OsoBoundary::End).unwrap();
        // Ordering restored: going backwards is fatal again.
        assert!(stream.on_mutation(mutation(10)).is_err());
        // The high-water mark carried out of the OSO region.
        match stream.on_mutation(mutation(90)).unwrap() {
            StreamOutput::Mutation { offset, .. } => assert_eq!(offset.seqno, 90),
            other => panic!("unexpected output {:?}", other),
        }
    }

    #[test]
    fn test_oso_bracketing_violations() {
        let mut stream = open_stream();
        assert!(stream.on_oso_snapshot(OsoBoundary::End).is_err());
        stream.on_oso_snapshot(OsoBoundary::Start).unwrap();
        assert!(stream.on_oso_snapshot(OsoBoundary::Start).is_err());
    }

    #[test]
    fn test_deletion_advances_cursor() {
        let mut stream = open_stream();
        stream.on_snapshot_marker(marker(1, 5)).unwrap();
        match stream.on_deletion(deletion(2), true).unwrap() {
            StreamOutput::Deletion {
                due_to_expiration,
                offset,
                ..
            } => {
                assert!(due_to_expiration);
                assert_eq!(offset.seqno, 2);
            }
            other => panic!("unexpected output {:?}", other),
        }
    }

    #[test]
    fn test_stream_end_transitions_phase() {
        let mut stream = open_stream();
        match stream.on_stream_end(StreamEndReason::StateChanged) {
            StreamOutput::Ended(reason) => assert_eq!(reason, StreamEndReason::StateChanged),
            other => panic!("unexpected output {:?}", other),
        }
        assert_eq!(stream.phase, StreamPhase::Ended);
    }
}
