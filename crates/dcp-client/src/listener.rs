//! Application-facing listener and event types.
//!
//! The listener runs on the channel's I/O task: callbacks must not
//! block. Every hook has a default body so hosts implement only what
//! they need; `on_failure` is the one required method. Defaults match
//! what most consumers want — document events return flow-control
//! credit, rollbacks resume from the server's suggestion.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use dcp_proto::messages::StreamEndReason;

use crate::error::DcpError;
use crate::session::{FailoverLogEntry, StreamOffset};

/// Returns flow-control credit for one event. In AUTO modes the channel
/// has already credited the bytes and the handle is inert; in MANUAL
/// mode the application must invoke it (once; extra calls are no-ops).
#[derive(Debug, Clone)]
pub struct AckHandle {
    bytes: u64,
    tx: Option<mpsc::UnboundedSender<u64>>,
    acked: Arc<AtomicBool>,
}

impl AckHandle {
    pub(crate) fn live(bytes: u64, tx: mpsc::UnboundedSender<u64>) -> Self {
        Self {
            bytes,
            tx: Some(tx),
            acked: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handle for events whose credit the channel manages itself.
    pub(crate) fn inert(bytes: u64) -> Self {
        Self {
            bytes,
            tx: None,
            acked: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn ack(&self) {
        if self.acked.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(tx) = &self.tx {
            let _ = tx.send(self.bytes);
        }
    }

    /// Framed size of the event this handle credits.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

/// A document created or updated.
#[derive(Debug, Clone)]
pub struct Mutation {
    pub vbucket: u16,
    pub collection_id: u32,
    pub key: Vec<u8>,
    pub content: Vec<u8>,
    pub cas: u64,
    pub rev_seqno: u64,
    pub flags: u32,
    pub expiry: u32,
    pub offset: StreamOffset,
    ack: AckHandle,
}

impl Mutation {
    pub(crate) fn new(
        vbucket: u16,
        body: dcp_proto::MutationBody,
        offset: StreamOffset,
        ack: AckHandle,
    ) -> Self {
        Self {
            vbucket,
            collection_id: body.collection_id,
            key: body.key,
            content: body.content,
            cas: body.cas,
            rev_seqno: body.rev_seqno,
            flags: body.flags,
            expiry: body.expiry,
            offset,
            ack,
        }
    }

    pub fn key_string(&self) -> String {
        String::from_utf8_lossy(&self.key).into_owned()
    }

    pub fn flow_control_ack(&self) {
        self.ack.ack();
    }
}

/// A document removed, either deleted or expired.
#[derive(Debug, Clone)]
pub struct Deletion {
    pub vbucket: u16,
    pub collection_id: u32,
    pub key: Vec<u8>,
    pub cas: u64,
    pub rev_seqno: u64,
    /// True when the removal was an expiry rather than a delete.
    pub due_to_expiration: bool,
    pub offset: StreamOffset,
    ack: AckHandle,
}

impl Deletion {
    pub(crate) fn new(
        vbucket: u16,
        body: dcp_proto::DeletionBody,
        due_to_expiration: bool,
        offset: StreamOffset,
        ack: AckHandle,
    ) -> Self {
        Self {
            vbucket,
            collection_id: body.collection_id,
            key: body.key,
            cas: body.cas,
            rev_seqno: body.rev_seqno,
            due_to_expiration,
            offset,
            ack,
        }
    }

    pub fn key_string(&self) -> String {
        String::from_utf8_lossy(&self.key).into_owned()
    }

    pub fn flow_control_ack(&self) {
        self.ack.ack();
    }
}

/// The vbucket's seqno moved without a document change (collections
/// mode). Consumers should checkpoint `offset` exactly as they would
/// for a mutation, or risk rollback-to-zero past the purge seqno.
#[derive(Debug, Clone)]
pub struct SeqnoAdvanced {
    pub vbucket: u16,
    pub offset: StreamOffset,
}

#[derive(Debug, Clone)]
pub struct SnapshotDetails {
    pub vbucket: u16,
    pub start_seqno: u64,
    pub end_seqno: u64,
    pub flags: u32,
}

#[derive(Debug, Clone)]
pub struct ScopeCreated {
    pub vbucket: u16,
    pub name: String,
    pub scope_id: u32,
    pub manifest_uid: u64,
    pub offset: StreamOffset,
}

#[derive(Debug, Clone)]
pub struct ScopeDropped {
    pub vbucket: u16,
    pub scope_id: u32,
    pub manifest_uid: u64,
    pub offset: StreamOffset,
}

#[derive(Debug, Clone)]
pub struct CollectionCreated {
    pub vbucket: u16,
    pub name: String,
    pub scope_id: u32,
    pub collection_id: u32,
    pub manifest_uid: u64,
    pub offset: StreamOffset,
}

#[derive(Debug, Clone)]
pub struct CollectionDropped {
    pub vbucket: u16,
    pub scope_id: u32,
    pub collection_id: u32,
    pub manifest_uid: u64,
    pub offset: StreamOffset,
}

#[derive(Debug, Clone)]
pub struct CollectionFlushed {
    pub vbucket: u16,
    pub scope_id: u32,
    pub collection_id: u32,
    pub manifest_uid: u64,
    pub offset: StreamOffset,
}

#[derive(Debug, Clone)]
pub struct FailoverLogUpdate {
    pub vbucket: u16,
    pub entries: Vec<FailoverLogEntry>,
}

#[derive(Debug, Clone)]
pub struct StreamEnd {
    pub vbucket: u16,
    pub reason: StreamEndReason,
}

/// The server demands a rewind. The default course is to resume from
/// `seqno`; calling `veto` instead fails the stream permanently.
#[derive(Debug, Clone)]
pub struct Rollback {
    pub vbucket: u16,
    pub seqno: u64,
    vetoed: Arc<AtomicBool>,
}

impl Rollback {
    pub(crate) fn new(vbucket: u16, seqno: u64) -> Self {
        Self {
            vbucket,
            seqno,
            vetoed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn veto(&self) {
        self.vetoed.store(true, Ordering::Release);
    }

    pub(crate) fn is_vetoed(&self) -> bool {
        self.vetoed.load(Ordering::Acquire)
    }
}

/// Something bad, and probably unrecoverable, happened.
#[derive(Debug)]
pub struct StreamFailure {
    /// The vbucket concerned, or None for channel-wide failures.
    pub vbucket: Option<u16>,
    pub error: DcpError,
}

/// Callback surface for database changes.
///
/// All hooks default to no-ops (document hooks additionally return
/// flow-control credit); only `on_failure` must be implemented.
pub trait DatabaseChangeListener: Send + Sync {
    fn on_mutation(&self, mutation: Mutation) {
        mutation.flow_control_ack();
    }

    fn on_deletion(&self, deletion: Deletion) {
        deletion.flow_control_ack();
    }

    fn on_seqno_advanced(&self, _seqno_advanced: SeqnoAdvanced) {}

    fn on_scope_created(&self, _scope_created: ScopeCreated) {}

    fn on_scope_dropped(&self, _scope_dropped: ScopeDropped) {}

    fn on_collection_created(&self, _collection_created: CollectionCreated) {}

    fn on_collection_dropped(&self, _collection_dropped: CollectionDropped) {}

    fn on_collection_flushed(&self, _collection_flushed: CollectionFlushed) {}

    /// Default: let the stream resume from the server's suggestion.
    fn on_rollback(&self, _rollback: Rollback) {}

    fn on_snapshot(&self, _snapshot: SnapshotDetails) {}

    fn on_failover_log(&self, _failover_log: FailoverLogUpdate) {}

    /// Streams ending for any reason other than `Ok` are reopened
    /// automatically; most listeners can ignore this.
    fn on_stream_end(&self, _stream_end: StreamEnd) {}

    fn on_failure(&self, failure: StreamFailure);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ack_handle_fires_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = AckHandle::live(42, tx);
        handle.ack();
        handle.ack();
        assert_eq!(rx.try_recv().unwrap(), 42);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_inert_handle_sends_nothing() {
        let handle = AckHandle::inert(42);
        handle.ack();
        assert_eq!(handle.bytes(), 42);
    }

    #[test]
    fn test_rollback_veto_visible_through_clone() {
        let rollback = Rollback::new(3, 100);
        let seen_by_listener = rollback.clone();
        assert!(!rollback.is_vetoed());
        seen_by_listener.veto();
        assert!(rollback.is_vetoed());
    }

    #[test]
    fn test_default_listener_acks_documents() {
        struct Noop;
        impl DatabaseChangeListener for Noop {
            fn on_failure(&self, _failure: StreamFailure) {}
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let body = dcp_proto::MutationBody {
            by_seqno: 1,
            rev_seqno: 1,
            flags: 0,
            expiry: 0,
            lock_time: 0,
            collection_id: 0,
            key: b"k".to_vec(),
            content: vec![],
            cas: 0,
            datatype: 0,
        };
        let mutation = Mutation::new(
            0,
            body,
            StreamOffset::default(),
            AckHandle::live(64, tx),
        );

        Noop.on_mutation(mutation);
        assert_eq!(rx.try_recv().unwrap(), 64);
    }
}
