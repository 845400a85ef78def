//! Per-vbucket session state: the resume cursor.
//!
//! A `SessionState` is everything needed to reopen a vbucket stream
//! after a disconnect without gaps or duplicates: the generation uuid,
//! the last observed seqno, the snapshot window that seqno belongs to,
//! and the failover log. The store holds one per vbucket and survives
//! channel churn; streams are the sole writers for their vbucket while
//! open.

use std::collections::BTreeMap;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use dcp_proto::constants::FAILOVER_LOG_MAX_ENTRIES;
use dcp_proto::messages::{FailoverLog, StreamRequest};

use crate::error::{DcpError, DcpResult};

/// One failover log entry; newest entries sit at index 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailoverLogEntry {
    pub vbuuid: u64,
    pub seqno: u64,
}

/// A checkpointable position in one vbucket's stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamOffset {
    pub vbuuid: u64,
    pub seqno: u64,
    pub snapshot_start: u64,
    pub snapshot_end: u64,
    pub collections_manifest_uid: u64,
}

/// Resume state for a single vbucket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    pub vbuuid: u64,
    pub seqno: u64,
    pub snapshot_start: u64,
    pub snapshot_end: u64,
    /// Newest first, capped at the server's 25-entry convention.
    pub failover_log: Vec<FailoverLogEntry>,
    pub collections_manifest_uid: u64,
}

impl SessionState {
    /// Build the stream-open tuple from this state.
    ///
    /// `vbuuid` comes from the newest failover entry (0 when the log is
    /// empty, meaning "from the beginning of history"). Snapshot bounds
    /// are the checkpointed ones, so the tuple always satisfies
    /// `snapshot_start <= start_seqno <= snapshot_end`.
    pub fn stream_request(&self, end_seqno: u64) -> StreamRequest {
        let offset = self.offset();
        StreamRequest {
            vbuuid: self.failover_log.first().map(|e| e.vbuuid).unwrap_or(0),
            start_seqno: offset.seqno,
            end_seqno,
            snapshot_start: offset.snapshot_start,
            snapshot_end: offset.snapshot_end,
        }
    }

    /// Replace the failover log from a stream-open response and adopt
    /// the newest generation uuid.
    pub fn apply_failover_log(&mut self, log: &FailoverLog) {
        self.failover_log = log
            .entries
            .iter()
            .take(FAILOVER_LOG_MAX_ENTRIES)
            .map(|e| FailoverLogEntry {
                vbuuid: e.vbuuid,
                seqno: e.seqno,
            })
            .collect();
        if let Some(newest) = self.failover_log.first() {
            self.vbuuid = newest.vbuuid;
        }
    }

    /// Rewind to `rollback_seqno` per the server's instruction.
    ///
    /// The newest failover entry whose start seqno is at or below the
    /// rollback point becomes the current generation; entries newer
    /// than it are discarded. With no matching entry this is a rollback
    /// to zero and the log is cleared.
    pub fn apply_rollback(&mut self, rollback_seqno: u64) {
        match self
            .failover_log
            .iter()
            .position(|e| e.seqno <= rollback_seqno)
        {
            Some(idx) => {
                self.failover_log.drain(..idx);
                self.vbuuid = self.failover_log[0].vbuuid;
                self.seqno = rollback_seqno;
                self.snapshot_start = rollback_seqno;
                self.snapshot_end = rollback_seqno;
            }
            None => {
                self.failover_log.clear();
                self.vbuuid = 0;
                self.seqno = 0;
                self.snapshot_start = 0;
                self.snapshot_end = 0;
            }
        }
    }

    /// Record a snapshot marker's window. The cursor may trail the new
    /// window until its first mutation arrives; `offset` accounts for
    /// that when a checkpoint is taken in between.
    pub fn record_snapshot(&mut self, start: u64, end: u64) {
        self.snapshot_start = start;
        self.snapshot_end = end;
    }

    /// Advance the cursor to an observed seqno.
    pub fn record_seqno(&mut self, by_seqno: u64) {
        self.seqno = by_seqno;
        if self.snapshot_end < by_seqno {
            self.snapshot_end = by_seqno;
        }
    }

    /// Apply a released offset wholesale (rollback-mitigation path).
    pub fn apply_offset(&mut self, offset: &StreamOffset) {
        self.seqno = offset.seqno;
        self.snapshot_start = offset.snapshot_start;
        self.snapshot_end = offset.snapshot_end;
        self.collections_manifest_uid = offset.collections_manifest_uid;
    }

    /// The offset a checkpoint of this state represents.
    ///
    /// If the cursor has not yet entered the announced window (a marker
    /// arrived but no mutation from it has), the window collapses onto
    /// the cursor so that `snapshot_start <= seqno <= snapshot_end`
    /// holds at every stable checkpoint.
    pub fn offset(&self) -> StreamOffset {
        let (snapshot_start, snapshot_end) = if self.seqno < self.snapshot_start {
            (self.seqno, self.seqno)
        } else {
            (self.snapshot_start, self.snapshot_end)
        };
        StreamOffset {
            vbuuid: self.vbuuid,
            seqno: self.seqno,
            snapshot_start,
            snapshot_end,
            collections_manifest_uid: self.collections_manifest_uid,
        }
    }
}

/// Serializable snapshot of the whole store; round-trips through
/// `restore` to an identical observable state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub num_vbuckets: u16,
    pub states: BTreeMap<u16, SessionState>,
}

/// Shared per-vbucket state store. Partition count is fixed for the
/// lifetime of a bucket.
pub struct SessionStore {
    num_vbuckets: u16,
    states: DashMap<u16, SessionState>,
}

impl SessionStore {
    pub fn new(num_vbuckets: u16) -> Self {
        Self {
            num_vbuckets,
            states: DashMap::new(),
        }
    }

    pub fn num_vbuckets(&self) -> u16 {
        self.num_vbuckets
    }

    /// Current state for a vbucket (default "from beginning" state when
    /// nothing has been recorded yet).
    pub fn get(&self, vbucket: u16) -> SessionState {
        self.states
            .get(&vbucket)
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// Mutate a vbucket's state in place.
    pub fn with_mut<R>(&self, vbucket: u16, f: impl FnOnce(&mut SessionState) -> R) -> R {
        let mut entry = self.states.entry(vbucket).or_default();
        f(entry.value_mut())
    }

    pub fn set(&self, vbucket: u16, state: SessionState) {
        self.states.insert(vbucket, state);
    }

    /// Drop a vbucket's history (explicit caller request).
    pub fn reset(&self, vbucket: u16) {
        self.states.remove(&vbucket);
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let states = self
            .states
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        SessionSnapshot {
            num_vbuckets: self.num_vbuckets,
            states,
        }
    }

    pub fn restore(&self, snapshot: SessionSnapshot) -> DcpResult<()> {
        if snapshot.num_vbuckets != self.num_vbuckets {
            return Err(DcpError::Config(format!(
                "snapshot has {} vbuckets, bucket has {}",
                snapshot.num_vbuckets, self.num_vbuckets
            )));
        }
        self.states.clear();
        for (vbucket, state) in snapshot.states {
            self.states.insert(vbucket, state);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dcp_proto::messages::FailoverEntry;
    use dcp_proto::SEQNO_INFINITY;

    fn log(entries: &[(u64, u64)]) -> FailoverLog {
        FailoverLog {
            entries: entries
                .iter()
                .map(|&(vbuuid, seqno)| FailoverEntry { vbuuid, seqno })
                .collect(),
        }
    }

    #[test]
    fn test_fresh_state_requests_from_beginning() {
        let state = SessionState::default();
        let req = state.stream_request(SEQNO_INFINITY);
        assert_eq!(req.vbuuid, 0);
        assert_eq!(req.start_seqno, 0);
        assert_eq!(req.snapshot_start, 0);
        assert_eq!(req.snapshot_end, 0);
    }

    #[test]
    fn test_checkpoint_invariant_holds_through_updates() {
        let mut state = SessionState::default();
        state.record_snapshot(0, 10);
        for seqno in [1, 4, 10] {
            state.record_seqno(seqno);
            let offset = state.offset();
            assert!(offset.snapshot_start <= offset.seqno);
            assert!(offset.seqno <= offset.snapshot_end);
        }

        // Marker for 11..20 announced before its first mutation: the
        // checkpoint view collapses onto the cursor.
        state.record_snapshot(11, 20);
        let offset = state.offset();
        assert_eq!(offset.snapshot_start, 10);
        assert_eq!(offset.snapshot_end, 10);
        assert_eq!(offset.seqno, 10);

        state.record_seqno(15);
        let offset = state.offset();
        assert!(offset.snapshot_start <= offset.seqno && offset.seqno <= offset.snapshot_end);
        assert_eq!(offset.snapshot_end, 20);
    }

    #[test]
    fn test_apply_failover_log_adopts_newest_uuid() {
        let mut state = SessionState::default();
        state.apply_failover_log(&log(&[(0xbbb, 50), (0xaaa, 0)]));
        assert_eq!(state.vbuuid, 0xbbb);
        assert_eq!(state.failover_log.len(), 2);
        assert_eq!(state.stream_request(SEQNO_INFINITY).vbuuid, 0xbbb);
    }

    #[test]
    fn test_failover_log_capped() {
        let entries: Vec<(u64, u64)> = (0..40).map(|i| (i as u64, i as u64 * 10)).collect();
        let mut state = SessionState::default();
        state.apply_failover_log(&log(&entries));
        assert_eq!(state.failover_log.len(), FAILOVER_LOG_MAX_ENTRIES);
    }

    #[test]
    fn test_rollback_lands_on_matching_generation() {
        let mut state = SessionState::default();
        state.apply_failover_log(&log(&[(0xccc, 100), (0xbbb, 40), (0xaaa, 0)]));
        state.record_snapshot(100, 130);
        state.record_seqno(120);

        state.apply_rollback(60);
        assert_eq!(state.vbuuid, 0xbbb);
        assert_eq!(state.seqno, 60);
        assert_eq!(state.snapshot_start, 60);
        assert_eq!(state.snapshot_end, 60);
        // The newer generation is gone.
        assert_eq!(state.failover_log.len(), 2);
    }

    #[test]
    fn test_rollback_to_zero_clears_history() {
        let mut state = SessionState::default();
        state.failover_log = vec![FailoverLogEntry {
            vbuuid: 0xccc,
            seqno: 100,
        }];
        state.vbuuid = 0xccc;
        state.seqno = 150;

        state.apply_rollback(50);
        assert_eq!(state.vbuuid, 0);
        assert_eq!(state.seqno, 0);
        assert!(state.failover_log.is_empty());
    }

    #[test]
    fn test_snapshot_roundtrip_identity() {
        let store = SessionStore::new(64);
        store.with_mut(3, |s| {
            s.apply_failover_log(&log(&[(0xf00, 0)]));
            s.record_snapshot(0, 9);
            s.record_seqno(9);
            s.collections_manifest_uid = 2;
        });
        store.with_mut(7, |s| s.record_seqno(1));

        let snapshot = store.snapshot();
        let json = serde_json::to_string(&snapshot).unwrap();
        let decoded: SessionSnapshot = serde_json::from_str(&json).unwrap();

        let restored = SessionStore::new(64);
        restored.restore(decoded).unwrap();
        assert_eq!(restored.snapshot(), snapshot);
        assert_eq!(restored.get(3), store.get(3));
    }

    #[test]
    fn test_restore_rejects_partition_count_mismatch() {
        let store = SessionStore::new(64);
        let snapshot = SessionSnapshot {
            num_vbuckets: 1024,
            states: BTreeMap::new(),
        };
        assert!(store.restore(snapshot).is_err());
    }
}
