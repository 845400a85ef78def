//! Rollback mitigation: hold events until they are persisted.
//!
//! With mitigation on, nothing reaches the listener until the required
//! number of copies (active, optionally plus replicas) report a
//! persisted seqno at or past the event. The channel polls
//! OBSERVE_SEQNO on an interval and feeds [`PersistedSeqnos`]; events
//! queue per vbucket in a [`MitigationBuffer`] and drain in order once
//! covered. A dropped channel or a topology change clears the buffer
//! without delivery: what was never released was never observed, so a
//! post-crash rewind cannot contradict anything the host saw.

use std::collections::{BTreeMap, HashMap, VecDeque};

use dashmap::DashMap;
use tracing::debug;

use crate::stream::StreamOutput;

/// Persisted-seqno cache, shared by every channel observing copies.
///
/// Copy 0 is the active; copies 1.. are replicas. Entries only move
/// forward — OBSERVE_SEQNO responses can race and arrive stale.
pub struct PersistedSeqnos {
    copies: DashMap<u16, BTreeMap<u8, u64>>,
}

impl PersistedSeqnos {
    pub fn new() -> Self {
        Self {
            copies: DashMap::new(),
        }
    }

    pub fn record(&self, vbucket: u16, copy: u8, persisted_seqno: u64) {
        let mut entry = self.copies.entry(vbucket).or_default();
        let slot = entry.entry(copy).or_insert(0);
        if persisted_seqno > *slot {
            *slot = persisted_seqno;
        }
    }

    /// Seqno persisted on all of the first `required_copies` copies, or
    /// None while any of them has not reported yet.
    pub fn persisted(&self, vbucket: u16, required_copies: u8) -> Option<u64> {
        let entry = self.copies.get(&vbucket)?;
        let mut floor = u64::MAX;
        for copy in 0..required_copies {
            floor = floor.min(*entry.get(&copy)?);
        }
        Some(floor)
    }

    /// Forget a vbucket (its chain moved; old observations are
    /// meaningless against the new copies).
    pub fn clear(&self, vbucket: u16) {
        self.copies.remove(&vbucket);
    }
}

impl Default for PersistedSeqnos {
    fn default() -> Self {
        Self::new()
    }
}

/// A buffered output plus the flow-control charge of the frame that
/// produced it; credit is returned only once the event is released and
/// consumed.
pub struct BufferedOutput {
    pub charge: u64,
    pub output: StreamOutput,
}

/// Per-vbucket FIFO of outputs awaiting persistence.
pub struct MitigationBuffer {
    queues: HashMap<u16, VecDeque<BufferedOutput>>,
}

impl MitigationBuffer {
    pub fn new() -> Self {
        Self {
            queues: HashMap::new(),
        }
    }

    pub fn push(&mut self, vbucket: u16, charge: u64, output: StreamOutput) {
        debug_assert!(output.offset().is_some());
        self.queues
            .entry(vbucket)
            .or_default()
            .push_back(BufferedOutput { charge, output });
    }

    /// Drain, in arrival order, every queued output whose seqno is
    /// covered by `persisted_seqno`.
    pub fn release(&mut self, vbucket: u16, persisted_seqno: u64) -> Vec<BufferedOutput> {
        let Some(queue) = self.queues.get_mut(&vbucket) else {
            return Vec::new();
        };
        let mut released = Vec::new();
        while let Some(front) = queue.front() {
            match front.output.offset() {
                Some(offset) if offset.seqno <= persisted_seqno => {
                    released.push(queue.pop_front().expect("front exists"));
                }
                _ => break,
            }
        }
        released
    }

    /// Vbuckets that currently have events queued.
    pub fn buffered_vbuckets(&self) -> Vec<u16> {
        self.queues
            .iter()
            .filter(|(_, q)| !q.is_empty())
            .map(|(&vb, _)| vb)
            .collect()
    }

    /// Drop a vbucket's pending events without delivering them.
    pub fn clear(&mut self, vbucket: u16) -> usize {
        let dropped = self.queues.remove(&vbucket).map(|q| q.len()).unwrap_or(0);
        if dropped > 0 {
            debug!(
                "discarded {} unpersisted events for vbucket {}",
                dropped, vbucket
            );
        }
        dropped
    }

    pub fn pending(&self, vbucket: u16) -> usize {
        self.queues.get(&vbucket).map(|q| q.len()).unwrap_or(0)
    }
}

impl Default for MitigationBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::StreamOffset;
    use dcp_proto::messages::MutationBody;

    fn output(seqno: u64) -> StreamOutput {
        StreamOutput::Mutation {
            body: MutationBody {
                by_seqno: seqno,
                rev_seqno: 1,
                flags: 0,
                expiry: 0,
                lock_time: 0,
                collection_id: 0,
                key: b"k".to_vec(),
                content: vec![],
                cas: 0,
                datatype: 0,
            },
            offset: StreamOffset {
                seqno,
                ..StreamOffset::default()
            },
        }
    }

    fn seqno_of(out: &BufferedOutput) -> u64 {
        out.output.offset().unwrap().seqno
    }

    #[test]
    fn test_release_respects_persisted_floor() {
        let mut buffer = MitigationBuffer::new();
        for s in 1..=6u64 {
            buffer.push(3, 100, output(s));
        }

        let released = buffer.release(3, 4);
        assert_eq!(released.iter().map(seqno_of).collect::<Vec<_>>(), vec![1, 2, 3, 4]);
        assert_eq!(buffer.pending(3), 2);

        // No further persistence: nothing more comes out.
        assert!(buffer.release(3, 4).is_empty());

        let released = buffer.release(3, 100);
        assert_eq!(released.iter().map(seqno_of).collect::<Vec<_>>(), vec![5, 6]);
        assert_eq!(buffer.pending(3), 0);
        assert!(buffer.buffered_vbuckets().is_empty());
    }

    #[test]
    fn test_clear_discards_without_delivery() {
        let mut buffer = MitigationBuffer::new();
        buffer.push(3, 100, output(1));
        buffer.push(3, 100, output(2));
        buffer.push(4, 100, output(1));

        assert_eq!(buffer.buffered_vbuckets().len(), 2);
        assert_eq!(buffer.clear(3), 2);
        assert!(buffer.release(3, 100).is_empty());
        // Other vbuckets untouched.
        assert_eq!(buffer.release(4, 100).len(), 1);
    }

    #[test]
    fn test_persisted_requires_all_copies() {
        let persisted = PersistedSeqnos::new();
        assert_eq!(persisted.persisted(9, 1), None);

        persisted.record(9, 0, 40);
        assert_eq!(persisted.persisted(9, 1), Some(40));
        // Two copies required, replica not reported yet.
        assert_eq!(persisted.persisted(9, 2), None);

        persisted.record(9, 1, 25);
        assert_eq!(persisted.persisted(9, 2), Some(25));

        // Stale responses never move the floor backwards.
        persisted.record(9, 0, 10);
        assert_eq!(persisted.persisted(9, 2), Some(25));

        persisted.clear(9);
        assert_eq!(persisted.persisted(9, 1), None);
    }
}
