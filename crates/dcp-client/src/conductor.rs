//! The conductor: cluster-map-driven channel lifecycle.
//!
//! Edge-triggered on config updates from the arbiter, the conductor
//! reconciles the set of open channels against the nodes that own the
//! vbuckets the host asked to stream, opens and closes streams as
//! ownership moves, reopens streams that end abnormally, and replaces
//! dropped channels with backoff. Reconciliation is idempotent:
//! applying the same map twice changes nothing.
//!
//! Channels talk back through an event queue rather than back-pointers;
//! the conductor is the only owner of channel handles.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use dcp_proto::messages::FailoverLog;

use crate::arbiter::BucketConfigArbiter;
use crate::channel::{
    self, ChannelCommand, ChannelContext, ChannelEvent, ChannelHandle, EndBound,
};
use crate::cluster_map::{ClusterMap, NodeEndpoint};
use crate::config::ClientConfig;
use crate::error::{DcpError, DcpResult};
use crate::listener::DatabaseChangeListener;
use crate::mitigation::PersistedSeqnos;
use crate::net::Connector;
use crate::session::SessionStore;

/// Where a newly-requested stream starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFrom {
    /// Seqno zero, discarding any saved state for the vbucket.
    Beginning,
    /// The vbucket's current seqno, captured when the stream opens.
    Now,
    /// Whatever the session store holds (restored state, or the
    /// position reached by earlier streaming).
    SavedState,
}

/// Where a stream stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamTo {
    /// The seqno current when the stream opens; ends with OK once
    /// reached.
    Now,
    Infinity,
    Seqno(u64),
}

impl StreamTo {
    fn to_end_bound(self) -> EndBound {
        match self {
            Self::Now => EndBound::Now,
            Self::Infinity => EndBound::Infinity,
            Self::Seqno(s) => EndBound::Seqno(s),
        }
    }
}

pub enum ConductorCommand {
    StreamPartitions {
        vbuckets: Vec<u16>,
        from: StreamFrom,
        to: StreamTo,
        reply: oneshot::Sender<DcpResult<()>>,
    },
    StopStreams {
        vbuckets: Vec<u16>,
    },
    GetFailoverLog {
        vbucket: u16,
        reply: oneshot::Sender<DcpResult<FailoverLog>>,
    },
    RetryNode {
        node: NodeEndpoint,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Client-side handle to the conductor task.
pub struct ConductorHandle {
    cmd_tx: mpsc::UnboundedSender<ConductorCommand>,
    done_rx: watch::Receiver<bool>,
    join: JoinHandle<()>,
}

impl ConductorHandle {
    /// Fire a command at the conductor task. Failures of the task
    /// itself surface through reply channels and events, not here.
    pub fn send(&self, cmd: ConductorCommand) {
        let _ = self.cmd_tx.send(cmd);
    }

    /// Completion signal: flips true once every requested finite
    /// stream has ended OK.
    pub fn done_subscription(&self) -> watch::Receiver<bool> {
        self.done_rx.clone()
    }

    /// Wait on a completion subscription.
    pub async fn wait_on(mut rx: watch::Receiver<bool>) -> DcpResult<()> {
        loop {
            if *rx.borrow_and_update() {
                return Ok(());
            }
            rx.changed().await.map_err(|_| DcpError::Shutdown)?;
        }
    }

    pub async fn shutdown(self) {
        let (reply, done) = oneshot::channel();
        if self.cmd_tx.send(ConductorCommand::Shutdown { reply }).is_ok() {
            let _ = done.await;
        }
        let _ = self.join.await;
    }
}

/// Spawn the conductor task. The arbiter must already hold a ready map.
pub fn spawn(
    config: ClientConfig,
    sessions: Arc<SessionStore>,
    arbiter: Arc<BucketConfigArbiter>,
    listener: Arc<dyn DatabaseChangeListener>,
    connector: Arc<dyn Connector>,
) -> ConductorHandle {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (done_tx, done_rx) = watch::channel(false);

    let ctx = Arc::new(ChannelContext {
        config,
        sessions,
        arbiter: arbiter.clone(),
        listener,
        connector,
        persisted: Arc::new(PersistedSeqnos::new()),
        events: events_tx,
    });

    let conductor = Conductor {
        ctx,
        map_rx: arbiter.subscribe(),
        events_rx,
        cmd_tx: cmd_tx.clone(),
        done_tx,
        channels: HashMap::new(),
        interests: BTreeMap::new(),
        assignments: HashMap::new(),
        from_now: HashSet::new(),
        completed: HashSet::new(),
        closing: HashSet::new(),
        backoff: HashMap::new(),
        shutting_down: false,
    };

    let join = tokio::spawn(conductor.run(cmd_rx));
    ConductorHandle {
        cmd_tx,
        done_rx,
        join,
    }
}

struct ChannelSlot {
    handle: ChannelHandle,
    ready: bool,
}

struct Conductor {
    ctx: Arc<ChannelContext>,
    map_rx: watch::Receiver<Option<Arc<ClusterMap>>>,
    events_rx: mpsc::UnboundedReceiver<ChannelEvent>,
    cmd_tx: mpsc::UnboundedSender<ConductorCommand>,
    done_tx: watch::Sender<bool>,

    channels: HashMap<NodeEndpoint, ChannelSlot>,
    /// Requested streams and their end bounds, completed or not.
    interests: BTreeMap<u16, EndBound>,
    /// Where each in-flight stream currently lives.
    assignments: HashMap<u16, NodeEndpoint>,
    /// Vbuckets whose first open must seed the session at "now".
    from_now: HashSet<u16>,
    completed: HashSet<u16>,
    /// Host-requested closes in flight.
    closing: HashSet<u16>,
    backoff: HashMap<NodeEndpoint, u32>,
    shutting_down: bool,
}

impl Conductor {
    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<ConductorCommand>) {
        info!("conductor started");
        loop {
            tokio::select! {
                changed = self.map_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    self.reconcile();
                }
                event = self.events_rx.recv() => {
                    match event {
                        Some(event) => self.on_event(event),
                        None => break,
                    }
                }
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(ConductorCommand::Shutdown { reply }) => {
                            self.shutdown();
                            let _ = reply.send(());
                            break;
                        }
                        Some(cmd) => self.on_command(cmd),
                        None => {
                            self.shutdown();
                            break;
                        }
                    }
                }
            }
        }
        info!("conductor stopped");
    }

    fn current_map(&self) -> Option<Arc<ClusterMap>> {
        self.map_rx.borrow().clone().filter(|m| m.is_ready())
    }

    /// Vbuckets that still want a stream.
    fn active_interests(&self) -> Vec<u16> {
        self.interests
            .keys()
            .copied()
            .filter(|vb| !self.completed.contains(vb) && !self.closing.contains(vb))
            .collect()
    }

    // ─── Reconciliation ───────────────────────────────────────────────────────

    fn reconcile(&mut self) {
        if self.shutting_down {
            return;
        }
        let Some(map) = self.current_map() else {
            return;
        };
        let wanted = self.active_interests();
        let desired = desired_nodes(&map, &wanted);

        // Close channels whose node no longer serves anything we want.
        // Stream positions survive in the session store.
        let stale: Vec<NodeEndpoint> = self
            .channels
            .keys()
            .filter(|node| !desired.contains(*node))
            .cloned()
            .collect();
        for node in stale {
            info!("closing channel {}: no owned vbuckets in map", node);
            if let Some(slot) = self.channels.remove(&node) {
                slot.handle.close();
            }
            self.assignments.retain(|_, n| *n != node);
        }

        // Open channels for nodes that now matter.
        for node in &desired {
            if !self.channels.contains_key(node) {
                info!("opening channel {}", node);
                let handle = channel::spawn(node.clone(), self.ctx.clone());
                self.channels.insert(
                    node.clone(),
                    ChannelSlot {
                        handle,
                        ready: false,
                    },
                );
            }
        }

        // Stream placement: close migrated streams, open missing ones.
        for vb in wanted {
            let Some(owner) = map.owner_of(vb).cloned() else {
                continue;
            };
            match self.assignments.get(&vb).cloned() {
                Some(current) if current == owner => {}
                Some(current) => {
                    // Owner moved; close on the old node and reopen
                    // once the stream-end comes back.
                    debug!("vb {} migrating {} -> {}", vb, current, owner);
                    if let Some(slot) = self.channels.get(&current) {
                        slot.handle.send(ChannelCommand::CloseStream { vbucket: vb });
                    } else {
                        self.assignments.remove(&vb);
                        self.open_stream(vb, &owner);
                    }
                }
                None => self.open_stream(vb, &owner),
            }
        }

        self.push_observe_sets(&map);
    }

    fn open_stream(&mut self, vbucket: u16, owner: &NodeEndpoint) {
        let Some(slot) = self.channels.get(owner) else {
            return;
        };
        if !slot.ready {
            return;
        }
        let Some(&end) = self.interests.get(&vbucket) else {
            return;
        };
        slot.handle.send(ChannelCommand::OpenStream {
            vbucket,
            end,
            seed_from_now: self.from_now.contains(&vbucket),
        });
        self.assignments.insert(vbucket, owner.clone());
    }

    /// Tell each channel which copies it hosts for persistence polling.
    fn push_observe_sets(&self, map: &ClusterMap) {
        let Some(mitigation) = self.ctx.config.mitigation.as_ref() else {
            return;
        };
        let copies = 1 + mitigation.replica_count;
        let targets = observe_targets(map, &self.active_interests(), copies);
        for (node, slot) in &self.channels {
            let set = targets.get(node).cloned().unwrap_or_default();
            slot.handle.send(ChannelCommand::SetObserveSet(set));
        }
    }

    // ─── Channel events ───────────────────────────────────────────────────────

    fn on_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Ready { node } => {
                debug!("channel {} ready", node);
                self.backoff.remove(&node);
                if let Some(slot) = self.channels.get_mut(&node) {
                    slot.ready = true;
                }
                self.reconcile();
            }
            ChannelEvent::StreamOpened {
                vbucket, end_seqno, ..
            } => {
                // Pin the resolved end so a reopen never re-captures a
                // later "now".
                self.from_now.remove(&vbucket);
                if let Some(end) = self.interests.get_mut(&vbucket) {
                    if *end == EndBound::Now {
                        *end = EndBound::Seqno(end_seqno);
                    }
                }
            }
            ChannelEvent::StreamEnded {
                node,
                vbucket,
                reason,
            } => {
                if self.assignments.get(&vbucket) == Some(&node) {
                    self.assignments.remove(&vbucket);
                }
                if self.closing.remove(&vbucket) {
                    self.interests.remove(&vbucket);
                } else if reason.is_ok() {
                    self.completed.insert(vbucket);
                } else {
                    debug!("vb {} ended ({:?}), reopening", vbucket, reason);
                    self.reconcile();
                }
                self.check_done();
            }
            ChannelEvent::StreamFailed {
                node,
                vbucket,
                permanent,
            } => {
                if self.assignments.get(&vbucket) == Some(&node) {
                    self.assignments.remove(&vbucket);
                }
                if permanent {
                    warn!("vb {}: permanent stream failure, giving up", vbucket);
                    self.interests.remove(&vbucket);
                    self.from_now.remove(&vbucket);
                    self.check_done();
                } else {
                    self.reconcile();
                }
            }
            ChannelEvent::Dropped {
                node,
                detail,
                permanent,
            } => {
                warn!("channel {} dropped: {}", node, detail);
                self.channels.remove(&node);
                let affected: Vec<u16> = self
                    .assignments
                    .iter()
                    .filter(|(_, n)| **n == node)
                    .map(|(&vb, _)| vb)
                    .collect();
                for vb in affected {
                    self.assignments.remove(&vb);
                    // Old persistence observations are meaningless for
                    // whatever copies come next.
                    self.ctx.persisted.clear(vb);
                }

                if permanent {
                    warn!("channel {}: permanent failure, not reconnecting", node);
                    return;
                }
                self.schedule_retry(node);
            }
        }
    }

    fn schedule_retry(&mut self, node: NodeEndpoint) {
        let attempt = self.backoff.entry(node.clone()).or_insert(0);
        *attempt += 1;
        let delay = Duration::from_millis(100)
            .saturating_mul(1u32 << (*attempt - 1).min(7))
            .min(Duration::from_secs(10));
        debug!("channel {}: retry in {:?}", node, delay);

        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = cmd_tx.send(ConductorCommand::RetryNode { node });
        });
    }

    // ─── Host commands ────────────────────────────────────────────────────────

    fn on_command(&mut self, cmd: ConductorCommand) {
        match cmd {
            ConductorCommand::StreamPartitions {
                vbuckets,
                from,
                to,
                reply,
            } => {
                let _ = reply.send(self.stream_partitions(vbuckets, from, to));
            }
            ConductorCommand::StopStreams { vbuckets } => {
                for vb in vbuckets {
                    match self.assignments.get(&vb) {
                        Some(node) => {
                            self.closing.insert(vb);
                            if let Some(slot) = self.channels.get(node) {
                                slot.handle
                                    .send(ChannelCommand::CloseStream { vbucket: vb });
                            }
                        }
                        None => {
                            self.interests.remove(&vb);
                        }
                    }
                }
                self.check_done();
            }
            ConductorCommand::GetFailoverLog { vbucket, reply } => {
                let target = self
                    .current_map()
                    .and_then(|map| map.owner_of(vbucket).cloned())
                    .and_then(|owner| self.channels.get(&owner).map(|s| (owner, s.ready)));
                match target {
                    Some((owner, true)) => {
                        if let Some(slot) = self.channels.get(&owner) {
                            slot.handle
                                .send(ChannelCommand::GetFailoverLog { vbucket, reply });
                        }
                    }
                    _ => {
                        let _ = reply.send(Err(DcpError::NotConnected));
                    }
                }
            }
            ConductorCommand::RetryNode { node } => {
                debug!("retrying node {}", node);
                self.reconcile();
            }
            ConductorCommand::Shutdown { .. } => unreachable!("handled in run loop"),
        }
    }

    fn stream_partitions(
        &mut self,
        vbuckets: Vec<u16>,
        from: StreamFrom,
        to: StreamTo,
    ) -> DcpResult<()> {
        let num_vbuckets = self.ctx.sessions.num_vbuckets();
        for &vb in &vbuckets {
            if vb >= num_vbuckets {
                return Err(DcpError::Config(format!(
                    "vbucket {} out of range (bucket has {})",
                    vb, num_vbuckets
                )));
            }
        }

        for vb in vbuckets {
            self.interests.insert(vb, to.to_end_bound());
            self.completed.remove(&vb);
            match from {
                StreamFrom::Beginning => {
                    self.ctx.sessions.reset(vb);
                }
                StreamFrom::Now => {
                    self.from_now.insert(vb);
                }
                StreamFrom::SavedState => {}
            }
        }
        let _ = self.done_tx.send(false);
        self.reconcile();
        Ok(())
    }

    fn check_done(&mut self) {
        let all_done = !self.interests.is_empty()
            && self
                .interests
                .keys()
                .all(|vb| self.completed.contains(vb));
        if all_done || self.interests.is_empty() {
            let _ = self.done_tx.send(true);
        }
    }

    fn shutdown(&mut self) {
        self.shutting_down = true;
        info!("conductor shutting down, closing {} channels", self.channels.len());
        for slot in self.channels.values() {
            slot.handle.close();
        }
        self.channels.clear();
        self.assignments.clear();
        let _ = self.done_tx.send(true);
    }
}

// ─── Pure planning helpers ────────────────────────────────────────────────────

/// Nodes that actively own at least one wanted vbucket.
fn desired_nodes(map: &ClusterMap, wanted: &[u16]) -> BTreeSet<NodeEndpoint> {
    wanted
        .iter()
        .filter_map(|&vb| map.owner_of(vb).cloned())
        .collect()
}

/// Per-node OBSERVE_SEQNO targets: every (vbucket, copy index) pair
/// whose copy lives on that node, for the wanted vbuckets.
fn observe_targets(
    map: &ClusterMap,
    wanted: &[u16],
    copies: usize,
) -> HashMap<NodeEndpoint, Vec<(u16, u8)>> {
    let mut targets: HashMap<NodeEndpoint, Vec<(u16, u8)>> = HashMap::new();
    for &vb in wanted {
        for (copy, node) in map.copies_of(vb, copies) {
            targets.entry(node.clone()).or_default().push((vb, copy));
        }
    }
    targets
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map() -> ClusterMap {
        ClusterMap {
            rev_epoch: 1,
            rev: 1,
            nodes: vec![
                NodeEndpoint::new("a", 11210),
                NodeEndpoint::new("b", 11210),
            ],
            // vb0 active on a (replica b), vb1 active on b (replica a),
            // vb2 active on a (no replica), vb3 unassigned.
            chains: vec![vec![0, 1], vec![1, 0], vec![0, -1], vec![-1, 0]],
        }
    }

    #[test]
    fn test_desired_nodes_only_active_owners() {
        let map = map();
        let desired = desired_nodes(&map, &[0, 2]);
        assert_eq!(desired.len(), 1);
        assert!(desired.contains(&NodeEndpoint::new("a", 11210)));

        let desired = desired_nodes(&map, &[0, 1, 2, 3]);
        assert_eq!(desired.len(), 2);
    }

    #[test]
    fn test_desired_nodes_skips_unassigned() {
        let map = map();
        // vb3 has no active owner; its replica never qualifies.
        let desired = desired_nodes(&map, &[3]);
        assert!(desired.is_empty());
    }

    #[test]
    fn test_plan_is_idempotent() {
        let map = map();
        let wanted = vec![0u16, 1, 2];
        let first = desired_nodes(&map, &wanted);
        let second = desired_nodes(&map, &wanted);
        assert_eq!(first, second);

        let targets1 = observe_targets(&map, &wanted, 2);
        let targets2 = observe_targets(&map, &wanted, 2);
        assert_eq!(
            targets1.get(&NodeEndpoint::new("a", 11210)),
            targets2.get(&NodeEndpoint::new("a", 11210))
        );
    }

    #[test]
    fn test_observe_targets_cover_replicas() {
        let map = map();
        let targets = observe_targets(&map, &[0, 1], 2);

        let a = targets.get(&NodeEndpoint::new("a", 11210)).unwrap();
        // Node a: active copy of vb0, replica copy of vb1.
        assert!(a.contains(&(0, 0)));
        assert!(a.contains(&(1, 1)));

        let b = targets.get(&NodeEndpoint::new("b", 11210)).unwrap();
        assert!(b.contains(&(0, 1)));
        assert!(b.contains(&(1, 0)));
    }

    #[test]
    fn test_observe_targets_active_only_when_no_replicas_required() {
        let map = map();
        let targets = observe_targets(&map, &[0, 1, 2], 1);
        let a = targets.get(&NodeEndpoint::new("a", 11210)).unwrap();
        assert_eq!(a.iter().filter(|(_, copy)| *copy > 0).count(), 0);
        assert!(a.contains(&(0, 0)));
        assert!(a.contains(&(2, 0)));
    }
}
