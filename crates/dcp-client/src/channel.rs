//! Per-node DCP channel.
//!
//! One channel is one TCP connection to one data node for one bucket.
//! Each channel owns a single I/O task that performs the handshake,
//! then reads frames, decodes, and dispatches — work across channels is
//! parallel, work within a channel is serialized, which is what gives
//! the per-vbucket ordering guarantee.
//!
//! The handshake is linear:
//!
//! ```text
//! CONNECTING -> AUTH -> HELLO -> SELECT_BUCKET -> DCP_OPEN
//!            -> DCP_CONTROL -> READY -> CLOSING
//! ```
//!
//! and is bounded by one deadline (connect timeout + grace period).
//! In steady state the task multiplexes socket reads, conductor
//! commands, flow-control credit, the client-side NOOP ticker, and the
//! persistence poll.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use dcp_proto::features::{Feature, FeatureSet};
use dcp_proto::frame::{read_frame, Frame};
use dcp_proto::messages::{
    self, DeletionBody, FailoverLog, MutationBody, ObserveSeqnoBody, SnapshotMarker,
    StreamEndReason, SystemEventBody, SystemEventKind,
};
use dcp_proto::{Opcode, Status, MAX_FRAME_BYTES, SEQNO_INFINITY};

use crate::arbiter::BucketConfigArbiter;
use crate::cluster_map::NodeEndpoint;
use crate::config::ClientConfig;
use crate::error::{DcpError, DcpResult, HandshakePhase};
use crate::flow_control::{FlowControl, FlowControlMode};
use crate::listener::{
    AckHandle, CollectionCreated, CollectionDropped, CollectionFlushed, DatabaseChangeListener,
    Deletion, FailoverLogUpdate, Mutation, Rollback, ScopeCreated, ScopeDropped, SeqnoAdvanced,
    SnapshotDetails, StreamEnd, StreamFailure,
};
use crate::mitigation::{MitigationBuffer, PersistedSeqnos};
use crate::net::Connector;
use crate::session::{SessionStore, StreamOffset};
use crate::stream::{ActiveStream, StreamOutput};

/// Where a stream should stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndBound {
    /// Up to the node's current seqno, captured when the stream opens.
    Now,
    Infinity,
    Seqno(u64),
}

/// Commands from the conductor to a channel task.
#[derive(Debug)]
pub enum ChannelCommand {
    OpenStream {
        vbucket: u16,
        end: EndBound,
        /// Seed a fresh session at the node's current seqno first
        /// (the "start from NOW" case).
        seed_from_now: bool,
    },
    CloseStream {
        vbucket: u16,
    },
    GetFailoverLog {
        vbucket: u16,
        reply: oneshot::Sender<DcpResult<FailoverLog>>,
    },
    /// (vbucket, copy index) pairs this node should OBSERVE_SEQNO for.
    SetObserveSet(Vec<(u16, u8)>),
    Close,
}

/// Notifications from a channel task up to the conductor.
#[derive(Debug)]
pub enum ChannelEvent {
    Ready {
        node: NodeEndpoint,
    },
    StreamOpened {
        node: NodeEndpoint,
        vbucket: u16,
        end_seqno: u64,
    },
    StreamEnded {
        node: NodeEndpoint,
        vbucket: u16,
        reason: StreamEndReason,
    },
    StreamFailed {
        node: NodeEndpoint,
        vbucket: u16,
        permanent: bool,
    },
    Dropped {
        node: NodeEndpoint,
        detail: String,
        permanent: bool,
    },
}

/// Shared wiring every channel needs.
pub struct ChannelContext {
    pub config: ClientConfig,
    pub sessions: Arc<SessionStore>,
    pub arbiter: Arc<BucketConfigArbiter>,
    pub listener: Arc<dyn DatabaseChangeListener>,
    pub connector: Arc<dyn Connector>,
    pub persisted: Arc<PersistedSeqnos>,
    pub events: mpsc::UnboundedSender<ChannelEvent>,
}

/// Conductor-side handle to a running channel task.
pub struct ChannelHandle {
    pub node: NodeEndpoint,
    cmd_tx: mpsc::UnboundedSender<ChannelCommand>,
    join: JoinHandle<()>,
}

impl ChannelHandle {
    pub fn send(&self, cmd: ChannelCommand) {
        let _ = self.cmd_tx.send(cmd);
    }

    pub fn close(&self) {
        let _ = self.cmd_tx.send(ChannelCommand::Close);
    }

    pub fn abort(&self) {
        self.join.abort();
    }
}

/// Spawn the I/O task for one node.
pub fn spawn(node: NodeEndpoint, ctx: Arc<ChannelContext>) -> ChannelHandle {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let task_node = node.clone();
    let join = tokio::spawn(async move {
        run_channel(task_node, ctx, cmd_rx).await;
    });
    ChannelHandle { node, cmd_tx, join }
}

async fn run_channel(
    node: NodeEndpoint,
    ctx: Arc<ChannelContext>,
    mut cmd_rx: mpsc::UnboundedReceiver<ChannelCommand>,
) {
    let stream = match ctx
        .connector
        .connect(&node, ctx.config.socket_connect_timeout)
        .await
    {
        Ok(stream) => stream,
        Err(e) => {
            warn!("channel {}: connect failed: {}", node, e);
            let _ = ctx.events.send(ChannelEvent::Dropped {
                node,
                detail: e.to_string(),
                permanent: false,
            });
            return;
        }
    };

    let (rd, wr) = tokio::io::split(stream);
    let mut channel = Channel::new(node.clone(), ctx.clone(), rd, wr);

    match channel.run(&mut cmd_rx).await {
        Ok(()) => {
            debug!("channel {}: closed", node);
        }
        Err(e) => {
            let permanent = e.is_permanent();
            warn!("channel {}: {}", node, e);

            // Affected vbuckets surface as stream ends; the host never
            // sees the raw error for a steady-state failure.
            for vbucket in channel.streams.keys().copied().collect::<Vec<_>>() {
                ctx.listener.on_stream_end(StreamEnd {
                    vbucket,
                    reason: StreamEndReason::ChannelDropped,
                });
            }

            let detail = e.to_string();
            if channel.phase != HandshakePhase::Ready {
                ctx.listener.on_failure(StreamFailure {
                    vbucket: None,
                    error: e,
                });
            }
            let _ = ctx.events.send(ChannelEvent::Dropped {
                node,
                detail,
                permanent,
            });
        }
    }
}

enum Pending {
    Noop,
    BufferAck,
    CloseStream { vbucket: u16 },
    FailoverLog {
        vbucket: u16,
        reply: oneshot::Sender<DcpResult<FailoverLog>>,
    },
    Observe { vbucket: u16, copy: u8 },
    Seqnos,
}

enum Action {
    Frame(Option<Frame>),
    Command(Option<ChannelCommand>),
    Credit(u64),
    NoopTick,
    PollTick,
}

struct Channel {
    node: NodeEndpoint,
    ctx: Arc<ChannelContext>,
    rd: ReadHalf<TcpStream>,
    wr: WriteHalf<TcpStream>,
    phase: HandshakePhase,
    features: FeatureSet,
    collections_aware: bool,
    opaque_counter: u32,
    pending: HashMap<u32, Pending>,
    streams: HashMap<u16, ActiveStream>,
    opaque_to_vbucket: HashMap<u32, u16>,
    flow: FlowControl,
    buffer: MitigationBuffer,
    observe_set: Vec<(u16, u8)>,
    /// OK stream-ends held back until the vbucket's buffered events
    /// have been released (mitigation only).
    pending_end: HashMap<u16, StreamEndReason>,
    now_seqnos: Option<HashMap<u16, u64>>,
    seqnos_requested: bool,
    waiting_for_now: Vec<(u16, EndBound, bool)>,
    last_server_traffic: Instant,
    ack_tx: mpsc::UnboundedSender<u64>,
    ack_rx: mpsc::UnboundedReceiver<u64>,
}

impl Channel {
    fn new(
        node: NodeEndpoint,
        ctx: Arc<ChannelContext>,
        rd: ReadHalf<TcpStream>,
        wr: WriteHalf<TcpStream>,
    ) -> Self {
        let flow = FlowControl::new(ctx.config.buffer_bytes, ctx.config.ack_threshold);
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        Self {
            node,
            ctx,
            rd,
            wr,
            phase: HandshakePhase::Connecting,
            features: FeatureSet::default(),
            collections_aware: false,
            opaque_counter: 0,
            pending: HashMap::new(),
            streams: HashMap::new(),
            opaque_to_vbucket: HashMap::new(),
            flow,
            buffer: MitigationBuffer::new(),
            observe_set: Vec::new(),
            pending_end: HashMap::new(),
            now_seqnos: None,
            seqnos_requested: false,
            waiting_for_now: Vec::new(),
            last_server_traffic: Instant::now(),
            ack_tx,
            ack_rx,
        }
    }

    fn next_opaque(&mut self) -> u32 {
        self.opaque_counter = self.opaque_counter.wrapping_add(1);
        self.opaque_counter
    }

    async fn write_frame(&mut self, frame: Frame) -> DcpResult<()> {
        self.wr.write_all(&frame.encode()).await?;
        Ok(())
    }

    async fn run(&mut self, cmd_rx: &mut mpsc::UnboundedReceiver<ChannelCommand>) -> DcpResult<()> {
        let handshake_result = match self.ctx.config.handshake_timeout() {
            Some(deadline) => {
                let result = tokio::time::timeout(deadline, self.handshake()).await;
                match result {
                    Ok(inner) => inner,
                    Err(_) => Err(DcpError::Handshake {
                        phase: self.phase,
                        detail: "handshake deadline exceeded".into(),
                        permanent: false,
                    }),
                }
            }
            None => self.handshake().await,
        };
        handshake_result?;

        self.phase = HandshakePhase::Ready;
        info!("channel {}: ready", self.node);
        let _ = self.ctx.events.send(ChannelEvent::Ready {
            node: self.node.clone(),
        });

        let noop_enabled = self.ctx.config.noop_enabled;
        let client_noop = self.ctx.config.client_noop_interval();
        let mut noop_tick =
            tokio::time::interval_at(tokio::time::Instant::now() + client_noop, client_noop);

        let mitigation = self.ctx.config.mitigation.clone();
        let poll_every = mitigation
            .as_ref()
            .map(|m| m.poll_interval)
            .unwrap_or(std::time::Duration::from_secs(3600));
        let mut poll_tick =
            tokio::time::interval_at(tokio::time::Instant::now() + poll_every, poll_every);

        loop {
            let action = tokio::select! {
                frame = read_frame(&mut self.rd, MAX_FRAME_BYTES) => Action::Frame(frame?),
                cmd = cmd_rx.recv() => Action::Command(cmd),
                bytes = self.ack_rx.recv() => Action::Credit(bytes.unwrap_or(0)),
                _ = noop_tick.tick(), if noop_enabled => Action::NoopTick,
                _ = poll_tick.tick(), if mitigation.is_some() => Action::PollTick,
            };

            match action {
                Action::Frame(Some(frame)) => self.on_frame(frame).await?,
                Action::Frame(None) => {
                    return Err(DcpError::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "server closed the connection",
                    )));
                }
                Action::Command(Some(ChannelCommand::Close)) | Action::Command(None) => {
                    self.phase = HandshakePhase::Closing;
                    return Ok(());
                }
                Action::Command(Some(cmd)) => self.on_command(cmd).await?,
                Action::Credit(bytes) => self.credit(bytes).await?,
                Action::NoopTick => self.on_noop_tick().await?,
                Action::PollTick => self.on_poll_tick().await?,
            }
        }
    }

    // ─── Handshake ────────────────────────────────────────────────────────────

    /// Send one request and wait for its response, servicing unrelated
    /// server traffic (NOOPs, config pushes) in the meantime. Config
    /// pushes are applied before we proceed, so a topology change seen
    /// during setup is never reordered behind stream traffic.
    async fn roundtrip(&mut self, frame: Frame) -> DcpResult<Frame> {
        let opaque = frame.opaque;
        self.write_frame(frame).await?;
        loop {
            let frame = match read_frame(&mut self.rd, MAX_FRAME_BYTES).await? {
                Some(frame) => frame,
                None => {
                    return Err(DcpError::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "server closed the connection",
                    )))
                }
            };
            self.last_server_traffic = Instant::now();
            if frame.is_response() && frame.opaque == opaque {
                return Ok(frame);
            }
            if frame.is_request() {
                self.on_server_request(frame).await?;
            } else {
                warn!(
                    "channel {}: dropping unexpected {} response during handshake",
                    self.node, frame.opcode
                );
            }
        }
    }

    fn handshake_error(&self, detail: impl Into<String>, permanent: bool) -> DcpError {
        DcpError::Handshake {
            phase: self.phase,
            detail: detail.into(),
            permanent,
        }
    }

    async fn handshake(&mut self) -> DcpResult<()> {
        let endpoint = self.node.to_string();
        let credentials = self.ctx.config.credentials.get(&endpoint);

        // AUTH: mechanism list, then SASL PLAIN.
        self.phase = HandshakePhase::Auth;
        let opaque = self.next_opaque();
        let mechs = self.roundtrip(messages::sasl_list_mechs(opaque)).await?;
        let mechs = String::from_utf8_lossy(&mechs.value).into_owned();
        if !mechs.split_whitespace().any(|m| m == "PLAIN") {
            return Err(self.handshake_error(
                format!("server offers no PLAIN mechanism (got '{}')", mechs),
                true,
            ));
        }

        let opaque = self.next_opaque();
        let auth = self
            .roundtrip(messages::sasl_auth_plain(
                opaque,
                &credentials.username,
                &credentials.password,
            ))
            .await?;
        if !auth.status().is_success() {
            return Err(self.handshake_error(
                format!("authentication rejected: {}", auth.status()),
                true,
            ));
        }

        // HELLO feature negotiation.
        self.phase = HandshakePhase::Hello;
        let opaque = self.next_opaque();
        let hello = self
            .roundtrip(messages::hello(
                opaque,
                &self.ctx.config.connection_name,
                &self.ctx.config.features,
            ))
            .await?;
        if !hello.status().is_success() {
            return Err(
                self.handshake_error(format!("HELLO rejected: {}", hello.status()), false)
            );
        }
        self.features = FeatureSet::parse(&hello.value);
        self.collections_aware = self.features.contains(Feature::Collections);
        if !self.features.contains(Feature::SelectBucket) {
            return Err(self.handshake_error("select_bucket feature not honored", true));
        }
        if !self.ctx.config.collections_filter.is_empty() && !self.collections_aware {
            return Err(
                self.handshake_error("collections filter configured but not honored", true)
            );
        }
        debug!("channel {}: negotiated {:?}", self.node, self.features);

        // SELECT_BUCKET.
        self.phase = HandshakePhase::SelectBucket;
        let opaque = self.next_opaque();
        let selected = self
            .roundtrip(messages::select_bucket(opaque, &self.ctx.config.bucket))
            .await?;
        if !selected.status().is_success() {
            let status = selected.status();
            return Err(self.handshake_error(
                format!("select bucket '{}': {}", self.ctx.config.bucket, status),
                status.is_permanent(),
            ));
        }

        // DCP_OPEN_CONNECTION as a producer.
        self.phase = HandshakePhase::DcpOpen;
        let opaque = self.next_opaque();
        let opened = self
            .roundtrip(messages::open_connection(
                opaque,
                &self.ctx.config.connection_name,
            ))
            .await?;
        if !opened.status().is_success() {
            return Err(self.handshake_error(
                format!("DCP open rejected: {}", opened.status()),
                opened.status().is_permanent(),
            ));
        }

        // DCP_CONTROL switches, fixed order, all-or-nothing.
        self.phase = HandshakePhase::DcpControl;
        for (key, value) in self.ctx.config.control_entries() {
            let opaque = self.next_opaque();
            let reply = self
                .roundtrip(messages::control(opaque, &key, &value))
                .await?;
            if !reply.status().is_success() {
                return Err(self.handshake_error(
                    format!("control {}={} rejected: {}", key, value, reply.status()),
                    true,
                ));
            }
        }

        Ok(())
    }

    // ─── Steady-state dispatch ────────────────────────────────────────────────

    async fn on_frame(&mut self, frame: Frame) -> DcpResult<()> {
        self.last_server_traffic = Instant::now();
        if frame.is_response() {
            self.on_response(frame).await
        } else {
            self.on_server_request(frame).await
        }
    }

    async fn on_response(&mut self, frame: Frame) -> DcpResult<()> {
        if frame.opcode == Opcode::DcpStreamRequest {
            return self.on_stream_open_response(frame).await;
        }

        match self.pending.remove(&frame.opaque) {
            Some(Pending::Noop) | Some(Pending::BufferAck) => Ok(()),
            Some(Pending::CloseStream { vbucket }) => {
                trace!(
                    "channel {}: close stream vb {} acknowledged: {}",
                    self.node,
                    vbucket,
                    frame.status()
                );
                Ok(())
            }
            Some(Pending::FailoverLog { vbucket, reply }) => {
                let result = if frame.status().is_success() {
                    FailoverLog::parse(&frame.value).map_err(DcpError::from)
                } else {
                    Err(DcpError::Request(frame.status()))
                };
                trace!("channel {}: failover log for vb {}", self.node, vbucket);
                let _ = reply.send(result);
                Ok(())
            }
            Some(Pending::Observe { vbucket, copy }) => {
                if frame.status().is_success() {
                    let body = ObserveSeqnoBody::parse(&frame)?;
                    self.ctx
                        .persisted
                        .record(vbucket, copy, body.persisted_seqno);
                    self.drain_buffered(vbucket).await?;
                }
                Ok(())
            }
            Some(Pending::Seqnos) => {
                if frame.status().is_success() {
                    let pairs = messages::parse_vb_seqnos(&frame.value)?;
                    self.now_seqnos = Some(pairs.into_iter().collect());
                } else {
                    // Treat as empty: streams fall back to "beginning".
                    warn!(
                        "channel {}: seqno snapshot failed: {}",
                        self.node,
                        frame.status()
                    );
                    self.now_seqnos = Some(HashMap::new());
                }
                let waiting = std::mem::take(&mut self.waiting_for_now);
                for (vbucket, end, seed) in waiting {
                    self.open_stream_ready(vbucket, end, seed).await?;
                }
                Ok(())
            }
            None => {
                // Unknown opcode or stale opaque in the response path:
                // log and drop the frame.
                warn!(
                    "channel {}: dropping unmatched {} response (opaque {:#x})",
                    self.node, frame.opcode, frame.opaque
                );
                Ok(())
            }
        }
    }

    async fn on_server_request(&mut self, frame: Frame) -> DcpResult<()> {
        match frame.opcode {
            Opcode::DcpNoop => {
                trace!("channel {}: noop", self.node);
                let reply = messages::noop_reply(frame.opaque);
                self.write_frame(reply).await
            }
            Opcode::GetClusterConfig => {
                // Clustermap change notification: hand to the arbiter
                // before any later frame is dispatched.
                let json = String::from_utf8_lossy(&frame.value);
                if let Err(e) = self.ctx.arbiter.accept_json(&json, &self.node.host) {
                    warn!("channel {}: bad pushed config: {}", self.node, e);
                }
                Ok(())
            }
            Opcode::DcpSnapshotMarker
            | Opcode::DcpMutation
            | Opcode::DcpDeletion
            | Opcode::DcpExpiration
            | Opcode::DcpStreamEnd
            | Opcode::DcpSystemEvent
            | Opcode::DcpSeqnoAdvanced
            | Opcode::DcpOsoSnapshot => self.on_stream_frame(frame).await,
            other => {
                warn!(
                    "channel {}: replying not-supported to server request {}",
                    self.node, other
                );
                let reply = messages::not_supported_reply(other, frame.opaque);
                self.write_frame(reply).await
            }
        }
    }

    async fn on_stream_open_response(&mut self, frame: Frame) -> DcpResult<()> {
        let Some(&vbucket) = self.opaque_to_vbucket.get(&frame.opaque) else {
            warn!(
                "channel {}: stream-open response with unknown opaque {:#x}",
                self.node, frame.opaque
            );
            return Ok(());
        };
        if !self.streams.contains_key(&vbucket) {
            self.opaque_to_vbucket.remove(&frame.opaque);
            return Ok(());
        }

        match frame.status() {
            Status::Success => {
                let log = FailoverLog::parse(&frame.value)?;
                let vbuuid = self.ctx.sessions.with_mut(vbucket, |s| {
                    s.apply_failover_log(&log);
                    s.vbuuid
                });
                let Some(stream) = self.streams.get_mut(&vbucket) else {
                    return Ok(());
                };
                stream.mark_open(vbuuid);
                let end_seqno = stream.end_seqno;

                debug!(
                    "channel {}: stream open vb {} (uuid {:#x}, end {:#x})",
                    self.node, vbucket, vbuuid, end_seqno
                );
                self.ctx.listener.on_failover_log(FailoverLogUpdate {
                    vbucket,
                    entries: self.ctx.sessions.get(vbucket).failover_log,
                });
                let _ = self.ctx.events.send(ChannelEvent::StreamOpened {
                    node: self.node.clone(),
                    vbucket,
                    end_seqno,
                });
                Ok(())
            }
            Status::Rollback => {
                self.opaque_to_vbucket.remove(&frame.opaque);
                let seqno = messages::parse_rollback_seqno(&frame)?;
                self.on_rollback(vbucket, seqno).await
            }
            status => {
                self.opaque_to_vbucket.remove(&frame.opaque);
                self.streams.remove(&vbucket);
                // NotMyVbucket replies carry a fresh config to explain
                // themselves; use it.
                if status == Status::NotMyVbucket && !frame.value.is_empty() {
                    let json = String::from_utf8_lossy(&frame.value);
                    let _ = self.ctx.arbiter.accept_json(&json, &self.node.host);
                }
                warn!(
                    "channel {}: stream open vb {} failed: {}",
                    self.node, vbucket, status
                );
                if status.is_permanent() {
                    self.ctx.listener.on_failure(StreamFailure {
                        vbucket: Some(vbucket),
                        error: DcpError::Request(status),
                    });
                }
                let _ = self.ctx.events.send(ChannelEvent::StreamFailed {
                    node: self.node.clone(),
                    vbucket,
                    permanent: status.is_permanent(),
                });
                Ok(())
            }
        }
    }

    /// Rollback response: rewind the session and retry, unless the
    /// listener vetoes, in which case the stream fails permanently.
    async fn on_rollback(&mut self, vbucket: u16, seqno: u64) -> DcpResult<()> {
        info!(
            "channel {}: rollback vb {} to seqno {}",
            self.node, vbucket, seqno
        );
        let rollback = Rollback::new(vbucket, seqno);
        self.ctx.listener.on_rollback(rollback.clone());

        if rollback.is_vetoed() {
            self.streams.remove(&vbucket);
            self.ctx.listener.on_failure(StreamFailure {
                vbucket: Some(vbucket),
                error: DcpError::RollbackVetoed { vbucket, seqno },
            });
            let _ = self.ctx.events.send(ChannelEvent::StreamFailed {
                node: self.node.clone(),
                vbucket,
                permanent: true,
            });
            return Ok(());
        }

        self.ctx
            .sessions
            .with_mut(vbucket, |s| s.apply_rollback(seqno));

        let Some(stream) = self.streams.remove(&vbucket) else {
            return Ok(());
        };
        self.open_stream_ready(vbucket, EndBound::Seqno(stream.end_seqno), false)
            .await
    }

    async fn on_stream_frame(&mut self, frame: Frame) -> DcpResult<()> {
        let Some(&vbucket) = self.opaque_to_vbucket.get(&frame.opaque) else {
            // Stream already gone (e.g. trailing frames after a close).
            trace!(
                "channel {}: dropping {} for unknown stream (opaque {:#x})",
                self.node,
                frame.opcode,
                frame.opaque
            );
            return Ok(());
        };

        let charge = if frame.opcode.is_flow_controlled() {
            let bytes = frame.total_len() as u64;
            self.flow.on_frame(frame.total_len());
            bytes
        } else {
            0
        };

        let Some(stream) = self.streams.get_mut(&vbucket) else {
            return self.credit(charge).await;
        };

        let output = match frame.opcode {
            Opcode::DcpSnapshotMarker => {
                stream.on_snapshot_marker(SnapshotMarker::parse(&frame)?)?
            }
            Opcode::DcpMutation => {
                stream.on_mutation(MutationBody::parse(&frame, self.collections_aware)?)?
            }
            Opcode::DcpDeletion => stream.on_deletion(
                DeletionBody::parse(&frame, self.collections_aware)?,
                false,
            )?,
            Opcode::DcpExpiration => stream.on_deletion(
                DeletionBody::parse(&frame, self.collections_aware)?,
                true,
            )?,
            Opcode::DcpSeqnoAdvanced => {
                stream.on_seqno_advanced(messages::parse_seqno_advanced(&frame)?)?
            }
            Opcode::DcpSystemEvent => stream.on_system_event(
                SystemEventBody::parse(&frame)?,
                self.collections_aware,
                &self.ctx.config.collections_filter,
            )?,
            Opcode::DcpOsoSnapshot => {
                stream.on_oso_snapshot(messages::parse_oso_snapshot(&frame)?)?
            }
            Opcode::DcpStreamEnd => {
                let reason = messages::parse_stream_end(&frame)?;
                stream.on_stream_end(reason)
            }
            _ => unreachable!("filtered by caller"),
        };

        self.route_output(vbucket, charge, output).await
    }

    /// Deliver immediately, or park under rollback mitigation.
    async fn route_output(
        &mut self,
        vbucket: u16,
        charge: u64,
        output: StreamOutput,
    ) -> DcpResult<()> {
        if self.ctx.config.mitigation.is_some() && output.offset().is_some() {
            self.buffer.push(vbucket, charge, output);
            return Ok(());
        }
        self.deliver(vbucket, charge, output).await
    }

    async fn deliver(&mut self, vbucket: u16, charge: u64, output: StreamOutput) -> DcpResult<()> {
        let mode = self.ctx.config.flow_control_mode;

        // Offsets reach the session store only when the event reaches
        // the listener; under mitigation that is release time, which is
        // exactly what makes a reconnect resume from persisted ground.
        if let Some(offset) = output.offset() {
            self.ctx
                .sessions
                .with_mut(vbucket, |s| s.apply_offset(offset));
        }

        match output {
            StreamOutput::Snapshot(marker) => {
                self.ctx.listener.on_snapshot(SnapshotDetails {
                    vbucket,
                    start_seqno: marker.start_seqno,
                    end_seqno: marker.end_seqno,
                    flags: marker.flags,
                });
                self.credit(charge).await
            }
            StreamOutput::OsoBoundary(_) => self.credit(charge).await,
            StreamOutput::Mutation { body, offset } => {
                let handle = self.document_ack(mode, charge).await?;
                let mutation = Mutation::new(vbucket, body, offset, handle);
                self.ctx.listener.on_mutation(mutation);
                self.after_callback(mode, charge).await
            }
            StreamOutput::Deletion {
                body,
                due_to_expiration,
                offset,
            } => {
                let handle = self.document_ack(mode, charge).await?;
                let deletion = Deletion::new(vbucket, body, due_to_expiration, offset, handle);
                self.ctx.listener.on_deletion(deletion);
                self.after_callback(mode, charge).await
            }
            StreamOutput::SeqnoAdvanced { offset } => {
                self.ctx
                    .listener
                    .on_seqno_advanced(SeqnoAdvanced { vbucket, offset });
                self.credit(charge).await
            }
            StreamOutput::SystemEvent {
                body,
                offset,
                deliver,
            } => {
                if deliver {
                    self.deliver_system_event(vbucket, body, offset);
                }
                self.credit(charge).await
            }
            StreamOutput::Ended(reason) => {
                // A normally-completed stream must not lose events that
                // are buffered awaiting persistence: hold the end until
                // the queue drains. Any other reason leads to a reopen
                // that will refetch whatever we discard.
                if reason == StreamEndReason::Ok && self.buffer.pending(vbucket) > 0 {
                    self.pending_end.insert(vbucket, reason);
                } else {
                    self.finish_stream(vbucket, reason);
                }
                self.credit(charge).await
            }
        }
    }

    /// Ack handle for a document event. AUTO credits before the
    /// callback; MANUAL hands the application a live handle.
    async fn document_ack(&mut self, mode: FlowControlMode, charge: u64) -> DcpResult<AckHandle> {
        match mode {
            FlowControlMode::Auto => {
                self.credit(charge).await?;
                Ok(AckHandle::inert(charge))
            }
            FlowControlMode::AutoAfterCallback => Ok(AckHandle::inert(charge)),
            FlowControlMode::Manual => Ok(AckHandle::live(charge, self.ack_tx.clone())),
        }
    }

    /// AUTO_AFTER_CALLBACK credits once the callback has returned.
    async fn after_callback(&mut self, mode: FlowControlMode, charge: u64) -> DcpResult<()> {
        if mode == FlowControlMode::AutoAfterCallback {
            self.credit(charge).await?;
        }
        Ok(())
    }

    fn deliver_system_event(&self, vbucket: u16, body: SystemEventBody, offset: StreamOffset) {
        let manifest_uid = body.manifest_uid;
        let scope_id = body.scope_id;
        let collection_id = body.collection_id.unwrap_or(0);
        match body.kind {
            SystemEventKind::ScopeCreated => self.ctx.listener.on_scope_created(ScopeCreated {
                vbucket,
                name: body.name,
                scope_id,
                manifest_uid,
                offset,
            }),
            SystemEventKind::ScopeDropped => self.ctx.listener.on_scope_dropped(ScopeDropped {
                vbucket,
                scope_id,
                manifest_uid,
                offset,
            }),
            SystemEventKind::CollectionCreated => {
                self.ctx.listener.on_collection_created(CollectionCreated {
                    vbucket,
                    name: body.name,
                    scope_id,
                    collection_id,
                    manifest_uid,
                    offset,
                })
            }
            SystemEventKind::CollectionDropped => {
                self.ctx.listener.on_collection_dropped(CollectionDropped {
                    vbucket,
                    scope_id,
                    collection_id,
                    manifest_uid,
                    offset,
                })
            }
            SystemEventKind::CollectionFlushed => {
                self.ctx.listener.on_collection_flushed(CollectionFlushed {
                    vbucket,
                    scope_id,
                    collection_id,
                    manifest_uid,
                    offset,
                })
            }
            SystemEventKind::Other(code) => {
                debug!("channel {}: ignoring system event {:#x}", self.node, code)
            }
        }
    }

    fn finish_stream(&mut self, vbucket: u16, reason: StreamEndReason) {
        debug!(
            "channel {}: stream end vb {} ({:?})",
            self.node, vbucket, reason
        );
        self.streams.remove(&vbucket);
        self.opaque_to_vbucket.retain(|_, vb| *vb != vbucket);
        self.pending_end.remove(&vbucket);
        // Anything still unpersisted is discarded, never delivered.
        self.buffer.clear(vbucket);

        self.ctx
            .listener
            .on_stream_end(StreamEnd { vbucket, reason });
        let _ = self.ctx.events.send(ChannelEvent::StreamEnded {
            node: self.node.clone(),
            vbucket,
            reason,
        });
    }

    // ─── Flow control ─────────────────────────────────────────────────────────

    async fn credit(&mut self, bytes: u64) -> DcpResult<()> {
        if bytes == 0 {
            return Ok(());
        }
        if let Some(cumulative) = self.flow.credit(bytes) {
            let opaque = self.next_opaque();
            self.pending.insert(opaque, Pending::BufferAck);
            trace!(
                "channel {}: buffer ack ({} cumulative bytes)",
                self.node,
                cumulative
            );
            let frame = messages::buffer_ack(opaque, cumulative);
            self.write_frame(frame).await?;
        }
        Ok(())
    }

    // ─── Commands from the conductor ──────────────────────────────────────────

    async fn on_command(&mut self, cmd: ChannelCommand) -> DcpResult<()> {
        match cmd {
            ChannelCommand::OpenStream {
                vbucket,
                end,
                seed_from_now,
            } => self.open_stream(vbucket, end, seed_from_now).await,
            ChannelCommand::CloseStream { vbucket } => self.close_stream(vbucket).await,
            ChannelCommand::GetFailoverLog { vbucket, reply } => {
                let opaque = self.next_opaque();
                self.pending
                    .insert(opaque, Pending::FailoverLog { vbucket, reply });
                self.write_frame(messages::get_failover_log(opaque, vbucket))
                    .await
            }
            ChannelCommand::SetObserveSet(targets) => {
                self.observe_set = targets;
                Ok(())
            }
            ChannelCommand::Close => Ok(()),
        }
    }

    async fn open_stream(
        &mut self,
        vbucket: u16,
        end: EndBound,
        seed_from_now: bool,
    ) -> DcpResult<()> {
        let needs_now = seed_from_now || end == EndBound::Now;
        if needs_now && self.now_seqnos.is_none() {
            self.waiting_for_now.push((vbucket, end, seed_from_now));
            if !self.seqnos_requested {
                self.seqnos_requested = true;
                let opaque = self.next_opaque();
                self.pending.insert(opaque, Pending::Seqnos);
                self.write_frame(messages::get_all_vb_seqnos(opaque)).await?;
            }
            return Ok(());
        }
        self.open_stream_ready(vbucket, end, seed_from_now).await
    }

    async fn open_stream_ready(
        &mut self,
        vbucket: u16,
        end: EndBound,
        seed_from_now: bool,
    ) -> DcpResult<()> {
        let now_seqno = self
            .now_seqnos
            .as_ref()
            .and_then(|m| m.get(&vbucket).copied())
            .unwrap_or(0);

        if seed_from_now {
            self.ctx.sessions.with_mut(vbucket, |s| {
                // Only a fresh session gets seeded; a restored one
                // already knows where to resume.
                if s.seqno == 0 && s.failover_log.is_empty() {
                    s.seqno = now_seqno;
                    s.snapshot_start = now_seqno;
                    s.snapshot_end = now_seqno;
                }
            });
        }

        let end_seqno = match end {
            EndBound::Infinity => SEQNO_INFINITY,
            EndBound::Seqno(s) => s,
            EndBound::Now => now_seqno,
        };

        let state = self.ctx.sessions.get(vbucket);
        let offset = state.offset();

        // Nothing left in the requested range: report completion
        // without bothering the server.
        if end_seqno != SEQNO_INFINITY && offset.seqno >= end_seqno {
            debug!(
                "channel {}: vb {} already at {} >= end {}",
                self.node, vbucket, offset.seqno, end_seqno
            );
            self.ctx.listener.on_stream_end(StreamEnd {
                vbucket,
                reason: StreamEndReason::Ok,
            });
            let _ = self.ctx.events.send(ChannelEvent::StreamEnded {
                node: self.node.clone(),
                vbucket,
                reason: StreamEndReason::Ok,
            });
            return Ok(());
        }

        let opaque = self.next_opaque();
        let request = state.stream_request(end_seqno);
        self.streams
            .insert(vbucket, ActiveStream::new(vbucket, opaque, end_seqno, offset));
        self.opaque_to_vbucket.insert(opaque, vbucket);

        let filter = if self.collections_aware {
            self.ctx.config.collections_filter.to_stream_filter_json()
        } else {
            None
        };

        debug!(
            "channel {}: requesting stream vb {} from {} (uuid {:#x})",
            self.node, vbucket, request.start_seqno, request.vbuuid
        );
        self.write_frame(messages::stream_request(
            opaque,
            vbucket,
            request,
            filter.as_deref(),
        ))
        .await
    }

    async fn close_stream(&mut self, vbucket: u16) -> DcpResult<()> {
        let Some(stream) = self.streams.get_mut(&vbucket) else {
            return Ok(());
        };
        stream.closing = true;
        // Unreleased events must not surface after a host-driven close.
        self.buffer.clear(vbucket);

        let opaque = self.next_opaque();
        self.pending
            .insert(opaque, Pending::CloseStream { vbucket });
        debug!("channel {}: closing stream vb {}", self.node, vbucket);
        // With send_stream_end_on_client_close_stream negotiated the
        // server follows up with STREAM_END(Closed), which finishes the
        // bookkeeping through the normal path.
        self.write_frame(messages::close_stream(opaque, vbucket))
            .await
    }

    // ─── Timers ───────────────────────────────────────────────────────────────

    /// Client-side NOOP plus idle and stall detection.
    async fn on_noop_tick(&mut self) -> DcpResult<()> {
        if self.last_server_traffic.elapsed() > self.ctx.config.idle_timeout() {
            return Err(DcpError::Timeout(format!(
                "no server traffic for {:?}",
                self.last_server_traffic.elapsed()
            )));
        }

        if let Some((unacked, buffer)) = self.flow.check_stall(self.ctx.config.noop_interval) {
            warn!(
                "channel {}: flow control stalled ({} of {} bytes unacked)",
                self.node, unacked, buffer
            );
            self.ctx.listener.on_failure(StreamFailure {
                vbucket: None,
                error: DcpError::FlowControlStall { unacked, buffer },
            });
        }

        let opaque = self.next_opaque();
        self.pending.insert(opaque, Pending::Noop);
        let frame = Frame::request(Opcode::DcpNoop, 0, opaque);
        self.write_frame(frame).await
    }

    /// Persistence poll: OBSERVE_SEQNO for every copy this node hosts,
    /// plus a drain attempt for anything already releasable.
    async fn on_poll_tick(&mut self) -> DcpResult<()> {
        for (vbucket, copy) in self.observe_set.clone() {
            let vbuuid = self.ctx.sessions.get(vbucket).vbuuid;
            let opaque = self.next_opaque();
            self.pending
                .insert(opaque, Pending::Observe { vbucket, copy });
            self.write_frame(messages::observe_seqno(opaque, vbucket, vbuuid))
                .await?;
        }
        for vbucket in self.buffer.buffered_vbuckets() {
            self.drain_buffered(vbucket).await?;
        }
        Ok(())
    }

    /// Release buffered events covered by the persisted floor.
    async fn drain_buffered(&mut self, vbucket: u16) -> DcpResult<()> {
        let Some(mitigation) = self.ctx.config.mitigation.as_ref() else {
            return Ok(());
        };
        let required = 1 + mitigation.replica_count as u8;
        let Some(floor) = self.ctx.persisted.persisted(vbucket, required) else {
            return Ok(());
        };
        for buffered in self.buffer.release(vbucket, floor) {
            self.deliver(vbucket, buffered.charge, buffered.output)
                .await?;
        }
        if self.buffer.pending(vbucket) == 0 {
            if let Some(reason) = self.pending_end.remove(&vbucket) {
                self.finish_stream(vbucket, reason);
            }
        }
        Ok(())
    }
}
