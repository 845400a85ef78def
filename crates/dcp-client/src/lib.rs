//! Client core for Couchbase's Database Change Protocol (DCP).
//!
//! Opens one channel per data node of a bucket, streams per-vbucket
//! changes in order, maintains the session state needed to resume
//! without gaps or duplicates, returns flow-control credit as events
//! are consumed, and reconciles everything against the live cluster
//! topology.
//!
//! The moving parts, bottom up:
//!
//! - [`session`] — per-vbucket resume cursors and failover logs
//! - [`cluster_map`] / [`arbiter`] — topology parsing and revision
//!   arbitration
//! - [`flow_control`] — buffer-ack accounting
//! - [`stream`] — the per-vbucket frame state machine
//! - [`channel`] — one connection to one node: handshake, dispatch,
//!   keepalive
//! - [`mitigation`] — optional hold-until-persisted delivery
//! - [`conductor`] — map-driven channel/stream placement
//! - [`client`] — the host-facing facade
//!
//! Hosts implement [`DatabaseChangeListener`] and drive a [`Client`].

pub mod arbiter;
pub mod bootstrap;
pub mod channel;
pub mod client;
pub mod cluster_map;
pub mod conductor;
pub mod config;
pub mod error;
pub mod flow_control;
pub mod listener;
pub mod mitigation;
pub mod net;
pub mod session;
pub mod stream;

pub use client::Client;
pub use cluster_map::{ClusterMap, NodeEndpoint};
pub use conductor::{StreamFrom, StreamTo};
pub use config::{
    ClientConfig, CollectionsFilter, Credentials, CredentialsProvider, MitigationConfig,
    StaticCredentials,
};
pub use error::{DcpError, DcpResult};
pub use flow_control::FlowControlMode;
pub use listener::{
    AckHandle, CollectionCreated, CollectionDropped, CollectionFlushed, DatabaseChangeListener,
    Deletion, FailoverLogUpdate, Mutation, Rollback, ScopeCreated, ScopeDropped, SeqnoAdvanced,
    SnapshotDetails, StreamEnd, StreamFailure,
};
pub use session::{SessionSnapshot, SessionState, SessionStore, StreamOffset};

pub use dcp_proto::messages::StreamEndReason;
