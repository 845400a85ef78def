//! Client configuration.
//!
//! Everything tunable lives here as typed fields, including the knobs
//! the server negotiates through DCP_CONTROL. Control entries are
//! emitted in a fixed order; servers reject unknown keys and the
//! channel treats any rejection as fatal, so order and spelling matter.

use std::sync::Arc;
use std::time::Duration;

use dcp_proto::features::FeatureSet;

use crate::error::{DcpError, DcpResult};
use crate::flow_control::FlowControlMode;

/// Username/password pair for SASL authentication.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Supplies credentials per endpoint, letting hosts hand out different
/// users per node (e.g. when fronting through a proxy).
pub trait CredentialsProvider: Send + Sync {
    /// `endpoint` is "host:port" of the node being authenticated.
    fn get(&self, endpoint: &str) -> Credentials;
}

/// The common case: one set of credentials for every node.
#[derive(Debug, Clone)]
pub struct StaticCredentials {
    credentials: Credentials,
}

impl StaticCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            credentials: Credentials {
                username: username.into(),
                password: password.into(),
            },
        }
    }
}

impl CredentialsProvider for StaticCredentials {
    fn get(&self, _endpoint: &str) -> Credentials {
        self.credentials.clone()
    }
}

/// Scope/collection filter for collections-aware streams.
///
/// Ids are the server-assigned numeric ids from the collections
/// manifest. An empty filter passes everything.
#[derive(Debug, Clone, Default)]
pub struct CollectionsFilter {
    pub scope_id: Option<u32>,
    pub collection_ids: Vec<u32>,
}

impl CollectionsFilter {
    pub fn is_empty(&self) -> bool {
        self.scope_id.is_none() && self.collection_ids.is_empty()
    }

    pub fn allows_scope(&self, scope_id: u32) -> bool {
        match self.scope_id {
            Some(wanted) => wanted == scope_id,
            None => self.collection_ids.is_empty(),
        }
    }

    pub fn allows_collection(&self, scope_id: u32, collection_id: u32) -> bool {
        if let Some(wanted) = self.scope_id {
            return wanted == scope_id;
        }
        if self.collection_ids.is_empty() {
            return true;
        }
        self.collection_ids.contains(&collection_id)
    }

    /// JSON filter body for DCP_STREAM_REQUEST, or None when empty.
    /// Ids are hex strings per the wire convention.
    pub fn to_stream_filter_json(&self) -> Option<String> {
        if self.is_empty() {
            return None;
        }
        if let Some(scope) = self.scope_id {
            return Some(format!("{{\"scope\":\"{:x}\"}}", scope));
        }
        let ids: Vec<String> = self
            .collection_ids
            .iter()
            .map(|id| format!("\"{:x}\"", id))
            .collect();
        Some(format!("{{\"collections\":[{}]}}", ids.join(",")))
    }
}

/// Rollback-mitigation (persistence polling) settings.
#[derive(Debug, Clone)]
pub struct MitigationConfig {
    /// How many replicas, beyond the active copy, must have persisted
    /// an event before it is released. 0 = active only.
    pub replica_count: usize,
    /// How often OBSERVE_SEQNO is issued per vbucket.
    pub poll_interval: Duration,
}

impl Default for MitigationConfig {
    fn default() -> Self {
        Self {
            replica_count: 0,
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Top-level client configuration.
#[derive(Clone)]
pub struct ClientConfig {
    /// Seed nodes, "host" or "host:port".
    pub seeds: Vec<String>,
    pub bucket: String,
    pub credentials: Arc<dyn CredentialsProvider>,
    /// Name announced in DCP_OPEN_CONNECTION; shows up in server stats.
    pub connection_name: String,

    /// HELLO features to request.
    pub features: FeatureSet,

    /// Flow-control buffer the server is told to respect, in bytes.
    pub buffer_bytes: u32,
    /// Fraction of `buffer_bytes` that triggers a buffer-ack.
    pub ack_threshold: f64,
    pub flow_control_mode: FlowControlMode,

    pub noop_enabled: bool,
    /// Server-side NOOP interval. The client answers server NOOPs and
    /// emits its own at 1.2x this interval; silence for 2x of it drops
    /// the channel.
    pub noop_interval: Duration,

    pub socket_connect_timeout: Duration,
    /// Extra slack added to the connect timeout to bound the whole
    /// handshake. Zero disables the handshake deadline.
    pub connect_callback_grace_period: Duration,

    /// Deliver expirations as DCP_EXPIRATION rather than deletions.
    pub expiry_opcode: bool,

    pub collections_filter: CollectionsFilter,
    pub mitigation: Option<MitigationConfig>,
}

impl ClientConfig {
    pub fn new(
        seeds: Vec<String>,
        bucket: impl Into<String>,
        credentials: Arc<dyn CredentialsProvider>,
    ) -> Self {
        Self {
            seeds,
            bucket: bucket.into(),
            credentials,
            connection_name: format!("dcp-rs-{:08x}", std::process::id()),
            features: FeatureSet::default_request(),
            buffer_bytes: 20 * 1024 * 1024,
            ack_threshold: 0.5,
            flow_control_mode: FlowControlMode::Auto,
            noop_enabled: true,
            noop_interval: Duration::from_secs(20),
            socket_connect_timeout: Duration::from_millis(10_000),
            connect_callback_grace_period: Duration::from_millis(2_000),
            expiry_opcode: true,
            collections_filter: CollectionsFilter::default(),
            mitigation: None,
        }
    }

    pub fn validate(&self) -> DcpResult<()> {
        if self.seeds.is_empty() {
            return Err(DcpError::Config("no seed nodes configured".into()));
        }
        if self.bucket.is_empty() {
            return Err(DcpError::Config("bucket name is empty".into()));
        }
        if !(0.0..=1.0).contains(&self.ack_threshold) {
            return Err(DcpError::Config(format!(
                "ack threshold {} outside [0, 1]",
                self.ack_threshold
            )));
        }
        if self.buffer_bytes == 0 {
            return Err(DcpError::Config("flow-control buffer is zero".into()));
        }
        Ok(())
    }

    /// Deadline for the whole handshake, None when the grace period is
    /// zero (deadline disabled).
    pub fn handshake_timeout(&self) -> Option<Duration> {
        if self.connect_callback_grace_period.is_zero() {
            None
        } else {
            Some(self.socket_connect_timeout + self.connect_callback_grace_period)
        }
    }

    /// Interval at which the client sends its own NOOPs. Slightly wider
    /// than the server interval to avoid redundant keepalives.
    pub fn client_noop_interval(&self) -> Duration {
        self.noop_interval.mul_f64(1.2)
    }

    /// Silence longer than this means the connection is dead.
    pub fn idle_timeout(&self) -> Duration {
        self.noop_interval * 2
    }

    /// DCP_CONTROL entries in the order they must be sent.
    pub fn control_entries(&self) -> Vec<(String, String)> {
        let mut entries = Vec::new();
        entries.push((
            "connection_buffer_size".to_string(),
            self.buffer_bytes.to_string(),
        ));
        if self.noop_enabled {
            entries.push(("enable_noop".to_string(), "true".to_string()));
            entries.push((
                "set_noop_interval".to_string(),
                self.noop_interval.as_secs().to_string(),
            ));
        }
        if self.expiry_opcode {
            entries.push(("enable_expiry_opcode".to_string(), "true".to_string()));
        }
        entries.push((
            "send_stream_end_on_client_close_stream".to_string(),
            "true".to_string(),
        ));
        entries
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("seeds", &self.seeds)
            .field("bucket", &self.bucket)
            .field("connection_name", &self.connection_name)
            .field("buffer_bytes", &self.buffer_bytes)
            .field("noop_interval", &self.noop_interval)
            .field("mitigation", &self.mitigation)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ClientConfig {
        ClientConfig::new(
            vec!["127.0.0.1".into()],
            "travel-sample",
            Arc::new(StaticCredentials::new("user", "pass")),
        )
    }

    #[test]
    fn test_control_entries_fixed_order() {
        let entries = config().control_entries();
        let keys: Vec<&str> = entries.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(
            keys,
            vec![
                "connection_buffer_size",
                "enable_noop",
                "set_noop_interval",
                "enable_expiry_opcode",
                "send_stream_end_on_client_close_stream",
            ]
        );
    }

    #[test]
    fn test_noop_disabled_drops_interval_entry() {
        let mut cfg = config();
        cfg.noop_enabled = false;
        let keys: Vec<String> = cfg.control_entries().into_iter().map(|(k, _)| k).collect();
        assert!(!keys.contains(&"enable_noop".to_string()));
        assert!(!keys.contains(&"set_noop_interval".to_string()));
    }

    #[test]
    fn test_handshake_timeout_disabled_by_zero_grace() {
        let mut cfg = config();
        assert!(cfg.handshake_timeout().is_some());
        cfg.connect_callback_grace_period = Duration::ZERO;
        assert!(cfg.handshake_timeout().is_none());
    }

    #[test]
    fn test_validate_rejects_empty_seeds() {
        let mut cfg = config();
        cfg.seeds.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_collections_filter_json() {
        let empty = CollectionsFilter::default();
        assert!(empty.to_stream_filter_json().is_none());

        let by_scope = CollectionsFilter {
            scope_id: Some(0x8),
            collection_ids: vec![],
        };
        assert_eq!(by_scope.to_stream_filter_json().unwrap(), "{\"scope\":\"8\"}");

        let by_collections = CollectionsFilter {
            scope_id: None,
            collection_ids: vec![0x9, 0xa],
        };
        assert_eq!(
            by_collections.to_stream_filter_json().unwrap(),
            "{\"collections\":[\"9\",\"a\"]}"
        );
    }

    #[test]
    fn test_filter_matching() {
        let filter = CollectionsFilter {
            scope_id: None,
            collection_ids: vec![7],
        };
        assert!(filter.allows_collection(0, 7));
        assert!(!filter.allows_collection(0, 8));
        // Scope events pass only for an unfiltered client.
        assert!(!filter.allows_scope(0));
        assert!(CollectionsFilter::default().allows_scope(0));
    }
}
