//! Bucket topology: which node owns which vbucket.
//!
//! The map is parsed from the bucket config JSON the server publishes.
//! Only the fields this client consumes are modeled: the revision pair,
//! the KV node list, and the active entry of the vbucket-to-server map.

use serde::Deserialize;

use crate::error::{DcpError, DcpResult};

/// Network identity of a data node, used as the channel key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeEndpoint {
    pub host: String,
    pub port: u16,
}

impl NodeEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse "host" or "host:port", defaulting to the KV port.
    pub fn parse(s: &str) -> DcpResult<Self> {
        match s.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse()
                    .map_err(|_| DcpError::Config(format!("bad port in '{}'", s)))?;
                Ok(Self::new(host, port))
            }
            None => Ok(Self::new(s, dcp_proto::KV_LISTEN_PORT)),
        }
    }
}

impl std::fmt::Display for NodeEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// One revision of the bucket topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterMap {
    pub rev_epoch: u64,
    pub rev: u64,
    pub nodes: Vec<NodeEndpoint>,
    /// Per vbucket: indexes into `nodes` for the active copy followed
    /// by the replica copies. -1 marks an unassigned slot.
    pub chains: Vec<Vec<i32>>,
}

impl ClusterMap {
    /// Strict freshness ordering on `(rev_epoch, rev)`.
    pub fn is_newer_than(&self, other: &ClusterMap) -> bool {
        (self.rev_epoch, self.rev) > (other.rev_epoch, other.rev)
    }

    /// A map without vbucket assignments is the bucket-just-created
    /// case; consumers must wait for a ready one.
    pub fn is_ready(&self) -> bool {
        !self.chains.is_empty()
    }

    pub fn num_vbuckets(&self) -> u16 {
        self.chains.len() as u16
    }

    /// Active owner of a vbucket. Replicas are never returned here:
    /// streams only ever open against the active copy.
    pub fn owner_of(&self, vbucket: u16) -> Option<&NodeEndpoint> {
        let chain = self.chains.get(vbucket as usize)?;
        match chain.first() {
            Some(&idx) if idx >= 0 => self.nodes.get(idx as usize),
            _ => None,
        }
    }

    /// The nodes holding copies of a vbucket, as (copy index, node)
    /// pairs: copy 0 is the active, 1.. are replicas. Unassigned chain
    /// slots are skipped.
    pub fn copies_of(&self, vbucket: u16, max_copies: usize) -> Vec<(u8, &NodeEndpoint)> {
        let Some(chain) = self.chains.get(vbucket as usize) else {
            return Vec::new();
        };
        chain
            .iter()
            .take(max_copies)
            .enumerate()
            .filter_map(|(copy, &idx)| {
                if idx >= 0 {
                    self.nodes.get(idx as usize).map(|n| (copy as u8, n))
                } else {
                    None
                }
            })
            .collect()
    }

    /// All vbuckets from `interest` that `node` actively owns.
    pub fn vbuckets_owned_by<'a>(
        &self,
        node: &NodeEndpoint,
        interest: impl IntoIterator<Item = &'a u16>,
    ) -> Vec<u16> {
        interest
            .into_iter()
            .copied()
            .filter(|&vb| self.owner_of(vb) == Some(node))
            .collect()
    }

    /// Parse the consumed subset of a bucket config JSON document.
    ///
    /// `origin_host` replaces the server-side `$HOST` placeholder that
    /// appears in configs fetched from a node that does not know its
    /// external name.
    pub fn parse(json: &str, origin_host: &str) -> DcpResult<Self> {
        let raw: BucketConfigJson = serde_json::from_str(json)
            .map_err(|e| DcpError::Config(format!("bucket config unparseable: {}", e)))?;

        let server_map = raw.vbucket_server_map.unwrap_or_default();
        let mut nodes = Vec::with_capacity(server_map.server_list.len());
        for server in &server_map.server_list {
            let resolved = server.replace("$HOST", origin_host);
            nodes.push(NodeEndpoint::parse(&resolved)?);
        }

        Ok(Self {
            rev_epoch: raw.rev_epoch,
            rev: raw.rev,
            nodes,
            chains: server_map.vbucket_map,
        })
    }
}

#[derive(Debug, Deserialize)]
struct BucketConfigJson {
    #[serde(default)]
    rev: u64,
    #[serde(default, rename = "revEpoch")]
    rev_epoch: u64,
    #[serde(rename = "vBucketServerMap")]
    vbucket_server_map: Option<VbucketServerMapJson>,
}

#[derive(Debug, Default, Deserialize)]
struct VbucketServerMapJson {
    #[serde(default, rename = "serverList")]
    server_list: Vec<String>,
    #[serde(default, rename = "vBucketMap")]
    vbucket_map: Vec<Vec<i32>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"{
        "name": "travel-sample",
        "rev": 207,
        "revEpoch": 2,
        "vBucketServerMap": {
            "hashAlgorithm": "CRC",
            "numReplicas": 1,
            "serverList": ["10.0.0.1:11210", "$HOST:11210"],
            "vBucketMap": [[0, 1], [1, 0], [1, -1], [-1, 0]]
        }
    }"#;

    #[test]
    fn test_parse_consumed_fields() {
        let map = ClusterMap::parse(CONFIG, "10.0.0.2").unwrap();
        assert_eq!(map.rev_epoch, 2);
        assert_eq!(map.rev, 207);
        assert_eq!(map.nodes.len(), 2);
        assert_eq!(map.nodes[1], NodeEndpoint::new("10.0.0.2", 11210));
        assert_eq!(map.num_vbuckets(), 4);
    }

    #[test]
    fn test_owner_is_active_copy_only() {
        let map = ClusterMap::parse(CONFIG, "10.0.0.2").unwrap();
        assert_eq!(map.owner_of(0), Some(&NodeEndpoint::new("10.0.0.1", 11210)));
        assert_eq!(map.owner_of(1), Some(&NodeEndpoint::new("10.0.0.2", 11210)));
        assert_eq!(map.owner_of(2), Some(&NodeEndpoint::new("10.0.0.2", 11210)));
        // No active copy: nothing to stream from, replica is not used.
        assert_eq!(map.owner_of(3), None);
        assert_eq!(map.owner_of(100), None);
    }

    #[test]
    fn test_vbuckets_owned_by() {
        let map = ClusterMap::parse(CONFIG, "10.0.0.2").unwrap();
        let interest = vec![0u16, 1, 2, 3];
        let owned = map.vbuckets_owned_by(&NodeEndpoint::new("10.0.0.2", 11210), &interest);
        assert_eq!(owned, vec![1, 2]);
    }

    #[test]
    fn test_freshness_ordering_is_lexicographic() {
        let base = ClusterMap::parse(CONFIG, "h").unwrap();
        let mut newer_rev = base.clone();
        newer_rev.rev += 1;
        let mut newer_epoch = base.clone();
        newer_epoch.rev_epoch += 1;
        newer_epoch.rev = 0;

        assert!(newer_rev.is_newer_than(&base));
        assert!(newer_epoch.is_newer_than(&base));
        assert!(newer_epoch.is_newer_than(&newer_rev));
        assert!(!base.is_newer_than(&base.clone()));
    }

    #[test]
    fn test_empty_vbucket_map_is_not_ready() {
        let map = ClusterMap::parse(r#"{"rev": 1}"#, "h").unwrap();
        assert!(!map.is_ready());
        assert_eq!(map.num_vbuckets(), 0);
    }

    #[test]
    fn test_copies_of_skips_unassigned_slots() {
        let map = ClusterMap::parse(CONFIG, "10.0.0.2").unwrap();
        // vbucket 0: active on node 0, replica on node 1.
        let copies = map.copies_of(0, 2);
        assert_eq!(copies.len(), 2);
        assert_eq!(copies[0].0, 0);
        assert_eq!(copies[1].0, 1);
        // vbucket 2: replica slot is -1.
        let copies = map.copies_of(2, 2);
        assert_eq!(copies.len(), 1);
        // Cap at the active copy only.
        assert_eq!(map.copies_of(0, 1).len(), 1);
    }

    #[test]
    fn test_endpoint_parse_defaults_port() {
        assert_eq!(
            NodeEndpoint::parse("example.org").unwrap(),
            NodeEndpoint::new("example.org", dcp_proto::KV_LISTEN_PORT)
        );
        assert_eq!(
            NodeEndpoint::parse("example.org:9999").unwrap(),
            NodeEndpoint::new("example.org", 9999)
        );
        assert!(NodeEndpoint::parse("example.org:zzz").is_err());
    }
}
