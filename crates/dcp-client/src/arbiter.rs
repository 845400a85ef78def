//! Bucket config arbitration.
//!
//! Cluster maps arrive from several sources at once: the bootstrap
//! fetch, server pushes on any channel, explicit GET_CLUSTER_CONFIG
//! responses, and NotMyVbucket bodies. Every one of them funnels
//! through the arbiter, which keeps only strictly fresher revisions and
//! publishes the winner to subscribers.

use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tracing::{debug, info};

use crate::cluster_map::ClusterMap;
use crate::error::{DcpError, DcpResult};

pub struct BucketConfigArbiter {
    /// Serializes accept decisions; the watch carries the result.
    current: Mutex<Option<Arc<ClusterMap>>>,
    tx: watch::Sender<Option<Arc<ClusterMap>>>,
}

impl BucketConfigArbiter {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self {
            current: Mutex::new(None),
            tx,
        }
    }

    /// Offer a parsed map. Returns true when it superseded the current
    /// one. A map whose `(rev_epoch, rev)` is not strictly greater is
    /// dropped; on an exact tie the first arrival wins.
    pub fn accept(&self, map: ClusterMap) -> bool {
        let mut current = self.current.lock().expect("arbiter lock poisoned");

        if let Some(existing) = current.as_ref() {
            if !map.is_newer_than(existing) {
                debug!(
                    "config rev ({}, {}) not newer than ({}, {}), dropped",
                    map.rev_epoch, map.rev, existing.rev_epoch, existing.rev
                );
                return false;
            }
        }

        info!(
            "bucket config rev ({}, {}) accepted, {} nodes, {} vbuckets",
            map.rev_epoch,
            map.rev,
            map.nodes.len(),
            map.num_vbuckets()
        );
        let map = Arc::new(map);
        *current = Some(map.clone());
        let _ = self.tx.send(Some(map));
        true
    }

    /// Offer a raw config JSON document as pushed by a server.
    pub fn accept_json(&self, json: &str, origin_host: &str) -> DcpResult<bool> {
        let map = ClusterMap::parse(json, origin_host)?;
        Ok(self.accept(map))
    }

    pub fn current(&self) -> Option<Arc<ClusterMap>> {
        self.current.lock().expect("arbiter lock poisoned").clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<ClusterMap>>> {
        self.tx.subscribe()
    }

    /// Wait until a map with vbucket assignments is available. A config
    /// published for a just-created bucket has an empty vbucket map and
    /// does not satisfy this.
    pub async fn wait_for_ready(&self) -> DcpResult<Arc<ClusterMap>> {
        let mut rx = self.subscribe();
        loop {
            if let Some(map) = rx.borrow_and_update().clone() {
                if map.is_ready() {
                    return Ok(map);
                }
            }
            rx.changed().await.map_err(|_| DcpError::Shutdown)?;
        }
    }
}

impl Default for BucketConfigArbiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster_map::NodeEndpoint;

    fn map(rev_epoch: u64, rev: u64, vbuckets: usize) -> ClusterMap {
        ClusterMap {
            rev_epoch,
            rev,
            nodes: vec![NodeEndpoint::new("n1", 11210)],
            chains: vec![vec![0]; vbuckets],
        }
    }

    #[test]
    fn test_stale_and_duplicate_revisions_rejected() {
        let arbiter = BucketConfigArbiter::new();
        assert!(arbiter.accept(map(1, 5, 4)));
        // Same revision: first one wins.
        assert!(!arbiter.accept(map(1, 5, 8)));
        // Older: rejected.
        assert!(!arbiter.accept(map(1, 4, 4)));
        assert!(!arbiter.accept(map(0, 99, 4)));
        // Strictly newer: accepted.
        assert!(arbiter.accept(map(1, 6, 4)));
        assert!(arbiter.accept(map(2, 0, 4)));

        let current = arbiter.current().unwrap();
        assert_eq!((current.rev_epoch, current.rev), (2, 0));
    }

    #[tokio::test]
    async fn test_wait_for_ready_skips_empty_maps() {
        let arbiter = Arc::new(BucketConfigArbiter::new());
        // Bucket-just-created config: no assignments yet.
        arbiter.accept(map(1, 1, 0));

        let waiter = {
            let arbiter = arbiter.clone();
            tokio::spawn(async move { arbiter.wait_for_ready().await })
        };
        // Give the waiter a chance to observe the not-ready map.
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        arbiter.accept(map(1, 2, 16));
        let ready = waiter.await.unwrap().unwrap();
        assert_eq!(ready.num_vbuckets(), 16);
    }

    #[tokio::test]
    async fn test_subscribers_see_accepted_maps() {
        let arbiter = BucketConfigArbiter::new();
        let mut rx = arbiter.subscribe();
        arbiter.accept(map(1, 1, 4));
        rx.changed().await.unwrap();
        let seen = rx.borrow().clone().unwrap();
        assert_eq!(seen.rev, 1);
    }
}
