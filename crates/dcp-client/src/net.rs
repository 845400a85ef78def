//! Socket construction for channels and bootstrap.

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

use crate::cluster_map::NodeEndpoint;
use crate::error::{DcpError, DcpResult};

/// Abstraction over how sockets to data nodes are made, so tests can
/// substitute a loopback dialer.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, node: &NodeEndpoint, timeout: Duration) -> DcpResult<TcpStream>;
}

/// Default kernel-TCP connector.
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, node: &NodeEndpoint, timeout: Duration) -> DcpResult<TcpStream> {
        let target = node.to_string();
        debug!("connecting to {}", target);

        let stream = tokio::time::timeout(timeout, TcpStream::connect(&target))
            .await
            .map_err(|_| DcpError::Timeout(format!("connect to {}", target)))??;

        stream.set_nodelay(true).ok();
        Ok(stream)
    }
}
