//! Seed bootstrap: obtain the first bucket config.
//!
//! Before the conductor can place channels it needs a cluster map.
//! Bootstrap walks the seed list, performs the minimal exchange
//! (authenticate, select bucket, GET_CLUSTER_CONFIG) on a throwaway
//! connection, and hands the parsed map to the arbiter. Subsequent
//! revisions arrive through server pushes on the DCP channels.

use std::sync::Arc;

use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use dcp_proto::frame::{read_frame, Frame};
use dcp_proto::messages;
use dcp_proto::MAX_FRAME_BYTES;

use crate::cluster_map::{ClusterMap, NodeEndpoint};
use crate::config::ClientConfig;
use crate::error::{DcpError, DcpResult, HandshakePhase};
use crate::net::Connector;

/// Try each seed in order until one yields a config. Permanent errors
/// (bad credentials, missing bucket) abort immediately: every other
/// seed would refuse us the same way.
pub async fn fetch_initial_config(
    config: &ClientConfig,
    connector: &Arc<dyn Connector>,
) -> DcpResult<ClusterMap> {
    let mut last_error = None;
    for seed in &config.seeds {
        let node = NodeEndpoint::parse(seed)?;
        debug!("bootstrapping from seed {}", node);
        match fetch_from(&node, config, connector).await {
            Ok(map) => return Ok(map),
            Err(e) if e.is_permanent() => return Err(e),
            Err(e) => {
                warn!("seed {} failed: {}", node, e);
                last_error = Some(e);
            }
        }
    }
    Err(last_error
        .unwrap_or_else(|| DcpError::Config("no seed nodes configured".into())))
}

async fn fetch_from(
    node: &NodeEndpoint,
    config: &ClientConfig,
    connector: &Arc<dyn Connector>,
) -> DcpResult<ClusterMap> {
    let stream = connector
        .connect(node, config.socket_connect_timeout)
        .await?;
    let (mut rd, mut wr) = tokio::io::split(stream);

    let exchange = async {
        let credentials = config.credentials.get(&node.to_string());

        let auth = roundtrip(
            &mut rd,
            &mut wr,
            messages::sasl_auth_plain(1, &credentials.username, &credentials.password),
        )
        .await?;
        if !auth.status().is_success() {
            return Err(DcpError::Handshake {
                phase: HandshakePhase::Auth,
                detail: format!("authentication rejected: {}", auth.status()),
                permanent: true,
            });
        }

        let selected = roundtrip(&mut rd, &mut wr, messages::select_bucket(2, &config.bucket))
            .await?;
        if !selected.status().is_success() {
            let status = selected.status();
            return Err(DcpError::Handshake {
                phase: HandshakePhase::SelectBucket,
                detail: format!("select bucket '{}': {}", config.bucket, status),
                permanent: status.is_permanent(),
            });
        }

        let reply = roundtrip(&mut rd, &mut wr, messages::get_cluster_config(3)).await?;
        if !reply.status().is_success() {
            return Err(DcpError::Request(reply.status()));
        }
        let json = String::from_utf8_lossy(&reply.value);
        ClusterMap::parse(&json, &node.host)
    };

    match config.handshake_timeout() {
        Some(deadline) => match tokio::time::timeout(deadline, exchange).await {
            Ok(result) => result,
            Err(_) => Err(DcpError::Timeout(format!("bootstrap from {}", node))),
        },
        None => exchange.await,
    }
}

async fn roundtrip(
    rd: &mut ReadHalf<TcpStream>,
    wr: &mut WriteHalf<TcpStream>,
    frame: Frame,
) -> DcpResult<Frame> {
    let opaque = frame.opaque;
    wr.write_all(&frame.encode()).await?;
    loop {
        let frame = match read_frame(rd, MAX_FRAME_BYTES).await? {
            Some(frame) => frame,
            None => {
                return Err(DcpError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "server closed the connection",
                )))
            }
        };
        if frame.is_response() && frame.opaque == opaque {
            return Ok(frame);
        }
        // Bootstrap connections have no streams; anything unsolicited
        // is dropped.
        debug!("bootstrap: ignoring {} frame", frame.opcode);
    }
}
