//! Host-facing client facade.
//!
//! Wires the pieces together: bootstrap fetches the first config, the
//! arbiter arbitrates revisions, the conductor owns channels, channels
//! own streams, and the session store carries resume positions across
//! all of it. Hosts interact only with this type and their listener.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::info;

use dcp_proto::messages::FailoverLog;

use crate::arbiter::BucketConfigArbiter;
use crate::bootstrap;
use crate::conductor::{self, ConductorCommand, ConductorHandle, StreamFrom, StreamTo};
use crate::config::ClientConfig;
use crate::error::{DcpError, DcpResult};
use crate::flow_control::FlowControlMode;
use crate::listener::DatabaseChangeListener;
use crate::net::{Connector, TcpConnector};
use crate::session::{SessionSnapshot, SessionStore};

/// Delay between bootstrap attempts while a just-created bucket has no
/// vbucket assignments yet.
const BOOTSTRAP_RETRY_DELAY: Duration = Duration::from_millis(200);

struct ClientState {
    config: ClientConfig,
    sessions: Option<Arc<SessionStore>>,
    conductor: Option<ConductorHandle>,
    /// Snapshot handed in before connect, applied once the partition
    /// count is known.
    pending_restore: Option<SessionSnapshot>,
}

/// A DCP client for one bucket.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    arbiter: Arc<BucketConfigArbiter>,
    connector: Arc<dyn Connector>,
    listener: RwLock<Option<Arc<dyn DatabaseChangeListener>>>,
    state: Mutex<ClientState>,
}

impl Client {
    pub fn new(config: ClientConfig) -> DcpResult<Self> {
        Self::with_connector(config, Arc::new(TcpConnector))
    }

    /// Same as [`Client::new`] with a custom dialer (tests, proxies).
    pub fn with_connector(config: ClientConfig, connector: Arc<dyn Connector>) -> DcpResult<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(ClientInner {
                arbiter: Arc::new(BucketConfigArbiter::new()),
                connector,
                listener: RwLock::new(None),
                state: Mutex::new(ClientState {
                    config,
                    sessions: None,
                    conductor: None,
                    pending_restore: None,
                }),
            }),
        })
    }

    /// Register the change listener. Must happen before `connect`.
    pub fn listener(&self, listener: Arc<dyn DatabaseChangeListener>) {
        *self.inner.listener.write().expect("listener lock poisoned") = Some(listener);
    }

    /// Change the flow-control mode. Only callable before `connect`.
    pub async fn flow_control_mode(&self, mode: FlowControlMode) -> DcpResult<()> {
        let mut state = self.inner.state.lock().await;
        if state.conductor.is_some() {
            return Err(DcpError::Config(
                "flow control mode cannot change while connected".into(),
            ));
        }
        state.config.flow_control_mode = mode;
        Ok(())
    }

    /// Bootstrap from the seeds and start the conductor.
    ///
    /// Blocks until a config with vbucket assignments is available; a
    /// bucket that was just created publishes an empty map first.
    pub async fn connect(&self) -> DcpResult<()> {
        let listener = self
            .inner
            .listener
            .read()
            .expect("listener lock poisoned")
            .clone()
            .ok_or_else(|| DcpError::Config("no listener registered".into()))?;

        let mut state = self.inner.state.lock().await;
        if state.conductor.is_some() {
            return Err(DcpError::Config("already connected".into()));
        }

        loop {
            let map = bootstrap::fetch_initial_config(&state.config, &self.inner.connector).await?;
            let ready = map.is_ready();
            self.inner.arbiter.accept(map);
            if ready {
                break;
            }
            info!("bucket has no vbucket assignments yet, retrying bootstrap");
            tokio::time::sleep(BOOTSTRAP_RETRY_DELAY).await;
        }

        let map = self
            .inner
            .arbiter
            .current()
            .ok_or(DcpError::NotConnected)?;
        let sessions = match &state.sessions {
            // Reconnect with retained state.
            Some(sessions) if sessions.num_vbuckets() == map.num_vbuckets() => sessions.clone(),
            _ => Arc::new(SessionStore::new(map.num_vbuckets())),
        };
        if let Some(snapshot) = state.pending_restore.take() {
            sessions.restore(snapshot)?;
        }

        info!(
            "connected to bucket '{}' ({} vbuckets, {} nodes)",
            state.config.bucket,
            map.num_vbuckets(),
            map.nodes.len()
        );

        let handle = conductor::spawn(
            state.config.clone(),
            sessions.clone(),
            self.inner.arbiter.clone(),
            listener,
            self.inner.connector.clone(),
        );
        state.sessions = Some(sessions);
        state.conductor = Some(handle);
        Ok(())
    }

    /// Close every channel. In-flight frames are drained, not
    /// delivered. Session state is retained for a later reconnect.
    pub async fn disconnect(&self) -> DcpResult<()> {
        let conductor = {
            let mut state = self.inner.state.lock().await;
            state.conductor.take()
        };
        match conductor {
            Some(handle) => {
                handle.shutdown().await;
                Ok(())
            }
            None => Err(DcpError::NotConnected),
        }
    }

    /// Open streams for the given vbuckets.
    pub async fn stream_partitions(
        &self,
        vbuckets: Vec<u16>,
        from: StreamFrom,
        to: StreamTo,
    ) -> DcpResult<()> {
        let (reply, response) = tokio::sync::oneshot::channel();
        self.with_conductor(|c| {
            c.send(ConductorCommand::StreamPartitions {
                vbuckets,
                from,
                to,
                reply,
            })
        })
        .await?;
        response.await.map_err(|_| DcpError::Shutdown)?
    }

    /// Stream every partition of the bucket.
    pub async fn stream_all(&self, from: StreamFrom, to: StreamTo) -> DcpResult<()> {
        let num = self.num_vbuckets().await?;
        self.stream_partitions((0..num).collect(), from, to).await
    }

    /// Ask the server to close streams for the given vbuckets.
    pub async fn stop_streams(&self, vbuckets: Vec<u16>) -> DcpResult<()> {
        self.with_conductor(|c| c.send(ConductorCommand::StopStreams { vbuckets }))
            .await
    }

    /// Resolves once every requested finite stream has completed.
    pub async fn wait_until_done(&self) -> DcpResult<()> {
        let handle = {
            let state = self.inner.state.lock().await;
            match &state.conductor {
                Some(c) => c.done_subscription(),
                None => return Err(DcpError::NotConnected),
            }
        };
        ConductorHandle::wait_on(handle).await
    }

    /// Current failover log for one vbucket, fetched from its owner.
    pub async fn get_failover_log(&self, vbucket: u16) -> DcpResult<FailoverLog> {
        let (reply, response) = tokio::sync::oneshot::channel();
        self.with_conductor(|c| c.send(ConductorCommand::GetFailoverLog { vbucket, reply }))
            .await?;
        response.await.map_err(|_| DcpError::Shutdown)?
    }

    /// Partition count of the bucket (available once connected).
    pub async fn num_vbuckets(&self) -> DcpResult<u16> {
        let state = self.inner.state.lock().await;
        state
            .sessions
            .as_ref()
            .map(|s| s.num_vbuckets())
            .ok_or(DcpError::NotConnected)
    }

    /// Canonical snapshot of every vbucket's resume state.
    pub async fn session_state(&self) -> DcpResult<SessionSnapshot> {
        let state = self.inner.state.lock().await;
        state
            .sessions
            .as_ref()
            .map(|s| s.snapshot())
            .ok_or(DcpError::NotConnected)
    }

    /// Restore a previously captured snapshot. Before `connect` the
    /// snapshot is held and applied during connection; afterwards it
    /// replaces the live state (only safe while no streams are open).
    pub async fn restore_session_state(&self, snapshot: SessionSnapshot) -> DcpResult<()> {
        let mut state = self.inner.state.lock().await;
        match &state.sessions {
            Some(sessions) => sessions.restore(snapshot),
            None => {
                state.pending_restore = Some(snapshot);
                Ok(())
            }
        }
    }

    async fn with_conductor<R>(&self, f: impl FnOnce(&ConductorHandle) -> R) -> DcpResult<R> {
        let state = self.inner.state.lock().await;
        match &state.conductor {
            Some(conductor) => Ok(f(conductor)),
            None => Err(DcpError::NotConnected),
        }
    }
}
