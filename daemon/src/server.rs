/// Coordination server: lifecycle and public API
///
/// ```text
///   Stopped ──start()──► Starting ──► Running ──stop()──► Stopping ──► Stopped
///      ▲                    │ store/bind failure
///      └────────────────────┘
/// ```
///
/// `start()` connects the channel store and subscribes, binds the WebSocket
/// listener, and spawns the accept loop, the health ticker and (optionally)
/// the metrics endpoint. Every background task listens on one broadcast
/// shutdown channel.
use crate::config::{DaemonConfig, StoreBackend};
use crate::errors::{DaemonError, DaemonResult};
use crate::metrics_endpoint;
use crate::redis_store::RedisStore;
use crate::session;
use agentlink_core::{
    ChannelStore, Connection, DeadLetter, Envelope, EnvelopeDraft, Hub, HubError, MemoryStore,
    MetricsSnapshot, RegistryEvent,
};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Lifecycle state of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Background work owned by a running server.
#[derive(Default)]
struct RunningTasks {
    shutdown_tx: Option<broadcast::Sender<()>>,
    accept: Option<JoinHandle<()>>,
    background: Vec<JoinHandle<()>>,
}

pub struct CoordinationServer {
    config: DaemonConfig,
    hub: Arc<Hub>,
    state: RwLock<ServiceState>,
    tasks: Mutex<RunningTasks>,
    local_addr: RwLock<Option<SocketAddr>>,
    metrics_addr: RwLock<Option<SocketAddr>>,
}

impl CoordinationServer {
    /// Build a server with the store named in the configuration.
    pub fn new(config: DaemonConfig) -> DaemonResult<Self> {
        let store: Arc<dyn ChannelStore> = match config.store.backend {
            StoreBackend::Redis => Arc::new(RedisStore::with_connection_info(
                config.store.connection_info(),
            )?),
            StoreBackend::Memory => Arc::new(MemoryStore::new()),
        };
        Self::with_store(config, store)
    }

    /// Build a server on an explicit store.
    pub fn with_store(config: DaemonConfig, store: Arc<dyn ChannelStore>) -> DaemonResult<Self> {
        config.validate()?;
        let hub = Hub::new(store, config.hub.clone())?;
        Ok(Self {
            config,
            hub,
            state: RwLock::new(ServiceState::Stopped),
            tasks: Mutex::new(RunningTasks::default()),
            local_addr: RwLock::new(None),
            metrics_addr: RwLock::new(None),
        })
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    pub async fn start(&self) -> DaemonResult<()> {
        {
            let mut state = self.state.write();
            match *state {
                ServiceState::Running => {
                    warn!("Coordination server is already running");
                    return Ok(());
                }
                ServiceState::Starting | ServiceState::Stopping => {
                    return Err(DaemonError::Server(format!(
                        "Cannot start while {:?}",
                        *state
                    )));
                }
                ServiceState::Stopped => *state = ServiceState::Starting,
            }
        }

        match self.start_inner().await {
            Ok(addr) => {
                *self.state.write() = ServiceState::Running;
                info!("Coordination server listening on ws://{}", addr);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Coordination server failed to start");
                self.teardown().await;
                *self.state.write() = ServiceState::Stopped;
                Err(e)
            }
        }
    }

    async fn start_inner(&self) -> DaemonResult<SocketAddr> {
        self.hub.connect().await.map_err(store_error)?;

        let (shutdown_tx, _) = broadcast::channel(16);
        self.tasks.lock().shutdown_tx = Some(shutdown_tx.clone());

        let pump = self
            .hub
            .start_pump(shutdown_tx.subscribe())
            .await
            .map_err(store_error)?;
        self.tasks.lock().background.push(pump);

        let addr = format!("{}:{}", self.config.server.host, self.config.server.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| DaemonError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;
        *self.local_addr.write() = Some(local_addr);

        if self.config.server.enable_metrics {
            let metrics_addr: SocketAddr = format!(
                "{}:{}",
                self.config.server.host, self.config.server.metrics_port
            )
            .parse()
            .map_err(|e| DaemonError::Config(format!("Invalid metrics address: {}", e)))?;
            let (bound, handle) =
                metrics_endpoint::spawn(metrics_addr, self.hub.clone(), shutdown_tx.subscribe())?;
            *self.metrics_addr.write() = Some(bound);
            self.tasks.lock().background.push(handle);
        }

        let monitor = self.hub.spawn_monitor(shutdown_tx.subscribe());
        let accept = tokio::spawn(accept_loop(listener, self.hub.clone(), shutdown_tx));

        let mut tasks = self.tasks.lock();
        tasks.background.push(monitor);
        tasks.accept = Some(accept);
        Ok(local_addr)
    }

    /// Stop accepting, close every session and disconnect the store.
    pub async fn stop(&self) -> DaemonResult<()> {
        {
            let mut state = self.state.write();
            if *state != ServiceState::Running {
                debug!("Stop requested while {:?}; nothing to do", *state);
                return Ok(());
            }
            *state = ServiceState::Stopping;
        }

        info!("Stopping coordination server...");
        self.teardown().await;
        *self.state.write() = ServiceState::Stopped;
        info!("Coordination server stopped");
        Ok(())
    }

    async fn teardown(&self) {
        let RunningTasks {
            shutdown_tx,
            accept,
            background,
        } = std::mem::take(&mut *self.tasks.lock());

        if let Some(tx) = shutdown_tx {
            let _ = tx.send(());
        }
        self.hub.close_sessions();

        // the listener is dropped when the accept loop returns
        if let Some(accept) = accept {
            let _ = accept.await;
        }
        for task in background {
            let _ = task.await;
        }

        if let Err(e) = self.hub.disconnect().await {
            warn!(error = %e, "Failed to disconnect channel store");
        }
        *self.local_addr.write() = None;
        *self.metrics_addr.write() = None;
    }

    pub fn state(&self) -> ServiceState {
        *self.state.read()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ServiceState::Running
    }

    /// Address of the WebSocket listener while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read()
    }

    /// Address of the metrics endpoint while running, if enabled.
    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        *self.metrics_addr.read()
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    // ========================================================================
    // Public API
    // ========================================================================

    pub async fn send_message(&self, draft: EnvelopeDraft) -> DaemonResult<Envelope> {
        Ok(self.hub.send_message(draft).await?)
    }

    pub fn get_metrics(&self) -> MetricsSnapshot {
        self.hub.metrics_snapshot(self.is_running())
    }

    pub fn get_clients(&self) -> Vec<Connection> {
        self.hub.get_clients()
    }

    pub fn get_buffered_messages(&self, agent_id: &str) -> Vec<Envelope> {
        self.hub.get_buffered_messages(agent_id)
    }

    pub fn clear_buffer(&self, agent_id: &str) -> usize {
        self.hub.clear_buffer(agent_id)
    }

    pub fn get_dead_letters(&self) -> Vec<DeadLetter> {
        self.hub.get_dead_letters()
    }

    pub async fn fetch_persisted(&self, envelope_id: &str) -> DaemonResult<Option<Envelope>> {
        Ok(self.hub.fetch_persisted(envelope_id).await?)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<RegistryEvent> {
        self.hub.subscribe_events()
    }
}

fn store_error(e: HubError) -> DaemonError {
    match e {
        HubError::Channel(store) => DaemonError::Store(store),
        other => DaemonError::Hub(other),
    }
}

async fn accept_loop(listener: TcpListener, hub: Arc<Hub>, shutdown_tx: broadcast::Sender<()>) {
    let mut shutdown_rx = shutdown_tx.subscribe();
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                debug!("Accept loop shutting down");
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        debug!(peer = %peer, "Accepted connection");
                        let hub = hub.clone();
                        let session_shutdown = shutdown_tx.subscribe();
                        tokio::spawn(async move {
                            if let Err(e) = session::handle_connection(stream, peer, hub, session_shutdown).await {
                                debug!(peer = %peer, error = %e, "Session ended with error");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                    }
                }
            }
        }
    }
}
