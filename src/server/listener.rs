//! RTMP server listener
//!
//! Accepts sockets, wraps each in a transport and spawns its [`Connection`].
//! Live connections are tracked by session id so the owner can dispose them
//! or sample their bandwidth.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;

use super::config::ServerConfig;
use super::connection::{Connection, ConnectionHandle, ServerContext};
use super::reload::{ConfigStore, VhostReloadEvent};
use crate::error::Result;
use crate::hooks::HookDispatcher;
use crate::protocol::{TransportFactory, UpstreamConnector};
use crate::registry::{RegistryConfig, StreamRegistry};
use crate::stats::KbpsSample;

type ConnectionTable = Arc<Mutex<HashMap<u64, ConnectionHandle>>>;

/// RTMP server
pub struct RtmpServer<F: TransportFactory> {
    factory: Arc<F>,
    ctx: ServerContext,
    registry: Arc<StreamRegistry>,
    connections: ConnectionTable,
    next_session_id: AtomicU64,
    connection_semaphore: Option<Arc<Semaphore>>,
}

impl<F: TransportFactory> RtmpServer<F> {
    /// Create a new server with the given configuration and transport factory
    pub fn new(config: ServerConfig, factory: F) -> Self {
        Self::with_registry_config(config, factory, RegistryConfig::default())
    }

    /// Create a new server with custom registry configuration
    pub fn with_registry_config(
        config: ServerConfig,
        factory: F,
        registry_config: RegistryConfig,
    ) -> Self {
        let connection_semaphore = if config.max_connections > 0 {
            Some(Arc::new(Semaphore::new(config.max_connections)))
        } else {
            None
        };

        let registry = Arc::new(StreamRegistry::with_config(registry_config));
        let ctx = ServerContext::new(
            Arc::new(ConfigStore::new(config)),
            Arc::clone(&registry) as _,
        );

        Self {
            factory: Arc::new(factory),
            ctx,
            registry,
            connections: Arc::new(Mutex::new(HashMap::new())),
            next_session_id: AtomicU64::new(1),
            connection_semaphore,
        }
    }

    /// Deliver lifecycle events to `hooks`
    pub fn with_hooks(mut self, hooks: Arc<dyn HookDispatcher>) -> Self {
        self.ctx = self.ctx.hooks(hooks);
        self
    }

    /// Connector used by edge vhosts for token traverse
    pub fn with_upstream(mut self, upstream: Arc<dyn UpstreamConnector>) -> Self {
        self.ctx = self.ctx.upstream(upstream);
        self
    }

    /// Get a reference to the stream registry
    pub fn registry(&self) -> &Arc<StreamRegistry> {
        &self.registry
    }

    pub fn config(&self) -> Arc<ServerConfig> {
        self.ctx.config.current()
    }

    /// Apply a new configuration to the server and its live connections
    pub fn reload(&self, config: ServerConfig) -> Vec<VhostReloadEvent> {
        self.ctx.config.reload(config)
    }

    /// Number of live connections
    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    /// Handle of a live connection
    pub fn connection(&self, session_id: u64) -> Option<ConnectionHandle> {
        self.connections.lock().get(&session_id).cloned()
    }

    /// Force one connection down; false when no such connection is live
    pub fn dispose(&self, session_id: u64) -> bool {
        match self.connection(session_id) {
            Some(handle) => {
                handle.dispose();
                true
            }
            None => false,
        }
    }

    /// Force every live connection down
    pub fn dispose_all(&self) {
        let handles: Vec<_> = self.connections.lock().values().cloned().collect();
        for handle in handles {
            handle.dispose();
        }
    }

    /// Cumulative bandwidth of every live connection
    pub fn remark_kbps(&self) -> Vec<(u64, KbpsSample)> {
        self.connections
            .lock()
            .values()
            .map(|handle| (handle.id(), handle.remark_kbps()))
            .collect()
    }

    /// Run the server
    ///
    /// This method blocks until the server is shut down.
    pub async fn run(&self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Run the server with graceful shutdown
    ///
    /// On shutdown every live connection is disposed.
    pub async fn run_until<S>(&self, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()>,
    {
        let bind_addr = self.ctx.config.current().bind_addr;
        let listener = TcpListener::bind(bind_addr).await?;
        tracing::info!(addr = %bind_addr, "RTMP server listening");

        let cleanup_handle = self.registry.spawn_cleanup_task();

        let result = tokio::select! {
            _ = shutdown => {
                tracing::info!("Shutdown signal received");
                Ok(())
            }
            result = self.accept_loop(&listener) => result,
        };

        cleanup_handle.abort();
        self.dispose_all();

        result
    }

    async fn accept_loop(&self, listener: &TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((socket, peer_addr)) => {
                    self.handle_connection(socket, peer_addr);
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr) {
        let permit = if let Some(ref sem) = self.connection_semaphore {
            match sem.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    tracing::warn!(peer = %peer_addr, "Connection rejected: limit reached");
                    return;
                }
            }
        } else {
            None
        };

        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(
            session_id = session_id,
            peer = %peer_addr,
            "New connection"
        );

        let transport = match self.factory.create(socket, peer_addr) {
            Ok(transport) => transport,
            Err(e) => {
                tracing::error!(session_id = session_id, error = %e, "Failed to set up transport");
                return;
            }
        };

        let connection = Connection::new(session_id, peer_addr, transport, self.ctx.clone());
        self.connections.lock().insert(session_id, connection.handle());

        let connections = Arc::clone(&self.connections);
        tokio::spawn(async move {
            let _permit = permit;
            // Errors are logged by the connection itself
            let _ = connection.run().await;
            connections.lock().remove(&session_id);
            tracing::debug!(session_id = session_id, "Connection removed");
        });
    }

    /// Get the bind address
    pub fn bind_addr(&self) -> SocketAddr {
        self.ctx.config.current().bind_addr
    }
}
