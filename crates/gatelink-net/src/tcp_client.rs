//! TCP client for connecting to game backends.
//!
//! [`GameClient`] is the surface application code talks to: it resolves an
//! endpoint, refuses duplicate connections through its [`ConnectionManager`],
//! starts the connection, and cleans it up once it disconnects.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::oneshot;

use crate::connection::{ConnectError, Connection, ConnectionConfig, Disconnect};
use crate::dispatch::DispatchRegistry;
use crate::framing::FrameError;
use crate::manager::{ConnectionManager, key_for};
use crate::service::ServiceCategory;

/// A started connection plus its disconnect notification.
pub struct ClientSession {
    /// The live connection.
    pub connection: Arc<Connection>,
    /// Resolves once with the reason the connection ended.
    pub disconnected: oneshot::Receiver<Disconnect>,
}

impl ClientSession {
    /// Queue a frame on this session's connection.
    pub fn send(&self, message_id: u32, payload: &[u8]) -> Result<(), FrameError> {
        self.connection.send(message_id, payload)
    }

    /// The remote endpoint.
    pub fn remote_addr(&self) -> SocketAddr {
        self.connection.remote_addr()
    }
}

/// Connects to backends and tracks the resulting connections.
pub struct GameClient {
    registry: Arc<DispatchRegistry>,
    manager: Arc<ConnectionManager>,
    config: ConnectionConfig,
}

impl GameClient {
    /// Create a client with its own [`ConnectionManager`].
    pub fn new(registry: Arc<DispatchRegistry>, config: ConnectionConfig) -> Self {
        Self::with_manager(registry, Arc::new(ConnectionManager::new()), config)
    }

    /// Create a client sharing an existing manager.
    pub fn with_manager(
        registry: Arc<DispatchRegistry>,
        manager: Arc<ConnectionManager>,
        config: ConnectionConfig,
    ) -> Self {
        Self {
            registry,
            manager,
            config,
        }
    }

    /// Return the connection manager.
    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Resolve `host:port` and connect to the first address it yields.
    pub async fn connect(
        &self,
        host: &str,
        port: u16,
        categories: ServiceCategory,
    ) -> Result<ClientSession, ConnectError> {
        let remote = tokio::net::lookup_host((host, port))
            .await
            .map_err(|err| ConnectError::Resolve(format!("{host}:{port}: {err}")))?
            .next()
            .ok_or_else(|| ConnectError::Resolve(format!("{host}:{port}")))?;
        self.connect_addr(remote, categories).await
    }

    /// Connect to `remote`, register the connection, and start it.
    ///
    /// Fails with [`ConnectError::AlreadyConnected`] if a connection to the
    /// same endpoint is live.
    pub async fn connect_addr(
        &self,
        remote: SocketAddr,
        categories: ServiceCategory,
    ) -> Result<ClientSession, ConnectError> {
        let key = key_for(remote.ip(), remote.port());
        if self.manager.contains(key).await {
            return Err(ConnectError::AlreadyConnected(remote));
        }

        let connection = Arc::new(
            Connection::connect(
                remote,
                categories,
                Arc::clone(&self.registry),
                self.config.clone(),
            )
            .await?,
        );
        let events = connection.take_disconnect_receiver();

        // Another task may have connected to the same endpoint meanwhile.
        if !self.manager.try_insert(key, Arc::clone(&connection)).await {
            connection.stop().await;
            return Err(ConnectError::AlreadyConnected(remote));
        }

        let (tx, disconnected) = oneshot::channel();
        if let Some(events) = events {
            let manager = Arc::clone(&self.manager);
            let watched = Arc::clone(&connection);
            tokio::spawn(async move {
                let Ok(disconnect) = events.await else {
                    return;
                };
                manager.remove_if_same(key, &watched).await;
                watched.stop().await;
                let _ = tx.send(disconnect);
            });
        }

        Ok(ClientSession {
            connection,
            disconnected,
        })
    }

    /// Stop the connection to `remote`, if any. Returns whether one existed.
    pub async fn disconnect(&self, remote: SocketAddr) -> bool {
        match self.manager.remove(key_for(remote.ip(), remote.port())).await {
            Some(connection) => {
                connection.stop().await;
                true
            }
            None => false,
        }
    }

    /// Stop every connection.
    pub async fn shutdown(&self) {
        self.manager.stop_all().await;
    }
}
