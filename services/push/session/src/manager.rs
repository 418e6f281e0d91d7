//! Connection manager for the push gateway
//!
//! The manager is the only component that opens sessions. It keeps at most one
//! live [`Connection`], forwards sends to it, and reacts to its unexpected
//! termination by reconnecting once when persistence is enabled.

use crate::connection::{Connection, Termination};
use crate::error::GatewayError;
use crate::events::GatewayEventHandler;
use crate::message::PushMessage;
use crate::transport::{CredentialBundle, GatewayAddress, SessionFactory, TlsSessionFactory};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock as StdRwLock, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// Configuration for a managed gateway connection
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Client certificate store and passphrase
    pub credentials: CredentialBundle,
    /// Gateway to connect to
    pub address: GatewayAddress,
    /// Reconnect once after every unexpected termination
    pub persistent: bool,
    /// Optional bound on TCP connect plus TLS handshake
    pub connect_timeout: Option<Duration>,
}

impl GatewayConfig {
    /// Production gateway, no persistence, no connect timeout
    pub fn new(credentials: CredentialBundle) -> Self {
        Self {
            credentials,
            address: GatewayAddress::default(),
            persistent: false,
            connect_timeout: None,
        }
    }
}

/// Owner of the gateway connection lifecycle
pub struct ConnectionManager<F: SessionFactory> {
    shared: Arc<Shared<F>>,
}

impl<F: SessionFactory> Clone for ConnectionManager<F> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

struct Shared<F: SessionFactory> {
    factory: F,
    address: GatewayAddress,
    persistent: bool,
    /// The single active connection; swapped whole on (re)connect
    current: RwLock<Option<Arc<Connection<F::Stream>>>>,
    /// Serializes start, reconnect and shutdown
    lifecycle: Mutex<()>,
    next_connection_id: AtomicU64,
    reconnect_attempts: AtomicU64,
    event_handler: StdRwLock<Option<Arc<dyn GatewayEventHandler>>>,
}

impl ConnectionManager<TlsSessionFactory> {
    /// Build the TLS context from `config` and open the first session.
    ///
    /// Configuration and initial handshake errors are returned directly;
    /// there is no background retry for the first attempt.
    pub async fn connect(
        config: GatewayConfig,
        event_handler: Option<Arc<dyn GatewayEventHandler>>,
    ) -> Result<Self, GatewayError> {
        let factory = TlsSessionFactory::new(&config.credentials)?
            .with_connect_timeout(config.connect_timeout);

        let manager = Self::new(factory, config.address, config.persistent);
        if let Some(handler) = event_handler {
            manager.set_event_handler(handler);
        }
        manager.start().await?;
        Ok(manager)
    }
}

impl<F: SessionFactory> ConnectionManager<F> {
    /// Create a disconnected manager around a session factory
    pub fn new(factory: F, address: GatewayAddress, persistent: bool) -> Self {
        Self {
            shared: Arc::new(Shared {
                factory,
                address,
                persistent,
                current: RwLock::new(None),
                lifecycle: Mutex::new(()),
                next_connection_id: AtomicU64::new(1),
                reconnect_attempts: AtomicU64::new(0),
                event_handler: StdRwLock::new(None),
            }),
        }
    }

    /// Set the handler for connection state changes
    pub fn set_event_handler(&self, handler: Arc<dyn GatewayEventHandler>) {
        if let Ok(mut slot) = self.shared.event_handler.write() {
            *slot = Some(handler);
        }
    }

    /// Open a session and install it as the active connection.
    ///
    /// Any connection already active is closed first.
    pub async fn start(&self) -> Result<(), GatewayError> {
        let _lifecycle = self.shared.lifecycle.lock().await;
        self.shared.establish().await.map(|_| ())
    }

    /// Queue one message on the active connection
    pub async fn send(&self, message: impl Into<PushMessage>) -> Result<(), GatewayError> {
        let connection = self.shared.active().await?;
        connection.enqueue(message.into()).await
    }

    /// Queue several messages back to back on the active connection
    pub async fn send_bulk<I, M>(&self, messages: I) -> Result<(), GatewayError>
    where
        I: IntoIterator<Item = M>,
        M: Into<PushMessage>,
    {
        let connection = self.shared.active().await?;
        connection
            .enqueue_bulk(messages.into_iter().map(Into::into))
            .await
    }

    /// Close the active connection without reconnecting
    pub async fn shutdown(&self) {
        let _lifecycle = self.shared.lifecycle.lock().await;
        let previous = self.shared.current.write().await.take();
        if let Some(connection) = previous {
            info!(connection = connection.id(), "Closing push gateway connection");
            connection.close().await;
        }
    }

    /// Whether a live connection is installed
    pub async fn is_connected(&self) -> bool {
        self.shared
            .current
            .read()
            .await
            .as_ref()
            .map(|c| !c.is_terminated())
            .unwrap_or(false)
    }

    /// Gateway this manager dials
    pub fn address(&self) -> &GatewayAddress {
        &self.shared.address
    }

    /// Whether unexpected terminations trigger a reconnect
    pub fn is_persistent(&self) -> bool {
        self.shared.persistent
    }

    /// Reconnects attempted so far
    pub fn reconnect_attempts(&self) -> u64 {
        self.shared.reconnect_attempts.load(Ordering::SeqCst)
    }
}

impl<F: SessionFactory> Shared<F> {
    fn event_handler(&self) -> Option<Arc<dyn GatewayEventHandler>> {
        self.event_handler.read().ok().and_then(|h| h.clone())
    }

    async fn active(&self) -> Result<Arc<Connection<F::Stream>>, GatewayError> {
        self.current
            .read()
            .await
            .clone()
            .ok_or(GatewayError::NotConnected)
    }

    /// Open a session and swap it in; caller holds `lifecycle`
    async fn establish(self: &Arc<Self>) -> Result<u64, GatewayError> {
        let previous = self.current.write().await.take();
        if let Some(previous) = previous {
            debug!(connection = previous.id(), "Closing connection before opening a new one");
            previous.close().await;
        }

        let stream = self.factory.open_session(&self.address).await?;
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::SeqCst);
        let (connection, terminated) = Connection::open(connection_id, stream);

        *self.current.write().await = Some(connection);
        Self::watch(Arc::downgrade(self), terminated);

        info!(connection = connection_id, "Connected to push gateway {}", self.address);
        if let Some(handler) = self.event_handler() {
            handler.notify_connected(connection_id, &self.address);
        }
        Ok(connection_id)
    }

    /// Wait for the connection's termination on a separate task
    fn watch(shared: Weak<Self>, terminated: oneshot::Receiver<Termination>) {
        tokio::spawn(async move {
            let termination = match terminated.await {
                Ok(termination) => termination,
                // Closed on purpose or replaced
                Err(_) => return,
            };
            if let Some(shared) = shared.upgrade() {
                shared.on_termination(termination).await;
            }
        });
    }

    async fn on_termination(self: Arc<Self>, termination: Termination) {
        warn!(
            connection = termination.connection_id,
            "Unexpected shutdown of push gateway connection: {}", termination.reason
        );

        if termination.dropped > 0 {
            warn!(
                connection = termination.connection_id,
                "{} queued message(s) were not transmitted and are dropped", termination.dropped
            );
        }
        if let Some(handler) = self.event_handler() {
            handler.notify_terminated(&termination);
        }

        let _lifecycle = self.lifecycle.lock().await;
        {
            let mut current = self.current.write().await;
            match current.as_ref() {
                Some(active) if active.id() == termination.connection_id => {
                    current.take();
                }
                _ => {
                    debug!(
                        connection = termination.connection_id,
                        "Terminated connection was already replaced; not reconnecting"
                    );
                    return;
                }
            }
        }

        if !self.persistent {
            info!("Persistence disabled; staying disconnected until restarted");
            return;
        }

        self.reconnect_attempts.fetch_add(1, Ordering::SeqCst);
        match self.establish().await {
            Ok(connection_id) => {
                info!(connection = connection_id, "Reconnected to push gateway {}", self.address);
                if let Some(handler) = self.event_handler() {
                    handler.notify_reconnected(connection_id);
                }
            }
            Err(e) => {
                error!("Reconnect to push gateway {} failed: {}", self.address, e);
                if let Some(handler) = self.event_handler() {
                    handler.notify_reconnect_failed(e.to_string());
                }
            }
        }
    }
}
