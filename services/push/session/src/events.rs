//! Event notification for gateway connection state changes

use crate::connection::Termination;
use crate::transport::GatewayAddress;
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Trait for observing gateway connection events
pub trait GatewayEventHandler: Send + Sync + std::fmt::Debug {
    /// A session was opened and installed
    fn notify_connected(&self, connection_id: u64, address: &GatewayAddress);
    /// The active connection ended unexpectedly
    fn notify_terminated(&self, termination: &Termination);
    /// A new session replaced a terminated one
    fn notify_reconnected(&self, connection_id: u64);
    /// The single reconnect attempt after a termination failed
    fn notify_reconnect_failed(&self, reason: String);
}

/// Gateway connection events
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    /// Session opened
    Connected {
        /// New connection id
        connection_id: u64,
        /// Gateway the session is attached to
        address: GatewayAddress,
    },
    /// Session ended unexpectedly
    Terminated(Termination),
    /// Session re-established after termination
    Reconnected {
        /// New connection id
        connection_id: u64,
    },
    /// Reconnect attempt failed
    ReconnectFailed {
        /// Error that prevented the reconnect
        reason: String,
    },
}

/// Handler that forwards events over a channel
#[derive(Debug, Clone)]
pub struct GatewayEventNotifier {
    event_tx: mpsc::UnboundedSender<GatewayEvent>,
}

impl GatewayEventNotifier {
    /// Create a notifier and the receiving end of its channel
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<GatewayEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (Self { event_tx }, event_rx)
    }

    fn send_event(&self, event: GatewayEvent) {
        debug!("Gateway event: {:?}", event);
        if let Err(e) = self.event_tx.send(event) {
            error!("Failed to send gateway event: {}", e);
        }
    }
}

impl GatewayEventHandler for GatewayEventNotifier {
    fn notify_connected(&self, connection_id: u64, address: &GatewayAddress) {
        self.send_event(GatewayEvent::Connected {
            connection_id,
            address: address.clone(),
        });
    }

    fn notify_terminated(&self, termination: &Termination) {
        self.send_event(GatewayEvent::Terminated(termination.clone()));
    }

    fn notify_reconnected(&self, connection_id: u64) {
        self.send_event(GatewayEvent::Reconnected { connection_id });
    }

    fn notify_reconnect_failed(&self, reason: String) {
        self.send_event(GatewayEvent::ReconnectFailed { reason });
    }
}
