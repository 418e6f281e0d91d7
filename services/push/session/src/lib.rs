//! Persistent, mutually-authenticated TLS connection to the push gateway.
//!
//! This crate opens client-certificate TLS sessions to the push notification
//! gateway, dispatches pre-serialized notifications over them, and recovers
//! from unexpected session loss.
//!
//! ## Features
//!
//! - **TLS Session Factory**: PKCS#12 credential bundle to a reusable rustls context
//! - **Connection**: FIFO queue with serialized writes onto one session
//! - **Connection Manager**: single active connection, optional reconnect on termination
//! - **Events**: hook for connection state changes
//!
//! ## Example
//!
//! ```rust,no_run
//! use push_session::{ConnectionManager, CredentialBundle, GatewayAddress, GatewayConfig};
//!
//! # async fn example() -> Result<(), push_session::GatewayError> {
//! let credentials = CredentialBundle::from_file("push-cert.p12", "secret")?;
//! let config = GatewayConfig {
//!     address: GatewayAddress::sandbox(),
//!     persistent: true,
//!     ..GatewayConfig::new(credentials)
//! };
//!
//! let manager = ConnectionManager::connect(config, None).await?;
//! manager.send(b"serialized notification".to_vec()).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod connection;
pub mod error;
pub mod events;
pub mod manager;
pub mod message;
pub mod transport;

// Re-export main types
pub use connection::{Connection, ConnectionStats, Termination, TerminationReason};
pub use error::GatewayError;
pub use events::{GatewayEvent, GatewayEventHandler, GatewayEventNotifier};
pub use manager::{ConnectionManager, GatewayConfig};
pub use message::PushMessage;
pub use transport::{
    make_client_config, CredentialBundle, GatewayAddress, GatewayStream, SessionFactory,
    TlsSessionFactory, DEFAULT_PORT, PRODUCTION_HOST, SANDBOX_HOST,
};
