//! Gateway error types.

use crate::transport::GatewayAddress;
use thiserror::Error;

/// Errors surfaced to callers of the connection manager
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Bad credential bundle or passphrase; never retried
    #[error("configuration error: {0}")]
    Config(String),

    /// Network or TLS failure while opening a session
    #[error("handshake with {address} failed: {source}")]
    Handshake {
        /// Gateway that was being dialed
        address: GatewayAddress,
        /// Underlying transport or TLS error
        #[source]
        source: std::io::Error,
    },

    /// No live connection to hand the message to
    #[error("not connected to the push gateway")]
    NotConnected,
}

impl GatewayError {
    pub(crate) fn handshake(address: &GatewayAddress, source: std::io::Error) -> Self {
        GatewayError::Handshake {
            address: address.clone(),
            source,
        }
    }
}
