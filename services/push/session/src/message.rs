//! Opaque outbound notification payloads.

use bytes::Bytes;

/// An already-serialized push notification.
///
/// The connection never inspects the payload; it writes the bytes to the
/// session verbatim and in submission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushMessage {
    payload: Bytes,
}

impl PushMessage {
    /// Wrap a serialized payload
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    /// Raw bytes as written to the session
    pub fn as_bytes(&self) -> &[u8] {
        &self.payload
    }

    /// Payload length in bytes
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is empty
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

impl From<Bytes> for PushMessage {
    fn from(payload: Bytes) -> Self {
        Self { payload }
    }
}

impl From<Vec<u8>> for PushMessage {
    fn from(payload: Vec<u8>) -> Self {
        Self::new(payload)
    }
}

impl From<&'static [u8]> for PushMessage {
    fn from(payload: &'static [u8]) -> Self {
        Self::new(Bytes::from_static(payload))
    }
}
