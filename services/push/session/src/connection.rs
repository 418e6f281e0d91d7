//! Message queue and dispatch over a single gateway session.
//!
//! A [`Connection`] owns one session and serializes every write onto it. When
//! the session breaks, the connection terminates for good and reports the
//! reason exactly once through the receiver handed out by [`Connection::open`].

use crate::error::GatewayError;
use crate::message::PushMessage;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace};

/// Why a connection stopped
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// Gateway closed the session
    #[error("closed by gateway")]
    ClosedByPeer,
    /// Reading from the session failed
    #[error("read failed: {0}")]
    ReadFailed(String),
    /// Writing to the session failed
    #[error("write failed: {0}")]
    WriteFailed(String),
}

/// Unexpected termination of a connection
#[derive(Debug, Clone)]
pub struct Termination {
    /// Id of the terminated connection
    pub connection_id: u64,
    /// What ended it
    pub reason: TerminationReason,
    /// Queued messages that were never written and are not carried forward
    pub dropped: usize,
}

/// Counters for a connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Messages fully written to the session
    pub messages_sent: u64,
    /// Payload bytes written to the session
    pub bytes_sent: u64,
}

struct Outbound<S> {
    writer: WriteHalf<S>,
    queue: VecDeque<PushMessage>,
    stats: ConnectionStats,
}

/// Queuing wrapper around exactly one session
pub struct Connection<S> {
    id: u64,
    outbound: Mutex<Outbound<S>>,
    terminated: AtomicBool,
    monitor: StdMutex<Option<oneshot::Sender<Termination>>>,
    watcher: StdMutex<Option<JoinHandle<()>>>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    /// Wrap an open session.
    ///
    /// Returns the connection and a receiver that resolves once if the
    /// session ends unexpectedly. The receiver errors instead when the
    /// connection is closed on purpose or dropped.
    pub fn open(id: u64, stream: S) -> (Arc<Self>, oneshot::Receiver<Termination>) {
        let (reader, writer) = tokio::io::split(stream);
        let (monitor_tx, monitor_rx) = oneshot::channel();

        let connection = Arc::new(Self {
            id,
            outbound: Mutex::new(Outbound {
                writer,
                queue: VecDeque::new(),
                stats: ConnectionStats::default(),
            }),
            terminated: AtomicBool::new(false),
            monitor: StdMutex::new(Some(monitor_tx)),
            watcher: StdMutex::new(None),
        });

        let handle = tokio::spawn(watch_session(Arc::downgrade(&connection), reader));
        if let Ok(mut watcher) = connection.watcher.lock() {
            *watcher = Some(handle);
        }

        debug!(connection = id, "Connection opened");
        (connection, monitor_rx)
    }

    /// Append a message and transmit everything queued
    pub async fn enqueue(&self, message: PushMessage) -> Result<(), GatewayError> {
        self.enqueue_bulk(std::iter::once(message)).await
    }

    /// Append a sequence of messages without interleaving and transmit
    pub async fn enqueue_bulk<I>(&self, messages: I) -> Result<(), GatewayError>
    where
        I: IntoIterator<Item = PushMessage>,
    {
        let mut outbound = self.outbound.lock().await;
        if self.is_terminated() {
            return Err(GatewayError::NotConnected);
        }

        outbound.queue.extend(messages);
        self.transmit(&mut outbound).await;
        Ok(())
    }

    /// Write queued messages in FIFO order, stopping at the first failure
    async fn transmit(&self, outbound: &mut Outbound<S>) {
        let mut written = 0usize;

        while let Some(message) = outbound.queue.front() {
            let len = message.len();
            if let Err(e) = outbound.writer.write_all(message.as_bytes()).await {
                let dropped = outbound.queue.len();
                outbound.queue.clear();
                error!(connection = self.id, "Failed to write message: {}", e);
                self.terminate(TerminationReason::WriteFailed(e.to_string()), dropped);
                return;
            }
            outbound.queue.pop_front();
            outbound.stats.messages_sent += 1;
            outbound.stats.bytes_sent += len as u64;
            written += 1;
        }

        if let Err(e) = outbound.writer.flush().await {
            error!(connection = self.id, "Failed to flush session: {}", e);
            self.terminate(TerminationReason::WriteFailed(e.to_string()), 0);
            return;
        }

        trace!(connection = self.id, "Transmitted {} message(s)", written);
    }

    /// Close the session on purpose; the monitor is not notified
    pub async fn close(&self) {
        self.terminated.store(true, Ordering::SeqCst);
        if let Ok(mut monitor) = self.monitor.lock() {
            monitor.take();
        }
        self.stop_watcher();

        let mut outbound = self.outbound.lock().await;
        outbound.queue.clear();
        if let Err(e) = outbound.writer.shutdown().await {
            debug!(connection = self.id, "Session shutdown error: {}", e);
        }
        debug!(connection = self.id, "Connection closed");
    }
}

impl<S> Connection<S> {
    /// Connection id assigned by the owner
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether the connection has stopped accepting messages
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Snapshot of the transmit counters
    pub async fn stats(&self) -> ConnectionStats {
        self.outbound.lock().await.stats
    }

    /// Move to `Terminated` and notify the monitor, at most once
    fn terminate(&self, reason: TerminationReason, dropped: usize) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }

        let monitor = self.monitor.lock().ok().and_then(|mut m| m.take());
        if let Some(monitor) = monitor {
            let termination = Termination {
                connection_id: self.id,
                reason,
                dropped,
            };
            if monitor.send(termination).is_err() {
                debug!(connection = self.id, "Termination monitor already gone");
            }
        }
    }

    fn stop_watcher(&self) {
        let handle = self.watcher.lock().ok().and_then(|mut w| w.take());
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

impl<S> Drop for Connection<S> {
    fn drop(&mut self) {
        self.stop_watcher();
    }
}

/// Drain the read side until the gateway goes away.
///
/// The gateway only speaks when it is about to drop the session, so inbound
/// bytes are discarded.
async fn watch_session<S>(connection: Weak<Connection<S>>, mut reader: ReadHalf<S>)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let mut buf = [0u8; 1024];

    let reason = loop {
        match reader.read(&mut buf).await {
            Ok(0) => break TerminationReason::ClosedByPeer,
            Ok(n) => trace!("Discarding {} inbound byte(s)", n),
            Err(e) => break TerminationReason::ReadFailed(e.to_string()),
        }
    };

    if let Some(connection) = connection.upgrade() {
        if !connection.is_terminated() {
            debug!(connection = connection.id, "Session ended: {}", reason);
        }
        connection.terminate(reason, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::Duration;
    use tokio::io::{duplex, ReadBuf};
    use tokio::time::timeout;

    /// Session that accepts `limit` bytes and then refuses writes
    struct FailingStream {
        accepted: Arc<StdMutex<Vec<u8>>>,
        limit: usize,
    }

    impl AsyncRead for FailingStream {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Pending
        }
    }

    impl AsyncWrite for FailingStream {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            let mut accepted = self.accepted.lock().unwrap();
            if accepted.len() + buf.len() > self.limit {
                return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "gateway gone")));
            }
            accepted.extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    async fn read_exactly(peer: &mut tokio::io::DuplexStream, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        timeout(Duration::from_secs(2), peer.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        buf
    }

    #[tokio::test]
    async fn test_enqueue_writes_in_order() {
        let (client, mut peer) = duplex(4096);
        let (connection, _terminated) = Connection::open(1, client);

        connection.enqueue(PushMessage::from(&b"first"[..])).await.unwrap();
        connection.enqueue(PushMessage::from(&b"second"[..])).await.unwrap();

        assert_eq!(read_exactly(&mut peer, 11).await, b"firstsecond");
        let stats = connection.stats().await;
        assert_eq!(stats.messages_sent, 2);
        assert_eq!(stats.bytes_sent, 11);
    }

    #[tokio::test]
    async fn test_bulk_matches_sequential_order() {
        let (client, mut peer) = duplex(4096);
        let (connection, _terminated) = Connection::open(1, client);

        let batch = vec![
            PushMessage::from(&b"m1"[..]),
            PushMessage::from(&b"m2"[..]),
            PushMessage::from(&b"m3"[..]),
        ];
        connection.enqueue_bulk(batch).await.unwrap();

        assert_eq!(read_exactly(&mut peer, 6).await, b"m1m2m3");
    }

    #[tokio::test]
    async fn test_concurrent_enqueue_never_interleaves() {
        let (client, mut peer) = duplex(64 * 1024);
        let (connection, _terminated) = Connection::open(1, client);

        let mut tasks = Vec::new();
        for sender in 0..32u8 {
            let connection = connection.clone();
            tasks.push(tokio::spawn(async move {
                connection.enqueue(PushMessage::from(vec![sender; 100])).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let wire = read_exactly(&mut peer, 32 * 100).await;
        let mut seen = Vec::new();
        for chunk in wire.chunks(100) {
            assert!(chunk.iter().all(|b| *b == chunk[0]), "message bytes were split");
            seen.push(chunk[0]);
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..32u8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_write_failure_terminates_and_reports_dropped() {
        let accepted = Arc::new(StdMutex::new(Vec::new()));
        let stream = FailingStream {
            accepted: accepted.clone(),
            limit: 4,
        };
        let (connection, terminated) = Connection::open(7, stream);

        // The failing write is not reported to the sender
        let batch = vec![
            PushMessage::from(&b"okay"[..]),
            PushMessage::from(&b"lost"[..]),
            PushMessage::from(&b"also"[..]),
        ];
        connection.enqueue_bulk(batch).await.unwrap();

        let termination = timeout(Duration::from_secs(2), terminated).await.unwrap().unwrap();
        assert_eq!(termination.connection_id, 7);
        assert!(matches!(termination.reason, TerminationReason::WriteFailed(_)));
        assert_eq!(termination.dropped, 2);
        assert_eq!(accepted.lock().unwrap().as_slice(), b"okay");

        assert!(connection.is_terminated());
        assert!(matches!(
            connection.enqueue(PushMessage::from(&b"late"[..])).await,
            Err(GatewayError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_peer_close_is_detected_without_writes() {
        let (client, peer) = duplex(1024);
        let (connection, terminated) = Connection::open(3, client);

        drop(peer);

        let termination = timeout(Duration::from_secs(2), terminated).await.unwrap().unwrap();
        assert_eq!(termination.reason, TerminationReason::ClosedByPeer);
        assert_eq!(termination.dropped, 0);
        assert!(connection.is_terminated());
    }

    #[tokio::test]
    async fn test_inbound_bytes_are_discarded() {
        let (client, mut peer) = duplex(1024);
        let (connection, _terminated) = Connection::open(4, client);

        peer.write_all(&[8, 7, 0, 0, 0, 1]).await.unwrap();
        connection.enqueue(PushMessage::from(&b"still up"[..])).await.unwrap();

        assert_eq!(read_exactly(&mut peer, 8).await, b"still up");
        assert!(!connection.is_terminated());
    }

    #[tokio::test]
    async fn test_close_does_not_notify_monitor() {
        let (client, _peer) = duplex(1024);
        let (connection, terminated) = Connection::open(5, client);

        connection.close().await;

        assert!(connection.is_terminated());
        assert!(timeout(Duration::from_secs(2), terminated).await.unwrap().is_err());
    }
}
