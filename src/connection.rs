//! Per-connection handler.
//!
//! Each accepted socket gets its own task running this loop:
//! receive bytes, frame them into packets, commit each packet to the log,
//! then replay the whole log back to the same peer. The connection ends when
//! the peer closes, an I/O error occurs, or the server shuts down.

use crate::framer::{Framer, DELIMITER};
use crate::log_store::{LogError, LogStore, ReadAllError};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

/// Why a connection stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer closed its side of the stream.
    PeerClosed,
    /// Server is shutting down.
    Shutdown,
}

/// Counters recorded when a connection closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Packets committed to the log.
    pub packets: u64,
    /// Raw bytes received from the peer.
    pub bytes_received: u64,
    /// Bytes sent back by replays.
    pub bytes_replayed: u64,
    /// Unterminated bytes dropped at close.
    pub pending_discarded: usize,
    pub reason: CloseReason,
}

impl ConnectionStats {
    fn new() -> Self {
        Self {
            packets: 0,
            bytes_received: 0,
            bytes_replayed: 0,
            pending_discarded: 0,
            reason: CloseReason::PeerClosed,
        }
    }
}

/// Errors that end a single connection.
#[derive(Debug)]
pub enum HandlerError {
    /// Receiving from the peer failed.
    Receive(std::io::Error),
    /// Appending a packet to the log failed.
    Commit(LogError),
    /// Reading the log back for replay failed.
    Snapshot(LogError),
    /// Sending the replay to the peer failed.
    Replay(std::io::Error),
}

impl HandlerError {
    /// Whether the failure came from the shared log rather than the peer.
    pub fn is_log_store(&self) -> bool {
        matches!(self, HandlerError::Commit(_) | HandlerError::Snapshot(_))
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandlerError::Receive(e) => write!(f, "receive failed: {}", e),
            HandlerError::Commit(e) => write!(f, "append failed: {}", e),
            HandlerError::Snapshot(e) => write!(f, "log read failed: {}", e),
            HandlerError::Replay(e) => write!(f, "replay failed: {}", e),
        }
    }
}

impl std::error::Error for HandlerError {}

impl From<ReadAllError> for HandlerError {
    fn from(e: ReadAllError) -> Self {
        match e {
            ReadAllError::Log(e) => HandlerError::Snapshot(e),
            ReadAllError::Sink(e) => HandlerError::Replay(e),
        }
    }
}

/// Serve an accepted TCP connection and log its outcome.
pub async fn serve(
    stream: TcpStream,
    peer: SocketAddr,
    log: Arc<LogStore>,
    shutdown: watch::Receiver<bool>,
    read_buffer_size: usize,
) {
    info!(peer = %peer.ip(), "Accepted connection from {}", peer.ip());

    if let Err(e) = stream.set_nodelay(true) {
        debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
    }

    match handle_connection(stream, log, shutdown, read_buffer_size).await {
        Ok(stats) => {
            info!(
                peer = %peer.ip(),
                packets = stats.packets,
                bytes_received = stats.bytes_received,
                bytes_replayed = stats.bytes_replayed,
                pending_discarded = stats.pending_discarded,
                reason = ?stats.reason,
                "Closed connection from {}",
                peer.ip()
            );
        }
        Err(e) if e.is_log_store() => {
            error!(peer = %peer, error = %e, "Log store failure, closing connection");
        }
        Err(e) => {
            warn!(peer = %peer, error = %e, "Connection closed with error");
        }
    }
}

/// Run the receive/commit/replay loop until the connection ends.
///
/// The socket is only raced against shutdown while waiting for input. Once
/// a packet is complete its append and replay run to the end.
pub async fn handle_connection<S>(
    mut stream: S,
    log: Arc<LogStore>,
    mut shutdown: watch::Receiver<bool>,
    read_buffer_size: usize,
) -> Result<ConnectionStats, HandlerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framer = Framer::new(DELIMITER, read_buffer_size);
    let mut stats = ConnectionStats::new();

    loop {
        if *shutdown.borrow() {
            stats.reason = CloseReason::Shutdown;
            break;
        }

        let n = tokio::select! {
            biased;
            // A dropped sender also means the server is gone.
            _ = shutdown.changed() => {
                stats.reason = CloseReason::Shutdown;
                break;
            }
            res = stream.read_buf(framer.read_buf()) => res.map_err(HandlerError::Receive)?,
        };

        if n == 0 {
            trace!("Connection closed by peer");
            break;
        }
        stats.bytes_received += n as u64;
        trace!(bytes = n, pending = framer.pending().len(), "Received data");

        while let Some(packet) = framer.next_packet() {
            let packet_len = packet.len();
            let log_len = log.append(packet).await.map_err(HandlerError::Commit)?;
            stats.packets += 1;
            debug!(bytes = packet_len, log_len, "Committed packet");

            stats.bytes_replayed += log.read_all(&mut stream).await?;
        }
    }

    stats.pending_discarded = framer.pending().len();
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use tokio::io::AsyncWriteExt;
    use tokio_test::io::Builder;

    fn temp_store() -> (tempfile::TempDir, Arc<LogStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = LogStore::create(dir.path().join("packets.log")).unwrap();
        (dir, store)
    }

    fn no_shutdown() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    #[tokio::test]
    async fn test_single_packet_replayed() {
        let (_dir, store) = temp_store();
        let (_tx, rx) = no_shutdown();
        let stream = Builder::new().read(b"hello\n").write(b"hello\n").build();

        let stats = handle_connection(stream, Arc::clone(&store), rx, 64)
            .await
            .unwrap();

        assert_eq!(stats.packets, 1);
        assert_eq!(stats.bytes_received, 6);
        assert_eq!(stats.bytes_replayed, 6);
        assert_eq!(stats.reason, CloseReason::PeerClosed);
        assert_eq!(store.snapshot_blocking().unwrap(), b"hello\n");
    }

    #[tokio::test]
    async fn test_split_packet_reassembled() {
        let (_dir, store) = temp_store();
        let (_tx, rx) = no_shutdown();
        let stream = Builder::new()
            .read(b"ab")
            .read(b"c\n")
            .write(b"abc\n")
            .build();

        let stats = handle_connection(stream, Arc::clone(&store), rx, 64)
            .await
            .unwrap();

        assert_eq!(stats.packets, 1);
        assert_eq!(store.snapshot_blocking().unwrap(), b"abc\n");
    }

    #[tokio::test]
    async fn test_replay_after_each_packet() {
        let (_dir, store) = temp_store();
        let (_tx, rx) = no_shutdown();
        let stream = Builder::new()
            .read(b"a\nb\n")
            .write(b"a\n")
            .write(b"a\nb\n")
            .build();

        let stats = handle_connection(stream, Arc::clone(&store), rx, 64)
            .await
            .unwrap();

        assert_eq!(stats.packets, 2);
        assert_eq!(stats.bytes_replayed, 6);
    }

    #[tokio::test]
    async fn test_replay_includes_earlier_entries() {
        let (_dir, store) = temp_store();
        store.append_blocking(b"hello\n").unwrap();
        let (_tx, rx) = no_shutdown();
        let stream = Builder::new()
            .read(b"world\n")
            .write(b"hello\nworld\n")
            .build();

        handle_connection(stream, Arc::clone(&store), rx, 64)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unterminated_bytes_not_committed() {
        let (_dir, store) = temp_store();
        let (_tx, rx) = no_shutdown();
        let stream = Builder::new().read(b"no newline").build();

        let stats = handle_connection(stream, Arc::clone(&store), rx, 64)
            .await
            .unwrap();

        assert_eq!(stats.packets, 0);
        assert_eq!(stats.pending_discarded, 10);
        assert_eq!(store.len().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_receive_error() {
        let (_dir, store) = temp_store();
        let (_tx, rx) = no_shutdown();
        let stream = Builder::new()
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();

        let err = handle_connection(stream, store, rx, 64).await.unwrap_err();
        assert!(matches!(err, HandlerError::Receive(_)));
        assert!(!err.is_log_store());
    }

    #[tokio::test]
    async fn test_replay_error_keeps_commit() {
        let (_dir, store) = temp_store();
        let (_tx, rx) = no_shutdown();
        let stream = Builder::new()
            .read(b"kept\n")
            .write_error(io::Error::new(io::ErrorKind::BrokenPipe, "gone"))
            .build();

        let err = handle_connection(stream, Arc::clone(&store), rx, 64)
            .await
            .unwrap_err();

        assert!(matches!(err, HandlerError::Replay(_)));
        assert_eq!(store.snapshot_blocking().unwrap(), b"kept\n");
    }

    #[tokio::test]
    async fn test_commit_error_on_closed_store() {
        let (_dir, store) = temp_store();
        store.remove().unwrap();
        let (_tx, rx) = no_shutdown();
        let stream = Builder::new().read(b"late\n").build();

        let err = handle_connection(stream, store, rx, 64).await.unwrap_err();
        assert!(matches!(err, HandlerError::Commit(LogError::Closed)));
        assert!(err.is_log_store());
    }

    #[tokio::test]
    async fn test_shutdown_already_requested() {
        let (_dir, store) = temp_store();
        let (tx, rx) = no_shutdown();
        tx.send(true).unwrap();
        let stream = Builder::new().build();

        let stats = handle_connection(stream, store, rx, 64).await.unwrap();
        assert_eq!(stats.reason, CloseReason::Shutdown);
    }

    #[tokio::test]
    async fn test_shutdown_while_waiting_for_input() {
        let (_dir, store) = temp_store();
        let (tx, rx) = no_shutdown();
        let (mut client, server) = tokio::io::duplex(64);

        let handler = tokio::spawn(handle_connection(server, Arc::clone(&store), rx, 64));

        client.write_all(b"pending").await.unwrap();
        tokio::task::yield_now().await;
        tx.send(true).unwrap();

        let stats = handler.await.unwrap().unwrap();
        assert_eq!(stats.reason, CloseReason::Shutdown);
        assert_eq!(store.len().unwrap(), 0);
    }
}
