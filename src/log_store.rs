//! Shared append-only packet log.
//!
//! Backed by a single file that is truncated when the server starts and
//! removed when it shuts down. Appends, removal and the start of every
//! replay take the same lock, so an append is never interleaved with another
//! append and a replay always starts from a committed length.
//!
//! Appends run on tokio's blocking pool. A blocking closure runs to
//! completion even if the task awaiting it is aborted, which keeps entries
//! whole when shutdown cancels a handler mid-commit.
//!
//! Replays stream `[0, len)` through their own read handle in fixed-size
//! chunks. Bytes below a committed length never change, so the lock is not
//! held while the peer is written to.

use bytes::BytesMut;
use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Bytes read from the log per replay chunk.
pub const REPLAY_CHUNK_SIZE: usize = 16 * 1024;

/// Log store errors
#[derive(Debug)]
pub enum LogError {
    /// The backing file rejected a read or write.
    Io(io::Error),
    /// The store was already removed by shutdown.
    Closed,
    /// A previous holder of the lock panicked.
    Poisoned,
}

impl std::fmt::Display for LogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogError::Io(e) => write!(f, "log store I/O error: {}", e),
            LogError::Closed => write!(f, "log store is closed"),
            LogError::Poisoned => write!(f, "log store lock poisoned"),
        }
    }
}

impl std::error::Error for LogError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LogError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for LogError {
    fn from(e: io::Error) -> Self {
        LogError::Io(e)
    }
}

/// The single log shared by every connection
#[derive(Debug)]
pub struct LogStore {
    path: PathBuf,
    /// `None` once the store has been removed.
    file: Mutex<Option<LogFile>>,
}

#[derive(Debug)]
struct LogFile {
    file: File,
    len: u64,
}

impl LogStore {
    /// Create the log file, truncating anything left from a previous run.
    pub fn create(path: impl Into<PathBuf>) -> io::Result<Arc<Self>> {
        let path = path.into();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        info!(path = %path.display(), "Log store created");

        Ok(Arc::new(Self {
            path,
            file: Mutex::new(Some(LogFile { file, len: 0 })),
        }))
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one packet and return the new log length.
    pub async fn append(self: &Arc<Self>, packet: bytes::Bytes) -> Result<u64, LogError> {
        let store = Arc::clone(self);
        tokio::task::spawn_blocking(move || store.append_blocking(&packet))
            .await
            .map_err(|e| LogError::Io(io::Error::other(e)))?
    }

    /// Stream the whole log, from offset 0 to its current end, into `sink`.
    ///
    /// The length is fixed under the lock when the replay starts; appends
    /// that complete afterwards are not included. At most one chunk is held
    /// in memory, and a slow peer never holds up other connections' appends.
    pub async fn read_all<W>(self: &Arc<Self>, sink: &mut W) -> Result<u64, ReadAllError>
    where
        W: AsyncWrite + Unpin,
    {
        let store = Arc::clone(self);
        let (reader, len) = tokio::task::spawn_blocking(move || store.open_reader())
            .await
            .map_err(|e| ReadAllError::Log(LogError::Io(io::Error::other(e))))?
            .map_err(ReadAllError::Log)?;

        let mut reader = tokio::fs::File::from_std(reader).take(len);
        let mut chunk = BytesMut::with_capacity(REPLAY_CHUNK_SIZE.min(len as usize));
        let mut sent = 0u64;

        while sent < len {
            chunk.clear();
            let n = reader
                .read_buf(&mut chunk)
                .await
                .map_err(|e| ReadAllError::Log(LogError::Io(e)))?;
            if n == 0 {
                return Err(ReadAllError::Log(LogError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "log shorter than its committed length",
                ))));
            }
            sink.write_all(&chunk).await.map_err(ReadAllError::Sink)?;
            sent += n as u64;
        }

        sink.flush().await.map_err(ReadAllError::Sink)?;
        Ok(sent)
    }

    /// Open an independent read handle together with the committed length.
    ///
    /// Reopening by path gives the reader its own file offset, so it never
    /// disturbs the append cursor.
    fn open_reader(&self) -> Result<(File, u64), LogError> {
        let guard = self.file.lock().map_err(|_| LogError::Poisoned)?;
        let log = guard.as_ref().ok_or(LogError::Closed)?;
        let reader = File::open(&self.path)?;
        Ok((reader, log.len))
    }

    /// Append under the lock, flushing before it is released.
    pub fn append_blocking(&self, packet: &[u8]) -> Result<u64, LogError> {
        let mut guard = self.file.lock().map_err(|_| LogError::Poisoned)?;
        let log = guard.as_mut().ok_or(LogError::Closed)?;

        log.file.seek(SeekFrom::Start(log.len))?;
        if let Err(e) = log.file.write_all(packet).and_then(|()| log.file.flush()) {
            // Drop whatever part of the packet made it to disk.
            if let Err(trunc) = log.file.set_len(log.len) {
                warn!(error = %trunc, "Failed to roll back partial append");
            }
            return Err(e.into());
        }
        log.len += packet.len() as u64;

        debug!(bytes = packet.len(), log_len = log.len, "Appended packet");
        Ok(log.len)
    }

    /// Copy the whole log under the lock, for tests.
    #[cfg(test)]
    pub fn snapshot_blocking(&self) -> Result<Vec<u8>, LogError> {
        use std::io::Read;

        let guard = self.file.lock().map_err(|_| LogError::Poisoned)?;
        let log = guard.as_ref().ok_or(LogError::Closed)?;

        let mut contents = Vec::with_capacity(log.len as usize);
        File::open(&self.path)?.take(log.len).read_to_end(&mut contents)?;
        Ok(contents)
    }

    /// Current log length in bytes
    pub fn len(&self) -> Result<u64, LogError> {
        let guard = self.file.lock().map_err(|_| LogError::Poisoned)?;
        guard.as_ref().map(|log| log.len).ok_or(LogError::Closed)
    }

    /// Close the store and delete the backing file.
    ///
    /// Waits for an in-flight append or replay start to release the lock.
    /// Replays already streaming keep their open handle to the unlinked file.
    /// Returns `false` if the store had already been removed.
    pub fn remove(&self) -> io::Result<bool> {
        let mut guard = match self.file.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if guard.take().is_none() {
            return Ok(false);
        }

        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(path = %self.path.display(), "Log file already gone");
            }
            Err(e) => return Err(e),
        }
        info!(path = %self.path.display(), "Log store removed");
        Ok(true)
    }
}

/// Failure while replaying the log to a peer
#[derive(Debug)]
pub enum ReadAllError {
    /// Reading the log failed.
    Log(LogError),
    /// Writing to the peer failed.
    Sink(io::Error),
}

impl std::fmt::Display for ReadAllError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadAllError::Log(e) => write!(f, "{}", e),
            ReadAllError::Sink(e) => write!(f, "replay write failed: {}", e),
        }
    }
}

impl std::error::Error for ReadAllError {}
