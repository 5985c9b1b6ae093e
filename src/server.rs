//! TCP server for the packet log.
//!
//! Binds the listening socket, accepts connections and hands each one to its
//! own task. On shutdown it stops accepting, tells running connections to
//! stop, waits a bounded time for them, then removes the log file.

use crate::config::Config;
use crate::connection;
use crate::log_store::LogStore;
use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

/// Pause after accept fails for lack of descriptors or memory.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

/// Server startup and runtime errors
#[derive(Debug)]
pub enum ServerError {
    /// The listen host could not be resolved.
    Resolve(String, io::Error),
    /// Every candidate address failed to bind.
    NoUsableAddress(Vec<(SocketAddr, io::Error)>),
    /// The log file could not be created.
    LogStore(PathBuf, io::Error),
    /// The bound socket could not be registered with the runtime.
    Listen(io::Error),
    /// The listening socket became unusable.
    Accept(io::Error),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Resolve(host, e) => write!(f, "Failed to resolve '{}': {}", host, e),
            ServerError::NoUsableAddress(failures) if failures.is_empty() => {
                write!(f, "Failed to bind: no candidate addresses")
            }
            ServerError::NoUsableAddress(failures) => {
                write!(f, "Failed to bind")?;
                for (addr, e) in failures {
                    write!(f, "; {}: {}", addr, e)?;
                }
                Ok(())
            }
            ServerError::LogStore(path, e) => {
                write!(f, "Failed to create log file '{}': {}", path.display(), e)
            }
            ServerError::Listen(e) => write!(f, "Failed to register listener: {}", e),
            ServerError::Accept(e) => write!(f, "Listening socket failed: {}", e),
        }
    }
}

impl std::error::Error for ServerError {}

/// Server instance
pub struct Server {
    listener: std::net::TcpListener,
    local_addr: SocketAddr,
    log: Arc<LogStore>,
    read_buffer_size: usize,
    drain_timeout: Duration,
}

impl Server {
    /// Bind the listening socket and create the log file.
    ///
    /// Runs without an async runtime so it can happen before daemonizing.
    pub fn bind(config: &Config) -> Result<Self, ServerError> {
        let candidates = candidate_addrs(config.listen.as_deref(), config.port)?;
        let (listener, local_addr) = bind_first(&candidates, config.backlog)?;

        let log = LogStore::create(&config.log_path)
            .map_err(|e| ServerError::LogStore(config.log_path.clone(), e))?;

        Ok(Server {
            listener,
            local_addr,
            log,
            read_buffer_size: config.read_buffer_size,
            drain_timeout: config.drain_timeout,
        })
    }

    /// Address the server is listening on
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Shared log store, for tests
    #[cfg(test)]
    pub fn log_store(&self) -> &Arc<LogStore> {
        &self.log
    }

    /// Accept connections until `shutdown` resolves, then drain and clean up.
    ///
    /// The log file is removed on every exit path, including a fatal accept
    /// error.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        let Server {
            listener,
            local_addr,
            log,
            read_buffer_size,
            drain_timeout,
        } = self;

        let result = match TcpListener::from_std(listener) {
            Ok(listener) => {
                info!(address = %local_addr, "Server listening");
                accept_loop(listener, &log, read_buffer_size, drain_timeout, shutdown).await
            }
            Err(e) => Err(ServerError::Listen(e)),
        };

        if let Ok(len) = log.len() {
            info!(log_bytes = len, "Removing log store");
        }
        let store = Arc::clone(&log);
        match tokio::task::spawn_blocking(move || store.remove()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => error!(path = %log.path().display(), error = %e, "Failed to remove log file"),
            Err(e) => error!(error = %e, "Log removal task failed"),
        }

        result
    }
}

async fn accept_loop<F>(
    listener: TcpListener,
    log: &Arc<LogStore>,
    read_buffer_size: usize,
    drain_timeout: Duration,
    shutdown: F,
) -> Result<(), ServerError>
where
    F: Future<Output = ()>,
{
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handlers = JoinSet::new();
    tokio::pin!(shutdown);

    let result = loop {
        tokio::select! {
            _ = &mut shutdown => break Ok(()),

            Some(res) = handlers.join_next(), if !handlers.is_empty() => reap(res),

            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, active = handlers.len() + 1, "Dispatching connection");
                    handlers.spawn(connection::serve(
                        stream,
                        peer,
                        Arc::clone(log),
                        shutdown_rx.clone(),
                        read_buffer_size,
                    ));
                }
                Err(e) if is_fatal_accept_error(&e) => break Err(ServerError::Accept(e)),
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                    if is_resource_exhaustion(&e) {
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                }
            },
        }
    };

    drop(listener);
    info!("Stopped accepting connections");

    // Receivers may all be gone already; nothing to notify then.
    let _ = shutdown_tx.send(true);
    drain(&mut handlers, drain_timeout).await;

    result
}

/// Wait up to `timeout` for connections to finish, then abort the rest.
async fn drain(handlers: &mut JoinSet<()>, timeout: Duration) {
    if handlers.is_empty() {
        return;
    }
    info!(active = handlers.len(), "Waiting for connections to finish");

    let finished = tokio::time::timeout(timeout, async {
        while let Some(res) = handlers.join_next().await {
            reap(res);
        }
    })
    .await;

    if finished.is_err() {
        warn!(remaining = handlers.len(), "Drain timed out, aborting connections");
        handlers.shutdown().await;
    }
}

fn reap(res: Result<(), JoinError>) {
    match res {
        Ok(()) => {}
        Err(e) if e.is_panic() => error!(error = %e, "Connection handler panicked"),
        Err(e) => debug!(error = %e, "Connection handler cancelled"),
    }
}

/// Addresses to try binding, in order.
///
/// Without a host this is the IPv4 wildcard followed by the IPv6 wildcard.
pub fn candidate_addrs(listen: Option<&str>, port: u16) -> Result<Vec<SocketAddr>, ServerError> {
    match listen {
        Some(host) => (host, port)
            .to_socket_addrs()
            .map(Iterator::collect)
            .map_err(|e| ServerError::Resolve(host.to_string(), e)),
        None => Ok(vec![
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)),
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, port)),
        ]),
    }
}

/// Bind the first candidate that accepts, logging each failure.
fn bind_first(
    candidates: &[SocketAddr],
    backlog: i32,
) -> Result<(std::net::TcpListener, SocketAddr), ServerError> {
    let mut failures = Vec::new();

    for &addr in candidates {
        match create_listener(addr, backlog) {
            Ok(listener) => {
                let local_addr = listener.local_addr().unwrap_or(addr);
                info!(address = %local_addr, "Bind success");
                return Ok((listener, local_addr));
            }
            Err(e) => {
                warn!(address = %addr, error = %e, "Bind error");
                failures.push((addr, e));
            }
        }
    }

    Err(ServerError::NoUsableAddress(failures))
}

/// Create a non-blocking TCP listener with SO_REUSEADDR.
fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}

/// Errors meaning the listening socket itself is no longer valid.
fn is_fatal_accept_error(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EBADF) | Some(libc::ENOTSOCK) | Some(libc::EINVAL) | Some(libc::EOPNOTSUPP)
    )
}

fn is_resource_exhaustion(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOBUFS) | Some(libc::ENOMEM)
    )
}
