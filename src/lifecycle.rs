//! Process lifecycle: daemonization and shutdown signals.
//!
//! Daemonizing forks, so it must run before the tokio runtime starts any
//! threads. Signal handling needs the runtime, so it is installed after;
//! SIGINT/SIGTERM are blocked from before the log file exists until then.

use std::ffi::CStr;
use std::io;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing::{info, warn};

/// Daemonization errors
#[derive(Debug)]
pub enum DaemonError {
    Fork(io::Error),
    Setsid(io::Error),
    Chdir(io::Error),
    Redirect(io::Error),
}

impl std::fmt::Display for DaemonError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DaemonError::Fork(e) => write!(f, "fork failed: {}", e),
            DaemonError::Setsid(e) => write!(f, "setsid failed: {}", e),
            DaemonError::Chdir(e) => write!(f, "chdir failed: {}", e),
            DaemonError::Redirect(e) => write!(f, "redirecting stdio failed: {}", e),
        }
    }
}

impl std::error::Error for DaemonError {}

/// Detach from the controlling terminal.
///
/// The parent exits with status 0 once the child exists. The child starts a
/// new session, moves to `/` and points stdin/stdout/stderr at `/dev/null`.
/// Open descriptors (listening socket, log file) are inherited.
pub fn daemonize() -> Result<(), DaemonError> {
    // SAFETY: called before any other thread is started.
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(DaemonError::Fork(io::Error::last_os_error()));
    }
    if pid > 0 {
        info!(pid, "Forked daemon process");
        std::process::exit(0);
    }

    // SAFETY: plain syscalls with no pointer arguments.
    if unsafe { libc::setsid() } < 0 {
        return Err(DaemonError::Setsid(io::Error::last_os_error()));
    }

    std::env::set_current_dir("/").map_err(DaemonError::Chdir)?;
    redirect_stdio().map_err(DaemonError::Redirect)?;
    Ok(())
}

fn redirect_stdio() -> io::Result<()> {
    const DEV_NULL: &CStr = c"/dev/null";

    // SAFETY: DEV_NULL is a valid NUL-terminated path.
    let fd = unsafe { libc::open(DEV_NULL.as_ptr(), libc::O_RDWR) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    for target in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        // SAFETY: both descriptors are open.
        if unsafe { libc::dup2(fd, target) } < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }
    }

    if fd > libc::STDERR_FILENO {
        unsafe { libc::close(fd) };
    }
    Ok(())
}

/// SIGINT/SIGTERM held pending on the calling thread.
///
/// Threads started while the mask is in place inherit it, so once the
/// calling thread restores its mask it is the one that takes the signals.
pub struct BlockedSignals {
    previous: libc::sigset_t,
}

/// Block SIGINT and SIGTERM on the calling thread.
pub fn block_shutdown_signals() -> io::Result<BlockedSignals> {
    // SAFETY: the sets are initialized by sigemptyset before use.
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGINT);
        libc::sigaddset(&mut set, libc::SIGTERM);

        let mut previous: libc::sigset_t = std::mem::zeroed();
        let rc = libc::pthread_sigmask(libc::SIG_BLOCK, &set, &mut previous);
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }
        Ok(BlockedSignals { previous })
    }
}

impl BlockedSignals {
    /// Restore the previous mask, delivering anything held back meanwhile.
    pub fn restore(self) -> io::Result<()> {
        // SAFETY: `previous` was filled in by pthread_sigmask.
        let rc = unsafe {
            libc::pthread_sigmask(libc::SIG_SETMASK, &self.previous, std::ptr::null_mut())
        };
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }
        Ok(())
    }
}

/// SIGINT/SIGTERM listeners, installed once at startup.
///
/// Once installed the default "terminate" action no longer applies, so
/// signals arriving during shutdown are only logged.
pub struct ShutdownSignals {
    interrupt: Signal,
    terminate: Signal,
}

impl ShutdownSignals {
    /// Install the handlers. Must be called inside the runtime.
    pub fn install() -> io::Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    /// Wait for the next interrupt or terminate signal and return its name.
    pub async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.terminate.recv() => "SIGTERM",
        }
    }

    /// Resolve on the first signal. Later signals are absorbed by a
    /// background task until the runtime shuts down.
    pub async fn wait(mut self) {
        let name = self.recv().await;
        info!(signal = name, "Caught signal, exiting");

        tokio::spawn(async move {
            loop {
                let name = self.recv().await;
                warn!(signal = name, "Shutdown already in progress");
            }
        });
    }
}
