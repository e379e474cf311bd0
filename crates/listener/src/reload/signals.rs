//! SIGHUP (re-read the store) and SIGTERM/SIGINT (shutdown) for the binary.

use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalType {
    /// Re-read stored configurations (SIGHUP)
    Reload,
    /// Graceful shutdown (SIGTERM/SIGINT)
    Shutdown,
}

/// Async source of process signals.
#[cfg(unix)]
pub struct SignalManager {
    hangup: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
    interrupt: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl SignalManager {
    /// Install the handlers. Must be called inside a tokio runtime.
    pub fn new() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        debug!("Installing signal handlers");
        Ok(Self {
            hangup: signal(SignalKind::hangup())?,
            terminate: signal(SignalKind::terminate())?,
            interrupt: signal(SignalKind::interrupt())?,
        })
    }

    /// Wait for the next signal
    pub async fn recv(&mut self) -> SignalType {
        let signal = tokio::select! {
            _ = self.hangup.recv() => SignalType::Reload,
            _ = self.terminate.recv() => SignalType::Shutdown,
            _ = self.interrupt.recv() => SignalType::Shutdown,
        };
        debug!(signal = ?signal, "Received signal");
        signal
    }
}

/// Async source of process signals. Only Ctrl-C is available here.
#[cfg(not(unix))]
pub struct SignalManager;

#[cfg(not(unix))]
impl SignalManager {
    pub fn new() -> std::io::Result<Self> {
        Ok(Self)
    }

    pub async fn recv(&mut self) -> SignalType {
        let _ = tokio::signal::ctrl_c().await;
        debug!("Received Ctrl-C");
        SignalType::Shutdown
    }
}
