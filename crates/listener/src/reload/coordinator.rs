//! Connection draining for torn-down listener generations.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Counts the open connections of one listener generation.
///
/// When a generation is shut down its listeners are closed immediately and
/// the coordinator is handed to a background task that logs the drain.
#[derive(Debug, Clone)]
pub struct DrainCoordinator {
    active: Arc<AtomicUsize>,
    max_drain_time: Duration,
    draining: Arc<AtomicBool>,
}

/// Held for the lifetime of one connection
#[derive(Debug)]
pub struct ConnectionGuard {
    active: Arc<AtomicUsize>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let count = self.active.fetch_sub(1, Ordering::AcqRel) - 1;
        trace!(active_connections = count, "Connection closed");
    }
}

impl DrainCoordinator {
    pub fn new(max_drain_time: Duration) -> Self {
        Self {
            active: Arc::new(AtomicUsize::new(0)),
            max_drain_time,
            draining: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Register a connection. It counts as active until the guard drops.
    pub fn track(&self) -> ConnectionGuard {
        let count = self.active.fetch_add(1, Ordering::AcqRel) + 1;
        trace!(active_connections = count, "Connection opened");
        ConnectionGuard {
            active: Arc::clone(&self.active),
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Wait until every tracked connection closed or the drain time passed.
    ///
    /// Returns `false` if connections were still open at the deadline.
    pub async fn wait_for_drain(&self) -> bool {
        self.draining.store(true, Ordering::Release);
        let start = Instant::now();
        let initial = self.active_count();

        if initial == 0 {
            debug!("No connections to drain");
            return true;
        }

        info!(
            active_connections = initial,
            max_drain_time_secs = self.max_drain_time.as_secs(),
            "Draining connections"
        );

        let mut last_logged = initial;
        loop {
            let current = self.active_count();
            if current == 0 {
                break;
            }
            if start.elapsed() > self.max_drain_time {
                warn!(
                    remaining_connections = current,
                    elapsed_secs = start.elapsed().as_secs(),
                    "Drain timeout reached, connections still open"
                );
                return false;
            }
            if current != last_logged {
                debug!(
                    remaining_connections = current,
                    elapsed_ms = start.elapsed().as_millis(),
                    "Draining connections"
                );
                last_logged = current;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        info!(
            elapsed_ms = start.elapsed().as_millis(),
            drained_connections = initial,
            "All connections drained"
        );
        true
    }

    /// Run [`Self::wait_for_drain`] on a background task.
    pub fn drain_in_background(self) -> tokio::task::JoinHandle<bool> {
        tokio::spawn(async move { self.wait_for_drain().await })
    }
}
