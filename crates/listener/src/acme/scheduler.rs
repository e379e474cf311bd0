//! Background renewal of cached ACME certificates.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::manager::AcmeManager;

/// Default check interval (12 hours)
const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(12 * 3600);

/// Minimum check interval (1 minute)
const MIN_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Delay before the first check after the ACME listener starts
const INITIAL_DELAY: Duration = Duration::from_secs(10);

/// Periodically renews certificates that are within `renew-before-days` of
/// expiry. Runs until its listener generation is cancelled.
pub struct RenewalScheduler {
    manager: Arc<AcmeManager>,
    check_interval: Duration,
}

impl RenewalScheduler {
    pub fn new(manager: Arc<AcmeManager>) -> Self {
        Self {
            manager,
            check_interval: DEFAULT_CHECK_INTERVAL,
        }
    }

    /// Set the check interval, clamped to at least one minute.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval.max(MIN_CHECK_INTERVAL);
        self
    }

    pub fn check_interval(&self) -> Duration {
        self.check_interval
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!(
            check_interval_secs = self.check_interval.as_secs(),
            renew_before_days = self.manager.config().renew_before_days,
            "Starting certificate renewal scheduler"
        );

        let mut ticker = interval(self.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Renewal scheduler cancelled before first check");
                return;
            }
            _ = tokio::time::sleep(INITIAL_DELAY) => {}
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.check_renewals().await,
            }
        }

        debug!("Renewal scheduler stopped");
    }

    async fn check_renewals(&self) {
        let start = Instant::now();
        match self.manager.renew_due().await {
            Ok(0) => debug!("No certificates due for renewal"),
            Ok(renewed) => info!(
                renewed,
                elapsed_secs = start.elapsed().as_secs(),
                "Certificate renewal check completed"
            ),
            Err(e) => error!(error = %e, "Certificate renewal check failed"),
        }
    }
}

impl std::fmt::Debug for RenewalScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenewalScheduler")
            .field("check_interval", &self.check_interval)
            .finish()
    }
}
