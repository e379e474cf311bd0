//! Periodic write-back of generated certificates and known IPs.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use certgate_common::{ConfigRef, ConfigUid};
use certgate_config::ConfigurationUpdate;

use super::{DynamicListener, Shared};
use crate::error::Result;

/// What one reconciler pass wrote to the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub certs_written: bool,
    pub ips_written: bool,
}

impl ReconcileOutcome {
    pub fn wrote_anything(&self) -> bool {
        self.certs_written || self.ips_written
    }
}

/// State copied out under the lock so the store is reached without it.
struct Snapshot {
    target: ConfigRef,
    uid: ConfigUid,
    certs: BTreeMap<String, String>,
    ips: Vec<String>,
    persisted_ips: Vec<String>,
}

impl Shared {
    async fn snapshot(&self) -> Option<Snapshot> {
        let state = self.state.lock().await;
        if state.policy.static_cert.is_some() {
            trace!("Static certificate active, nothing to reconcile");
            return None;
        }
        let Some(active) = state.active.as_ref() else {
            trace!("No active configuration, nothing to reconcile");
            return None;
        };
        Some(Snapshot {
            target: active.config_ref(),
            uid: active.uid.clone(),
            certs: state.certs.serialize(),
            ips: state.known_ips.addresses(),
            persisted_ips: state.persisted_ips.clone(),
        })
    }

    async fn reconcile(&self) -> Result<ReconcileOutcome> {
        let mut outcome = ReconcileOutcome::default();
        let Some(snapshot) = self.snapshot().await else {
            return Ok(outcome);
        };

        let mut current = self.store.get(&snapshot.target).await?;

        if snapshot.certs != current.generated_certs {
            let entries = snapshot.certs.len();
            current = self
                .store
                .update(
                    ConfigurationUpdate::for_config(&current).with_generated_certs(snapshot.certs),
                )
                .await?;
            outcome.certs_written = true;
            info!(
                config = %current.config_ref(),
                entries,
                resource_version = %current.resource_version,
                "Persisted generated certificates"
            );
        }

        if snapshot.ips != snapshot.persisted_ips {
            let updated = self
                .store
                .update(ConfigurationUpdate::for_config(&current).with_known_ips(snapshot.ips.clone()))
                .await?;
            info!(
                config = %updated.config_ref(),
                known_ips = snapshot.ips.len(),
                resource_version = %updated.resource_version,
                "Persisted known IPs"
            );
            outcome.ips_written = true;

            // a reload in the meantime reset the snapshot for its own config
            let mut state = self.state.lock().await;
            if state.active.as_ref().map(|a| &a.uid) == Some(&snapshot.uid) {
                state.persisted_ips = snapshot.ips;
            }
        }

        Ok(outcome)
    }
}

impl DynamicListener {
    /// Run one reconciler pass now.
    ///
    /// Skipped while a static certificate is configured or nothing is
    /// active. Store failures leave the previous snapshot in place so the
    /// next pass retries.
    pub async fn reconcile_once(&self) -> Result<ReconcileOutcome> {
        self.shared.reconcile().await
    }

    /// Start the background reconciler. It stops when `cancel` fires or the
    /// listener is dropped.
    pub fn start_reconciler(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let shared = Arc::downgrade(&self.shared);
        let interval = self.shared.options.reconcile_interval;

        tokio::spawn(async move {
            debug!(interval_secs = interval.as_secs(), "Starting state reconciler");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                match shared.reconcile().await {
                    Ok(outcome) if outcome.wrote_anything() => {
                        debug!(?outcome, "Reconciler pass wrote state")
                    }
                    Ok(_) => trace!("Reconciler pass found nothing to write"),
                    Err(e) => warn!(error = %e, "Failed to persist listener state, retrying next pass"),
                }
            }
            debug!("State reconciler stopped");
        })
    }
}
