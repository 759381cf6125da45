//! Registry cleanup
//!
//! Devices and applications are created and deleted in the identity
//! service. The cleaner removes what the Join Server still holds for
//! entities the identity service no longer knows: device records, their
//! session keys and application activation settings.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::identity::IdentityServer;
use crate::registry::{AppActivationRegistry, DeviceRegistry, EndDeviceIdentifiers, KeyRegistry};

/// What one cleanup pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupStats {
    pub devices: usize,
    pub applications: usize,
}

pub struct Cleaner {
    identity: Arc<dyn IdentityServer>,
    devices: Arc<dyn DeviceRegistry>,
    keys: Arc<dyn KeyRegistry>,
    app_activation: Arc<dyn AppActivationRegistry>,
}

/// Ask a running cleaner to stop. Returns whether one was listening; with
/// cleanup disabled the receiver is already gone.
pub fn signal_shutdown(shutdown: &watch::Sender<bool>) -> bool {
    match shutdown.send(true) {
        Ok(()) => true,
        Err(e) => {
            debug!("Shutdown signal not delivered: {}", e);
            false
        }
    }
}

impl Cleaner {
    pub fn new(
        identity: Arc<dyn IdentityServer>,
        devices: Arc<dyn DeviceRegistry>,
        keys: Arc<dyn KeyRegistry>,
        app_activation: Arc<dyn AppActivationRegistry>,
    ) -> Self {
        Self {
            identity,
            devices,
            keys,
            app_activation,
        }
    }

    /// One reconciliation pass. Nothing is deleted when the identity
    /// service cannot be listed completely.
    pub async fn run_once(&self) -> Result<CleanupStats> {
        let applications: HashSet<String> =
            self.identity.list_applications().await?.into_iter().collect();
        let mut known = HashSet::new();
        for application_id in &applications {
            for device_id in self.identity.list_end_devices(application_id).await? {
                known.insert((application_id.clone(), device_id));
            }
        }

        let (stale, live): (Vec<EndDeviceIdentifiers>, Vec<EndDeviceIdentifiers>) = self
            .devices
            .range_by_id()
            .await?
            .into_iter()
            .partition(|ids| {
                !known.contains(&(ids.application_id.clone(), ids.device_id.clone()))
            });
        let deleted = self.devices.batch_delete(&stale).await?;

        // A DevEUI may live on under another JoinEUI.
        let live_dev_euis: HashSet<_> = live.iter().map(|ids| ids.dev_eui).collect();
        for ids in &deleted {
            if !live_dev_euis.contains(&ids.dev_eui) {
                self.keys.delete_by_dev_eui(ids.dev_eui).await?;
            }
            debug!(device = %ids, "Removed stale device");
        }

        let stale_applications: Vec<String> = self
            .app_activation
            .range_by_id()
            .await?
            .into_iter()
            .filter(|id| !applications.contains(id))
            .collect();
        self.app_activation.batch_delete(&stale_applications).await?;

        let stats = CleanupStats {
            devices: deleted.len(),
            applications: stale_applications.len(),
        };
        if stats != CleanupStats::default() {
            info!(
                devices = stats.devices,
                applications = stats.applications,
                "Registry cleanup removed stale entries"
            );
        }
        Ok(stats)
    }

    /// Run a pass every `interval` until `shutdown` flips or its sender is
    /// dropped.
    pub async fn run(self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = interval.as_secs(), "Registry cleanup started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        warn!(code = e.code(), error = %e, "Registry cleanup failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("Registry cleanup stopped");
                    return;
                }
            }
        }
    }
}
